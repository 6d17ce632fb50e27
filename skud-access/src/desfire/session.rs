//! DESFire sessions and the session table
//!
//! Sessions live only in process memory. Each one is addressed by an opaque
//! id and expires a fixed time after creation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::crypto::AesKey;
use super::provisioning::{AuthState, ProvisionState, SessionState};
use super::DesfireError;

/// Default session lifetime in seconds
pub const DEFAULT_SESSION_TTL_SECS: i64 = 30;

/// One in-flight exchange with one card
pub struct DesfireSession {
    pub id: String,
    pub card_uid: String,
    pub device_id: Uuid,
    pub state: SessionState,
    pub derived_key: AesKey,
    /// Key for the authentication in progress
    pub current_key: AesKey,
    pub rnd_a: Option<[u8; 16]>,
    pub rnd_b: Option<[u8; 16]>,
    pub iv: Option<[u8; 16]>,
    pub session_key: Option<AesKey>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DesfireSession {
    pub fn new(
        card_uid: &str,
        device_id: Uuid,
        state: SessionState,
        derived_key: AesKey,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        // Provisioning starts from the factory key, authentication from ours
        let current_key = match state {
            SessionState::Provisioning(_) => [0u8; 16],
            SessionState::Authentication(_) => derived_key,
        };
        Self {
            id: Uuid::new_v4().to_string(),
            card_uid: card_uid.to_string(),
            device_id,
            state,
            derived_key,
            current_key,
            rnd_a: None,
            rnd_b: None,
            iv: None,
            session_key: None,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_provisioning(&self) -> bool {
        matches!(self.state, SessionState::Provisioning(_))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Forget everything from a previous authentication
    pub fn reset_crypto(&mut self) {
        self.rnd_a = None;
        self.rnd_b = None;
        self.iv = None;
        self.session_key = None;
    }

    /// Mark the session as failed
    pub fn fail(&mut self) {
        self.state = match self.state {
            SessionState::Provisioning(_) => SessionState::Provisioning(ProvisionState::Failed),
            SessionState::Authentication(_) => SessionState::Authentication(AuthState::Failed),
        };
        self.reset_crypto();
    }
}

impl std::fmt::Debug for DesfireSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesfireSession")
            .field("id", &self.id)
            .field("card_uid", &self.card_uid)
            .field("device_id", &self.device_id)
            .field("state", &self.state)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

struct Entry {
    expires_at: DateTime<Utc>,
    session: Arc<Mutex<DesfireSession>>,
}

/// Concurrent session map
///
/// Lookups take the read lock; inserts, evictions and sweeps take the write
/// lock. Each session has its own mutex so steps on different sessions never
/// contend.
pub struct SessionTable {
    sessions: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
}

impl SessionTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Add a session and return its shared handle
    pub fn insert(&self, session: DesfireSession) -> Arc<Mutex<DesfireSession>> {
        let id = session.id.clone();
        let expires_at = session.expires_at;
        let handle = Arc::new(Mutex::new(session));
        self.sessions.write().insert(
            id.clone(),
            Entry {
                expires_at,
                session: Arc::clone(&handle),
            },
        );
        debug!("DESFire session {} stored", id);
        handle
    }

    /// Look up a live session, evicting it if it has expired
    pub fn get(&self, id: &str, now: DateTime<Utc>) -> Result<Arc<Mutex<DesfireSession>>, DesfireError> {
        {
            let sessions = self.sessions.read();
            match sessions.get(id) {
                None => return Err(DesfireError::SessionNotFound),
                Some(entry) if now <= entry.expires_at => return Ok(Arc::clone(&entry.session)),
                Some(_) => {}
            }
        }
        self.remove(id);
        info!("DESFire session {} expired on lookup", id);
        Err(DesfireError::SessionExpired)
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    /// Drop every session past its expiry, returning how many went
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|id, entry| {
            let keep = now <= entry.expires_at;
            if !keep {
                debug!("DESFire session {} expired and cleaned up", id);
            }
            keep
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_SESSION_TTL_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(table: &SessionTable, now: DateTime<Utc>) -> DesfireSession {
        DesfireSession::new(
            "04AABBCC",
            Uuid::new_v4(),
            SessionState::Provisioning(ProvisionState::SelectPicc),
            [9u8; 16],
            now,
            table.ttl(),
        )
    }

    #[test]
    fn test_insert_and_get() {
        let table = SessionTable::default();
        let now = Utc::now();
        let handle = table.insert(session(&table, now));
        let id = handle.lock().id.clone();

        let found = table.get(&id, now).unwrap();
        assert!(Arc::ptr_eq(&found, &handle));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_provisioning_starts_with_factory_key() {
        let table = SessionTable::default();
        let s = session(&table, Utc::now());
        assert_eq!(s.current_key, [0u8; 16]);
        assert_eq!(s.derived_key, [9u8; 16]);
        assert!(s.is_provisioning());
    }

    #[test]
    fn test_unknown_session() {
        let table = SessionTable::default();
        assert!(matches!(table.get("nope", Utc::now()), Err(DesfireError::SessionNotFound)));
    }

    #[test]
    fn test_lookup_evicts_expired() {
        let table = SessionTable::default();
        let now = Utc::now();
        let id = table.insert(session(&table, now)).lock().id.clone();

        let later = now + Duration::seconds(31);
        assert!(matches!(table.get(&id, later), Err(DesfireError::SessionExpired)));
        assert!(table.is_empty());
        assert!(matches!(table.get(&id, now), Err(DesfireError::SessionNotFound)));
    }

    #[test]
    fn test_prune_expired() {
        let table = SessionTable::default();
        let now = Utc::now();
        table.insert(session(&table, now - Duration::seconds(60)));
        table.insert(session(&table, now - Duration::seconds(45)));
        table.insert(session(&table, now));

        assert_eq!(table.prune_expired(now), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.prune_expired(now), 0);
    }

    #[test]
    fn test_fail_clears_crypto() {
        let table = SessionTable::default();
        let mut s = session(&table, Utc::now());
        s.session_key = Some([1u8; 16]);
        s.rnd_a = Some([2u8; 16]);
        s.fail();
        assert_eq!(s.state, SessionState::Provisioning(ProvisionState::Failed));
        assert!(s.session_key.is_none());
        assert!(s.rnd_a.is_none());
    }
}
