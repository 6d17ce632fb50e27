//! Challenge Gate
//!
//! One-time nonces a reader must echo back on protected calls. At most one
//! challenge is outstanding per device; issuing replaces it and consuming
//! deletes it, so a captured request cannot be replayed.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::crypto::random_hex;
use crate::store::{AccessStore, StoreError};

/// Challenge lifetime in seconds
pub const DEFAULT_CHALLENGE_TTL_SECS: i64 = 30;

/// Random bytes per challenge value
pub const CHALLENGE_BYTES: usize = 16;

/// A stored challenge
#[derive(Clone, PartialEq, Eq)]
pub struct Challenge {
    pub device_id: Uuid,
    pub value: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Challenge {
    pub fn new(device_id: Uuid, value: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            device_id,
            value,
            expires_at,
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Challenge")
            .field("device_id", &self.device_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// What the reader receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeGrant {
    pub value: String,
    pub ttl_seconds: i64,
}

pub struct ChallengeGate {
    store: Arc<dyn AccessStore>,
    ttl: Duration,
}

impl ChallengeGate {
    pub fn new(store: Arc<dyn AccessStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a fresh challenge, replacing any outstanding one
    pub fn issue(&self, device_id: Uuid) -> Result<ChallengeGrant, StoreError> {
        self.issue_at(device_id, Utc::now())
    }

    pub fn issue_at(&self, device_id: Uuid, now: DateTime<Utc>) -> Result<ChallengeGrant, StoreError> {
        let value = random_hex(CHALLENGE_BYTES);
        let mut challenge = Challenge::new(device_id, value.clone(), now + self.ttl);
        challenge.created_at = now;
        self.store.upsert_challenge(challenge)?;
        debug!("Challenge issued for device {}", device_id);

        Ok(ChallengeGrant {
            value,
            ttl_seconds: self.ttl.num_seconds(),
        })
    }

    /// Consume a presented challenge
    ///
    /// Unknown, mismatched and expired values all yield `false`.
    pub fn consume(&self, device_id: Uuid, value: &str) -> Result<bool, StoreError> {
        self.consume_at(device_id, value, Utc::now())
    }

    pub fn consume_at(&self, device_id: Uuid, value: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let accepted = !value.is_empty() && self.store.consume_challenge(device_id, value, now)?;
        if !accepted {
            warn!("Invalid or expired challenge from device {}", device_id);
        }
        Ok(accepted)
    }

    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let purged = self.store.purge_expired_challenges(Utc::now())?;
        if purged > 0 {
            debug!("Purged {} expired challenges", purged);
        }
        Ok(purged)
    }
}
