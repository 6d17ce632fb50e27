//! DESFire engine
//!
//! Owns key derivation and the session table. One instance per server,
//! shared by reference between request handlers and the session sweeper.

use chrono::{Duration, Utc};
use log::{debug, info};
use uuid::Uuid;

use crate::crypto::{AesKey, KeyDerivation};
use super::command::DesfireCommand;
use super::provisioning::{self, AuthState, ProvisionState, SessionState, StepOutcome};
use super::session::{DesfireSession, SessionTable};
use super::status::CardReply;
use super::DesfireError;

/// Result of feeding one card reply into a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub session_id: String,
    pub card_uid: String,
    pub provisioning: bool,
    pub outcome: StepOutcome,
}

/// Which exchange a submitted reply is meant for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Provisioning,
    Authentication,
}

pub struct DesfireEngine {
    kdf: KeyDerivation,
    aid: [u8; 3],
    sessions: SessionTable,
}

impl DesfireEngine {
    pub fn new(kdf: KeyDerivation, aid: [u8; 3], session_ttl: Duration) -> Self {
        info!("DESFire engine initialized for application {}", hex::encode_upper(aid));
        Self {
            kdf,
            aid,
            sessions: SessionTable::new(session_ttl),
        }
    }

    pub fn aid(&self) -> [u8; 3] {
        self.aid
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn derive_key(&self, card_uid: &str) -> AesKey {
        self.kdf.derive(card_uid)
    }

    fn open(&self, card_uid: &str, device_id: Uuid, state: SessionState) -> DesfireSession {
        DesfireSession::new(
            card_uid,
            device_id,
            state,
            self.kdf.derive(card_uid),
            Utc::now(),
            self.sessions.ttl(),
        )
    }

    /// Start a server-driven provisioning run; returns the session id and first command
    pub fn start_provisioning(&self, card_uid: &str, device_id: Uuid) -> (String, DesfireCommand) {
        let mut session = self.open(card_uid, device_id, SessionState::Provisioning(ProvisionState::SelectPicc));
        let first = provisioning::begin_provisioning(&mut session);
        let id = session.id.clone();
        self.sessions.insert(session);
        info!("Provisioning session {} created for card {}", id, card_uid);
        (id, first)
    }

    /// Start a reader-driven provisioning run; returns the session id and the key to write
    pub fn start_local_provisioning(&self, card_uid: &str, device_id: Uuid) -> (String, String) {
        let session = self.open(
            card_uid,
            device_id,
            SessionState::Provisioning(ProvisionState::AwaitingConfirmation),
        );
        let id = session.id.clone();
        let key_hex = hex::encode(session.derived_key);
        self.sessions.insert(session);
        info!("Local provisioning session {} created for card {}", id, card_uid);
        (id, key_hex)
    }

    /// Start authenticating a provisioned card; returns the session id and first command
    pub fn start_authentication(&self, card_uid: &str, device_id: Uuid) -> (String, DesfireCommand) {
        let mut session = self.open(card_uid, device_id, SessionState::Authentication(AuthState::SelectApp));
        let first = provisioning::begin_authentication(&mut session, &self.aid);
        let id = session.id.clone();
        self.sessions.insert(session);
        info!("Authentication session {} created for card {}", id, card_uid);
        (id, first)
    }

    /// Feed the card's reply into a session
    ///
    /// Sessions are discarded once they reach an outcome or fail.
    pub fn step(&self, session_id: &str, device_id: Uuid, reply_hex: &str) -> Result<StepResult, DesfireError> {
        let handle = self.sessions.get(session_id, Utc::now())?;
        let mut session = handle.lock();
        if session.device_id != device_id {
            return Err(DesfireError::WrongDevice);
        }

        let result = CardReply::from_hex(reply_hex).and_then(|reply| {
            debug!("Session {} state {} reply {}", session_id, session.state.name(), reply_hex);
            provisioning::advance(&mut session, &self.aid, &reply)
        });

        match result {
            Ok(outcome) => {
                if !matches!(outcome, StepOutcome::Continue(_)) {
                    self.sessions.remove(session_id);
                }
                Ok(StepResult {
                    session_id: session_id.to_string(),
                    card_uid: session.card_uid.clone(),
                    provisioning: session.is_provisioning(),
                    outcome,
                })
            }
            Err(e) => {
                session.fail();
                self.sessions.remove(session_id);
                Err(e)
            }
        }
    }

    /// Like [`step`](Self::step), but refuses sessions of the other flow
    pub fn step_in(
        &self,
        flow: Flow,
        session_id: &str,
        device_id: Uuid,
        reply_hex: &str,
    ) -> Result<StepResult, DesfireError> {
        {
            let handle = self.sessions.get(session_id, Utc::now())?;
            let session = handle.lock();
            let matches = match flow {
                Flow::Provisioning => session.is_provisioning(),
                Flow::Authentication => !session.is_provisioning(),
            };
            if !matches {
                return Err(DesfireError::InvalidState(session.state.name()));
            }
        }
        self.step(session_id, device_id, reply_hex)
    }

    /// Close a reader-driven provisioning session, returning its card uid
    pub fn confirm_local(&self, session_id: &str, device_id: Uuid) -> Result<String, DesfireError> {
        let handle = self.sessions.get(session_id, Utc::now())?;
        let mut session = handle.lock();
        if session.device_id != device_id {
            return Err(DesfireError::WrongDevice);
        }
        self.sessions.remove(session_id);

        let state = session.state;
        match state {
            SessionState::Provisioning(ProvisionState::AwaitingConfirmation) => {
                session.state = SessionState::Provisioning(ProvisionState::Complete);
                Ok(session.card_uid.clone())
            }
            other => {
                session.fail();
                Err(DesfireError::InvalidState(other.name()))
            }
        }
    }

    /// Abandon a session on behalf of its device, returning its card uid
    pub fn cancel(&self, session_id: &str, device_id: Uuid) -> Result<String, DesfireError> {
        let handle = self.sessions.get(session_id, Utc::now())?;
        let mut session = handle.lock();
        if session.device_id != device_id {
            return Err(DesfireError::WrongDevice);
        }
        self.sessions.remove(session_id);
        session.fail();
        info!("Session {} cancelled for card {}", session_id, session.card_uid);
        Ok(session.card_uid.clone())
    }

    /// Card uid of a live session
    pub fn session_card_uid(&self, session_id: &str) -> Option<String> {
        let handle = self.sessions.get(session_id, Utc::now()).ok()?;
        let uid = handle.lock().card_uid.clone();
        Some(uid)
    }

    /// Drop a session without completing it
    pub fn discard(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id)
    }

    /// Drop every expired session
    pub fn prune_expired(&self) -> usize {
        let pruned = self.sessions.prune_expired(Utc::now());
        if pruned > 0 {
            debug!("Pruned {} expired DESFire sessions", pruned);
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desfire::command::CommandKind;
    use crate::desfire::testing::SimulatedCard;

    const AID: [u8; 3] = [0x01, 0x00, 0x00];

    fn engine() -> DesfireEngine {
        let kdf = KeyDerivation::new(&[0x24u8; 16]).unwrap();
        DesfireEngine::new(kdf, AID, Duration::seconds(30))
    }

    fn drive(engine: &DesfireEngine, id: &str, device: Uuid, card: &mut SimulatedCard, first: DesfireCommand) -> StepOutcome {
        let mut cmd = first;
        loop {
            let reply = card.transceive_hex(&cmd.to_hex());
            match engine.step(id, device, &reply).unwrap().outcome {
                StepOutcome::Continue(next) => cmd = next,
                done => return done,
            }
        }
    }

    #[test]
    fn test_provision_then_authenticate() {
        let engine = engine();
        let device = Uuid::new_v4();
        let mut card = SimulatedCard::factory_fresh(AID);

        let (id, first) = engine.start_provisioning("04A1B2C3", device);
        assert_eq!(drive(&engine, &id, device, &mut card, first), StepOutcome::Provisioned);
        assert_eq!(card.app_key(), Some(engine.derive_key("04A1B2C3")));
        assert!(engine.sessions().is_empty());

        let (id, first) = engine.start_authentication("04A1B2C3", device);
        assert_eq!(first.kind, CommandKind::SelectApp);
        assert_eq!(drive(&engine, &id, device, &mut card, first), StepOutcome::Authenticated);
        assert!(engine.sessions().is_empty());
    }

    #[test]
    fn test_card_provisioned_for_other_uid_is_clone() {
        let engine = engine();
        let device = Uuid::new_v4();
        let mut card = SimulatedCard::provisioned(AID, engine.derive_key("04000001"));

        let (id, first) = engine.start_authentication("04000002", device);
        assert_eq!(drive(&engine, &id, device, &mut card, first), StepOutcome::CloneDetected);
    }

    #[test]
    fn test_protocol_error_discards_session() {
        let engine = engine();
        let device = Uuid::new_v4();
        let (id, _) = engine.start_provisioning("04A1B2C3", device);

        assert!(matches!(engine.step(&id, device, "zz"), Err(DesfireError::InvalidHex(_))));
        assert!(matches!(engine.step(&id, device, "00"), Err(DesfireError::SessionNotFound)));
    }

    #[test]
    fn test_other_device_cannot_step() {
        let engine = engine();
        let device = Uuid::new_v4();
        let (id, _) = engine.start_provisioning("04A1B2C3", device);

        assert!(matches!(engine.step(&id, Uuid::new_v4(), "00"), Err(DesfireError::WrongDevice)));
        // The owner can still continue
        assert!(engine.step(&id, device, "00").is_ok());
    }

    #[test]
    fn test_local_provisioning_confirmation() {
        let engine = engine();
        let device = Uuid::new_v4();
        let (id, key_hex) = engine.start_local_provisioning("04A1B2C3", device);
        assert_eq!(key_hex, hex::encode(engine.derive_key("04A1B2C3")));

        // Stepping a local session is not allowed
        assert!(matches!(engine.step(&id, device, "00"), Err(DesfireError::InvalidState(_))));

        let (id, _) = engine.start_local_provisioning("04A1B2C3", device);
        assert_eq!(engine.confirm_local(&id, device).unwrap(), "04A1B2C3");
        assert!(matches!(engine.confirm_local(&id, device), Err(DesfireError::SessionNotFound)));
    }

    #[test]
    fn test_cloud_session_cannot_be_confirmed() {
        let engine = engine();
        let device = Uuid::new_v4();
        let (id, _) = engine.start_provisioning("04A1B2C3", device);
        assert!(matches!(engine.confirm_local(&id, device), Err(DesfireError::InvalidState(_))));
    }

    #[test]
    fn test_concurrent_sessions_are_independent() {
        let engine = engine();
        let device = Uuid::new_v4();
        let mut first_card = SimulatedCard::factory_fresh(AID);
        let mut second_card = SimulatedCard::factory_fresh(AID);

        let (a, cmd_a) = engine.start_provisioning("04000001", device);
        let (b, cmd_b) = engine.start_provisioning("04000002", device);
        assert_eq!(engine.sessions().len(), 2);

        // Interleave one step of each before finishing
        let reply_a = first_card.transceive_hex(&cmd_a.to_hex());
        let reply_b = second_card.transceive_hex(&cmd_b.to_hex());
        let next_a = match engine.step(&a, device, &reply_a).unwrap().outcome {
            StepOutcome::Continue(cmd) => cmd,
            other => panic!("unexpected {:?}", other),
        };
        let next_b = match engine.step(&b, device, &reply_b).unwrap().outcome {
            StepOutcome::Continue(cmd) => cmd,
            other => panic!("unexpected {:?}", other),
        };

        assert_eq!(drive(&engine, &a, device, &mut first_card, next_a), StepOutcome::Provisioned);
        assert_eq!(drive(&engine, &b, device, &mut second_card, next_b), StepOutcome::Provisioned);
        assert_ne!(first_card.app_key(), second_card.app_key());
    }

    #[test]
    fn test_step_in_wrong_flow_is_refused() {
        let engine = engine();
        let device = Uuid::new_v4();
        let (id, _) = engine.start_authentication("04A1B2C3", device);

        assert!(matches!(
            engine.step_in(Flow::Provisioning, &id, device, "00"),
            Err(DesfireError::InvalidState("select_app"))
        ));
        // Still usable in its own flow
        assert!(engine.step_in(Flow::Authentication, &id, device, "00").is_ok());
    }

    #[test]
    fn test_cancel_checks_owner() {
        let engine = engine();
        let device = Uuid::new_v4();
        let (id, _) = engine.start_local_provisioning("04A1B2C3", device);

        assert!(matches!(engine.cancel(&id, Uuid::new_v4()), Err(DesfireError::WrongDevice)));
        assert_eq!(engine.session_card_uid(&id).as_deref(), Some("04A1B2C3"));
        assert_eq!(engine.cancel(&id, device).unwrap(), "04A1B2C3");
        assert_eq!(engine.session_card_uid(&id), None);
    }

    #[test]
    fn test_prune_keeps_live_sessions() {
        let engine = engine();
        engine.start_provisioning("04A1B2C3", Uuid::new_v4());
        assert_eq!(engine.prune_expired(), 0);
        assert_eq!(engine.sessions().len(), 1);
    }
}
