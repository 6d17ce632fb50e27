//! Session state machines
//!
//! Provisioning writes our derived key onto a factory-fresh card:
//!
//! ```text
//! SelectPicc -> AuthPicc1 -> AuthPicc2 -> CreateApp -> SelectApp
//!            -> AuthApp1 -> AuthApp2 -> ChangeKey -> Complete
//! ```
//!
//! Authentication proves a provisioned card holds its derived key:
//!
//! ```text
//! SelectApp -> Auth1 -> Auth2 -> Complete
//! ```
//!
//! Any protocol error moves the session to `Failed`.

use log::{debug, info, warn};
use serde::Serialize;

use super::auth::{answer_challenge, random_rnd_a, session_key, verify_card_proof};
use super::command::DesfireCommand;
use super::session::DesfireSession;
use super::status::CardReply;
use super::DesfireError;

/// Key slot 0, the application master key
const KEY_NO: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    SelectPicc,
    AuthPicc1,
    AuthPicc2,
    CreateApp,
    SelectApp,
    AuthApp1,
    AuthApp2,
    ChangeKey,
    /// The reader writes the key itself and reports back
    AwaitingConfirmation,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    SelectApp,
    Auth1,
    Auth2,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "flow", content = "state", rename_all = "snake_case")]
pub enum SessionState {
    Provisioning(ProvisionState),
    Authentication(AuthState),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Provisioning(state) => match state {
                ProvisionState::SelectPicc => "prov_select_picc",
                ProvisionState::AuthPicc1 => "prov_auth_picc_1",
                ProvisionState::AuthPicc2 => "prov_auth_picc_2",
                ProvisionState::CreateApp => "prov_create_app",
                ProvisionState::SelectApp => "prov_select_app",
                ProvisionState::AuthApp1 => "prov_auth_app_1",
                ProvisionState::AuthApp2 => "prov_auth_app_2",
                ProvisionState::ChangeKey => "prov_change_key",
                ProvisionState::AwaitingConfirmation => "prov_awaiting_confirmation",
                ProvisionState::Complete => "prov_complete",
                ProvisionState::Failed => "prov_failed",
            },
            SessionState::Authentication(state) => match state {
                AuthState::SelectApp => "select_app",
                AuthState::Auth1 => "auth1",
                AuthState::Auth2 => "auth2",
                AuthState::Complete => "complete",
                AuthState::Failed => "failed",
            },
        }
    }
}

/// What a processed card reply leads to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Send this command next
    Continue(DesfireCommand),
    /// The derived key is on the card
    Provisioned,
    /// The card proved it holds the derived key
    Authenticated,
    /// The card failed to prove key possession
    CloneDetected,
}

enum Proof {
    Verified,
    Rejected,
}

/// Handle `AF || EncRndB` and build the second-pass command
fn first_pass(session: &mut DesfireSession, reply: &CardReply) -> Result<DesfireCommand, DesfireError> {
    let enc_rnd_b: [u8; 16] = reply.block("EncRndB")?;
    let challenge = answer_challenge(&session.current_key, &enc_rnd_b, random_rnd_a())?;

    session.rnd_a = Some(challenge.rnd_a);
    session.rnd_b = Some(challenge.rnd_b);
    session.iv = Some(challenge.iv);
    Ok(DesfireCommand::additional_frame(&challenge.response))
}

/// Handle `00 || EncRndA`; establishes the session key when verified
fn second_pass(session: &mut DesfireSession, reply: &CardReply) -> Result<Proof, DesfireError> {
    if reply.is_authentication_error() {
        return Ok(Proof::Rejected);
    }
    if !reply.is_ok() {
        return Err(DesfireError::UnexpectedStatus {
            step: "authentication step 2",
            status: reply.status,
        });
    }
    let enc_rnd_a: [u8; 16] = reply.block("EncRndA")?;
    let (rnd_a, rnd_b, iv) = match (session.rnd_a, session.rnd_b, session.iv) {
        (Some(rnd_a), Some(rnd_b), Some(iv)) => (rnd_a, rnd_b, iv),
        _ => return Err(DesfireError::InvalidState("authentication step 2")),
    };

    if !verify_card_proof(&session.current_key, &iv, &rnd_a, &enc_rnd_a)? {
        return Ok(Proof::Rejected);
    }
    session.session_key = Some(session_key(&rnd_a, &rnd_b));
    Ok(Proof::Verified)
}

/// First command of a provisioning run
pub fn begin_provisioning(session: &mut DesfireSession) -> DesfireCommand {
    session.state = SessionState::Provisioning(ProvisionState::SelectPicc);
    session.current_key = [0u8; 16];
    DesfireCommand::select_picc()
}

/// First command of an authentication run
pub fn begin_authentication(session: &mut DesfireSession, aid: &[u8; 3]) -> DesfireCommand {
    session.state = SessionState::Authentication(AuthState::SelectApp);
    session.current_key = session.derived_key;
    DesfireCommand::select_app(aid)
}

/// Advance a provisioning session by one card reply
pub fn advance_provisioning(
    session: &mut DesfireSession,
    state: ProvisionState,
    aid: &[u8; 3],
    reply: &CardReply,
) -> Result<(ProvisionState, StepOutcome), DesfireError> {
    debug!("Provisioning {} in state {:?}, card status 0x{:02X}", session.card_uid, state, reply.status);

    match state {
        ProvisionState::SelectPicc => {
            if !reply.is_ok() {
                return Err(DesfireError::UnexpectedStatus { step: "select PICC", status: reply.status });
            }
            session.current_key = [0u8; 16];
            Ok((ProvisionState::AuthPicc1, StepOutcome::Continue(DesfireCommand::authenticate(KEY_NO))))
        }
        ProvisionState::AuthPicc1 => {
            if !reply.is_additional_frame() || reply.data.len() < 16 {
                debug!("PICC authentication not available, creating application directly");
                return Ok((ProvisionState::CreateApp, StepOutcome::Continue(DesfireCommand::create_app(aid))));
            }
            let cmd = first_pass(session, reply)?;
            Ok((ProvisionState::AuthPicc2, StepOutcome::Continue(cmd)))
        }
        ProvisionState::AuthPicc2 => match second_pass(session, reply)? {
            Proof::Verified => Ok((ProvisionState::CreateApp, StepOutcome::Continue(DesfireCommand::create_app(aid)))),
            Proof::Rejected => Err(DesfireError::AuthenticationFailed("PICC")),
        },
        ProvisionState::CreateApp => {
            if reply.is_ok() {
                debug!("Application created");
            } else if reply.is_duplicate() {
                debug!("Application already exists");
            } else {
                return Err(DesfireError::UnexpectedStatus { step: "create application", status: reply.status });
            }
            Ok((ProvisionState::SelectApp, StepOutcome::Continue(DesfireCommand::select_app(aid))))
        }
        ProvisionState::SelectApp => {
            if !reply.is_ok() {
                return Err(DesfireError::UnexpectedStatus { step: "select application", status: reply.status });
            }
            session.reset_crypto();
            session.current_key = [0u8; 16];
            Ok((ProvisionState::AuthApp1, StepOutcome::Continue(DesfireCommand::authenticate(KEY_NO))))
        }
        ProvisionState::AuthApp1 => {
            if !reply.is_additional_frame() {
                return Err(DesfireError::UnexpectedStatus { step: "application authentication", status: reply.status });
            }
            let cmd = first_pass(session, reply)?;
            Ok((ProvisionState::AuthApp2, StepOutcome::Continue(cmd)))
        }
        ProvisionState::AuthApp2 => match second_pass(session, reply)? {
            Proof::Verified => {
                let session_key = session.session_key.ok_or(DesfireError::MissingSessionKey)?;
                let cmd = DesfireCommand::change_key(KEY_NO, &session.derived_key, &session_key)?;
                debug!("ChangeKey command built for {}", session.card_uid);
                Ok((ProvisionState::ChangeKey, StepOutcome::Continue(cmd)))
            }
            Proof::Rejected => Err(DesfireError::AuthenticationFailed("application")),
        },
        ProvisionState::ChangeKey => {
            if !reply.is_ok() {
                return Err(DesfireError::UnexpectedStatus { step: "change key", status: reply.status });
            }
            info!("Derived key written to card {}", session.card_uid);
            session.reset_crypto();
            Ok((ProvisionState::Complete, StepOutcome::Provisioned))
        }
        ProvisionState::AwaitingConfirmation => Err(DesfireError::InvalidState("prov_awaiting_confirmation")),
        ProvisionState::Complete => Err(DesfireError::InvalidState("prov_complete")),
        ProvisionState::Failed => Err(DesfireError::InvalidState("prov_failed")),
    }
}

/// Advance an authentication session by one card reply
pub fn advance_authentication(
    session: &mut DesfireSession,
    state: AuthState,
    reply: &CardReply,
) -> Result<(AuthState, StepOutcome), DesfireError> {
    debug!("Authenticating {} in state {:?}, card status 0x{:02X}", session.card_uid, state, reply.status);

    match state {
        AuthState::SelectApp => {
            if reply.is_application_not_found() {
                return Err(DesfireError::ApplicationNotFound);
            }
            if !reply.is_ok() {
                return Err(DesfireError::UnexpectedStatus { step: "select application", status: reply.status });
            }
            Ok((AuthState::Auth1, StepOutcome::Continue(DesfireCommand::authenticate(KEY_NO))))
        }
        AuthState::Auth1 => {
            if !reply.is_additional_frame() {
                return Err(DesfireError::UnexpectedStatus { step: "authentication step 1", status: reply.status });
            }
            let cmd = first_pass(session, reply)?;
            Ok((AuthState::Auth2, StepOutcome::Continue(cmd)))
        }
        AuthState::Auth2 => match second_pass(session, reply)? {
            Proof::Verified => {
                info!("Card {} authenticated", session.card_uid);
                Ok((AuthState::Complete, StepOutcome::Authenticated))
            }
            Proof::Rejected => {
                warn!("Authentication failed for card {}, possible clone", session.card_uid);
                Ok((AuthState::Failed, StepOutcome::CloneDetected))
            }
        },
        AuthState::Complete => Err(DesfireError::InvalidState("complete")),
        AuthState::Failed => Err(DesfireError::InvalidState("failed")),
    }
}

/// Route a reply to the state machine the session belongs to
pub fn advance(session: &mut DesfireSession, aid: &[u8; 3], reply: &CardReply) -> Result<StepOutcome, DesfireError> {
    let result = match session.state {
        SessionState::Provisioning(state) => advance_provisioning(session, state, aid, reply)
            .map(|(next, outcome)| (SessionState::Provisioning(next), outcome)),
        SessionState::Authentication(state) => advance_authentication(session, state, reply)
            .map(|(next, outcome)| (SessionState::Authentication(next), outcome)),
    };
    match result {
        Ok((next, outcome)) => {
            session.state = next;
            Ok(outcome)
        }
        Err(e) => {
            warn!("DESFire session {} failed in {}: {}", session.id, session.state.name(), e);
            session.fail();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desfire::command::CommandKind;
    use crate::desfire::testing::SimulatedCard;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    const AID: [u8; 3] = [0x01, 0x00, 0x00];
    const DERIVED: [u8; 16] = [0x3Cu8; 16];

    fn provisioning_session() -> DesfireSession {
        DesfireSession::new(
            "04112233445566",
            Uuid::new_v4(),
            SessionState::Provisioning(ProvisionState::SelectPicc),
            DERIVED,
            Utc::now(),
            Duration::seconds(30),
        )
    }

    fn authentication_session() -> DesfireSession {
        DesfireSession::new(
            "04112233445566",
            Uuid::new_v4(),
            SessionState::Authentication(AuthState::SelectApp),
            DERIVED,
            Utc::now(),
            Duration::seconds(30),
        )
    }

    fn reply(bytes: &[u8]) -> CardReply {
        CardReply::parse(bytes).unwrap()
    }

    /// Drive a session against a card until it stops asking for commands
    fn run(session: &mut DesfireSession, card: &mut SimulatedCard, first: DesfireCommand) -> Result<StepOutcome, DesfireError> {
        let mut cmd = first;
        for _ in 0..16 {
            let answer = card.transceive(&cmd.data);
            match advance(session, &AID, &reply(&answer))? {
                StepOutcome::Continue(next) => cmd = next,
                done => return Ok(done),
            }
        }
        panic!("state machine did not terminate");
    }

    #[test]
    fn test_full_provisioning_writes_derived_key() {
        let mut card = SimulatedCard::factory_fresh(AID);
        let mut session = provisioning_session();
        let first = begin_provisioning(&mut session);
        assert_eq!(first.kind, CommandKind::SelectPicc);

        let outcome = run(&mut session, &mut card, first).unwrap();
        assert_eq!(outcome, StepOutcome::Provisioned);
        assert_eq!(session.state, SessionState::Provisioning(ProvisionState::Complete));
        assert_eq!(card.app_key(), Some(DERIVED));
    }

    #[test]
    fn test_provisioning_without_picc_auth() {
        let mut card = SimulatedCard::factory_fresh(AID).without_picc_auth();
        let mut session = provisioning_session();
        let first = begin_provisioning(&mut session);

        let outcome = run(&mut session, &mut card, first).unwrap();
        assert_eq!(outcome, StepOutcome::Provisioned);
        assert_eq!(card.app_key(), Some(DERIVED));
    }

    #[test]
    fn test_create_app_success_and_duplicate_converge() {
        for status in [&[0x00u8][..], &[0x91, 0xDE][..], &[0xDE][..]] {
            let mut session = provisioning_session();
            session.state = SessionState::Provisioning(ProvisionState::CreateApp);
            let outcome = advance(&mut session, &AID, &reply(status)).unwrap();

            assert_eq!(session.state, SessionState::Provisioning(ProvisionState::SelectApp));
            assert!(matches!(outcome, StepOutcome::Continue(ref c) if c.kind == CommandKind::SelectApp));
        }
    }

    #[test]
    fn test_create_app_other_status_fails() {
        let mut session = provisioning_session();
        session.state = SessionState::Provisioning(ProvisionState::CreateApp);
        let result = advance(&mut session, &AID, &reply(&[0x91, 0x9D]));
        assert!(matches!(result, Err(DesfireError::UnexpectedStatus { status: 0x9D, .. })));
        assert_eq!(session.state, SessionState::Provisioning(ProvisionState::Failed));
    }

    #[test]
    fn test_select_app_resets_crypto_state() {
        let mut session = provisioning_session();
        session.state = SessionState::Provisioning(ProvisionState::SelectApp);
        session.session_key = Some([1u8; 16]);
        session.rnd_a = Some([2u8; 16]);
        session.current_key = [3u8; 16];

        advance(&mut session, &AID, &reply(&[0x00])).unwrap();
        assert_eq!(session.state, SessionState::Provisioning(ProvisionState::AuthApp1));
        assert!(session.session_key.is_none());
        assert!(session.rnd_a.is_none());
        assert_eq!(session.current_key, [0u8; 16]);
    }

    #[test]
    fn test_change_key_failure_is_hard() {
        let mut session = provisioning_session();
        session.state = SessionState::Provisioning(ProvisionState::ChangeKey);
        let result = advance(&mut session, &AID, &reply(&[0x91, 0x1E]));
        assert!(result.is_err());
        assert_eq!(session.state, SessionState::Provisioning(ProvisionState::Failed));
    }

    #[test]
    fn test_failed_session_rejects_further_steps() {
        let mut session = provisioning_session();
        session.state = SessionState::Provisioning(ProvisionState::Failed);
        let result = advance(&mut session, &AID, &reply(&[0x00]));
        assert!(matches!(result, Err(DesfireError::InvalidState(_))));
    }

    #[test]
    fn test_authentication_with_correct_key() {
        let mut card = SimulatedCard::provisioned(AID, DERIVED);
        let mut session = authentication_session();
        let first = begin_authentication(&mut session, &AID);

        let outcome = run(&mut session, &mut card, first).unwrap();
        assert_eq!(outcome, StepOutcome::Authenticated);
        assert_eq!(session.session_key, card.session_key());
    }

    #[test]
    fn test_authentication_detects_clone() {
        // Same UID, different key: a copy made without our master key
        let mut card = SimulatedCard::provisioned(AID, [0x77u8; 16]);
        let mut session = authentication_session();
        let first = begin_authentication(&mut session, &AID);

        let outcome = run(&mut session, &mut card, first).unwrap();
        assert_eq!(outcome, StepOutcome::CloneDetected);
        assert_eq!(session.state, SessionState::Authentication(AuthState::Failed));
    }

    #[test]
    fn test_tampered_final_reply_is_clone() {
        let mut card = SimulatedCard::provisioned(AID, DERIVED);
        let mut session = authentication_session();
        let select = begin_authentication(&mut session, &AID);

        let answer = card.transceive(&select.data);
        let auth1 = match advance(&mut session, &AID, &reply(&answer)).unwrap() {
            StepOutcome::Continue(cmd) => cmd,
            other => panic!("unexpected {:?}", other),
        };
        let answer = card.transceive(&auth1.data);
        let auth2 = match advance(&mut session, &AID, &reply(&answer)).unwrap() {
            StepOutcome::Continue(cmd) => cmd,
            other => panic!("unexpected {:?}", other),
        };
        let mut answer = card.transceive(&auth2.data);
        answer[5] ^= 0x01;

        let outcome = advance(&mut session, &AID, &reply(&answer)).unwrap();
        assert_eq!(outcome, StepOutcome::CloneDetected);
    }

    #[test]
    fn test_authentication_app_missing() {
        let mut session = authentication_session();
        let result = advance(&mut session, &AID, &reply(&[0x91, 0xA0]));
        assert!(matches!(result, Err(DesfireError::ApplicationNotFound)));
    }

    #[test]
    fn test_short_enc_rnd_b_is_protocol_error() {
        let mut session = authentication_session();
        session.state = SessionState::Authentication(AuthState::Auth1);
        let result = advance(&mut session, &AID, &reply(&[0xAF, 0x01, 0x02]));
        assert!(matches!(result, Err(DesfireError::WrongLength { expected: 16, got: 2, .. })));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::Provisioning(ProvisionState::AuthPicc1).name(), "prov_auth_picc_1");
        assert_eq!(SessionState::Authentication(AuthState::Auth2).name(), "auth2");
    }
}
