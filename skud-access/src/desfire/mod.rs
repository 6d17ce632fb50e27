//! DESFire EV1 AES engine
//!
//! Server side of the card protocol: the reader relays our commands to the
//! card and forwards the card's replies back. The engine keeps per-session
//! crypto state between round trips.

pub mod auth;
pub mod command;
pub mod engine;
pub mod provisioning;
pub mod session;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

use crate::crypto::AesError;

pub use command::{CommandKind, DesfireCommand};
pub use engine::{DesfireEngine, Flow, StepResult};
pub use provisioning::{AuthState, ProvisionState, SessionState, StepOutcome};
pub use session::{DesfireSession, SessionTable};
pub use status::{CardReply, DesfireStatus};

/// Protocol and session errors
///
/// Any of these aborts the session it occurred in.
#[derive(Debug, Error)]
pub enum DesfireError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("empty card reply")]
    EmptyReply,
    #[error("{what} must be {expected} bytes, got {got}")]
    WrongLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{step} failed: card returned status 0x{status:02X}")]
    UnexpectedStatus { step: &'static str, status: u8 },
    #[error("application not found on card")]
    ApplicationNotFound,
    #[error("{0} authentication failed")]
    AuthenticationFailed(&'static str),
    #[error("no session key established")]
    MissingSessionKey,
    #[error("session not found")]
    SessionNotFound,
    #[error("session expired")]
    SessionExpired,
    #[error("session belongs to another device")]
    WrongDevice,
    #[error("session does not accept this operation in state {0}")]
    InvalidState(&'static str),
    #[error("crypto error: {0}")]
    Crypto(#[from] AesError),
}

impl DesfireError {
    /// Short machine-readable reason reported to readers
    pub fn reason(&self) -> &'static str {
        match self {
            DesfireError::InvalidHex(_) | DesfireError::EmptyReply => "invalid_response",
            DesfireError::WrongLength { .. } => "invalid_length",
            DesfireError::UnexpectedStatus { .. } => "unexpected_status",
            DesfireError::ApplicationNotFound => "app_not_found",
            DesfireError::AuthenticationFailed(_) => "auth_failed",
            DesfireError::MissingSessionKey | DesfireError::Crypto(_) => "crypto_error",
            DesfireError::SessionNotFound => "session_not_found",
            DesfireError::SessionExpired => "session_expired",
            DesfireError::WrongDevice => "wrong_device",
            DesfireError::InvalidState(_) => "invalid_state",
        }
    }
}
