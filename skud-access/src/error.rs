//! Error taxonomy of the access core

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::desfire::DesfireError;
use crate::store::StoreError;

/// Why a protected request was refused before any card lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ChallengeRequired,
    InvalidChallenge,
    CloneDetected,
    HardwareIdRequired,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::ChallengeRequired => "challenge_required",
            RejectReason::InvalidChallenge => "invalid_or_expired_challenge",
            RejectReason::CloneDetected => "clone_detected",
            RejectReason::HardwareIdRequired => "hardware_id_required",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    CardPending,
    KeyRotationPending,
    CardExists,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::CardPending => "card_pending",
            ConflictReason::KeyRotationPending => "key_rotation_pending",
            ConflictReason::CardExists => "card_exists",
        }
    }
}

/// Card-level denial during verify. Not an error: the caller gets a
/// negative decision, never a hint about which uids exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotFound,
    NotActive,
    NotLinked,
    TokenRequired,
    InvalidToken,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::NotFound => "not_found",
            DenyReason::NotActive => "not_active",
            DenyReason::NotLinked => "not_linked",
            DenyReason::TokenRequired => "token_required",
            DenyReason::InvalidToken => "invalid_token",
        }
    }
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("authentication rejected: {}", .0.as_str())]
    Rejected(RejectReason),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {}", .0.as_str())]
    Conflict(ConflictReason),
    #[error("device class does not support this operation")]
    NotEligible,
    #[error("protocol error: {0}")]
    Protocol(#[from] DesfireError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for AccessError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => AccessError::NotFound(what),
            StoreError::Duplicate("card") => AccessError::Conflict(ConflictReason::CardExists),
            other => AccessError::Store(other),
        }
    }
}

impl AccessError {
    /// Fails closed and must be logged
    pub fn is_rejection(&self) -> bool {
        matches!(self, AccessError::Rejected(_))
    }
}
