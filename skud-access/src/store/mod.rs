//! Persistence collaborators
//!
//! The access core talks to storage through two traits. Every method is one
//! atomic operation: implementations backed by a relational database map each
//! to a single statement or transaction.

pub mod memory;
pub mod snapshot;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::card::{AccessLog, Card, CardStatus, CardToken, CardType, LogAction};
use crate::challenge::Challenge;
use crate::device::Device;

pub use memory::MemoryStore;
pub use snapshot::{Snapshot, SnapshotFile};

/// Default page size for log queries
pub const DEFAULT_LOG_LIMIT: usize = 100;

/// Largest page a log query may request
pub const MAX_LOG_LIMIT: usize = 500;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0} already exists")]
    Duplicate(&'static str),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Card list filter
#[derive(Debug, Clone, Default)]
pub struct CardFilter {
    pub status: Option<CardStatus>,
    pub device_id: Option<Uuid>,
}

/// Access log query
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub action: Option<LogAction>,
    pub allowed: Option<bool>,
    /// Case-insensitive substring of the card UID
    pub card_uid: Option<String>,
    pub device_id: Option<Uuid>,
    pub card_type: Option<CardType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl LogFilter {
    /// Requested limit, defaulted and capped
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            None | Some(0) => DEFAULT_LOG_LIMIT,
            Some(limit) => limit.min(MAX_LOG_LIMIT),
        }
    }

    pub fn matches(&self, entry: &AccessLog) -> bool {
        if self.action.map_or(false, |action| action != entry.action) {
            return false;
        }
        if self.allowed.map_or(false, |allowed| allowed != entry.allowed) {
            return false;
        }
        if let Some(needle) = &self.card_uid {
            let needle = needle.to_ascii_uppercase();
            match &entry.card_uid {
                Some(uid) if uid.to_ascii_uppercase().contains(&needle) => {}
                _ => return false,
            }
        }
        if self.device_id.is_some() && self.device_id != entry.device_id {
            return false;
        }
        if self.card_type.is_some() && self.card_type != entry.card_type {
            return false;
        }
        if self.from.map_or(false, |from| entry.created_at < from) {
            return false;
        }
        if self.to.map_or(false, |to| entry.created_at > to) {
            return false;
        }
        true
    }
}

/// Cards, tokens, challenges and the audit log
pub trait AccessStore: Send + Sync {
    /// Insert a card together with its first token and optional device link.
    /// Fails with `Duplicate` if the UID is taken.
    fn create_card(&self, card: Card, token: CardToken, link: Option<Uuid>) -> Result<Card, StoreError>;
    fn card_by_id(&self, id: Uuid) -> Result<Option<Card>, StoreError>;
    fn card_by_uid(&self, uid: &str) -> Result<Option<Card>, StoreError>;
    fn list_cards(&self, filter: &CardFilter) -> Result<Vec<Card>, StoreError>;
    fn update_card(
        &self,
        id: Uuid,
        name: Option<String>,
        status: Option<CardStatus>,
        now: DateTime<Utc>,
    ) -> Result<Card, StoreError>;
    /// Remove a card with its tokens and links
    fn delete_card(&self, id: Uuid) -> Result<Card, StoreError>;
    /// Returns false if the link already existed
    fn link_card(&self, card_id: Uuid, device_id: Uuid) -> Result<bool, StoreError>;
    /// Returns false if there was no such link
    fn unlink_card(&self, card_id: Uuid, device_id: Uuid) -> Result<bool, StoreError>;
    /// Flag a key update and bump the key version, unless one is already
    /// pending. Returns the new version, or `None` when already pending.
    fn schedule_key_update(&self, card_id: Uuid, now: DateTime<Utc>) -> Result<Option<u32>, StoreError>;
    fn clear_key_update(&self, card_id: Uuid, now: DateTime<Utc>) -> Result<Card, StoreError>;

    fn current_token(&self, card_id: Uuid) -> Result<Option<CardToken>, StoreError>;
    /// Find a token that is current or still inside its overlap window
    fn find_token(&self, token: &str, now: DateTime<Utc>) -> Result<Option<CardToken>, StoreError>;
    /// Demote the current token with an expiry of `now + grace` and insert
    /// `new_token` as current, in one transaction
    fn rotate_token(
        &self,
        card_id: Uuid,
        new_token: String,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    /// Delete every other token of the card and make `token` current with no
    /// expiry, in one transaction. Returns false if the token is unknown.
    fn promote_token(&self, card_id: Uuid, token: &str) -> Result<bool, StoreError>;
    fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Insert or replace the device's challenge
    fn upsert_challenge(&self, challenge: Challenge) -> Result<(), StoreError>;
    /// Delete the device's challenge if `value` matches, expired or not.
    /// Returns true only if a matching unexpired challenge was deleted.
    fn consume_challenge(&self, device_id: Uuid, value: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;
    fn purge_expired_challenges(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    fn append_log(&self, entry: AccessLog) -> Result<AccessLog, StoreError>;
    /// Newest first
    fn list_logs(&self, filter: &LogFilter) -> Result<Vec<AccessLog>, StoreError>;
    fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Persist buffered state, if the implementation buffers any.
    /// Returns false if persisting failed.
    fn flush(&self) -> bool {
        true
    }
}

/// Device class and identity-lock fields
pub trait DeviceRegistry: Send + Sync {
    fn device(&self, id: Uuid) -> Result<Option<Device>, StoreError>;
    fn linked_cards(&self, device_id: Uuid) -> Result<Vec<Uuid>, StoreError>;
    fn set_pending_chip_id(&self, device_id: Uuid, chip_id: &str) -> Result<(), StoreError>;
    /// Move pending to confirmed. Returns the confirmed id, or `None` if
    /// nothing was pending.
    fn confirm_chip_id(&self, device_id: Uuid) -> Result<Option<String>, StoreError>;
    fn reject_pending_chip_id(&self, device_id: Uuid) -> Result<(), StoreError>;
    /// Clear both confirmed and pending identifiers
    fn clear_chip_id(&self, device_id: Uuid) -> Result<(), StoreError>;
}
