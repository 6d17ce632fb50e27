//! Card lifecycle and token rotation
//!
//! A card starts `pending` and only an operator moves it on. Each card owns
//! one current token; rotating demotes the old one into a grace window so a
//! reader that has not caught up yet keeps working.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use uuid::Uuid;

use crate::crypto::random_hex;
use crate::error::{AccessError, ConflictReason};
use crate::store::{AccessStore, StoreError};
use super::model::{Card, CardStatus, CardToken, CardType};

/// Overlap window for a superseded token
pub const DEFAULT_TOKEN_GRACE_SECS: i64 = 24 * 60 * 60;

/// Random bytes per card token
pub const TOKEN_BYTES: usize = 32;

/// A presented token that resolved to a card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenMatch {
    pub card_id: Uuid,
    pub is_current: bool,
}

pub struct CardLifecycle {
    store: Arc<dyn AccessStore>,
    grace: Duration,
}

impl CardLifecycle {
    pub fn new(store: Arc<dyn AccessStore>, grace: Duration) -> Self {
        Self { store, grace }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Create a freshly discovered card with its first token
    pub fn register_pending(
        &self,
        uid: &str,
        card_type: CardType,
        link: Option<Uuid>,
    ) -> Result<(Card, String), StoreError> {
        let now = Utc::now();
        let card = Card::discovered(uid, card_type, now);
        let token = random_hex(TOKEN_BYTES);
        let card = self
            .store
            .create_card(card.clone(), CardToken::current(card.id, token.clone(), now), link)?;
        info!("Card {} registered as pending", card.uid);
        Ok((card, token))
    }

    pub fn set_status(&self, card_id: Uuid, status: CardStatus) -> Result<Card, StoreError> {
        let card = self.store.update_card(card_id, None, Some(status), Utc::now())?;
        info!("Card {} is now {}", card.uid, status);
        Ok(card)
    }

    /// Issue a new current token; the previous one enters its grace window
    pub fn rotate(&self, card_id: Uuid) -> Result<String, StoreError> {
        let token = random_hex(TOKEN_BYTES);
        self.store.rotate_token(card_id, token.clone(), self.grace, Utc::now())?;
        info!("Token rotated for card {}", card_id);
        Ok(token)
    }

    /// Look up a token that is current or still in its grace window
    pub fn resolve(&self, token: &str) -> Result<Option<TokenMatch>, StoreError> {
        self.resolve_at(token, Utc::now())
    }

    pub fn resolve_at(&self, token: &str, now: DateTime<Utc>) -> Result<Option<TokenMatch>, StoreError> {
        if token.is_empty() {
            return Ok(None);
        }
        Ok(self.store.find_token(token, now)?.map(|t| TokenMatch {
            card_id: t.card_id,
            is_current: t.is_current,
        }))
    }

    /// Finish a rotation once the reader presented the old token
    pub fn promote(&self, card_id: Uuid, token: &str) -> Result<bool, StoreError> {
        let promoted = self.store.promote_token(card_id, token)?;
        if promoted {
            info!("Token promoted for card {}", card_id);
        }
        Ok(promoted)
    }

    pub fn purge_expired_tokens(&self) -> Result<usize, StoreError> {
        let purged = self.store.purge_expired_tokens(Utc::now())?;
        if purged > 0 {
            debug!("Purged {} expired tokens", purged);
        }
        Ok(purged)
    }

    /// Flag a card for a DESFire key change and bump its key version
    pub fn schedule_key_rotation(&self, card_id: Uuid) -> Result<u32, AccessError> {
        match self.store.schedule_key_update(card_id, Utc::now())? {
            Some(version) => {
                info!("Key rotation scheduled for card {} (version {})", card_id, version);
                Ok(version)
            }
            None => Err(AccessError::Conflict(ConflictReason::KeyRotationPending)),
        }
    }

    pub fn complete_key_rotation(&self, card_id: Uuid) -> Result<Card, StoreError> {
        let card = self.store.clear_key_update(card_id, Utc::now())?;
        info!("Key rotation completed for card {}", card.uid);
        Ok(card)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn lifecycle() -> (Arc<MemoryStore>, CardLifecycle) {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = CardLifecycle::new(store.clone(), Duration::seconds(DEFAULT_TOKEN_GRACE_SECS));
        (store, lifecycle)
    }

    #[test]
    fn test_register_pending() {
        let (store, lifecycle) = lifecycle();
        let (card, token) = lifecycle.register_pending("abc123", CardType::MifareDesfire, None).unwrap();
        assert_eq!(card.status, CardStatus::Pending);
        assert_eq!(card.uid, "ABC123");
        assert_eq!(token.len(), 64);
        assert_eq!(store.current_token(card.id).unwrap().unwrap().token, token);

        let again = lifecycle.register_pending("ABC123", CardType::MifareDesfire, None);
        assert_eq!(again.unwrap_err(), StoreError::Duplicate("card"));
    }

    #[test]
    fn test_rotation_overlap_and_promote() {
        let (store, lifecycle) = lifecycle();
        let (card, old) = lifecycle.register_pending("ABC123", CardType::MifareDesfire, None).unwrap();
        let new = lifecycle.rotate(card.id).unwrap();
        assert_ne!(old, new);

        let now = Utc::now();
        assert_eq!(
            lifecycle.resolve_at(&new, now).unwrap(),
            Some(TokenMatch { card_id: card.id, is_current: true })
        );
        assert_eq!(
            lifecycle.resolve_at(&old, now).unwrap(),
            Some(TokenMatch { card_id: card.id, is_current: false })
        );
        assert_eq!(lifecycle.resolve_at(&old, now + Duration::hours(25)).unwrap(), None);

        assert!(lifecycle.promote(card.id, &old).unwrap());
        assert_eq!(store.current_token(card.id).unwrap().unwrap().token, old);
        assert_eq!(lifecycle.resolve(&new).unwrap(), None);
    }

    #[test]
    fn test_key_rotation_conflict() {
        let (_, lifecycle) = lifecycle();
        let (card, _) = lifecycle.register_pending("ABC123", CardType::MifareDesfire, None).unwrap();

        assert_eq!(lifecycle.schedule_key_rotation(card.id).unwrap(), 2);
        assert!(matches!(
            lifecycle.schedule_key_rotation(card.id),
            Err(AccessError::Conflict(ConflictReason::KeyRotationPending))
        ));

        let card = lifecycle.complete_key_rotation(card.id).unwrap();
        assert!(!card.pending_key_update);
        assert_eq!(card.key_version, 2);
    }

    #[test]
    fn test_unknown_card() {
        let (_, lifecycle) = lifecycle();
        assert_eq!(lifecycle.rotate(Uuid::new_v4()).unwrap_err(), StoreError::NotFound("card"));
        assert!(matches!(
            lifecycle.schedule_key_rotation(Uuid::new_v4()),
            Err(AccessError::NotFound("card"))
        ));
        assert_eq!(lifecycle.resolve("").unwrap(), None);
    }
}
