//! In-memory store
//!
//! All tables sit behind one mutex, so every trait method observes and
//! leaves a consistent state. Optionally mirrored to a JSON snapshot.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info};
use parking_lot::Mutex;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::card::{AccessLog, Card, CardStatus, CardToken};
use crate::challenge::Challenge;
use crate::device::Device;
use super::snapshot::{CardLink, Snapshot, SnapshotFile};
use super::{AccessStore, CardFilter, DeviceRegistry, LogFilter, StoreError};

#[derive(Default)]
struct Tables {
    cards: HashMap<Uuid, Card>,
    /// (card, device)
    links: BTreeSet<(Uuid, Uuid)>,
    /// Keyed by token value
    tokens: HashMap<String, CardToken>,
    /// One per device
    challenges: HashMap<Uuid, Challenge>,
    logs: Vec<AccessLog>,
    next_log_id: u64,
    devices: HashMap<Uuid, Device>,
}

impl Tables {
    /// Card with its device links filled in
    fn hydrate(&self, card: &Card) -> Card {
        let mut card = card.clone();
        card.devices = self
            .links
            .iter()
            .filter(|(card_id, _)| *card_id == card.id)
            .map(|(_, device_id)| *device_id)
            .collect();
        card
    }

    fn card_mut(&mut self, id: Uuid) -> Result<&mut Card, StoreError> {
        self.cards.get_mut(&id).ok_or(StoreError::NotFound("card"))
    }

    fn device_mut(&mut self, id: Uuid) -> Result<&mut Device, StoreError> {
        self.devices.get_mut(&id).ok_or(StoreError::NotFound("device"))
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            cards: self.cards.values().cloned().collect(),
            links: self
                .links
                .iter()
                .map(|(card_id, device_id)| CardLink { card_id: *card_id, device_id: *device_id })
                .collect(),
            tokens: self.tokens.values().cloned().collect(),
            logs: self.logs.clone(),
            next_log_id: self.next_log_id,
            devices: self.devices.values().cloned().collect(),
        }
    }

    fn restore(snapshot: Snapshot) -> Self {
        let mut tables = Tables {
            next_log_id: snapshot.next_log_id,
            logs: snapshot.logs,
            ..Default::default()
        };
        for mut card in snapshot.cards {
            card.devices.clear();
            tables.cards.insert(card.id, card);
        }
        for link in snapshot.links {
            tables.links.insert((link.card_id, link.device_id));
        }
        for token in snapshot.tokens {
            tables.tokens.insert(token.token.clone(), token);
        }
        for device in snapshot.devices {
            tables.devices.insert(device.id, device);
        }
        let max_id = tables.logs.iter().map(|l| l.id).max().unwrap_or(0);
        tables.next_log_id = tables.next_log_id.max(max_id);
        tables
    }
}

/// Mutex-guarded implementation of both store traits
pub struct MemoryStore {
    tables: Mutex<Tables>,
    snapshot_file: Option<SnapshotFile>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            snapshot_file: None,
        }
    }

    /// Open a store mirrored to `file`, loading any existing snapshot
    pub fn open(file: SnapshotFile) -> Result<Self, StoreError> {
        let tables = match file.load()? {
            Some(snapshot) => Tables::restore(snapshot),
            None => Tables::default(),
        };
        info!(
            "Store opened with {} cards, {} devices",
            tables.cards.len(),
            tables.devices.len()
        );
        Ok(Self {
            tables: Mutex::new(tables),
            snapshot_file: Some(file),
        })
    }

    /// Register or replace a device record
    pub fn upsert_device(&self, device: Device) {
        self.tables.lock().devices.insert(device.id, device);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessStore for MemoryStore {
    fn create_card(&self, card: Card, token: CardToken, link: Option<Uuid>) -> Result<Card, StoreError> {
        let mut tables = self.tables.lock();
        if tables.cards.values().any(|c| c.uid == card.uid) {
            return Err(StoreError::Duplicate("card"));
        }
        if tables.tokens.contains_key(&token.token) {
            return Err(StoreError::Duplicate("token"));
        }
        if let Some(device_id) = link {
            if !tables.devices.contains_key(&device_id) {
                return Err(StoreError::NotFound("device"));
            }
            tables.links.insert((card.id, device_id));
        }
        let id = card.id;
        tables.tokens.insert(token.token.clone(), token);
        tables.cards.insert(id, card);
        debug!("Card {} created", id);
        let created = tables.hydrate(&tables.cards[&id]);
        Ok(created)
    }

    fn card_by_id(&self, id: Uuid) -> Result<Option<Card>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables.cards.get(&id).map(|c| tables.hydrate(c)))
    }

    fn card_by_uid(&self, uid: &str) -> Result<Option<Card>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables.cards.values().find(|c| c.uid == uid).map(|c| tables.hydrate(c)))
    }

    fn list_cards(&self, filter: &CardFilter) -> Result<Vec<Card>, StoreError> {
        let tables = self.tables.lock();
        let mut cards: Vec<Card> = tables
            .cards
            .values()
            .filter(|c| filter.status.map_or(true, |s| c.status == s))
            .map(|c| tables.hydrate(c))
            .filter(|c| filter.device_id.map_or(true, |d| c.is_linked_to(d)))
            .collect();
        cards.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(cards)
    }

    fn update_card(
        &self,
        id: Uuid,
        name: Option<String>,
        status: Option<CardStatus>,
        now: DateTime<Utc>,
    ) -> Result<Card, StoreError> {
        let mut tables = self.tables.lock();
        let card = tables.card_mut(id)?;
        if let Some(name) = name {
            card.name = if name.is_empty() { None } else { Some(name) };
        }
        if let Some(status) = status {
            card.status = status;
        }
        card.updated_at = now;
        let updated = tables.hydrate(&tables.cards[&id]);
        Ok(updated)
    }

    fn delete_card(&self, id: Uuid) -> Result<Card, StoreError> {
        let mut tables = self.tables.lock();
        let card = tables.cards.get(&id).map(|c| tables.hydrate(c)).ok_or(StoreError::NotFound("card"))?;
        tables.cards.remove(&id);
        tables.tokens.retain(|_, t| t.card_id != id);
        tables.links.retain(|(card_id, _)| *card_id != id);
        Ok(card)
    }

    fn link_card(&self, card_id: Uuid, device_id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        if !tables.cards.contains_key(&card_id) {
            return Err(StoreError::NotFound("card"));
        }
        if !tables.devices.contains_key(&device_id) {
            return Err(StoreError::NotFound("device"));
        }
        Ok(tables.links.insert((card_id, device_id)))
    }

    fn unlink_card(&self, card_id: Uuid, device_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.tables.lock().links.remove(&(card_id, device_id)))
    }

    fn schedule_key_update(&self, card_id: Uuid, now: DateTime<Utc>) -> Result<Option<u32>, StoreError> {
        let mut tables = self.tables.lock();
        let card = tables.card_mut(card_id)?;
        if card.pending_key_update {
            return Ok(None);
        }
        card.pending_key_update = true;
        card.key_version += 1;
        card.updated_at = now;
        Ok(Some(card.key_version))
    }

    fn clear_key_update(&self, card_id: Uuid, now: DateTime<Utc>) -> Result<Card, StoreError> {
        let mut tables = self.tables.lock();
        let card = tables.card_mut(card_id)?;
        card.pending_key_update = false;
        card.updated_at = now;
        let updated = tables.hydrate(&tables.cards[&card_id]);
        Ok(updated)
    }

    fn current_token(&self, card_id: Uuid) -> Result<Option<CardToken>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .tokens
            .values()
            .find(|t| t.card_id == card_id && t.is_current)
            .cloned())
    }

    fn find_token(&self, token: &str, now: DateTime<Utc>) -> Result<Option<CardToken>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables.tokens.get(token).filter(|t| t.is_valid(now)).cloned())
    }

    fn rotate_token(
        &self,
        card_id: Uuid,
        new_token: String,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if !tables.cards.contains_key(&card_id) {
            return Err(StoreError::NotFound("card"));
        }
        if tables.tokens.contains_key(&new_token) {
            return Err(StoreError::Duplicate("token"));
        }
        for token in tables.tokens.values_mut().filter(|t| t.card_id == card_id && t.is_current) {
            token.is_current = false;
            token.expires_at = Some(now + grace);
        }
        tables
            .tokens
            .insert(new_token.clone(), CardToken::current(card_id, new_token, now));
        Ok(())
    }

    fn promote_token(&self, card_id: Uuid, token: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        match tables.tokens.get(token) {
            Some(t) if t.card_id == card_id => {}
            _ => return Ok(false),
        }
        tables.tokens.retain(|value, t| t.card_id != card_id || value == token);
        if let Some(t) = tables.tokens.get_mut(token) {
            t.is_current = true;
            t.expires_at = None;
        }
        Ok(true)
    }

    fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock();
        let before = tables.tokens.len();
        tables.tokens.retain(|_, t| t.is_current || t.expires_at.map_or(false, |at| at > now));
        Ok(before - tables.tokens.len())
    }

    fn upsert_challenge(&self, challenge: Challenge) -> Result<(), StoreError> {
        self.tables.lock().challenges.insert(challenge.device_id, challenge);
        Ok(())
    }

    fn consume_challenge(&self, device_id: Uuid, value: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        let matches = match tables.challenges.get(&device_id) {
            Some(stored) => bool::from(stored.value.as_bytes().ct_eq(value.as_bytes())),
            None => false,
        };
        if !matches {
            return Ok(false);
        }
        // Matching value: deleted whether or not it has expired
        Ok(tables
            .challenges
            .remove(&device_id)
            .map_or(false, |c| c.expires_at > now))
    }

    fn purge_expired_challenges(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock();
        let before = tables.challenges.len();
        tables.challenges.retain(|_, c| c.expires_at > now);
        Ok(before - tables.challenges.len())
    }

    fn append_log(&self, mut entry: AccessLog) -> Result<AccessLog, StoreError> {
        let mut tables = self.tables.lock();
        tables.next_log_id += 1;
        entry.id = tables.next_log_id;
        tables.logs.push(entry.clone());
        Ok(entry)
    }

    fn list_logs(&self, filter: &LogFilter) -> Result<Vec<AccessLog>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .logs
            .iter()
            .rev()
            .filter(|entry| filter.matches(entry))
            .take(filter.effective_limit())
            .cloned()
            .collect())
    }

    fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock();
        let before = tables.logs.len();
        tables.logs.retain(|entry| entry.created_at >= cutoff);
        Ok(before - tables.logs.len())
    }

    /// Write the snapshot, if one is configured. Challenges are never written.
    fn flush(&self) -> bool {
        let Some(file) = &self.snapshot_file else {
            return true;
        };
        let snapshot = self.tables.lock().snapshot();
        let saved = file.save(&snapshot);
        if !saved {
            error!("Failed to persist store snapshot to {:?}", file.path());
        }
        saved
    }
}

impl DeviceRegistry for MemoryStore {
    fn device(&self, id: Uuid) -> Result<Option<Device>, StoreError> {
        Ok(self.tables.lock().devices.get(&id).cloned())
    }

    fn linked_cards(&self, device_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .links
            .iter()
            .filter(|(_, d)| *d == device_id)
            .map(|(card_id, _)| *card_id)
            .collect())
    }

    fn set_pending_chip_id(&self, device_id: Uuid, chip_id: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        tables.device_mut(device_id)?.pending_chip_id = Some(chip_id.to_string());
        Ok(())
    }

    fn confirm_chip_id(&self, device_id: Uuid) -> Result<Option<String>, StoreError> {
        let mut tables = self.tables.lock();
        let device = tables.device_mut(device_id)?;
        match device.pending_chip_id.take() {
            Some(pending) => {
                device.chip_id = Some(pending.clone());
                Ok(Some(pending))
            }
            None => Ok(None),
        }
    }

    fn reject_pending_chip_id(&self, device_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        tables.device_mut(device_id)?.pending_chip_id = None;
        Ok(())
    }

    fn clear_chip_id(&self, device_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let device = tables.device_mut(device_id)?;
        device.chip_id = None;
        device.pending_chip_id = None;
        Ok(())
    }
}
