//! Card records
//!
//! Serializable records shared by the lifecycle service, the decision engine
//! and the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Physical card family reported by the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardType {
    #[serde(rename = "MIFARE_CLASSIC_1K")]
    MifareClassic1k,
    #[serde(rename = "MIFARE_CLASSIC_4K")]
    MifareClassic4k,
    MifareDesfire,
    MifareUltralight,
    Unknown,
}

impl CardType {
    /// Lenient parse of the reader's card type string
    pub fn parse(value: &str) -> Self {
        let upper = value.trim().to_ascii_uppercase();
        if upper.contains("DESFIRE") {
            CardType::MifareDesfire
        } else if upper.contains("ULTRALIGHT") {
            CardType::MifareUltralight
        } else if upper.contains("CLASSIC") && upper.contains("4K") {
            CardType::MifareClassic4k
        } else if upper.contains("CLASSIC") || upper.contains("1K") {
            CardType::MifareClassic1k
        } else {
            CardType::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CardType::MifareClassic1k => "MIFARE_CLASSIC_1K",
            CardType::MifareClassic4k => "MIFARE_CLASSIC_4K",
            CardType::MifareDesfire => "MIFARE_DESFIRE",
            CardType::MifareUltralight => "MIFARE_ULTRALIGHT",
            CardType::Unknown => "UNKNOWN",
        }
    }

    pub fn is_desfire(&self) -> bool {
        matches!(self, CardType::MifareDesfire)
    }
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Card lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    Pending,
    Active,
    Disabled,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Pending => "pending",
            CardStatus::Active => "active",
            CardStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(CardStatus::Pending),
            "active" => Ok(CardStatus::Active),
            "disabled" => Ok(CardStatus::Disabled),
            other => Err(format!("unknown card status: {}", other)),
        }
    }
}

/// Normalize a card UID: no whitespace, uppercase hex
pub fn normalize_uid(uid: &str) -> String {
    uid.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// A registered card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: Uuid,
    pub uid: String,
    #[serde(rename = "type")]
    pub card_type: CardType,
    #[serde(default)]
    pub name: Option<String>,
    pub status: CardStatus,
    pub key_version: u32,
    pub pending_key_update: bool,
    /// Devices this card may open; filled in by the store on read
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Card {
    /// A freshly discovered card: always pending
    pub fn discovered(uid: &str, card_type: CardType, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            uid: normalize_uid(uid),
            card_type,
            name: None,
            status: CardStatus::Pending,
            key_version: 1,
            pending_key_update: false,
            devices: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Label for readers and dashboards
    pub fn display_name(&self) -> &str {
        match &self.name {
            Some(name) if !name.is_empty() => name,
            _ => &self.uid,
        }
    }

    pub fn is_linked_to(&self, device_id: Uuid) -> bool {
        self.devices.contains(&device_id)
    }
}

/// A rotating per-card secret
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardToken {
    pub card_id: Uuid,
    pub token: String,
    pub is_current: bool,
    /// Set when the token is superseded
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CardToken {
    pub fn current(card_id: Uuid, token: String, now: DateTime<Utc>) -> Self {
        Self {
            card_id,
            token,
            is_current: true,
            expires_at: None,
            created_at: now,
        }
    }

    /// Usable: current, or superseded but still inside the overlap window
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.is_current || self.expires_at.map_or(false, |at| at > now)
    }
}

impl fmt::Debug for CardToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardToken")
            .field("card_id", &self.card_id)
            .field("is_current", &self.is_current)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Audit log action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Verify,
    Register,
    CardStatus,
    CardDelete,
    KeyRotation,
    TokenRotation,
    CloneAttempt,
    Challenge,
    Provision,
    DesfireAuth,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::Verify => "verify",
            LogAction::Register => "register",
            LogAction::CardStatus => "card_status",
            LogAction::CardDelete => "card_delete",
            LogAction::KeyRotation => "key_rotation",
            LogAction::TokenRotation => "token_rotation",
            LogAction::CloneAttempt => "clone_attempt",
            LogAction::Challenge => "challenge",
            LogAction::Provision => "provision",
            LogAction::DesfireAuth => "desfire_auth",
        }
    }
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLog {
    /// Assigned by the store
    #[serde(default)]
    pub id: u64,
    pub device_id: Option<Uuid>,
    pub card_uid: Option<String>,
    pub card_type: Option<CardType>,
    pub action: LogAction,
    pub status: String,
    pub allowed: bool,
    pub created_at: DateTime<Utc>,
}

impl AccessLog {
    pub fn new(action: LogAction, status: &str, allowed: bool) -> Self {
        Self {
            id: 0,
            device_id: None,
            card_uid: None,
            card_type: None,
            action,
            status: status.to_string(),
            allowed,
            created_at: Utc::now(),
        }
    }

    pub fn device(mut self, device_id: Uuid) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn card(mut self, card_uid: &str, card_type: CardType) -> Self {
        self.card_uid = Some(card_uid.to_string());
        self.card_type = Some(card_type);
        self
    }
}
