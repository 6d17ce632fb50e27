//! Access Decision Engine
//!
//! `AccessService` is the one place readers and the management layer call
//! into. It runs the challenge and identity gates, applies the card rules,
//! drives DESFire sessions, and writes every outcome to the audit log before
//! answering. Audit-log write failures are reported through `error!` and
//! never change the answer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::card::{
    normalize_uid, AccessLog, Card, CardLifecycle, CardStatus, CardType, LogAction,
};
use crate::challenge::{ChallengeGate, ChallengeGrant};
use crate::config::{Config, ConfigError};
use crate::crypto::KeyDerivation;
use crate::desfire::{DesfireCommand, DesfireEngine, DesfireError, Flow, StepOutcome};
use crate::device::Device;
use crate::error::{AccessError, ConflictReason, DenyReason, RejectReason};
use crate::events::{CardAction, EventSink, LiveEvent};
use crate::identity::{IdentityLock, IdentityVerdict};
use crate::store::{AccessStore, CardFilter, DeviceRegistry, LogFilter, MemoryStore, SnapshotFile};
use crate::sweeper::{Sweeper, SweeperSet};

/// Reader timeout while the server drives a provisioning run
pub const PROVISION_TIMEOUT_MS: u32 = 30_000;
/// Reader timeout for an authentication exchange
pub const AUTH_TIMEOUT_MS: u32 = 10_000;
/// Reader timeout for an immediate answer
pub const IMMEDIATE_TIMEOUT_MS: u32 = 5_000;

/// Who is calling, and the proofs they sent along
#[derive(Debug, Clone)]
pub struct DeviceRequest {
    pub device_id: Uuid,
    /// Hardware identifier header
    pub hardware_id: Option<String>,
    pub challenge: Option<String>,
}

impl DeviceRequest {
    pub fn new(device_id: Uuid) -> Self {
        Self {
            device_id,
            hardware_id: None,
            challenge: None,
        }
    }

    pub fn hardware_id(mut self, hardware_id: &str) -> Self {
        self.hardware_id = Some(hardware_id.to_string());
        self
    }

    pub fn challenge(mut self, challenge: &str) -> Self {
        self.challenge = Some(challenge.to_string());
        self
    }
}

/// A card as presented at a reader
#[derive(Debug, Clone)]
pub struct CardPresentation {
    pub card_uid: String,
    pub card_type: CardType,
    pub token: Option<String>,
}

impl CardPresentation {
    pub fn new(card_uid: &str, card_type: CardType) -> Self {
        Self {
            card_uid: normalize_uid(card_uid),
            card_type,
            token: None,
        }
    }

    pub fn token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyOutcome {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_display_name: Option<String>,
    /// The presented token finished a pending rotation
    pub token_updated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
}

impl VerifyOutcome {
    fn deny(reason: DenyReason, card: Option<&Card>) -> Self {
        Self {
            allowed: false,
            card_display_name: card.map(|c| c.display_name().to_string()),
            token_updated: false,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterOutcome {
    pub card_id: Uuid,
    pub status: CardStatus,
    /// A new pending card was created
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningMode {
    /// The server drives the card command by command
    Cloud,
    /// The reader writes the key itself and confirms afterwards
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningStart {
    Cloud { session_id: String, command: DesfireCommand },
    Local { session_id: String, derived_key_hex: String },
}

impl ProvisioningStart {
    pub fn session_id(&self) -> &str {
        match self {
            ProvisioningStart::Cloud { session_id, .. } | ProvisioningStart::Local { session_id, .. } => session_id,
        }
    }
}

/// Answer to one submitted card reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepReply {
    Continue(DesfireCommand),
    /// Key written and card registered as pending
    Provisioned(Card),
    /// Key written, but the uid was already registered
    AlreadyRegistered { card_uid: String },
    Granted { card_display_name: String },
    Denied { reason: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionDenial {
    NotFound,
    CardDisabled,
    WrongDevice,
    CardPending,
}

impl SessionDenial {
    /// Only an active card linked to the device may authenticate there
    fn for_card(card: &Card, device_id: Uuid) -> Option<Self> {
        if card.status == CardStatus::Disabled {
            Some(SessionDenial::CardDisabled)
        } else if !card.is_linked_to(device_id) {
            Some(SessionDenial::WrongDevice)
        } else if card.status == CardStatus::Pending {
            Some(SessionDenial::CardPending)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionDenial::NotFound => "not_found",
            SessionDenial::CardDisabled => "card_disabled",
            SessionDenial::WrongDevice => "wrong_device",
            SessionDenial::CardPending => "card_pending",
        }
    }
}

/// How a reader should proceed with a presented card
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardSession {
    /// Fall back to the token flow
    NotDesfire,
    Provision { session_id: String, command: DesfireCommand },
    Authenticate { session_id: String, command: DesfireCommand },
    Denied(SessionDenial),
}

impl CardSession {
    pub fn timeout_ms(&self) -> u32 {
        match self {
            CardSession::Provision { .. } => PROVISION_TIMEOUT_MS,
            CardSession::Authenticate { .. } => AUTH_TIMEOUT_MS,
            CardSession::NotDesfire | CardSession::Denied(_) => IMMEDIATE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Registered(Card),
    AlreadyRegistered { card_uid: String },
    /// The reader reported failure; the session is gone
    Failed,
}

pub struct AccessService {
    config: Config,
    store: Arc<dyn AccessStore>,
    registry: Arc<dyn DeviceRegistry>,
    events: Arc<dyn EventSink>,
    engine: Arc<DesfireEngine>,
    gate: Arc<ChallengeGate>,
    identity: IdentityLock,
    lifecycle: Arc<CardLifecycle>,
}

impl AccessService {
    pub fn new(
        config: Config,
        store: Arc<dyn AccessStore>,
        registry: Arc<dyn DeviceRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, AccessError> {
        let kdf = KeyDerivation::new(&config.master_key).map_err(|_| ConfigError::InvalidMasterKey)?;
        if config.dev_master_key {
            warn!("Access service running with the development master key");
        }
        let engine = Arc::new(DesfireEngine::new(kdf, config.app_id, config.session_ttl));
        let gate = Arc::new(ChallengeGate::new(Arc::clone(&store), config.challenge_ttl));
        let identity = IdentityLock::new(Arc::clone(&registry), Arc::clone(&events), config.identity_policy);
        let lifecycle = Arc::new(CardLifecycle::new(Arc::clone(&store), config.token_grace));

        Ok(Self {
            config,
            store,
            registry,
            events,
            engine,
            gate,
            identity,
            lifecycle,
        })
    }

    /// Service backed by a [`MemoryStore`] mirrored to `config.storage_dir`
    pub fn persistent(config: Config, events: Arc<dyn EventSink>) -> Result<(Self, Arc<MemoryStore>), AccessError> {
        let store = Arc::new(MemoryStore::open(SnapshotFile::new(Some(config.storage_dir.clone())))?);
        let service = Self::new(config, store.clone(), store.clone(), events)?;
        Ok((service, store))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &DesfireEngine {
        &self.engine
    }

    fn device(&self, device_id: Uuid) -> Result<Device, AccessError> {
        self.registry.device(device_id)?.ok_or(AccessError::NotFound("device"))
    }

    fn existing_card(&self, card_id: Uuid) -> Result<Card, AccessError> {
        self.store.card_by_id(card_id)?.ok_or(AccessError::NotFound("card"))
    }

    /// Append to the audit log and broadcast. Never fails the caller.
    fn record(&self, entry: AccessLog) {
        let entry = match self.store.append_log(entry.clone()) {
            Ok(saved) => saved,
            Err(e) => {
                error!("Failed to write access log ({} / {}): {}", entry.action.as_str(), entry.status, e);
                entry
            }
        };
        self.events.publish(LiveEvent::AccessLog(entry));
    }

    fn card_changed(&self, action: CardAction, card: Card) {
        self.events.publish(LiveEvent::CardUpdate { action, card });
    }

    fn clone_alert(&self, device_id: Uuid, card_uid: Option<&str>, presented: Option<String>) {
        self.events.publish(LiveEvent::CloneAlert {
            device_id,
            card_uid: card_uid.map(str::to_string),
            presented_hardware_id: presented,
        });
    }

    /// Hardware identity check shared by every protected entry point
    fn check_identity(
        &self,
        device: &Device,
        hardware_id: Option<&str>,
        action: LogAction,
        card: Option<&CardPresentation>,
    ) -> Result<IdentityVerdict, AccessError> {
        let verdict = self.identity.check(device, hardware_id)?;
        let log_entry = |clone_action: LogAction, status: &str| {
            let entry = AccessLog::new(clone_action, status, false).device(device.id);
            match card {
                Some(card) => entry.card(&card.card_uid, card.card_type),
                None => entry,
            }
        };

        match verdict {
            IdentityVerdict::CloneDetected { presented } => {
                let clone_action = if action == LogAction::Challenge {
                    LogAction::Challenge
                } else {
                    LogAction::CloneAttempt
                };
                self.record(log_entry(clone_action, "clone_detected"));
                self.clone_alert(device.id, card.map(|c| c.card_uid.as_str()), Some(presented));
                Err(AccessError::Rejected(RejectReason::CloneDetected))
            }
            IdentityVerdict::MissingHeader => {
                self.record(log_entry(action, "hardware_id_required"));
                Err(AccessError::Rejected(RejectReason::HardwareIdRequired))
            }
            other => Ok(other),
        }
    }

    /// Challenge, then identity. Returns the calling device.
    fn authenticate(
        &self,
        request: &DeviceRequest,
        action: LogAction,
        card: &CardPresentation,
    ) -> Result<Device, AccessError> {
        let device = self.device(request.device_id)?;
        let rejected = |status: &str| {
            AccessLog::new(action, status, false)
                .device(device.id)
                .card(&card.card_uid, card.card_type)
        };

        if device.class.requires_challenge() {
            let challenge = request.challenge.as_deref().filter(|c| !c.is_empty());
            let Some(challenge) = challenge else {
                self.record(rejected("challenge_required"));
                return Err(AccessError::Rejected(RejectReason::ChallengeRequired));
            };
            if !self.gate.consume(device.id, challenge)? {
                self.record(rejected("invalid_challenge"));
                return Err(AccessError::Rejected(RejectReason::InvalidChallenge));
            }
        }

        self.check_identity(&device, request.hardware_id.as_deref(), action, Some(card))?;
        Ok(device)
    }

    /// Hand out a one-time challenge to an access-control reader
    pub fn issue_challenge(&self, device_id: Uuid, hardware_id: Option<&str>) -> Result<ChallengeGrant, AccessError> {
        let device = self.device(device_id)?;
        if !device.class.requires_challenge() {
            return Err(AccessError::NotEligible);
        }
        self.check_identity(&device, hardware_id, LogAction::Challenge, None)?;
        Ok(self.gate.issue(device.id)?)
    }

    /// Decide whether a presented card opens this reader
    pub fn verify(&self, request: &DeviceRequest, presented: &CardPresentation) -> Result<VerifyOutcome, AccessError> {
        let device = self.authenticate(request, LogAction::Verify, presented)?;
        let entry = |status: &str, allowed: bool| {
            AccessLog::new(LogAction::Verify, status, allowed)
                .device(device.id)
                .card(&presented.card_uid, presented.card_type)
        };

        let Some(card) = self.store.card_by_uid(&presented.card_uid)? else {
            info!("Verify: card {} not found on device {}", presented.card_uid, device.id);
            self.record(entry(DenyReason::NotFound.as_str(), false));
            return Ok(VerifyOutcome::deny(DenyReason::NotFound, None));
        };

        let active = card.status == CardStatus::Active;
        let linked = card.is_linked_to(device.id);
        info!(
            "Verify: device {} card {} status {} linked {}",
            device.id, card.uid, card.status, linked
        );
        if !active || !linked {
            let reason = if active { DenyReason::NotLinked } else { DenyReason::NotActive };
            self.record(entry(card.status.as_str(), false));
            return Ok(VerifyOutcome::deny(reason, Some(&card)));
        }

        let mut token_updated = false;
        if device.class.requires_card_token() {
            let token = presented.token.as_deref().filter(|t| !t.is_empty());
            match token {
                None if card.card_type.is_desfire() => {
                    warn!("Verify: DESFire card {} presented without token", card.uid);
                    self.record(entry(DenyReason::TokenRequired.as_str(), false));
                    return Ok(VerifyOutcome::deny(DenyReason::TokenRequired, Some(&card)));
                }
                None => {}
                Some(token) => match self.lifecycle.resolve(token)? {
                    Some(found) if found.card_id == card.id => {
                        if !found.is_current {
                            if !self.lifecycle.promote(card.id, token)? {
                                self.record(entry(DenyReason::InvalidToken.as_str(), false));
                                return Ok(VerifyOutcome::deny(DenyReason::InvalidToken, Some(&card)));
                            }
                            token_updated = true;
                        }
                    }
                    _ => {
                        warn!("Verify: invalid token for card {}", card.uid);
                        self.record(entry(DenyReason::InvalidToken.as_str(), false));
                        return Ok(VerifyOutcome::deny(DenyReason::InvalidToken, Some(&card)));
                    }
                },
            }
        }

        self.record(entry(card.status.as_str(), true));
        Ok(VerifyOutcome {
            allowed: true,
            card_display_name: Some(card.display_name().to_string()),
            token_updated,
            reason: None,
        })
    }

    /// Report a card seen at a reader
    pub fn register(&self, request: &DeviceRequest, presented: &CardPresentation) -> Result<RegisterOutcome, AccessError> {
        let device = self.authenticate(request, LogAction::Register, presented)?;
        let entry = |status: &str| {
            AccessLog::new(LogAction::Register, status, false)
                .device(device.id)
                .card(&presented.card_uid, presented.card_type)
        };
        let link = device.class.accepts_cards().then_some(device.id);

        match self.store.card_by_uid(&presented.card_uid)? {
            None => {
                let (card, _) = self
                    .lifecycle
                    .register_pending(&presented.card_uid, presented.card_type, link)?;
                self.record(entry(CardStatus::Pending.as_str()));
                let outcome = RegisterOutcome {
                    card_id: card.id,
                    status: card.status,
                    created: true,
                };
                self.card_changed(CardAction::Created, card);
                Ok(outcome)
            }
            Some(card) if card.status == CardStatus::Pending => {
                info!("Register: card {} already pending", card.uid);
                self.record(entry("conflict"));
                Err(AccessError::Conflict(ConflictReason::CardPending))
            }
            Some(card) => {
                if let Some(device_id) = link {
                    if !card.is_linked_to(device_id) && self.store.link_card(card.id, device_id)? {
                        info!("Register: card {} linked to device {}", card.uid, device_id);
                    }
                }
                self.record(entry(card.status.as_str()));
                Ok(RegisterOutcome {
                    card_id: card.id,
                    status: card.status,
                    created: false,
                })
            }
        }
    }

    /// Dispatch a card presented at a DESFire-capable reader
    pub fn begin_card_session(
        &self,
        device_id: Uuid,
        card_uid: &str,
        card_type: Option<CardType>,
    ) -> Result<CardSession, AccessError> {
        let device = self.device(device_id)?;
        if card_type.map_or(false, |t| !t.is_desfire()) {
            return Ok(CardSession::NotDesfire);
        }
        let card_uid = normalize_uid(card_uid);

        let Some(card) = self.store.card_by_uid(&card_uid)? else {
            info!("Card {} unknown, starting provisioning", card_uid);
            let (session_id, command) = self.engine.start_provisioning(&card_uid, device.id);
            return Ok(CardSession::Provision { session_id, command });
        };

        Ok(self.open_authentication(&card, device.id))
    }

    fn open_authentication(&self, card: &Card, device_id: Uuid) -> CardSession {
        if let Some(denial) = SessionDenial::for_card(card, device_id) {
            info!("Card {} denied on device {}: {}", card.uid, device_id, denial.as_str());
            return CardSession::Denied(denial);
        }
        let (session_id, command) = self.engine.start_authentication(&card.uid, device_id);
        CardSession::Authenticate { session_id, command }
    }

    pub fn start_provisioning(
        &self,
        card_uid: &str,
        device_id: Uuid,
        mode: ProvisioningMode,
    ) -> Result<ProvisioningStart, AccessError> {
        let device = self.device(device_id)?;
        let card_uid = normalize_uid(card_uid);
        Ok(match mode {
            ProvisioningMode::Cloud => {
                let (session_id, command) = self.engine.start_provisioning(&card_uid, device.id);
                ProvisioningStart::Cloud { session_id, command }
            }
            ProvisioningMode::Local => {
                let (session_id, derived_key_hex) = self.engine.start_local_provisioning(&card_uid, device.id);
                ProvisioningStart::Local {
                    session_id,
                    derived_key_hex,
                }
            }
        })
    }

    /// Authenticate a registered card, never provisioning it
    pub fn start_authentication(&self, card_uid: &str, device_id: Uuid) -> Result<CardSession, AccessError> {
        let device = self.device(device_id)?;
        let card_uid = normalize_uid(card_uid);
        match self.store.card_by_uid(&card_uid)? {
            Some(card) => Ok(self.open_authentication(&card, device.id)),
            None => {
                info!("Card {} unknown, authentication refused", card_uid);
                Ok(CardSession::Denied(SessionDenial::NotFound))
            }
        }
    }

    pub fn submit_provisioning_step(
        &self,
        session_id: &str,
        device_id: Uuid,
        reply_hex: &str,
    ) -> Result<StepReply, AccessError> {
        self.submit_step(Flow::Provisioning, session_id, device_id, reply_hex)
    }

    pub fn submit_authentication_step(
        &self,
        session_id: &str,
        device_id: Uuid,
        reply_hex: &str,
    ) -> Result<StepReply, AccessError> {
        self.submit_step(Flow::Authentication, session_id, device_id, reply_hex)
    }

    fn submit_step(&self, flow: Flow, session_id: &str, device_id: Uuid, reply_hex: &str) -> Result<StepReply, AccessError> {
        let card_uid = self.engine.session_card_uid(session_id);
        let result = match self.engine.step_in(flow, session_id, device_id, reply_hex) {
            Ok(result) => result,
            Err(e) => {
                let aborted = !matches!(
                    e,
                    DesfireError::WrongDevice
                        | DesfireError::SessionNotFound
                        | DesfireError::SessionExpired
                        | DesfireError::InvalidState(_)
                );
                if let (true, Flow::Provisioning, Some(uid)) = (aborted, flow, card_uid.as_deref()) {
                    warn!("Provisioning of card {} failed: {}", uid, e);
                    self.record(
                        AccessLog::new(LogAction::Provision, "failed", false)
                            .device(device_id)
                            .card(uid, CardType::MifareDesfire),
                    );
                }
                return Err(e.into());
            }
        };

        match result.outcome {
            StepOutcome::Continue(command) => Ok(StepReply::Continue(command)),
            StepOutcome::Provisioned => {
                match self.register_provisioned(&result.card_uid, device_id, LogAction::Provision, "key_written")? {
                    ConfirmOutcome::Registered(card) => Ok(StepReply::Provisioned(card)),
                    _ => Ok(StepReply::AlreadyRegistered {
                        card_uid: result.card_uid,
                    }),
                }
            }
            StepOutcome::Authenticated => {
                // The card may have changed while the exchange was in flight
                let usable = match self.store.card_by_uid(&result.card_uid)? {
                    Some(card) => SessionDenial::for_card(&card, device_id).map_or(Ok(card), Err),
                    None => Err(SessionDenial::NotFound),
                };
                match usable {
                    Ok(card) => {
                        info!("Card {} authenticated on device {}", card.uid, device_id);
                        self.record(
                            AccessLog::new(LogAction::DesfireAuth, "authenticated", true)
                                .device(device_id)
                                .card(&card.uid, card.card_type),
                        );
                        Ok(StepReply::Granted {
                            card_display_name: card.display_name().to_string(),
                        })
                    }
                    Err(denial) => {
                        warn!(
                            "Card {} proved its key on device {} but is refused: {}",
                            result.card_uid,
                            device_id,
                            denial.as_str()
                        );
                        self.record(
                            AccessLog::new(LogAction::DesfireAuth, denial.as_str(), false)
                                .device(device_id)
                                .card(&result.card_uid, CardType::MifareDesfire),
                        );
                        Ok(StepReply::Denied {
                            reason: denial.as_str(),
                        })
                    }
                }
            }
            StepOutcome::CloneDetected => {
                warn!("Clone detected: card {} on device {}", result.card_uid, device_id);
                self.record(
                    AccessLog::new(LogAction::DesfireAuth, "clone_detected", false)
                        .device(device_id)
                        .card(&result.card_uid, CardType::MifareDesfire),
                );
                self.clone_alert(device_id, Some(&result.card_uid), None);
                Ok(StepReply::Denied {
                    reason: RejectReason::CloneDetected.as_str(),
                })
            }
        }
    }

    /// Close a reader-driven provisioning session
    pub fn confirm_provisioning(&self, session_id: &str, device_id: Uuid, success: bool) -> Result<ConfirmOutcome, AccessError> {
        if !success {
            let card_uid = self.engine.cancel(session_id, device_id)?;
            warn!("Reader reported provisioning failure for card {}", card_uid);
            self.record(
                AccessLog::new(LogAction::Provision, "failed", false)
                    .device(device_id)
                    .card(&card_uid, CardType::MifareDesfire),
            );
            return Ok(ConfirmOutcome::Failed);
        }
        let card_uid = self.engine.confirm_local(session_id, device_id)?;
        self.register_provisioned(&card_uid, device_id, LogAction::Register, "provisioned")
    }

    fn register_provisioned(
        &self,
        card_uid: &str,
        device_id: Uuid,
        action: LogAction,
        status: &str,
    ) -> Result<ConfirmOutcome, AccessError> {
        let link = self
            .registry
            .device(device_id)?
            .filter(|d| d.class.accepts_cards())
            .map(|d| d.id);

        match self.lifecycle.register_pending(card_uid, CardType::MifareDesfire, link) {
            Ok((card, _)) => {
                info!("Card {} provisioned and registered", card.uid);
                self.record(
                    AccessLog::new(action, status, false)
                        .device(device_id)
                        .card(&card.uid, CardType::MifareDesfire),
                );
                self.card_changed(CardAction::Created, card.clone());
                Ok(ConfirmOutcome::Registered(card))
            }
            Err(crate::store::StoreError::Duplicate("card")) => {
                info!("Card {} provisioned but already registered", card_uid);
                Ok(ConfirmOutcome::AlreadyRegistered {
                    card_uid: card_uid.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn card(&self, card_id: Uuid) -> Result<Card, AccessError> {
        self.existing_card(card_id)
    }

    pub fn current_token(&self, card_id: Uuid) -> Result<String, AccessError> {
        self.existing_card(card_id)?;
        self.store
            .current_token(card_id)?
            .map(|t| t.token)
            .ok_or(AccessError::NotFound("token"))
    }

    pub fn list_cards(&self, filter: &CardFilter) -> Result<Vec<Card>, AccessError> {
        Ok(self.store.list_cards(filter)?)
    }

    pub fn update_card(&self, card_id: Uuid, name: Option<String>, status: Option<CardStatus>) -> Result<Card, AccessError> {
        let card = self.store.update_card(card_id, name, status, Utc::now())?;
        info!("Card {} updated", card.uid);
        self.card_changed(CardAction::Updated, card.clone());
        Ok(card)
    }

    pub fn set_card_status(&self, card_id: Uuid, status: CardStatus) -> Result<Card, AccessError> {
        let card = self.lifecycle.set_status(card_id, status)?;
        let mut entry = AccessLog::new(LogAction::CardStatus, status.as_str(), status == CardStatus::Active)
            .card(&card.uid, card.card_type);
        if let Some(device_id) = card.devices.first() {
            entry = entry.device(*device_id);
        }
        self.record(entry);
        self.card_changed(CardAction::Updated, card.clone());
        Ok(card)
    }

    pub fn delete_card(&self, card_id: Uuid) -> Result<Card, AccessError> {
        let card = self.store.delete_card(card_id)?;
        info!("Card {} deleted", card.uid);
        let mut entry = AccessLog::new(LogAction::CardDelete, "deleted", false).card(&card.uid, card.card_type);
        if let Some(device_id) = card.devices.first() {
            entry = entry.device(*device_id);
        }
        self.record(entry);
        self.card_changed(CardAction::Deleted, card.clone());
        Ok(card)
    }

    pub fn link(&self, card_id: Uuid, device_id: Uuid) -> Result<Card, AccessError> {
        self.existing_card(card_id)?;
        let device = self.device(device_id)?;
        if !device.class.accepts_cards() {
            return Err(AccessError::NotEligible);
        }
        self.store.link_card(card_id, device.id)?;
        let card = self.existing_card(card_id)?;
        info!("Card {} linked to device {}", card.uid, device.id);
        self.card_changed(CardAction::Updated, card.clone());
        Ok(card)
    }

    pub fn unlink(&self, card_id: Uuid, device_id: Uuid) -> Result<Card, AccessError> {
        self.existing_card(card_id)?;
        if !self.store.unlink_card(card_id, device_id)? {
            return Err(AccessError::NotFound("link"));
        }
        let card = self.existing_card(card_id)?;
        info!("Card {} unlinked from device {}", card.uid, device_id);
        self.card_changed(CardAction::Updated, card.clone());
        Ok(card)
    }

    /// Issue a new token; the old one stays valid for the grace window
    pub fn rotate_token(&self, card_id: Uuid) -> Result<String, AccessError> {
        let card = self.existing_card(card_id)?;
        let token = self.lifecycle.rotate(card.id)?;
        self.record(AccessLog::new(LogAction::TokenRotation, "rotated", false).card(&card.uid, card.card_type));
        Ok(token)
    }

    pub fn schedule_key_rotation(&self, card_id: Uuid) -> Result<u32, AccessError> {
        let card = self.existing_card(card_id)?;
        let version = self.lifecycle.schedule_key_rotation(card.id)?;
        self.record(AccessLog::new(LogAction::KeyRotation, "scheduled", false).card(&card.uid, card.card_type));
        Ok(version)
    }

    pub fn complete_key_rotation(&self, card_id: Uuid) -> Result<Card, AccessError> {
        let card = self.lifecycle.complete_key_rotation(card_id)?;
        self.record(AccessLog::new(LogAction::KeyRotation, "completed", false).card(&card.uid, card.card_type));
        self.card_changed(CardAction::Updated, card.clone());
        Ok(card)
    }

    pub fn list_logs(&self, filter: &LogFilter) -> Result<Vec<AccessLog>, AccessError> {
        Ok(self.store.list_logs(filter)?)
    }

    pub fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, AccessError> {
        let purged = self.store.purge_logs_before(cutoff)?;
        if purged > 0 {
            info!("Purged {} access log entries", purged);
        }
        Ok(purged)
    }

    pub fn confirm_hardware_id(&self, device_id: Uuid) -> Result<String, AccessError> {
        self.identity.confirm(device_id)
    }

    pub fn reject_pending_hardware_id(&self, device_id: Uuid) -> Result<(), AccessError> {
        self.identity.reject_pending(device_id)
    }

    pub fn clear_hardware_id(&self, device_id: Uuid) -> Result<(), AccessError> {
        self.identity.clear(device_id)
    }

    /// Start the background sweeps owned by this instance
    pub fn start_sweepers(&self) -> std::io::Result<SweeperSet> {
        let mut set = SweeperSet::default();

        let engine = Arc::clone(&self.engine);
        set.push(Sweeper::spawn("skud-sessions", self.config.session_sweep, move || {
            engine.prune_expired();
        })?);

        let gate = Arc::clone(&self.gate);
        set.push(Sweeper::spawn("skud-challenges", self.config.challenge_sweep, move || {
            if let Err(e) = gate.purge_expired() {
                error!("Challenge sweep failed: {}", e);
            }
        })?);

        let lifecycle = Arc::clone(&self.lifecycle);
        set.push(Sweeper::spawn("skud-tokens", self.config.token_sweep, move || {
            if let Err(e) = lifecycle.purge_expired_tokens() {
                error!("Token sweep failed: {}", e);
            }
        })?);

        if let Some(retention) = self.config.log_retention {
            let store = Arc::clone(&self.store);
            set.push(Sweeper::spawn("skud-log-retention", std::time::Duration::from_secs(3600), move || {
                match store.purge_logs_before(Utc::now() - retention) {
                    Ok(0) => {}
                    Ok(purged) => info!("Retention purged {} access log entries", purged),
                    Err(e) => error!("Log retention sweep failed: {}", e),
                }
            })?);
        }

        let store = Arc::clone(&self.store);
        set.push(Sweeper::spawn("skud-snapshot", self.config.snapshot_interval, move || {
            store.flush();
        })?);

        info!("Started {} background sweepers", set.len());
        Ok(set)
    }
}
