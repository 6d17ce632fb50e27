//! Access-control core for SKUD card readers
//!
//! Decides whether a presented card may open a reader and keeps the audit
//! trail of every decision. The pieces:
//!
//! - DESFire EV1 AES mutual authentication and key provisioning, driven
//!   server side through the reader (`desfire`)
//! - one-time challenges that bind each protected request to the reader
//!   that asked for it (`challenge`)
//! - the hardware identity lock that pins a reader's credential to its
//!   electronics (`identity`)
//! - card lifecycle with overlapping token rotation (`card`)
//! - the decision engine tying them together (`access`)
//!
//! Storage and event delivery are traits; `store::MemoryStore` and
//! `events::EventHub` are the bundled implementations.

pub mod access;
pub mod card;
pub mod challenge;
pub mod config;
pub mod crypto;
pub mod desfire;
pub mod device;
pub mod error;
pub mod events;
pub mod identity;
pub mod store;
pub mod sweeper;

pub use access::{
    AccessService, CardPresentation, CardSession, ConfirmOutcome, DeviceRequest, ProvisioningMode,
    ProvisioningStart, RegisterOutcome, SessionDenial, StepReply, VerifyOutcome,
};
pub use card::{AccessLog, Card, CardStatus, CardType, LogAction};
pub use challenge::ChallengeGrant;
pub use config::{Config, ConfigError};
pub use device::{Device, DeviceClass};
pub use error::{AccessError, ConflictReason, DenyReason, RejectReason};
pub use events::{EventHub, EventSink, LiveEvent, NullEvents};
pub use identity::IdentityPolicy;
pub use store::{AccessStore, CardFilter, DeviceRegistry, LogFilter, MemoryStore, StoreError};
