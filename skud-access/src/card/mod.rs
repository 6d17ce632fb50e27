//! Cards and their tokens
//!
//! Records in `model`, the status and token rotation rules in `lifecycle`.

pub mod lifecycle;
pub mod model;

pub use lifecycle::{CardLifecycle, TokenMatch, DEFAULT_TOKEN_GRACE_SECS};
pub use model::{normalize_uid, AccessLog, Card, CardStatus, CardToken, CardType, LogAction};
