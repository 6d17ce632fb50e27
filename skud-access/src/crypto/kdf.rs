//! Per-card key derivation
//!
//! Every DESFire card carries its own AES-128 key, derived from the server
//! master key and the card UID. Only the master key needs protecting.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Domain separation label mixed into every derivation
pub const KDF_LABEL: &[u8] = b"SKUD_DESFIRE_V1";

/// An AES-128 key
pub type AesKey = [u8; 16];

/// Key derivation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KdfError {
    #[error("master key must be 16 bytes, got {0}")]
    InvalidMasterKey(usize),
}

/// Derives card keys from the master key
///
/// The keyed HMAC state is built once and cloned per derivation.
#[derive(Clone)]
pub struct KeyDerivation {
    keyed: HmacSha256,
}

impl KeyDerivation {
    /// Create a derivation from a 16-byte master key
    pub fn new(master_key: &[u8]) -> Result<Self, KdfError> {
        if master_key.len() != 16 {
            return Err(KdfError::InvalidMasterKey(master_key.len()));
        }
        let keyed = <HmacSha256 as Mac>::new_from_slice(master_key)
            .map_err(|_| KdfError::InvalidMasterKey(master_key.len()))?;
        Ok(Self { keyed })
    }

    /// `HMAC-SHA256(master, label || uid)` truncated to 16 bytes
    pub fn derive(&self, card_uid: &str) -> AesKey {
        let mut mac = self.keyed.clone();
        mac.update(KDF_LABEL);
        mac.update(card_uid.as_bytes());
        let full = mac.finalize().into_bytes();

        let mut key = [0u8; 16];
        key.copy_from_slice(&full[..16]);
        key
    }

    /// Hex form of the derived key, for readers that write the key themselves
    pub fn derive_hex(&self, card_uid: &str) -> String {
        hex::encode(self.derive(card_uid))
    }
}

impl std::fmt::Debug for KeyDerivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDerivation").finish_non_exhaustive()
    }
}
