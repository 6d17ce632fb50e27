//! Cryptographic Operations
//!
//! Provides the symmetric primitives used by the DESFire engine.

pub mod aes;
pub mod crc;
pub mod kdf;

pub use self::aes::{AesError, AesOperations};
pub use self::crc::{desfire_crc32, desfire_crc32_le};
pub use self::kdf::{AesKey, KdfError, KeyDerivation};

use rand::rngs::OsRng;
use rand::RngCore;

/// `len` random bytes from the OS generator, lowercase hex
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
