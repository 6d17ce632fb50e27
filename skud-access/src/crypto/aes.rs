//! AES-128 Operations
//!
//! AES-128-CBC without padding, as used by DESFire EV1/EV2 native commands.

use ::aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use log::debug;
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<::aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<::aes::Aes128>;

/// AES operation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AesError {
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKey { expected: usize, got: usize },
    #[error("Invalid IV length: expected {expected}, got {got}")]
    InvalidIv { expected: usize, got: usize },
    #[error("Data length {0} is not a multiple of the block size")]
    InvalidData(usize),
}

/// AES-128 Operations
pub struct AesOperations;

impl AesOperations {
    /// Block size for AES
    pub const BLOCK_SIZE: usize = 16;

    /// Key size for AES-128
    pub const KEY_SIZE: usize = 16;

    /// The all-zero IV DESFire uses at the start of every exchange
    pub const ZERO_IV: [u8; 16] = [0u8; 16];

    fn check_inputs(key: &[u8], iv: &[u8], data: &[u8]) -> Result<(), AesError> {
        if key.len() != Self::KEY_SIZE {
            return Err(AesError::InvalidKey { expected: Self::KEY_SIZE, got: key.len() });
        }
        if iv.len() != Self::BLOCK_SIZE {
            return Err(AesError::InvalidIv { expected: Self::BLOCK_SIZE, got: iv.len() });
        }
        if data.is_empty() || data.len() % Self::BLOCK_SIZE != 0 {
            return Err(AesError::InvalidData(data.len()));
        }
        Ok(())
    }

    /// Encrypt whole blocks with AES-128-CBC
    pub fn encrypt_cbc(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, AesError> {
        Self::check_inputs(key, iv, plaintext)?;
        debug!("AES-CBC encrypting {} bytes", plaintext.len());

        let mut buf = plaintext.to_vec();
        let len = buf.len();
        Aes128CbcEnc::new_from_slices(key, iv)
            .map_err(|_| AesError::InvalidKey { expected: Self::KEY_SIZE, got: key.len() })?
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|_| AesError::InvalidData(len))?;
        Ok(buf)
    }

    /// Decrypt whole blocks with AES-128-CBC
    pub fn decrypt_cbc(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, AesError> {
        Self::check_inputs(key, iv, ciphertext)?;
        debug!("AES-CBC decrypting {} bytes", ciphertext.len());

        let mut buf = ciphertext.to_vec();
        Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|_| AesError::InvalidKey { expected: Self::KEY_SIZE, got: key.len() })?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| AesError::InvalidData(ciphertext.len()))?;
        Ok(buf)
    }
}
