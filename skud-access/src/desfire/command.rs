//! DESFire command frames
//!
//! Commands are built server-side and relayed to the card by the reader as
//! hex strings.

use serde::{Deserialize, Serialize};

use crate::crypto::crc::desfire_crc32_le;
use crate::crypto::{AesError, AesKey, AesOperations};

/// Native DESFire instruction bytes
pub mod ins {
    pub const SELECT_APPLICATION: u8 = 0x5A;
    pub const AUTHENTICATE_AES: u8 = 0xAA;
    pub const ADDITIONAL_FRAME: u8 = 0xAF;
    pub const CREATE_APPLICATION: u8 = 0xCA;
    pub const CHANGE_KEY: u8 = 0xC4;
}

/// Root application (PICC level) identifier
pub const PICC_AID: [u8; 3] = [0x00, 0x00, 0x00];

/// Key settings for the service application: every change needs the master key
pub const APP_KEY_SETTINGS: u8 = 0x0F;

/// One key, AES
pub const APP_KEY_COUNT_AES: u8 = 0x81;

/// What a command does, reported to the reader alongside the bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    SelectPicc,
    SelectApp,
    #[serde(rename = "AUTH_PART1")]
    Auth1,
    #[serde(rename = "AUTH_PART2")]
    Auth2,
    CreateApp,
    ChangeKey,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode_upper(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A command for the reader to send to the card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesfireCommand {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl DesfireCommand {
    fn new(kind: CommandKind, data: Vec<u8>) -> Self {
        Self { kind, data }
    }

    /// Select the root application: `5A 000000`
    pub fn select_picc() -> Self {
        let mut data = vec![ins::SELECT_APPLICATION];
        data.extend_from_slice(&PICC_AID);
        Self::new(CommandKind::SelectPicc, data)
    }

    /// Select an application: `5A` + AID (LSB first)
    pub fn select_app(aid: &[u8; 3]) -> Self {
        let mut data = vec![ins::SELECT_APPLICATION];
        data.extend_from_slice(aid);
        Self::new(CommandKind::SelectApp, data)
    }

    /// First authentication pass: `AA` + key number
    pub fn authenticate(key_no: u8) -> Self {
        Self::new(CommandKind::Auth1, vec![ins::AUTHENTICATE_AES, key_no])
    }

    /// Second authentication pass: `AF` + E(RndA || RndB')
    pub fn additional_frame(response: &[u8; 32]) -> Self {
        let mut data = Vec::with_capacity(33);
        data.push(ins::ADDITIONAL_FRAME);
        data.extend_from_slice(response);
        Self::new(CommandKind::Auth2, data)
    }

    /// Create the service application with one AES key slot
    pub fn create_app(aid: &[u8; 3]) -> Self {
        let mut data = vec![ins::CREATE_APPLICATION];
        data.extend_from_slice(aid);
        data.push(APP_KEY_SETTINGS);
        data.push(APP_KEY_COUNT_AES);
        Self::new(CommandKind::CreateApp, data)
    }

    /// Change the key we are authenticated with
    ///
    /// Payload is `new_key || crc32(C4 || key_no || new_key) || 00 * 12`,
    /// encrypted under the session key with a zero IV.
    pub fn change_key(
        key_no: u8,
        new_key: &AesKey,
        session_key: &AesKey,
    ) -> Result<Self, AesError> {
        let mut crc_input = Vec::with_capacity(18);
        crc_input.push(ins::CHANGE_KEY);
        crc_input.push(key_no);
        crc_input.extend_from_slice(new_key);

        let mut plaintext = [0u8; 32];
        plaintext[..16].copy_from_slice(new_key);
        plaintext[16..20].copy_from_slice(&desfire_crc32_le(&crc_input));

        let encrypted = AesOperations::encrypt_cbc(session_key, &AesOperations::ZERO_IV, &plaintext)?;

        let mut data = Vec::with_capacity(2 + encrypted.len());
        data.push(ins::CHANGE_KEY);
        data.push(key_no);
        data.extend_from_slice(&encrypted);
        Ok(Self::new(CommandKind::ChangeKey, data))
    }

    /// Hex form sent to the reader
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.data)
    }
}
