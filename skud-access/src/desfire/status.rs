//! DESFire native status codes and card replies
//!
//! Readers forward the raw card reply as hex, status byte first. ISO-wrapped
//! replies (`91 xx`) carry the native status in the second byte.

use super::DesfireError;

/// Native DESFire status codes
#[allow(dead_code)]
pub struct DesfireStatus;

#[allow(dead_code)]
impl DesfireStatus {
    pub const OPERATION_OK: u8 = 0x00;
    pub const NO_CHANGES: u8 = 0x0C;
    pub const OUT_OF_EEPROM: u8 = 0x0E;
    pub const ILLEGAL_COMMAND: u8 = 0x1C;
    pub const INTEGRITY_ERROR: u8 = 0x1E;
    pub const NO_SUCH_KEY: u8 = 0x40;
    pub const LENGTH_ERROR: u8 = 0x7E;
    pub const PERMISSION_DENIED: u8 = 0x9D;
    pub const PARAMETER_ERROR: u8 = 0x9E;
    pub const APPLICATION_NOT_FOUND: u8 = 0xA0;
    pub const AUTHENTICATION_ERROR: u8 = 0xAE;
    pub const ADDITIONAL_FRAME: u8 = 0xAF;
    pub const BOUNDARY_ERROR: u8 = 0xBE;
    pub const COMMAND_ABORTED: u8 = 0xCA;
    pub const DUPLICATE_ERROR: u8 = 0xDE;
    pub const FILE_NOT_FOUND: u8 = 0xF0;

    /// First byte of an ISO 7816 wrapped DESFire status word
    pub const ISO_WRAPPER: u8 = 0x91;
}

/// A reply read from the card and forwarded by the reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardReply {
    /// Native status code
    pub status: u8,
    /// Payload following the status
    pub data: Vec<u8>,
}

impl CardReply {
    /// Parse a raw reply, status byte first
    pub fn parse(bytes: &[u8]) -> Result<Self, DesfireError> {
        match bytes {
            [] => Err(DesfireError::EmptyReply),
            [DesfireStatus::ISO_WRAPPER, status, rest @ ..] => Ok(Self {
                status: *status,
                data: rest.to_vec(),
            }),
            [status, rest @ ..] => Ok(Self {
                status: *status,
                data: rest.to_vec(),
            }),
        }
    }

    /// Parse a hex reply; whitespace between bytes is ignored
    pub fn from_hex(reply: &str) -> Result<Self, DesfireError> {
        let compact: String = reply.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = hex::decode(&compact).map_err(|e| DesfireError::InvalidHex(e.to_string()))?;
        Self::parse(&bytes)
    }

    pub fn is_ok(&self) -> bool {
        self.status == DesfireStatus::OPERATION_OK
    }

    pub fn is_additional_frame(&self) -> bool {
        self.status == DesfireStatus::ADDITIONAL_FRAME
    }

    pub fn is_authentication_error(&self) -> bool {
        self.status == DesfireStatus::AUTHENTICATION_ERROR
    }

    pub fn is_duplicate(&self) -> bool {
        self.status == DesfireStatus::DUPLICATE_ERROR
    }

    pub fn is_application_not_found(&self) -> bool {
        self.status == DesfireStatus::APPLICATION_NOT_FOUND
    }

    /// First `N` bytes of the payload, or a length error naming `what`
    pub fn block<const N: usize>(&self, what: &'static str) -> Result<[u8; N], DesfireError> {
        if self.data.len() < N {
            return Err(DesfireError::WrongLength {
                what,
                expected: N,
                got: self.data.len(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[..N]);
        Ok(out)
    }
}
