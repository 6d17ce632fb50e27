//! DESFire CRC32
//!
//! ISO 3309 CRC32 as computed by DESFire cards: reflected polynomial
//! 0xEDB88320, initial value 0xFFFFFFFF and no final XOR.

const POLYNOMIAL: u32 = 0xEDB8_8320;

/// Compute the DESFire CRC32 of `data`
pub fn desfire_crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLYNOMIAL;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// CRC32 in the little-endian byte order the card expects on the wire
pub fn desfire_crc32_le(data: &[u8]) -> [u8; 4] {
    desfire_crc32(data).to_le_bytes()
}
