//! AES mutual authentication
//!
//! Two-pass DESFire `AuthenticateAES` exchange:
//!
//! 1. The card sends `E(K, RndB)` (IV zero). We recover RndB, pick RndA and
//!    answer `E(K, RndA || rotl(RndB))` chained from the card's ciphertext.
//! 2. The card answers `E(K, rotl(RndA))` chained from our last block. A card
//!    that does not hold K cannot produce it.

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::crypto::{AesKey, AesOperations};
use super::DesfireError;

/// State carried from the first pass to the second
#[derive(Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub rnd_a: [u8; 16],
    pub rnd_b: [u8; 16],
    /// Chaining IV for decrypting the card's final reply
    pub iv: [u8; 16],
    /// Bytes to send back to the card
    pub response: [u8; 32],
}

impl std::fmt::Debug for AuthChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthChallenge").finish_non_exhaustive()
    }
}

/// Rotate a block left by one byte
pub fn rotate_left(block: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..15].copy_from_slice(&block[1..]);
    out[15] = block[0];
    out
}

/// Fresh RndA from the OS generator
pub fn random_rnd_a() -> [u8; 16] {
    let mut rnd_a = [0u8; 16];
    OsRng.fill_bytes(&mut rnd_a);
    rnd_a
}

/// Answer the card's first pass using the given RndA
pub fn answer_challenge(
    key: &AesKey,
    enc_rnd_b: &[u8; 16],
    rnd_a: [u8; 16],
) -> Result<AuthChallenge, DesfireError> {
    let plain = AesOperations::decrypt_cbc(key, &AesOperations::ZERO_IV, enc_rnd_b)?;
    let mut rnd_b = [0u8; 16];
    rnd_b.copy_from_slice(&plain);

    let mut plaintext = [0u8; 32];
    plaintext[..16].copy_from_slice(&rnd_a);
    plaintext[16..].copy_from_slice(&rotate_left(&rnd_b));

    let ciphertext = AesOperations::encrypt_cbc(key, enc_rnd_b, &plaintext)?;
    let mut response = [0u8; 32];
    response.copy_from_slice(&ciphertext);
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&ciphertext[16..]);

    Ok(AuthChallenge { rnd_a, rnd_b, iv, response })
}

/// Check the card's proof of key possession
///
/// Returns `Ok(false)` on mismatch; errors are reserved for malformed input.
pub fn verify_card_proof(
    key: &AesKey,
    iv: &[u8; 16],
    rnd_a: &[u8; 16],
    enc_rnd_a: &[u8; 16],
) -> Result<bool, DesfireError> {
    let decrypted = AesOperations::decrypt_cbc(key, iv, enc_rnd_a)?;
    let expected = rotate_left(rnd_a);
    Ok(bool::from(decrypted.as_slice().ct_eq(&expected[..])))
}

/// `RndA[0..4] || RndB[0..4] || RndA[12..16] || RndB[12..16]`
pub fn session_key(rnd_a: &[u8; 16], rnd_b: &[u8; 16]) -> AesKey {
    let mut key = [0u8; 16];
    key[0..4].copy_from_slice(&rnd_a[0..4]);
    key[4..8].copy_from_slice(&rnd_b[0..4]);
    key[8..12].copy_from_slice(&rnd_a[12..16]);
    key[12..16].copy_from_slice(&rnd_b[12..16]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desfire::testing::SimulatedCard;

    #[test]
    fn test_rotate_left() {
        let mut block = [0u8; 16];
        for (i, b) in block.iter_mut().enumerate() {
            *b = i as u8;
        }
        let rotated = rotate_left(&block);
        assert_eq!(rotated[0], 1);
        assert_eq!(rotated[14], 15);
        assert_eq!(rotated[15], 0);
    }

    #[test]
    fn test_round_trip_with_honest_card() {
        let key = [0x5Cu8; 16];
        for _ in 0..8 {
            let mut card = SimulatedCard::with_app_key(key);
            let enc_rnd_b = card.begin_auth();
            let rnd_a = random_rnd_a();

            let challenge = answer_challenge(&key, &enc_rnd_b, rnd_a).unwrap();
            let enc_rnd_a = card.finish_auth(&challenge.response).unwrap();

            assert!(verify_card_proof(&key, &challenge.iv, &rnd_a, &enc_rnd_a).unwrap());
            assert_eq!(challenge.rnd_b, card.rnd_b());

            let expected = session_key(&rnd_a, &card.rnd_b());
            assert_eq!(&expected[0..4], &rnd_a[0..4]);
            assert_eq!(&expected[4..8], &card.rnd_b()[0..4]);
            assert_eq!(&expected[8..12], &rnd_a[12..16]);
            assert_eq!(&expected[12..16], &card.rnd_b()[12..16]);
            assert_eq!(card.session_key(), Some(expected));
        }
    }

    #[test]
    fn test_any_bit_flip_is_rejected() {
        let key = [0x01u8; 16];
        let mut card = SimulatedCard::with_app_key(key);
        let enc_rnd_b = card.begin_auth();
        let rnd_a = random_rnd_a();
        let challenge = answer_challenge(&key, &enc_rnd_b, rnd_a).unwrap();
        let enc_rnd_a = card.finish_auth(&challenge.response).unwrap();

        for byte in 0..16 {
            for bit in 0..8 {
                let mut tampered = enc_rnd_a;
                tampered[byte] ^= 1 << bit;
                let verified = verify_card_proof(&key, &challenge.iv, &rnd_a, &tampered).unwrap();
                assert!(!verified, "flip at byte {} bit {} accepted", byte, bit);
            }
        }
    }

    #[test]
    fn test_card_with_wrong_key_fails() {
        let mut card = SimulatedCard::with_app_key([0xAAu8; 16]);
        let enc_rnd_b = card.begin_auth();

        let server_key = [0xBBu8; 16];
        let rnd_a = random_rnd_a();
        let challenge = answer_challenge(&server_key, &enc_rnd_b, rnd_a).unwrap();

        // A card holding a different key rejects our response outright
        assert!(card.finish_auth(&challenge.response).is_none());
    }

    #[test]
    fn test_debug_hides_randoms() {
        let challenge = answer_challenge(&[0u8; 16], &[0u8; 16], [7u8; 16]).unwrap();
        assert_eq!(format!("{:?}", challenge), "AuthChallenge { .. }");
    }
}
