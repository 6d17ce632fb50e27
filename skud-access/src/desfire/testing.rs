//! A software DESFire card for driving the engine in tests

use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::{desfire_crc32, AesKey, AesOperations};
use super::auth::{rotate_left, session_key};
use super::command::{ins, PICC_AID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selected {
    Picc,
    App,
}

/// Answers native DESFire commands like a real card would
pub struct SimulatedCard {
    aid: [u8; 3],
    picc_key: AesKey,
    app_key: Option<AesKey>,
    picc_auth_supported: bool,
    selected: Selected,
    rnd_b: [u8; 16],
    enc_rnd_b: [u8; 16],
    session_key: Option<AesKey>,
}

impl SimulatedCard {
    /// A blank card: default PICC key, no service application
    pub fn factory_fresh(aid: [u8; 3]) -> Self {
        Self {
            aid,
            picc_key: [0u8; 16],
            app_key: None,
            picc_auth_supported: true,
            selected: Selected::Picc,
            rnd_b: [0u8; 16],
            enc_rnd_b: [0u8; 16],
            session_key: None,
        }
    }

    /// A card that already carries the service application with `key`
    pub fn with_app_key(key: AesKey) -> Self {
        let mut card = Self::factory_fresh([0x01, 0x00, 0x00]);
        card.app_key = Some(key);
        card.selected = Selected::App;
        card
    }

    /// Same, for a specific AID
    pub fn provisioned(aid: [u8; 3], key: AesKey) -> Self {
        let mut card = Self::with_app_key(key);
        card.aid = aid;
        card
    }

    /// Cards that refuse authentication at PICC level
    pub fn without_picc_auth(mut self) -> Self {
        self.picc_auth_supported = false;
        self
    }

    pub fn app_key(&self) -> Option<AesKey> {
        self.app_key
    }

    pub fn rnd_b(&self) -> [u8; 16] {
        self.rnd_b
    }

    pub fn session_key(&self) -> Option<AesKey> {
        self.session_key
    }

    fn current_key(&self) -> Option<AesKey> {
        match self.selected {
            Selected::Picc => Some(self.picc_key),
            Selected::App => self.app_key,
        }
    }

    /// First pass: pick RndB and return it encrypted
    pub fn begin_auth(&mut self) -> [u8; 16] {
        let key = self.current_key().unwrap_or([0u8; 16]);
        OsRng.fill_bytes(&mut self.rnd_b);
        let enc = AesOperations::encrypt_cbc(&key, &AesOperations::ZERO_IV, &self.rnd_b).unwrap();
        self.enc_rnd_b.copy_from_slice(&enc);
        self.session_key = None;
        self.enc_rnd_b
    }

    /// Second pass: check the reader's proof and answer with E(rotl(RndA))
    pub fn finish_auth(&mut self, response: &[u8; 32]) -> Option<[u8; 16]> {
        let key = self.current_key()?;
        let plain = AesOperations::decrypt_cbc(&key, &self.enc_rnd_b, response).unwrap();
        if plain[16..] != rotate_left(&self.rnd_b) {
            return None;
        }
        let mut rnd_a = [0u8; 16];
        rnd_a.copy_from_slice(&plain[..16]);

        let enc = AesOperations::encrypt_cbc(&key, &response[16..], &rotate_left(&rnd_a)).unwrap();
        self.session_key = Some(session_key(&rnd_a, &self.rnd_b));
        let mut out = [0u8; 16];
        out.copy_from_slice(&enc);
        Some(out)
    }

    /// Process a raw command and return the raw reply, status first
    pub fn transceive(&mut self, command: &[u8]) -> Vec<u8> {
        match command {
            [ins::SELECT_APPLICATION, aid @ ..] if aid.len() == 3 => {
                self.session_key = None;
                if aid == PICC_AID {
                    self.selected = Selected::Picc;
                    vec![0x00]
                } else if aid == self.aid && self.app_key.is_some() {
                    self.selected = Selected::App;
                    vec![0x00]
                } else {
                    vec![0x91, 0xA0]
                }
            }
            [ins::AUTHENTICATE_AES, 0x00] => {
                if self.selected == Selected::Picc && !self.picc_auth_supported {
                    return vec![0x91, 0xAE];
                }
                let mut reply = vec![0xAF];
                reply.extend_from_slice(&self.begin_auth());
                reply
            }
            [ins::ADDITIONAL_FRAME, rest @ ..] if rest.len() == 32 => {
                let mut response = [0u8; 32];
                response.copy_from_slice(rest);
                match self.finish_auth(&response) {
                    Some(enc_rnd_a) => {
                        let mut reply = vec![0x00];
                        reply.extend_from_slice(&enc_rnd_a);
                        reply
                    }
                    None => vec![0x91, 0xAE],
                }
            }
            [ins::CREATE_APPLICATION, aid @ .., _, _] if aid.len() == 3 => {
                if self.app_key.is_some() && aid == self.aid {
                    vec![0x91, 0xDE]
                } else {
                    self.aid.copy_from_slice(aid);
                    self.app_key = Some([0u8; 16]);
                    vec![0x00]
                }
            }
            [ins::CHANGE_KEY, key_no, rest @ ..] if rest.len() == 32 => {
                let session = match (self.selected, self.session_key) {
                    (Selected::App, Some(key)) => key,
                    _ => return vec![0x91, 0xAE],
                };
                let plain = AesOperations::decrypt_cbc(&session, &AesOperations::ZERO_IV, rest).unwrap();
                let mut crc_input = vec![ins::CHANGE_KEY, *key_no];
                crc_input.extend_from_slice(&plain[..16]);
                if plain[16..20] != desfire_crc32(&crc_input).to_le_bytes() {
                    return vec![0x91, 0x1E];
                }
                let mut new_key = [0u8; 16];
                new_key.copy_from_slice(&plain[..16]);
                self.app_key = Some(new_key);
                self.session_key = None;
                vec![0x00]
            }
            _ => vec![0x91, 0x1C],
        }
    }

    /// Process a hex command, returning a hex reply
    pub fn transceive_hex(&mut self, command: &str) -> String {
        let bytes = hex::decode(command).unwrap();
        hex::encode_upper(self.transceive(&bytes))
    }
}
