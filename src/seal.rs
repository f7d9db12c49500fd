//! Seed sealing between commit and reveal (AES-256-GCM)
//!
//! The sealed seed lives in the repository next to its draw, but the key
//! never does. Storage access alone cannot reveal a seed before the draw.
//!
//! The draw id is bound as associated data, so a sealed seed copied onto
//! another draw fails authentication.

use crate::randomness::{Seed, SEED_SIZE};
use crate::types::DrawId;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroize;

/// AES-256 key size
pub const SEAL_KEY_SIZE: usize = 32;

/// AES-GCM nonce size
pub const SEAL_NONCE_SIZE: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error("invalid seal key: {0}")]
    InvalidKey(String),
    #[error("seal authentication failed")]
    Authentication,
    #[error("sealed seed malformed")]
    Malformed,
}

/// Seed under authenticated encryption
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSeed {
    pub nonce: [u8; SEAL_NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl fmt::Debug for SealedSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedSeed")
            .field("nonce", &hex::encode(self.nonce))
            .field("len", &self.ciphertext.len())
            .finish()
    }
}

/// Holder of the sealing key
#[derive(Clone)]
pub struct SeedVault {
    cipher: Aes256Gcm,
}

impl fmt::Debug for SeedVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SeedVault(<key>)")
    }
}

impl SeedVault {
    pub fn new(key: &[u8; SEAL_KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Build from a 64-char hex key
    pub fn from_hex(key_hex: &str) -> Result<Self, SealError> {
        let mut raw = hex::decode(key_hex.trim()).map_err(|e| SealError::InvalidKey(e.to_string()))?;
        if raw.len() != SEAL_KEY_SIZE {
            let len = raw.len();
            raw.zeroize();
            return Err(SealError::InvalidKey(format!(
                "expected {} bytes, got {}",
                SEAL_KEY_SIZE, len
            )));
        }
        let mut key = [0u8; SEAL_KEY_SIZE];
        key.copy_from_slice(&raw);
        raw.zeroize();
        let vault = Self::new(&key);
        key.zeroize();
        Ok(vault)
    }

    /// Random key, hex-encoded
    pub fn generate_key_hex() -> String {
        let mut key = [0u8; SEAL_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        let encoded = hex::encode(key);
        key.zeroize();
        encoded
    }

    pub fn seal(&self, draw_id: DrawId, seed: &Seed) -> Result<SealedSeed, SealError> {
        let mut nonce = [0u8; SEAL_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let aad = draw_id.to_le_bytes();
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: seed.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|_| SealError::Authentication)?;

        Ok(SealedSeed { nonce, ciphertext })
    }

    pub fn unseal(&self, draw_id: DrawId, sealed: &SealedSeed) -> Result<Seed, SealError> {
        let aad = draw_id.to_le_bytes();
        let mut plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| SealError::Authentication)?;

        if plaintext.len() != SEED_SIZE {
            plaintext.zeroize();
            return Err(SealError::Malformed);
        }

        let mut bytes = [0u8; SEED_SIZE];
        bytes.copy_from_slice(&plaintext);
        plaintext.zeroize();
        let seed = Seed::from_bytes(bytes);
        bytes.zeroize();
        Ok(seed)
    }
}
