//! Commit-reveal randomness — seed generation, hashing and number derivation
//!
//! ```text
//! commit:  seed_hash = SHA-256(seed)                 published before the draw
//! reveal:  seed                                      published after the draw
//! derive:  h₀ = seed, hᵢ = SHA-256(hᵢ₋₁)
//!          numberᵢ = (u32_be(hᵢ[0..4]) mod N) + 1    duplicates skipped
//! ```
//!
//! Everything here is stateless. Anyone holding the revealed seed can
//! recompute the winning numbers and check them against the commitment.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Seed width in bytes (256 bits)
pub const SEED_SIZE: usize = 32;

/// Upper bound on hash rounds while collecting distinct numbers.
/// Only reachable if the hash chain cycles, which SHA-256 makes negligible.
pub const MAX_DERIVATION_ROUNDS: usize = 100_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RandomnessError {
    #[error("invalid seed: {0}")]
    InvalidSeed(String),
    #[error("invalid draw parameters: count={count}, max={max}")]
    InvalidParameters { count: u8, max: u8 },
    #[error("derivation exhausted after {0} rounds")]
    DerivationExhausted(usize),
}

/// Secret 256-bit draw seed
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Seed([u8; SEED_SIZE]);

impl Seed {
    pub fn from_bytes(bytes: [u8; SEED_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, RandomnessError> {
        let raw = hex::decode(s).map_err(|e| RandomnessError::InvalidSeed(e.to_string()))?;
        let bytes: [u8; SEED_SIZE] = raw.try_into().map_err(|v: Vec<u8>| {
            RandomnessError::InvalidSeed(format!("expected {} bytes, got {}", SEED_SIZE, v.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; SEED_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Seed(<redacted>)")
    }
}

/// Fresh seed from the operating system CSPRNG
pub fn generate_seed() -> Seed {
    let mut bytes = [0u8; SEED_SIZE];
    OsRng.fill_bytes(&mut bytes);
    Seed(bytes)
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Public commitment: hex SHA-256 over the raw seed bytes
pub fn hash_seed(seed: &Seed) -> String {
    hex::encode(sha256(seed.as_bytes()))
}

/// Derive `count` distinct numbers in `[1, max]`, sorted ascending.
///
/// Deterministic: the same seed, count and max always give the same output.
pub fn generate_winning_numbers(seed: &Seed, count: u8, max: u8) -> Result<Vec<u8>, RandomnessError> {
    if count == 0 || max == 0 || count > max {
        return Err(RandomnessError::InvalidParameters { count, max });
    }

    let mut picked = [false; 256];
    let mut numbers = Vec::with_capacity(count as usize);
    let mut digest: [u8; 32] = *seed.as_bytes();

    for _ in 0..MAX_DERIVATION_ROUNDS {
        digest = sha256(&digest);
        let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        // Result is in [1, 255]
        let number = (value % max as u32 + 1) as u8;

        if !picked[number as usize] {
            picked[number as usize] = true;
            numbers.push(number);
            if numbers.len() == count as usize {
                numbers.sort_unstable();
                return Ok(numbers);
            }
        }
    }

    Err(RandomnessError::DerivationExhausted(MAX_DERIVATION_ROUNDS))
}

/// Check a revealed seed against its published commitment
pub fn verify_seed_hash(seed: &Seed, hash: &str) -> bool {
    hash_seed(seed).eq_ignore_ascii_case(hash)
}

/// Check claimed winning numbers against a recomputation from the seed
pub fn verify_numbers(seed: &Seed, numbers: &[u8], count: u8, max: u8) -> bool {
    match generate_winning_numbers(seed, count, max) {
        Ok(expected) => expected == numbers,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_one() -> Seed {
        let mut bytes = [0u8; SEED_SIZE];
        bytes[31] = 1;
        Seed::from_bytes(bytes)
    }

    #[test]
    fn test_seed_hex_round_trip() {
        let seed = generate_seed();
        let hex = seed.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Seed::from_hex(&hex).unwrap(), seed);
    }

    #[test]
    fn test_seed_rejects_wrong_length() {
        assert!(matches!(Seed::from_hex("00ff"), Err(RandomnessError::InvalidSeed(_))));
        assert!(matches!(Seed::from_hex("zz"), Err(RandomnessError::InvalidSeed(_))));
    }

    #[test]
    fn test_generated_seeds_differ() {
        assert_ne!(generate_seed(), generate_seed());
    }

    #[test]
    fn test_hash_is_sha256_of_raw_bytes() {
        let seed = Seed::from_bytes([0u8; SEED_SIZE]);
        // SHA-256 of 32 zero bytes
        assert_eq!(
            hash_seed(&seed),
            "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
        );
    }

    #[test]
    fn test_debug_is_redacted() {
        let seed = seed_one();
        assert_eq!(format!("{:?}", seed), "Seed(<redacted>)");
    }

    #[test]
    fn test_known_seed_is_stable() {
        let first = generate_winning_numbers(&seed_one(), 5, 36).unwrap();
        let second = generate_winning_numbers(&seed_one(), 5, 36).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 5);
        assert!(first.windows(2).all(|w| w[0] < w[1]));
        assert!(first.iter().all(|n| (1..=36).contains(n)));
    }

    #[test]
    fn test_full_range_draw() {
        // K == N must return every number exactly once
        let numbers = generate_winning_numbers(&seed_one(), 10, 10).unwrap();
        assert_eq!(numbers, (1..=10).collect::<Vec<u8>>());
    }

    #[test]
    fn test_invalid_parameters() {
        let seed = seed_one();
        assert!(generate_winning_numbers(&seed, 0, 36).is_err());
        assert!(generate_winning_numbers(&seed, 5, 0).is_err());
        assert!(generate_winning_numbers(&seed, 6, 5).is_err());
    }

    #[test]
    fn test_verify_numbers_rejects_tampering() {
        let seed = seed_one();
        let mut numbers = generate_winning_numbers(&seed, 5, 36).unwrap();
        assert!(verify_numbers(&seed, &numbers, 5, 36));

        numbers.reverse();
        assert!(!verify_numbers(&seed, &numbers, 5, 36));
        assert!(!verify_numbers(&seed, &numbers[..4], 5, 36));
    }

    #[test]
    fn test_verify_seed_hash_rejects_other_seed() {
        let seed = generate_seed();
        let hash = hash_seed(&seed);
        assert!(verify_seed_hash(&seed, &hash));
        assert!(verify_seed_hash(&seed, &hash.to_uppercase()));
        assert!(!verify_seed_hash(&seed_one(), &hash));
    }
}
