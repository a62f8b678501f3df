//! Challenge generation.
//!
//! A challenge is a fresh block of random bytes that the client must sign with the private key
//! matching its identifier. Challenges are single-use and live only as long as the connection
//! that issued them.

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Number of random bytes in a challenge.
pub const CHALLENGE_LEN: usize = 128;

/// Errors that may occur while generating a challenge. These are always the server's fault.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(
        "in an attempt to generate the challenge, the server failed to read the {CHALLENGE_LEN} \
         random bytes needed: {0}"
    )]
    InsufficientRandomness(#[source] rand::Error),
}

/// A single-use challenge payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Challenge {
    payload: [u8; CHALLENGE_LEN],
}

impl Challenge {
    pub fn payload(&self) -> &[u8; CHALLENGE_LEN] {
        &self.payload
    }

    /// Whether `plaintext` is exactly this challenge's payload. Runs in constant time with respect
    /// to the content of the payload.
    pub fn matches(&self, plaintext: &[u8]) -> bool {
        plaintext.len() == CHALLENGE_LEN && bool::from(self.payload[..].ct_eq(plaintext))
    }
}

impl std::fmt::Debug for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Challenge")
            .field("len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Generate a challenge from the operating system's random source.
pub fn generate() -> Result<Challenge, GenerationError> {
    generate_with(&mut OsRng)
}

/// Generate a challenge from `rng`. Fails if `rng` cannot supply all [`CHALLENGE_LEN`] bytes.
pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Challenge, GenerationError> {
    let mut payload = [0u8; CHALLENGE_LEN];
    rng.try_fill_bytes(&mut payload)
        .map_err(GenerationError::InsufficientRandomness)?;
    Ok(Challenge { payload })
}
