//! Keyed secret hashing and constant-time verification.
//!
//! Stored secrets are tagged digests, `"$b3$" + base64(blake3(secret))`, so
//! the algorithm can change later without invalidating old rows.

use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::RngCore;
use std::sync::Mutex;
use thiserror::Error;

const ALGO_BLAKE3: &str = "$b3$";

/// Upper bound on idle hashers retained by the pool.
const POOL_MAX: usize = 8;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("unrecognized secret algorithm")]
    UnknownAlgorithm,
    #[error("failed to decode stored digest")]
    Decode(#[from] base64::DecodeError),
}

/// A bounded pool of BLAKE3 hashers shared by all sessions.
///
/// Entries are reset before every use and handed back afterwards; the pool
/// never grows past `POOL_MAX`, excess hashers are dropped.
pub struct HasherPool {
    idle: Mutex<Vec<blake3::Hasher>>,
}

impl Default for HasherPool {
    fn default() -> Self {
        Self::new()
    }
}

impl HasherPool {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
        }
    }

    fn get(&self) -> blake3::Hasher {
        let mut h = self
            .idle
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(blake3::Hasher::new);
        h.reset();
        h
    }

    fn put(&self, h: blake3::Hasher) {
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < POOL_MAX {
            idle.push(h);
        }
    }

    fn digest(&self, input: &str) -> blake3::Hash {
        let mut h = self.get();
        h.update(input.as_bytes());
        let out = h.finalize();
        self.put(h);
        out
    }

    /// Hash a secret into its tagged, persistable form.
    pub fn hash_secret(&self, input: &str) -> String {
        format!("{}{}", ALGO_BLAKE3, B64.encode(self.digest(input).as_bytes()))
    }

    /// Check a secret against a tagged hash in constant time.
    pub fn verify_secret(&self, input: &str, tagged: &str) -> Result<bool, SecretError> {
        let encoded = tagged
            .strip_prefix(ALGO_BLAKE3)
            .ok_or(SecretError::UnknownAlgorithm)?;

        let computed = self.digest(input);
        let stored = B64.decode(encoded)?;
        Ok(bool::from(subtle::ConstantTimeEq::ct_eq(
            computed.as_bytes().as_slice(),
            stored.as_slice(),
        )))
    }
}

/// 32 bytes of OS randomness as unpadded URL-safe base64, for generated
/// SMTP passwords and API keys.
pub fn random_token() -> String {
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}
