//! Cryptographic primitives for inklink.
//!
//! Provides three things:
//!   1. BLAKE3 hashing: content fingerprints
//!   2. HMAC-SHA256 over a pre-shared key: handshake and envelope signatures
//!   3. Nonces and the unix clock used by the replay window
//!
//! Key material lives in `Zeroizing` buffers and is wiped when dropped.
//! There is no unsafe code in this module.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::wire::SIGNATURE_LEN;

type HmacSha256 = Hmac<Sha256>;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

// ── Shared Key ────────────────────────────────────────────────────────────────

/// The pre-shared secret both ends sign with.
pub struct SharedKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl SharedKey {
    /// Derive key bytes from the configured secret string.
    ///
    /// Base64 is tried first; if it does not decode to at least one byte the
    /// raw UTF-8 bytes are used. Returns None for an empty secret.
    pub fn from_secret(secret: &str) -> Option<Self> {
        if secret.is_empty() {
            return None;
        }
        let bytes = match STANDARD.decode(secret) {
            Ok(decoded) if !decoded.is_empty() => decoded,
            _ => secret.as_bytes().to_vec(),
        };
        Some(Self {
            bytes: Zeroizing::new(bytes),
        })
    }

    fn mac(&self) -> Result<HmacSha256, CryptoError> {
        HmacSha256::new_from_slice(&self.bytes).map_err(|_| CryptoError::InvalidKey)
    }

    /// HMAC-SHA256 of `data`.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; SIGNATURE_LEN], CryptoError> {
        let mut mac = self.mac()?;
        mac.update(data);
        let mut out = [0u8; SIGNATURE_LEN];
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    }

    /// Check a signature in constant time.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let mut mac = self.mac()?;
        mac.update(data);
        mac.verify_slice(signature)
            .map_err(|_| CryptoError::SignatureMismatch)
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKey").finish_non_exhaustive()
    }
}

// ── Nonces & Clock ────────────────────────────────────────────────────────────

/// Generate a cryptographically random 64-bit nonce.
pub fn random_nonce() -> u64 {
    rand::thread_rng().next_u64()
}

/// Current unix time in seconds, saturating into u32.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("HMAC key rejected")]
    InvalidKey,

    #[error("signature mismatch")]
    SignatureMismatch,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
