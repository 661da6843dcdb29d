//! Link security: challenge/response handshake, signed envelopes, and
//! replay protection over a pre-shared key.
//!
//! One `SecurityManager` exists per link end. The phone drives
//! `make_handshake_request` / `validate_handshake_response`; the device end
//! answers with `accept_handshake_request`. Once established, both ends
//! exchange envelopes through `secure_payload` / `open_secure_payload`.
//!
//! Session state:
//!
//! ```text
//! Unestablished ──request──▶ PendingResponse ──valid response──▶ Established
//!       ▲                          │ any failure                     │
//!       └──────────── reset_session (disconnect) ◀──────────────────┘
//! ```

use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use zerocopy::byteorder::{U32, U64};
use zerocopy::{AsBytes, FromBytes};

use crate::crypto::{self, CryptoError, SharedKey};
use crate::envelope::{Envelope, EnvelopeError};
use crate::wire::{
    HandshakeRequest, HandshakeResponse, ReceivedMessage, CLOCK_SKEW_SECS,
    HANDSHAKE_REQUEST_KIND, HANDSHAKE_RESPONSE_KIND, HANDSHAKE_RESPONSE_LEN,
    HANDSHAKE_RESPONSE_SIGNED_LEN, PROTOCOL_VERSION, SIGNATURE_LEN,
};

/// Upper bound on remembered envelope nonces.
pub const REPLAY_CACHE_CAPACITY: usize = 4096;

const HANDSHAKE_REQUEST_SIGNED_LEN: usize = 1 + 8 + 4;
const HANDSHAKE_REQUEST_LEN: usize = HANDSHAKE_REQUEST_SIGNED_LEN + SIGNATURE_LEN;

/// Whether application traffic is wrapped in signed envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// No shared secret configured: plain frames, no handshake.
    Compatibility,
    Secure,
}

impl SecurityMode {
    pub fn from_secret(secret: Option<&str>) -> Self {
        match secret {
            Some(s) if !s.is_empty() => SecurityMode::Secure,
            _ => SecurityMode::Compatibility,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unestablished,
    PendingResponse,
    Established,
}

/// Seen envelope nonces, keyed to their `issued_at`.
#[derive(Debug)]
struct NonceCache {
    seen: HashMap<u64, u32>,
    capacity: usize,
}

impl NonceCache {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            capacity,
        }
    }

    fn prune(&mut self, floor: u32) {
        self.seen.retain(|_, issued_at| *issued_at >= floor);
    }

    fn record(&mut self, nonce: u64, issued_at: u32) -> Result<(), SecurityError> {
        if self.seen.contains_key(&nonce) {
            return Err(SecurityError::ReplayDetected);
        }
        if self.seen.len() >= self.capacity {
            return Err(SecurityError::ReplayCacheFull);
        }
        self.seen.insert(nonce, issued_at);
        Ok(())
    }

    fn clear(&mut self) {
        self.seen.clear();
    }
}

type Clock = Box<dyn Fn() -> u32 + Send + Sync>;

pub struct SecurityManager {
    key: Option<SharedKey>,
    clock: Clock,
    clock_skew: u32,
    pending_client_nonce: Option<u64>,
    established: bool,
    nonces: NonceCache,
}

impl std::fmt::Debug for SecurityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityManager")
            .field("has_key", &self.key.is_some())
            .field("state", &self.state())
            .field("seen_nonces", &self.nonces.seen.len())
            .finish()
    }
}

impl SecurityManager {
    /// Build a manager from the configured secret. A missing or empty
    /// secret is accepted here and only reported when signing is attempted.
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            key: secret.and_then(SharedKey::from_secret),
            clock: Box::new(crypto::unix_now),
            clock_skew: CLOCK_SKEW_SECS,
            pending_client_nonce: None,
            established: false,
            nonces: NonceCache::new(REPLAY_CACHE_CAPACITY),
        }
    }

    /// Replace the unix-seconds clock.
    pub fn with_clock(mut self, clock: impl Fn() -> u32 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_clock_skew(mut self, secs: u32) -> Self {
        self.clock_skew = secs;
        self
    }

    pub fn with_replay_capacity(mut self, capacity: usize) -> Self {
        self.nonces = NonceCache::new(capacity);
        self
    }

    pub fn state(&self) -> SessionState {
        if self.established {
            SessionState::Established
        } else if self.pending_client_nonce.is_some() {
            SessionState::PendingResponse
        } else {
            SessionState::Unestablished
        }
    }

    pub fn is_session_established(&self) -> bool {
        self.established
    }

    /// Forget the session: pending nonce, replay cache, established flag.
    pub fn reset_session(&mut self) {
        self.pending_client_nonce = None;
        self.nonces.clear();
        self.established = false;
    }

    fn key(&self) -> Result<&SharedKey, SecurityError> {
        self.key.as_ref().ok_or(SecurityError::MissingSecret)
    }

    fn sign(&self, data: &[u8]) -> Result<[u8; SIGNATURE_LEN], SecurityError> {
        self.key()?.sign(data).map_err(|_| SecurityError::InvalidKey)
    }

    fn now(&self) -> u32 {
        (self.clock)()
    }

    fn check_timestamp(&self, issued_at: u32) -> Result<(), SecurityError> {
        let now = self.now();
        let lower = now.saturating_sub(self.clock_skew);
        let upper = now.saturating_add(self.clock_skew);
        if issued_at < lower || issued_at > upper {
            return Err(SecurityError::TimestampOutOfWindow { issued_at, now });
        }
        Ok(())
    }

    // ── Handshake (phone side) ───────────────────────────────────────────────

    /// Build a signed handshake request and pin its nonce. Any previously
    /// pending request is forgotten.
    pub fn make_handshake_request(&mut self) -> Result<Bytes, SecurityError> {
        let client_nonce = crypto::random_nonce();
        let mut request = HandshakeRequest {
            kind: HANDSHAKE_REQUEST_KIND,
            client_nonce: U64::new(client_nonce),
            issued_at: U32::new(self.now()),
            signature: [0u8; SIGNATURE_LEN],
        };
        request.signature = self.sign(&request.as_bytes()[..HANDSHAKE_REQUEST_SIGNED_LEN])?;

        self.established = false;
        self.pending_client_nonce = Some(client_nonce);
        tracing::debug!(client_nonce, "handshake request issued");
        Ok(Bytes::copy_from_slice(request.as_bytes()))
    }

    /// Check a handshake response against the pending request. Only a fully
    /// valid response establishes the session.
    pub fn validate_handshake_response(&mut self, bytes: &[u8]) -> Result<(), SecurityError> {
        if bytes.len() != HANDSHAKE_RESPONSE_LEN {
            return Err(SecurityError::InvalidHandshakeLength(bytes.len()));
        }
        let expected_nonce = self
            .pending_client_nonce
            .ok_or(SecurityError::NoPendingHandshake)?;
        let response =
            HandshakeResponse::read_from(bytes).ok_or(SecurityError::InvalidHandshakeLength(bytes.len()))?;

        if response.kind != HANDSHAKE_RESPONSE_KIND {
            return Err(SecurityError::UnexpectedHandshakeKind(response.kind));
        }
        self.key()?
            .verify(&bytes[..HANDSHAKE_RESPONSE_SIGNED_LEN], &response.signature)
            .map_err(|e| match e {
                CryptoError::SignatureMismatch => SecurityError::HandshakeSignatureMismatch,
                CryptoError::InvalidKey => SecurityError::InvalidKey,
            })?;
        if response.client_nonce.get() != expected_nonce {
            return Err(SecurityError::NonceMismatch);
        }
        self.check_timestamp(response.issued_at.get())?;

        self.established = true;
        self.pending_client_nonce = None;
        tracing::info!(server_nonce = response.server_nonce.get(), "secure session established");
        Ok(())
    }

    // ── Handshake (device side) ──────────────────────────────────────────────

    /// Verify a handshake request and produce the signed response. The
    /// session is established on this end as soon as the response is built.
    pub fn accept_handshake_request(&mut self, bytes: &[u8]) -> Result<Bytes, SecurityError> {
        if bytes.len() != HANDSHAKE_REQUEST_LEN {
            return Err(SecurityError::InvalidHandshakeLength(bytes.len()));
        }
        let request =
            HandshakeRequest::read_from(bytes).ok_or(SecurityError::InvalidHandshakeLength(bytes.len()))?;
        if request.kind != HANDSHAKE_REQUEST_KIND {
            return Err(SecurityError::UnexpectedHandshakeKind(request.kind));
        }
        self.key()?
            .verify(&bytes[..HANDSHAKE_REQUEST_SIGNED_LEN], &request.signature)
            .map_err(|e| match e {
                CryptoError::SignatureMismatch => SecurityError::HandshakeSignatureMismatch,
                CryptoError::InvalidKey => SecurityError::InvalidKey,
            })?;
        self.check_timestamp(request.issued_at.get())?;

        let mut response = HandshakeResponse {
            kind: HANDSHAKE_RESPONSE_KIND,
            client_nonce: request.client_nonce,
            server_nonce: U64::new(crypto::random_nonce()),
            issued_at: U32::new(self.now()),
            signature: [0u8; SIGNATURE_LEN],
        };
        response.signature = self.sign(&response.as_bytes()[..HANDSHAKE_RESPONSE_SIGNED_LEN])?;

        self.nonces.clear();
        self.pending_client_nonce = None;
        self.established = true;
        Ok(Bytes::copy_from_slice(response.as_bytes()))
    }

    // ── Envelopes ────────────────────────────────────────────────────────────

    /// Wrap `payload` in a signed envelope with a fresh nonce.
    pub fn secure_payload(&self, payload_type: u8, payload: &[u8]) -> Result<Bytes, SecurityError> {
        if !self.established {
            return Err(SecurityError::SessionNotEstablished);
        }
        let mut envelope = Envelope::unsigned(
            PROTOCOL_VERSION,
            payload_type,
            crypto::random_nonce(),
            self.now(),
            Bytes::copy_from_slice(payload),
        )?;
        envelope.signature = self.sign(&envelope.signing_bytes()?)?;
        Ok(envelope.encode()?)
    }

    /// Verify and unwrap an envelope. Each nonce is accepted at most once
    /// while it is inside the clock-skew window.
    pub fn open_secure_payload(&mut self, bytes: &[u8]) -> Result<ReceivedMessage, SecurityError> {
        if !self.established {
            return Err(SecurityError::SessionNotEstablished);
        }
        let envelope = Envelope::decode(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(SecurityError::UnsupportedProtocolVersion(envelope.version));
        }
        self.check_timestamp(envelope.issued_at)?;
        self.key()?
            .verify(&envelope.signing_bytes()?, &envelope.signature)
            .map_err(|e| match e {
                CryptoError::SignatureMismatch => SecurityError::SignatureMismatch,
                CryptoError::InvalidKey => SecurityError::InvalidKey,
            })?;

        let floor = self.now().saturating_sub(self.clock_skew);
        self.nonces.prune(floor);
        self.nonces.record(envelope.nonce, envelope.issued_at)?;

        Ok(ReceivedMessage {
            type_tag: envelope.payload_type,
            payload: envelope.payload,
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("no shared secret configured")]
    MissingSecret,

    #[error("HMAC key rejected")]
    InvalidKey,

    #[error("secure session has not been established")]
    SessionNotEstablished,

    #[error("handshake message has invalid length {0}")]
    InvalidHandshakeLength(usize),

    #[error("no pending handshake request")]
    NoPendingHandshake,

    #[error("unexpected handshake kind 0x{0:02x}")]
    UnexpectedHandshakeKind(u8),

    #[error("handshake signature mismatch")]
    HandshakeSignatureMismatch,

    #[error("handshake nonce mismatch")]
    NonceMismatch,

    #[error("timestamp {issued_at} outside accepted window around {now}")]
    TimestampOutOfWindow { issued_at: u32, now: u32 },

    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("envelope signature mismatch")]
    SignatureMismatch,

    #[error("replayed envelope nonce")]
    ReplayDetected,

    #[error("replay cache full")]
    ReplayCacheFull,

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
