//! Secure envelope codec.
//!
//! Layout: `EnvelopeHeader (16) | payload | signature (32)`. The signature
//! covers everything before it. This module only moves bytes; signing and
//! verification live in `security`.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use zerocopy::byteorder::{U16, U32, U64};
use zerocopy::{AsBytes, FromBytes};

use crate::wire::{EnvelopeHeader, ENVELOPE_HEADER_LEN, SIGNATURE_LEN};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("envelope shorter than header and signature")]
    EnvelopeTooShort,

    #[error("declared payload length exceeds envelope")]
    LengthMismatch,

    #[error("envelope payload of {0} bytes exceeds u16 length field")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u8,
    pub payload_type: u8,
    pub nonce: u64,
    /// Unix seconds.
    pub issued_at: u32,
    pub payload: Bytes,
    pub signature: [u8; SIGNATURE_LEN],
}

impl Envelope {
    /// Build an envelope with an all-zero signature, to be filled in by the
    /// signer once `signing_bytes` is known.
    pub fn unsigned(
        version: u8,
        payload_type: u8,
        nonce: u64,
        issued_at: u32,
        payload: Bytes,
    ) -> Result<Self, EnvelopeError> {
        if payload.len() > usize::from(u16::MAX) {
            return Err(EnvelopeError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            version,
            payload_type,
            nonce,
            issued_at,
            payload,
            signature: [0u8; SIGNATURE_LEN],
        })
    }

    /// The payload may have been replaced after construction, so the length
    /// is checked again here.
    fn header(&self) -> Result<EnvelopeHeader, EnvelopeError> {
        let payload_len = u16::try_from(self.payload.len())
            .map_err(|_| EnvelopeError::PayloadTooLarge(self.payload.len()))?;
        Ok(EnvelopeHeader {
            version: self.version,
            payload_type: self.payload_type,
            nonce: U64::new(self.nonce),
            issued_at: U32::new(self.issued_at),
            payload_len: U16::new(payload_len),
        })
    }

    /// Every field except the signature, in wire order.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let header = self.header()?;
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        let header = self.header()?;
        let mut out =
            BytesMut::with_capacity(ENVELOPE_HEADER_LEN + self.payload.len() + SIGNATURE_LEN);
        out.put_slice(header.as_bytes());
        out.put_slice(&self.payload);
        out.put_slice(&self.signature);
        Ok(out.freeze())
    }

    /// Parse an envelope. The signature is not checked.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < ENVELOPE_HEADER_LEN + SIGNATURE_LEN {
            return Err(EnvelopeError::EnvelopeTooShort);
        }
        let header =
            EnvelopeHeader::read_from_prefix(bytes).ok_or(EnvelopeError::EnvelopeTooShort)?;
        let payload_len = usize::from(header.payload_len.get());
        let payload_end = ENVELOPE_HEADER_LEN + payload_len;
        if payload_end + SIGNATURE_LEN > bytes.len() {
            return Err(EnvelopeError::LengthMismatch);
        }

        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&bytes[payload_end..payload_end + SIGNATURE_LEN]);

        Ok(Self {
            version: header.version,
            payload_type: header.payload_type,
            nonce: header.nonce.get(),
            issued_at: header.issued_at.get(),
            payload: Bytes::copy_from_slice(&bytes[ENVELOPE_HEADER_LEN..payload_end]),
            signature,
        })
    }
}
