//! Outbound writer: turns application messages into characteristic writes.
//!
//! A message that fits one write goes out as a simple frame; anything
//! larger is chunk-framed against the link's current write size. In secure
//! mode the message is sealed in an envelope first and travels as
//! `DataType::SecureEnvelope`. Every write waits on the shared rate limiter.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use inklink_core::chunk::{self, ChunkError};
use inklink_core::framing;
use inklink_core::security::{SecurityError, SecurityManager};
use inklink_core::wire::{DataType, WireError, CHUNK_HEADER_LEN, SIMPLE_WRITE_HEADER_LEN};

use crate::link::{DeviceLink, LinkError};
use crate::qos::RateLimiter;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

pub struct OutboundWriter {
    link: Arc<dyn DeviceLink>,
    limiter: Arc<RateLimiter>,
    next_message_id: u16,
}

impl OutboundWriter {
    pub fn new(link: Arc<dyn DeviceLink>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            link,
            limiter,
            next_message_id: 0,
        }
    }

    /// Send one application message. `security` is `Some` in secure mode.
    pub async fn send(
        &mut self,
        data_type: DataType,
        payload: &[u8],
        security: Option<&SecurityManager>,
    ) -> Result<(), SendError> {
        match security {
            Some(manager) => {
                let sealed = manager.secure_payload(data_type.into(), payload)?;
                self.send_framed(DataType::SecureEnvelope.into(), &sealed).await
            }
            None => self.send_framed(data_type.into(), payload).await,
        }
    }

    /// Handshake requests are never sealed and never chunked.
    pub async fn send_handshake_request(&mut self, request: &[u8]) -> Result<(), SendError> {
        let frame = framing::encode_write(DataType::HandshakeRequest.into(), request)?;
        self.write(frame).await
    }

    async fn send_framed(&mut self, type_tag: u8, payload: &[u8]) -> Result<(), SendError> {
        let max_write_len = self.link.max_write_len();
        for frame in self.frames(type_tag, payload, max_write_len)? {
            self.write(frame).await?;
        }
        Ok(())
    }

    /// Pick simple or chunk framing for `payload` at `max_write_len`.
    pub fn frames(
        &mut self,
        type_tag: u8,
        payload: &[u8],
        max_write_len: usize,
    ) -> Result<Vec<Bytes>, SendError> {
        if SIMPLE_WRITE_HEADER_LEN + payload.len() <= max_write_len {
            return Ok(vec![framing::encode_write(type_tag, payload)?]);
        }

        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        let max_chunk = max_write_len.saturating_sub(CHUNK_HEADER_LEN);
        let frames = chunk::encode(type_tag, message_id, payload, max_chunk)?;
        tracing::debug!(
            type_tag,
            message_id,
            chunks = frames.len(),
            len = payload.len(),
            "chunking outbound message"
        );
        Ok(frames)
    }

    async fn write(&self, frame: Bytes) -> Result<(), SendError> {
        self.limiter.acquire_permit().await;
        self.link.write(frame).await?;
        Ok(())
    }
}
