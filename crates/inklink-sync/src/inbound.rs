//! Inbound router: turns raw notifications into routed events.
//!
//! A notification may be a chunk frame, a simple frame, or a bare
//! `type | payload` event record. Framing and trust failures are logged
//! and dropped here; nothing in this module returns an error.

use std::sync::Arc;

use bytes::Bytes;

use inklink_core::chunk::{self, ChunkAssembler};
use inklink_core::framing;
use inklink_core::security::{SecurityManager, SecurityMode};
use inklink_core::wire::{DeviceEvent, ReceivedMessage};

use crate::qos::RateLimiter;

/// What a notification turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Raw handshake response bytes for whoever is awaiting the handshake.
    HandshakeResponse(Bytes),
    /// The device asked for a refresh and the debounce let it through.
    RefreshRequested,
    /// Any other application message.
    Message(ReceivedMessage),
}

pub struct InboundRouter {
    assembler: ChunkAssembler,
    limiter: Arc<RateLimiter>,
    mode: SecurityMode,
}

impl InboundRouter {
    pub fn new(assembler: ChunkAssembler, limiter: Arc<RateLimiter>, mode: SecurityMode) -> Self {
        Self {
            assembler,
            limiter,
            mode,
        }
    }

    /// Route one notification. Returns None when it was an incomplete chunk
    /// or was dropped.
    pub async fn route(
        &mut self,
        notification: &[u8],
        security: &mut SecurityManager,
    ) -> Option<Inbound> {
        let message = self.deframe(notification)?;
        self.classify(message, security).await
    }

    fn deframe(&mut self, notification: &[u8]) -> Option<ReceivedMessage> {
        if let Some((header, body)) = chunk::parse_header(notification) {
            // A damaged chunk of an in-flight message stays a chunk: the
            // assembler drops that message rather than it being reread as
            // another frame kind.
            if usize::from(header.length.get()) == body.len()
                || self.assembler.is_assembling(header.message_id.get())
            {
                return self.assembler.decode_chunk(notification);
            }
        }
        if let Some(message) = framing::decode_notify(notification) {
            return Some(message);
        }
        let (&type_tag, payload) = notification.split_first()?;
        tracing::debug!(type_tag, "treating notification as raw event record");
        Some(ReceivedMessage::new(type_tag, Bytes::copy_from_slice(payload)))
    }

    async fn classify(
        &self,
        message: ReceivedMessage,
        security: &mut SecurityManager,
    ) -> Option<Inbound> {
        let message = match DeviceEvent::from_u8(message.type_tag) {
            Some(DeviceEvent::HandshakeResponse) => {
                return Some(Inbound::HandshakeResponse(message.payload));
            }
            Some(DeviceEvent::SecureEnvelope) => match security.open_secure_payload(&message.payload) {
                Ok(opened) => opened,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping secure envelope");
                    return None;
                }
            },
            _ if self.mode == SecurityMode::Secure => {
                tracing::warn!(
                    type_tag = message.type_tag,
                    "dropping unsecured message in secure mode"
                );
                return None;
            }
            _ => message,
        };

        if DeviceEvent::from_u8(message.type_tag) == Some(DeviceEvent::RequestRefresh) {
            if self.limiter.allow_refresh_request().await {
                return Some(Inbound::RefreshRequested);
            }
            tracing::debug!("refresh request debounced");
            return None;
        }

        Some(Inbound::Message(message))
    }
}
