//! Loopback peripheral: an in-process companion device.
//!
//! Implements `DeviceLink` by running the device half of the protocol in
//! memory: it reassembles writes, answers handshakes, opens and seals
//! envelopes, records what it received, and answers event-log requests
//! with queued device events. Failure knobs let tests and the daemon
//! exercise the coordinator's retry paths.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use inklink_core::chunk::{self, ChunkAssembler};
use inklink_core::framing;
use inklink_core::security::SecurityManager;
use inklink_core::wire::{
    DataType, DeviceEvent, ReceivedMessage, CHUNK_HEADER_LEN, SIMPLE_NOTIFY_HEADER_LEN,
};

use crate::link::{DeviceLink, LinkError};

/// Notification queue depth between the peripheral and the coordinator.
pub const NOTIFY_QUEUE_DEPTH: usize = 256;

struct DeviceState {
    connected: bool,
    security: Option<SecurityManager>,
    assembler: ChunkAssembler,
    received: Vec<ReceivedMessage>,
    queued_events: Vec<ReceivedMessage>,
    next_message_id: u16,
    connects: u32,
    disconnects: u32,
    fail_connects: u32,
    refuse_connects: bool,
    connect_delay: Duration,
    answer_handshakes: bool,
    fail_writes: HashMap<u8, u32>,
}

pub struct LoopbackPeripheral {
    state: Mutex<DeviceState>,
    notify_tx: mpsc::Sender<Bytes>,
    max_write_len: usize,
}

impl LoopbackPeripheral {
    /// Build a peripheral and the notification receiver to hand to the
    /// coordinator. With a secret the device insists on secure traffic.
    pub fn new(max_write_len: usize, secret: Option<&str>) -> (Self, mpsc::Receiver<Bytes>) {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_QUEUE_DEPTH);
        let security = secret
            .filter(|s| !s.is_empty())
            .map(|s| SecurityManager::new(Some(s)));
        let peripheral = Self {
            state: Mutex::new(DeviceState {
                connected: false,
                security,
                assembler: ChunkAssembler::new(),
                received: Vec::new(),
                queued_events: Vec::new(),
                next_message_id: 0,
                connects: 0,
                disconnects: 0,
                fail_connects: 0,
                refuse_connects: false,
                connect_delay: Duration::ZERO,
                answer_handshakes: true,
                fail_writes: HashMap::new(),
            }),
            notify_tx,
            max_write_len,
        };
        (peripheral, notify_rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        // A poisoned lock only means a test panicked mid-write; the state
        // is still usable for reporting.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Failure knobs ────────────────────────────────────────────────────────

    pub fn fail_next_connects(&self, n: u32) {
        self.lock().fail_connects = n;
    }

    pub fn refuse_connects(&self, refuse: bool) {
        self.lock().refuse_connects = refuse;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    pub fn answer_handshakes(&self, answer: bool) {
        self.lock().answer_handshakes = answer;
    }

    /// Fail the next `n` messages of `data_type` on their final write.
    pub fn fail_writes(&self, data_type: DataType, n: u32) {
        self.lock().fail_writes.insert(data_type.into(), n);
    }

    /// Queue a device event to be returned by the next event-log request.
    pub fn queue_event(&self, event: DeviceEvent, payload: impl Into<Bytes>) {
        self.lock()
            .queued_events
            .push(ReceivedMessage::new(event as u8, payload));
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    /// Every application message the device accepted, in order.
    pub fn received(&self) -> Vec<ReceivedMessage> {
        self.lock().received.clone()
    }

    pub fn received_types(&self) -> Vec<u8> {
        self.lock().received.iter().map(|m| m.type_tag).collect()
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connects
    }

    pub fn disconnect_count(&self) -> u32 {
        self.lock().disconnects
    }

    // ── Device → phone ───────────────────────────────────────────────────────

    /// Send a device-initiated event, sealed when a secure session exists.
    pub async fn notify(&self, event: DeviceEvent, payload: &[u8]) -> Result<(), LinkError> {
        let frames = {
            let mut state = self.lock();
            self.outgoing(&mut state, event as u8, payload)?
        };
        self.deliver(frames).await
    }

    fn outgoing(
        &self,
        state: &mut DeviceState,
        type_tag: u8,
        payload: &[u8],
    ) -> Result<Vec<Bytes>, LinkError> {
        let sealed;
        let (type_tag, payload) = match state.security.as_ref() {
            Some(security) if security.is_session_established() => {
                sealed = security
                    .secure_payload(type_tag, payload)
                    .map_err(|e| LinkError::WriteFailed(e.to_string()))?;
                (DeviceEvent::SecureEnvelope as u8, sealed.as_ref())
            }
            _ => (type_tag, payload),
        };
        self.frame(state, type_tag, payload)
    }

    fn frame(
        &self,
        state: &mut DeviceState,
        type_tag: u8,
        payload: &[u8],
    ) -> Result<Vec<Bytes>, LinkError> {
        if payload.len() <= usize::from(u8::MAX)
            && SIMPLE_NOTIFY_HEADER_LEN + payload.len() <= self.max_write_len
        {
            let frame = framing::encode_notify(type_tag, payload)
                .map_err(|e| LinkError::WriteFailed(e.to_string()))?;
            return Ok(vec![frame]);
        }
        let message_id = state.next_message_id;
        state.next_message_id = state.next_message_id.wrapping_add(1);
        chunk::encode(
            type_tag,
            message_id,
            payload,
            self.max_write_len.saturating_sub(CHUNK_HEADER_LEN),
        )
        .map_err(|e| LinkError::WriteFailed(e.to_string()))
    }

    async fn deliver(&self, frames: Vec<Bytes>) -> Result<(), LinkError> {
        for frame in frames {
            self.notify_tx
                .send(frame)
                .await
                .map_err(|_| LinkError::WriteFailed("notification queue closed".into()))?;
        }
        Ok(())
    }

    // ── Phone → device ───────────────────────────────────────────────────────

    fn deframe(state: &mut DeviceState, frame: &[u8]) -> Option<ReceivedMessage> {
        if let Some((header, body)) = chunk::parse_header(frame) {
            if usize::from(header.length.get()) == body.len()
                || state.assembler.is_assembling(header.message_id.get())
            {
                return state.assembler.decode_chunk(frame);
            }
        }
        framing::decode_write(frame)
    }

    /// Process one completed message; returns the notification frames to
    /// send back.
    fn handle(&self, state: &mut DeviceState, message: ReceivedMessage) -> Result<Vec<Bytes>, LinkError> {
        if message.type_tag == u8::from(DataType::HandshakeRequest) {
            if !state.answer_handshakes {
                tracing::debug!("loopback ignoring handshake request");
                return Ok(Vec::new());
            }
            let Some(security) = state.security.as_mut() else {
                tracing::warn!("loopback has no secret, ignoring handshake request");
                return Ok(Vec::new());
            };
            let response = security
                .accept_handshake_request(&message.payload)
                .map_err(|e| LinkError::WriteFailed(e.to_string()))?;
            return self.frame(state, DeviceEvent::HandshakeResponse as u8, &response);
        }

        let message = match (state.security.as_mut(), message.type_tag) {
            (Some(security), t) if t == u8::from(DataType::SecureEnvelope) => security
                .open_secure_payload(&message.payload)
                .map_err(|e| LinkError::WriteFailed(e.to_string()))?,
            (Some(_), t) => {
                return Err(LinkError::WriteFailed(format!(
                    "unsecured message 0x{t:02x} refused"
                )))
            }
            (None, _) => message,
        };

        if let Some(remaining) = state.fail_writes.get_mut(&message.type_tag) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LinkError::WriteFailed(format!(
                    "injected failure for 0x{:02x}",
                    message.type_tag
                )));
            }
        }

        let is_event_request = message.type_tag == u8::from(DataType::EventLogRequest);
        state.received.push(message);

        let mut frames = Vec::new();
        if is_event_request {
            let events = std::mem::take(&mut state.queued_events);
            for event in events {
                frames.extend(self.outgoing(state, event.type_tag, &event.payload)?);
            }
        }
        Ok(frames)
    }
}

#[async_trait]
impl DeviceLink for LoopbackPeripheral {
    async fn connect(&self) -> Result<(), LinkError> {
        let delay = {
            let mut state = self.lock();
            state.connects += 1;
            if state.refuse_connects {
                return Err(LinkError::DeviceNotFound);
            }
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(LinkError::ConnectionTimeout);
            }
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.lock();
        if state.connected {
            state.disconnects += 1;
        }
        state.connected = false;
        state.assembler = ChunkAssembler::new();
        if let Some(security) = state.security.as_mut() {
            security.reset_session();
        }
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn write(&self, frame: Bytes) -> Result<(), LinkError> {
        let replies = {
            let mut state = self.lock();
            if !state.connected {
                return Err(LinkError::NotConnected);
            }
            match Self::deframe(&mut state, &frame) {
                Some(message) => self.handle(&mut state, message)?,
                None => Vec::new(),
            }
        };
        self.deliver(replies).await
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }
}
