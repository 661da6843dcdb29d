//! inklink wire format: on-wire types for the phone ↔ companion link.
//!
//! These types ARE the protocol. Every field and every size here is shared
//! with the device firmware; changing anything is a breaking change.
//!
//! Fixed headers use zerocopy derives with explicit big-endian field types,
//! so layout is deterministic and parsing is allocation-free. There is no
//! unsafe code in this module.

use bytes::Bytes;
use chrono::{DateTime, Datelike, TimeZone, Timelike};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Chunk Header ─────────────────────────────────────────────────────────────

/// Header carried by every chunk of a multi-packet message.
///
/// `length` and `crc` describe the chunk that follows this header, not the
/// whole message, so a damaged chunk is diagnosable on its own.
///
/// Wire size: 9 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ChunkHeader {
    /// Application message type, identical for every chunk of a message.
    pub type_tag: u8,
    /// Scopes reassembly. Wraps at u16::MAX.
    pub message_id: U16<BigEndian>,
    /// Zero-based chunk index. Always < total.
    pub seq: u8,
    /// Chunk count for the message (1..=255).
    pub total: u8,
    /// Length of this chunk's payload in bytes.
    pub length: U16<BigEndian>,
    /// CRC16-CCITT-FALSE of this chunk's payload.
    pub crc: U16<BigEndian>,
}

assert_eq_size!(ChunkHeader, [u8; CHUNK_HEADER_LEN]);

// ── Secure Envelope Header ───────────────────────────────────────────────────

/// Fixed prefix of a secure envelope. The payload follows immediately,
/// then the 32-byte signature.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct EnvelopeHeader {
    pub version: u8,
    pub payload_type: u8,
    pub nonce: U64<BigEndian>,
    /// Unix seconds.
    pub issued_at: U32<BigEndian>,
    pub payload_len: U16<BigEndian>,
}

assert_eq_size!(EnvelopeHeader, [u8; ENVELOPE_HEADER_LEN]);

// ── Handshake ────────────────────────────────────────────────────────────────

/// Challenge sent by the phone. The signature covers every preceding byte.
///
/// Wire size: 45 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct HandshakeRequest {
    /// Always HANDSHAKE_REQUEST_KIND.
    pub kind: u8,
    pub client_nonce: U64<BigEndian>,
    pub issued_at: U32<BigEndian>,
    pub signature: [u8; SIGNATURE_LEN],
}

assert_eq_size!(HandshakeRequest, [u8; 45]);

/// Device answer to a HandshakeRequest. Echoes the client nonce.
///
/// Wire size: 53 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct HandshakeResponse {
    /// Always HANDSHAKE_RESPONSE_KIND.
    pub kind: u8,
    pub client_nonce: U64<BigEndian>,
    pub server_nonce: U64<BigEndian>,
    pub issued_at: U32<BigEndian>,
    pub signature: [u8; SIGNATURE_LEN],
}

assert_eq_size!(HandshakeResponse, [u8; HANDSHAKE_RESPONSE_LEN]);

/// Bytes of a HandshakeResponse covered by its signature.
pub const HANDSHAKE_RESPONSE_SIGNED_LEN: usize = 1 + 8 + 8 + 4;

// ── Data Types ───────────────────────────────────────────────────────────────

/// Message types written by the phone to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    PetStatus = 0x01,
    TaskList = 0x02,
    Schedule = 0x03,
    Weather = 0x04,
    Time = 0x05,
    DayPack = 0x10,
    TaskInPage = 0x11,
    DeviceMode = 0x12,
    EventLogRequest = 0x20,
    EventLogBatch = 0x21,
    /// Carries a raw HandshakeRequest. Never wrapped in an envelope.
    HandshakeRequest = 0x50,
    /// Carries an encoded secure envelope; the real type is inside.
    SecureEnvelope = 0x51,
}

impl TryFrom<u8> for DataType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(DataType::PetStatus),
            0x02 => Ok(DataType::TaskList),
            0x03 => Ok(DataType::Schedule),
            0x04 => Ok(DataType::Weather),
            0x05 => Ok(DataType::Time),
            0x10 => Ok(DataType::DayPack),
            0x11 => Ok(DataType::TaskInPage),
            0x12 => Ok(DataType::DeviceMode),
            0x20 => Ok(DataType::EventLogRequest),
            0x21 => Ok(DataType::EventLogBatch),
            0x50 => Ok(DataType::HandshakeRequest),
            0x51 => Ok(DataType::SecureEnvelope),
            other => Err(WireError::UnknownDataType(other)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(t: DataType) -> u8 {
        t as u8
    }
}

/// Message types notified by the device to the phone.
///
/// The inbound and outbound code spaces are independent: 0x20 is an
/// event-log request going out and a refresh request coming in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceEvent {
    EnterTaskIn = 0x10,
    CompleteTask = 0x11,
    SkipTask = 0x12,
    SelectedTaskChanged = 0x13,
    WheelSelect = 0x14,
    ViewEventDetail = 0x15,
    RequestRefresh = 0x20,
    EventLogBatch = 0x21,
    DeviceWake = 0x30,
    DeviceSleep = 0x31,
    LowBattery = 0x40,
    HandshakeResponse = 0x50,
    SecureEnvelope = 0x51,
}

impl DeviceEvent {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x10 => Some(Self::EnterTaskIn),
            0x11 => Some(Self::CompleteTask),
            0x12 => Some(Self::SkipTask),
            0x13 => Some(Self::SelectedTaskChanged),
            0x14 => Some(Self::WheelSelect),
            0x15 => Some(Self::ViewEventDetail),
            0x20 => Some(Self::RequestRefresh),
            0x21 => Some(Self::EventLogBatch),
            0x30 => Some(Self::DeviceWake),
            0x31 => Some(Self::DeviceSleep),
            0x40 => Some(Self::LowBattery),
            0x50 => Some(Self::HandshakeResponse),
            0x51 => Some(Self::SecureEnvelope),
            _ => None,
        }
    }
}

/// A complete application message after framing has been removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub type_tag: u8,
    pub payload: Bytes,
}

impl ReceivedMessage {
    pub fn new(type_tag: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            type_tag,
            payload: payload.into(),
        }
    }
}

// ── Payload helpers ──────────────────────────────────────────────────────────

/// Time-sync payload: `[year-2000, month, day, hour, minute, second]`,
/// taken in whatever zone `now` carries. The year offset saturates to 0..=255.
pub fn time_payload<Tz: TimeZone>(now: &DateTime<Tz>) -> [u8; 6] {
    let year_offset = (now.year() - 2000).clamp(0, 255) as u8;
    [
        year_offset,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
    ]
}

/// Event-log request payload: the unix timestamp of the newest log already
/// held by the phone, big-endian.
pub fn event_log_request_payload(since: u32) -> [u8; 4] {
    since.to_be_bytes()
}

/// Stable content fingerprint: hex BLAKE3 of the encoded content.
pub fn fingerprint(content: &[u8]) -> String {
    hex::encode(blake3::hash(content).as_bytes())
}

// ── Constants ────────────────────────────────────────────────────────────────

/// Chunk header size in bytes.
pub const CHUNK_HEADER_LEN: usize = 9;

/// Maximum chunks per message (the `total` field is a u8).
pub const MAX_CHUNKS: usize = 255;

/// Outbound simple frame header: type + u16 length.
pub const SIMPLE_WRITE_HEADER_LEN: usize = 3;

/// Inbound simple frame header: type + u8 length.
pub const SIMPLE_NOTIFY_HEADER_LEN: usize = 2;

/// Secure envelope fixed header size.
pub const ENVELOPE_HEADER_LEN: usize = 1 + 1 + 8 + 4 + 2;

/// HMAC-SHA256 output length.
pub const SIGNATURE_LEN: usize = 32;

/// Exact size of a handshake response.
pub const HANDSHAKE_RESPONSE_LEN: usize = HANDSHAKE_RESPONSE_SIGNED_LEN + SIGNATURE_LEN;

/// Secure envelope protocol version.
pub const PROTOCOL_VERSION: u8 = 2;

pub const HANDSHAKE_REQUEST_KIND: u8 = 0x01;
pub const HANDSHAKE_RESPONSE_KIND: u8 = 0x02;

/// Accepted clock skew between phone and device, in seconds.
pub const CLOCK_SKEW_SECS: u32 = 120;

/// Usable ATT payload at the default (BLE 4.2) MTU.
/// Negotiated links report their own value through the device link.
pub const DEFAULT_MAX_WRITE_LEN: usize = 17;

/// Characteristic writes allowed per rolling second.
pub const MAX_WRITES_PER_SECOND: usize = 20;

/// Minimum spacing between accepted device refresh requests, in milliseconds.
pub const REFRESH_MIN_INTERVAL_MS: u64 = 2000;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when producing or interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown data type: 0x{0:02x}")]
    UnknownDataType(u8),

    #[error("payload of {0} bytes does not fit the frame")]
    PayloadTooLarge(usize),
}

// ── Tests ────────────────────────────────────────────────────────────────────
