//! inklink-core: wire format, framing codecs, and link security for the
//! phone ↔ E-ink companion link. All other inklink crates depend on this one.

pub mod chunk;
pub mod config;
pub mod crc;
pub mod crypto;
pub mod envelope;
pub mod framing;
pub mod security;
pub mod wire;

pub use chunk::{ChunkAssembler, ChunkError};
pub use config::InklinkConfig;
pub use envelope::{Envelope, EnvelopeError};
pub use security::{SecurityError, SecurityManager, SecurityMode, SessionState};
pub use wire::{DataType, DeviceEvent, ReceivedMessage, WireError};
