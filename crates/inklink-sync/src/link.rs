//! Device link: the transport seam between the sync engine and a radio.
//!
//! A link owns one connection to one companion device: a single write
//! characteristic going out and a notification characteristic coming in.
//! Notifications are not returned from any method here; the link pushes
//! them into the `mpsc` sender it was built with, and the coordinator
//! consumes the other end.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("bluetooth is unavailable")]
    BluetoothUnavailable,

    #[error("companion device not found")]
    DeviceNotFound,

    #[error("connection timed out")]
    ConnectionTimeout,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("companion service not found")]
    ServiceNotFound,

    #[error("required characteristic not found")]
    CharacteristicNotFound,

    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Transport to the companion device.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Scan, connect, and discover the service and both characteristics.
    async fn connect(&self) -> Result<(), LinkError>;

    /// Drop the connection. Idempotent.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Write one frame to the write characteristic.
    async fn write(&self, frame: Bytes) -> Result<(), LinkError>;

    /// Largest frame `write` accepts on the current connection.
    fn max_write_len(&self) -> usize;
}
