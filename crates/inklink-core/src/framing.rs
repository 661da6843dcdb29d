//! Simple framing for messages that fit in a single characteristic write.
//!
//! The two directions use different header widths:
//!   phone → device   `type:u8 | length:u16 BE | payload`
//!   device → phone   `type:u8 | length:u8     | payload`

use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::{ReceivedMessage, WireError, SIMPLE_NOTIFY_HEADER_LEN, SIMPLE_WRITE_HEADER_LEN};

/// Frame an outbound write.
pub fn encode_write(type_tag: u8, payload: &[u8]) -> Result<Bytes, WireError> {
    let length = u16::try_from(payload.len()).map_err(|_| WireError::PayloadTooLarge(payload.len()))?;
    let mut frame = BytesMut::with_capacity(SIMPLE_WRITE_HEADER_LEN + payload.len());
    frame.put_u8(type_tag);
    frame.put_u16(length);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Decode a device notification. Bytes past the declared length are ignored.
pub fn decode_notify(frame: &[u8]) -> Option<ReceivedMessage> {
    if frame.len() < SIMPLE_NOTIFY_HEADER_LEN {
        return None;
    }
    let length = usize::from(frame[1]);
    let end = SIMPLE_NOTIFY_HEADER_LEN + length;
    let payload = frame.get(SIMPLE_NOTIFY_HEADER_LEN..end)?;
    Some(ReceivedMessage::new(frame[0], Bytes::copy_from_slice(payload)))
}

/// Device-side mirror of `decode_notify`.
pub fn encode_notify(type_tag: u8, payload: &[u8]) -> Result<Bytes, WireError> {
    let length = u8::try_from(payload.len()).map_err(|_| WireError::PayloadTooLarge(payload.len()))?;
    let mut frame = BytesMut::with_capacity(SIMPLE_NOTIFY_HEADER_LEN + payload.len());
    frame.put_u8(type_tag);
    frame.put_u8(length);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Device-side mirror of `encode_write`.
pub fn decode_write(frame: &[u8]) -> Option<ReceivedMessage> {
    if frame.len() < SIMPLE_WRITE_HEADER_LEN {
        return None;
    }
    let length = usize::from(u16::from_be_bytes([frame[1], frame[2]]));
    let end = SIMPLE_WRITE_HEADER_LEN + length;
    let payload = frame.get(SIMPLE_WRITE_HEADER_LEN..end)?;
    Some(ReceivedMessage::new(frame[0], Bytes::copy_from_slice(payload)))
}
