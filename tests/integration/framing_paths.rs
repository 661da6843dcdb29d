//! Framing across the link: write sizes, interleaving, corruption.

use anyhow::{Context, Result};
use inklink_core::chunk::{self, ChunkAssembler};
use inklink_core::framing;
use inklink_core::wire::ReceivedMessage;
use inklink_sync::{LoopbackPeripheral, SyncCoordinator, SyncInput};

use crate::*;

#[test]
fn test_interleaved_messages_reassemble() -> Result<()> {
    let first: Vec<u8> = (0..120).collect();
    let second: Vec<u8> = (0..90).rev().collect();
    let a = chunk::encode(0x02, 100, &first, 8)?;
    let b = chunk::encode(0x03, 101, &second, 8)?;

    let mut interleaved = Vec::new();
    for i in 0..a.len().max(b.len()) {
        interleaved.extend(a.get(i).cloned());
        interleaved.extend(b.get(i).cloned());
    }

    let mut assembler = ChunkAssembler::new();
    let mut messages = assembler.decode_all(&interleaved);
    messages.sort_by_key(|m| m.type_tag);
    assert_eq!(
        messages,
        vec![
            ReceivedMessage::new(0x02, first),
            ReceivedMessage::new(0x03, second),
        ]
    );
    assert_eq!(assembler.in_flight(), 0);
    Ok(())
}

#[test]
fn test_corrupt_chunk_drops_message_until_resent() -> Result<()> {
    let payload: Vec<u8> = (0..40).collect();
    let frames = chunk::encode(0x04, 9, &payload, 8)?;
    let mut assembler = ChunkAssembler::new();

    let mut corrupted: Vec<Vec<u8>> = frames.iter().map(|f| f.to_vec()).collect();
    let last = corrupted.last_mut().context("no frames")?;
    let idx = last.len() - 1;
    last[idx] ^= 0xff;
    assert!(assembler.decode_all(&corrupted).is_empty());

    let messages = assembler.decode_all(&frames);
    assert_eq!(messages, vec![ReceivedMessage::new(0x04, payload)]);
    Ok(())
}

#[test]
fn test_simple_frames() -> Result<()> {
    let frame = framing::encode_write(0x05, &[26, 7, 16, 9, 30, 0])?;
    assert_eq!(frame.as_ref(), &[0x05, 0x00, 0x06, 26, 7, 16, 9, 30, 0]);

    let message = framing::decode_notify(&[0x40, 0x01, 15, 0xee]).context("no message")?;
    assert_eq!(message, ReceivedMessage::new(0x40, vec![15]));
    assert!(framing::decode_notify(&[0x40, 0x05, 1]).is_none());
    Ok(())
}

/// After MTU negotiation the same day pack fits in a single simple frame;
/// the device cannot tell the difference.
#[tokio::test(start_paused = true)]
async fn test_larger_write_size_uses_simple_frames() -> Result<()> {
    let content: Vec<u8> = (0..150u8).collect();
    let mut received = Vec::new();

    for max_write_len in [17usize, 185] {
        let (device, notifications) = LoopbackPeripheral::new(max_write_len, None);
        let device = std::sync::Arc::new(device);
        let mut coordinator = SyncCoordinator::new(
            device.clone(),
            notifications,
            &inklink_core::config::InklinkConfig::default(),
        );
        let report = coordinator
            .perform_sync(SyncInput {
                now: local(20, 12, 0)?,
                content: bytes::Bytes::from(content.clone()),
                last_sync: None,
                last_fingerprint: None,
                last_event_log_timestamp: 0,
                force: false,
            })
            .await;
        assert!(report.content_pushed);
        received.push(device.received()[1].clone());
    }

    assert_eq!(received[0], received[1]);
    assert_eq!(received[0].payload.as_ref(), content.as_slice());
    Ok(())
}
