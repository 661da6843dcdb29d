//! Chunk framing: splits a message into MTU-sized frames and reassembles
//! them on the far side.
//!
//! Each frame carries a 9-byte `ChunkHeader` whose `length` and `crc`
//! describe that frame's payload only. A damaged frame poisons its whole
//! message: the in-flight assembly is dropped and the sender's next sync
//! starts over.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use zerocopy::byteorder::U16;
use zerocopy::{AsBytes, FromBytes};

use crate::crc::crc16;
use crate::wire::{ChunkHeader, ReceivedMessage, CHUNK_HEADER_LEN, MAX_CHUNKS};

/// Default lifetime of an incomplete assembly.
pub const ASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on concurrently reassembling message ids.
pub const MAX_IN_FLIGHT: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("max chunk size must be between 1 and 65535")]
    InvalidChunkSize,

    #[error("payload of {0} bytes needs 0 or more than 255 chunks")]
    PayloadTooLarge(usize),
}

/// Split `payload` into chunk frames of at most `max_chunk_size` payload
/// bytes each.
///
/// An empty payload is refused: it would need zero chunks, which no
/// receiver can complete.
pub fn encode(
    type_tag: u8,
    message_id: u16,
    payload: &[u8],
    max_chunk_size: usize,
) -> Result<Vec<Bytes>, ChunkError> {
    // The per-chunk length field is a u16.
    if max_chunk_size == 0 || max_chunk_size > usize::from(u16::MAX) {
        return Err(ChunkError::InvalidChunkSize);
    }

    let total = payload.len().div_ceil(max_chunk_size);
    if total == 0 || total > MAX_CHUNKS {
        return Err(ChunkError::PayloadTooLarge(payload.len()));
    }

    let frames = payload
        .chunks(max_chunk_size)
        .enumerate()
        .map(|(seq, piece)| {
            let header = ChunkHeader {
                type_tag,
                message_id: U16::new(message_id),
                seq: seq as u8,
                total: total as u8,
                length: U16::new(piece.len() as u16),
                crc: U16::new(crc16(piece)),
            };
            let mut frame = BytesMut::with_capacity(CHUNK_HEADER_LEN + piece.len());
            frame.put_slice(header.as_bytes());
            frame.put_slice(piece);
            frame.freeze()
        })
        .collect();

    Ok(frames)
}

/// Parse and validate a chunk header, returning it with the chunk body.
///
/// Only the structural checks run here (`total > 0`, `seq < total`); length
/// and CRC are the assembler's business.
pub fn parse_header(frame: &[u8]) -> Option<(ChunkHeader, &[u8])> {
    let header = ChunkHeader::read_from_prefix(frame)?;
    if header.total == 0 || header.seq >= header.total {
        return None;
    }
    Some((header, &frame[CHUNK_HEADER_LEN..]))
}

struct Assembly {
    type_tag: u8,
    total: u8,
    chunks: HashMap<u8, Bytes>,
    started_at: Instant,
}

/// Reassembles chunk frames into complete messages.
///
/// Owned by a single reader; not shared across tasks.
pub struct ChunkAssembler {
    active: HashMap<u16, Assembly>,
    timeout: Duration,
    capacity: usize,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::with_timeout(ASSEMBLY_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            active: HashMap::new(),
            timeout,
            capacity: MAX_IN_FLIGHT,
        }
    }

    /// Number of messages currently being reassembled.
    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    /// Whether chunks of `message_id` are currently being collected.
    pub fn is_assembling(&self, message_id: u16) -> bool {
        self.active.contains_key(&message_id)
    }

    /// Feed one frame. Returns the message when this frame completes it.
    pub fn decode_chunk(&mut self, frame: &[u8]) -> Option<ReceivedMessage> {
        self.evict_stale();

        if frame.len() < CHUNK_HEADER_LEN {
            tracing::debug!(len = frame.len(), "chunk shorter than header");
            return None;
        }
        let (header, body) = match parse_header(frame) {
            Some(parsed) => parsed,
            None => {
                tracing::debug!("chunk header has invalid seq/total");
                return None;
            }
        };
        let message_id = header.message_id.get();

        if usize::from(header.length.get()) != body.len() {
            tracing::warn!(
                message_id,
                seq = header.seq,
                declared = header.length.get(),
                actual = body.len(),
                "chunk length mismatch, dropping message"
            );
            self.active.remove(&message_id);
            return None;
        }
        if crc16(body) != header.crc.get() {
            tracing::warn!(message_id, seq = header.seq, "chunk CRC mismatch, dropping message");
            self.active.remove(&message_id);
            return None;
        }

        if !self.active.contains_key(&message_id) {
            self.make_room();
            self.active.insert(
                message_id,
                Assembly {
                    type_tag: header.type_tag,
                    total: header.total,
                    chunks: HashMap::new(),
                    started_at: Instant::now(),
                },
            );
        }

        let assembly = self.active.get_mut(&message_id)?;
        if assembly.type_tag != header.type_tag || assembly.total != header.total {
            tracing::warn!(
                message_id,
                "chunk disagrees with in-flight assembly, ignoring"
            );
            return None;
        }

        assembly.chunks.insert(header.seq, Bytes::copy_from_slice(body));
        tracing::debug!(
            message_id,
            seq = header.seq,
            total = header.total,
            "chunk accepted"
        );

        if assembly.chunks.len() < usize::from(assembly.total) {
            return None;
        }

        let assembly = self.active.remove(&message_id)?;
        let mut payload = BytesMut::new();
        for seq in 0..assembly.total {
            payload.put_slice(assembly.chunks.get(&seq)?);
        }
        Some(ReceivedMessage {
            type_tag: assembly.type_tag,
            payload: payload.freeze(),
        })
    }

    /// Feed a sequence of frames, collecting every message they complete.
    pub fn decode_all<I, B>(&mut self, frames: I) -> Vec<ReceivedMessage>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        frames
            .into_iter()
            .filter_map(|frame| self.decode_chunk(frame.as_ref()))
            .collect()
    }

    /// Remove assemblies older than the timeout.
    pub fn evict_stale(&mut self) {
        self.evict_stale_at(Instant::now());
    }

    fn evict_stale_at(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.active.retain(|message_id, assembly| {
            let stale = now.saturating_duration_since(assembly.started_at) > timeout;
            if stale {
                tracing::warn!(message_id, "removing stale assembly (timed out)");
            }
            !stale
        });
    }

    fn make_room(&mut self) {
        if self.active.len() < self.capacity {
            return;
        }
        let oldest = self
            .active
            .iter()
            .min_by_key(|(_, assembly)| assembly.started_at)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            tracing::warn!(message_id = id, "assembly table full, evicting oldest");
            self.active.remove(&id);
        }
    }
}
