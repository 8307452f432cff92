// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::collections::BTreeMap;
use std::path::Path;
use crate::checksum::crc16_ccitt;
use crate::chunker::{self, Chunk, IncompleteError};
use crate::protocol::*;

// ============================================================================
// Offer
// ============================================================================

/// Announces a transfer. There is no transfer ID: at most one offer is in
/// flight per session, and a new offer replaces the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOffer {
    pub file_name: String,
    pub chunk_count: u32,
    pub total_size: u64,
}

impl TransferOffer {
    pub fn new(file_name: &str, total_size: u64, max_chunk_size: usize) -> Self {
        TransferOffer {
            file_name: sanitize_offer_name(file_name),
            chunk_count: chunker::chunk_count(total_size, max_chunk_size),
            total_size,
        }
    }

    /// Whether `chunk_count` could describe `total_size` bytes under any chunk
    /// size a sender may configure. Every chunk carries at least one byte.
    pub fn is_plausible(&self) -> bool {
        let chunks = self.chunk_count as u64;
        if self.total_size == 0 {
            return chunks == 0;
        }
        chunks > 0
            && chunks <= self.total_size
            && self.total_size <= chunks * MAX_CONFIGURABLE_CHUNK_SIZE as u64
    }
}

/// Replaces characters that would break the colon-delimited line format.
pub fn sanitize_offer_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == FIELD_SEPARATOR || c.is_control() { '_' } else { c })
        .collect()
}

/// Reduces an offered name to a bare file name safe to create in the output directory.
pub fn local_file_name(offered: &str) -> String {
    let normalized = offered.replace('\\', "/");
    match Path::new(&normalized).file_name().and_then(|n| n.to_str()) {
        Some(name) if !name.trim().is_empty() => name.to_string(),
        _ => FALLBACK_FILE_NAME.to_string(),
    }
}

// ============================================================================
// Receiver-side transfer state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkVerdict {
    /// Stored (or already held); reply ACK
    Accept,
    /// Checksum mismatch; reply NACK, nothing stored
    Reject,
    /// Sequence number outside the offered range; no reply
    OutOfRange,
}

/// Why a completed transfer could not be delivered.
#[derive(Debug, PartialEq, Eq)]
pub enum Rejection {
    Incomplete(IncompleteError),
    ChecksumMismatch { expected: u16, actual: u16 },
    SizeMismatch { declared: u64, actual: u64 },
}

/// Chunks accumulated for the transfer currently being received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferState {
    offer: TransferOffer,
    received: BTreeMap<u32, Vec<u8>>,
}

impl TransferState {
    pub fn new(offer: TransferOffer) -> Self {
        TransferState { offer, received: BTreeMap::new() }
    }

    pub fn offer(&self) -> &TransferOffer {
        &self.offer
    }

    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn received_bytes(&self) -> u64 {
        self.received.values().map(|p| p.len() as u64).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.received_count() == self.offer.chunk_count
    }

    /// Validates and stores a chunk. Storing a sequence number twice is not an
    /// error: a lost ACK makes the sender repeat the chunk, which is acked again.
    pub fn accept_chunk(&mut self, chunk: Chunk) -> ChunkVerdict {
        if chunk.seq >= self.offer.chunk_count {
            return ChunkVerdict::OutOfRange;
        }
        if !chunk.is_intact() {
            return ChunkVerdict::Reject;
        }
        self.received.insert(chunk.seq, chunk.payload);
        ChunkVerdict::Accept
    }

    /// Assembles the file and checks it against the completion record's CRC
    /// and the offer's declared size.
    pub fn finish(&self, file_checksum: u16) -> Result<Vec<u8>, Rejection> {
        let data = chunker::assemble(&self.received, self.offer.chunk_count)
            .map_err(Rejection::Incomplete)?;

        let actual = crc16_ccitt(&data);
        if actual != file_checksum {
            return Err(Rejection::ChecksumMismatch { expected: file_checksum, actual });
        }
        if data.len() as u64 != self.offer.total_size {
            return Err(Rejection::SizeMismatch {
                declared: self.offer.total_size,
                actual: data.len() as u64,
            });
        }
        Ok(data)
    }
}
