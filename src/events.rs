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

//! Progress notifications for whoever presents a transfer. The protocol core
//! only pushes events; it never waits on a consumer.

use std::path::PathBuf;
use crossbeam_channel::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Timeout,
    Nack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Started { direction: Direction, file_name: String, chunk_count: u32, total_size: u64 },
    ChunkSent { seq: u32, attempt: u32 },
    Retrying { seq: u32, attempt: u32, reason: RetryReason },
    ChunkAcked { seq: u32, chunk_count: u32, bytes_acked: u64 },
    ChunkStored { seq: u32, received: u32, chunk_count: u32 },
    /// Sender has emitted the completion record
    Finished { file_name: String, checksum: u16 },
    Delivered { path: PathBuf, size: u64, checksum: u16 },
    Failed { direction: Direction, file_name: Option<String>, reason: String },
}

/// Optional event channel; a dropped consumer silently disables events.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<Sender<TransferEvent>>);

impl EventSink {
    pub fn new(tx: Sender<TransferEvent>) -> Self {
        EventSink(Some(tx))
    }

    pub fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}
