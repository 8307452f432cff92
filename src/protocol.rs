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

//! LoRa file transfer wire constants

use std::time::Duration;

/// Offer - announces file name, chunk count and total size
pub const TAG_FILE: &str = "FILE";

/// Chunk - sequence number, CRC and base64 payload
pub const TAG_DATA: &str = "DATA";

/// Receiver accepted the chunk with this sequence number
pub const TAG_ACK: &str = "ACK";

/// Receiver rejected the chunk with this sequence number, retransmit
pub const TAG_NACK: &str = "NACK";

/// Completion record - CRC of the whole file
pub const TAG_DONE: &str = "DONE";

/// Sender gave up, receiver discards the transfer
pub const TAG_ABORT: &str = "ABORT";

/// Separates packet fields
pub const FIELD_SEPARATOR: char = ':';

/// Appended to every packet written to the link
pub const LINE_DELIMITER: &[u8] = b"\r\n";

/// Banner the radio module prints after a reset; never a packet
pub const POWER_ON_BANNER: &[u8] = b"Power on";

/// Raw payload bytes per chunk, before base64
pub const MAX_CHUNK_SIZE: usize = 100;

/// Largest chunk size a config may select while staying under MAX_LINE_LENGTH
pub const MAX_CONFIGURABLE_CHUNK_SIZE: usize = 2048;

/// Unterminated input longer than this is discarded as line noise
pub const MAX_LINE_LENGTH: usize = 4096;

/// Wait for ACK/NACK per attempt, sized for the slowest spreading factor
pub const ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Attempts per chunk before the transfer is abandoned
pub const MAX_RETRIES: u32 = 5;

/// How long the receiver keeps a stalled transfer before returning to listening
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(ACK_TIMEOUT.as_secs() * (MAX_RETRIES as u64 + 1));

/// Longest configurable timeout
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Poll interval while no transfer is in progress
pub const LISTEN_POLL: Duration = Duration::from_secs(1);

/// Default directory for delivered files, relative to the working directory
pub const RECEIVE_DIR: &str = "./lora_received";

/// Name used when the offered name has no usable final component
pub const FALLBACK_FILE_NAME: &str = "received.bin";

/// Toggles the radio module between AT command mode and transparent mode
pub const MODE_TOGGLE: &[u8] = b"+++\r\n";

/// Module reply after entering AT command mode
pub const ENTRY_AT: &str = "Entry AT";

/// Module reply after leaving AT command mode
pub const EXIT_AT: &str = "Exit AT";
