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

//! Text packet codec. One packet per line, colon-separated fields:
//!
//! ```text
//! FILE:<name>:<chunk_count>:<total_size>
//! DATA:<seq>:<crc16 hex>:<payload base64>
//! ACK:<seq>
//! NACK:<seq>
//! DONE:<crc16 hex>
//! ABORT
//! ```

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;
use crate::chunker::Chunk;
use crate::protocol::*;
use crate::transfer::TransferOffer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Offer(TransferOffer),
    Data(Chunk),
    Ack(u32),
    Nack(u32),
    Done(u16),
    Abort,
    /// A line whose leading tag is not part of the protocol
    Unknown(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("line is not valid UTF-8")]
    NotUtf8,
    #[error("{tag} packet has {got} fields, expected {expected}")]
    FieldCount { tag: &'static str, expected: usize, got: usize },
    #[error("{field} is not a valid number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("invalid checksum field: {0:?}")]
    InvalidChecksum(String),
    #[error("payload is not valid base64: {0}")]
    InvalidPayload(String),
    #[error("DATA packet has an empty payload")]
    EmptyPayload,
    #[error("FILE packet has an empty file name")]
    EmptyFileName,
}

impl Packet {
    /// Renders the packet without the line delimiter.
    pub fn encode(&self) -> String {
        match self {
            Packet::Offer(offer) => format!(
                "{TAG_FILE}:{}:{}:{}",
                offer.file_name, offer.chunk_count, offer.total_size
            ),
            Packet::Data(chunk) => format!(
                "{TAG_DATA}:{}:{:04x}:{}",
                chunk.seq,
                chunk.checksum,
                BASE64.encode(&chunk.payload)
            ),
            Packet::Ack(seq) => format!("{TAG_ACK}:{seq}"),
            Packet::Nack(seq) => format!("{TAG_NACK}:{seq}"),
            Packet::Done(crc) => format!("{TAG_DONE}:{crc:04x}"),
            Packet::Abort => TAG_ABORT.to_string(),
            Packet::Unknown(line) => line.clone(),
        }
    }

    /// Parses one line (delimiter already stripped). Malformed lines of a known
    /// kind are errors; lines with an unrecognized tag become `Unknown`.
    pub fn decode(line: &[u8]) -> Result<Packet, PacketError> {
        let line = std::str::from_utf8(line).map_err(|_| PacketError::NotUtf8)?.trim();
        let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();

        match fields[0] {
            TAG_FILE => {
                expect_fields(TAG_FILE, &fields, 4)?;
                if fields[1].is_empty() {
                    return Err(PacketError::EmptyFileName);
                }
                Ok(Packet::Offer(TransferOffer {
                    file_name: fields[1].to_string(),
                    chunk_count: parse_number("chunk_count", fields[2])?,
                    total_size: parse_number("total_size", fields[3])?,
                }))
            }
            TAG_DATA => {
                expect_fields(TAG_DATA, &fields, 4)?;
                let seq = parse_number("seq", fields[1])?;
                let checksum = parse_checksum(fields[2])?;
                let payload = BASE64
                    .decode(fields[3])
                    .map_err(|e| PacketError::InvalidPayload(e.to_string()))?;
                if payload.is_empty() {
                    return Err(PacketError::EmptyPayload);
                }
                Ok(Packet::Data(Chunk { seq, checksum, payload }))
            }
            TAG_ACK => {
                expect_fields(TAG_ACK, &fields, 2)?;
                Ok(Packet::Ack(parse_number("seq", fields[1])?))
            }
            TAG_NACK => {
                expect_fields(TAG_NACK, &fields, 2)?;
                Ok(Packet::Nack(parse_number("seq", fields[1])?))
            }
            TAG_DONE => {
                expect_fields(TAG_DONE, &fields, 2)?;
                Ok(Packet::Done(parse_checksum(fields[1])?))
            }
            TAG_ABORT => {
                expect_fields(TAG_ABORT, &fields, 1)?;
                Ok(Packet::Abort)
            }
            _ => Ok(Packet::Unknown(line.to_string())),
        }
    }

    /// Short description for logs; never includes the payload.
    pub fn summary(&self) -> String {
        match self {
            Packet::Data(chunk) => format!(
                "{TAG_DATA}:{} ({} bytes, crc={:04x})",
                chunk.seq,
                chunk.payload.len(),
                chunk.checksum
            ),
            Packet::Unknown(line) => format!("unknown {:?}", truncate(line, 40)),
            other => other.encode(),
        }
    }
}

fn expect_fields(tag: &'static str, fields: &[&str], expected: usize) -> Result<(), PacketError> {
    if fields.len() != expected {
        return Err(PacketError::FieldCount { tag, expected, got: fields.len() });
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, PacketError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PacketError::InvalidNumber { field, value: value.to_string() });
    }
    value.parse().map_err(|_| PacketError::InvalidNumber { field, value: value.to_string() })
}

/// Checksums travel as hex; a leading `0x` is tolerated.
fn parse_checksum(value: &str) -> Result<u16, PacketError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if digits.is_empty() || digits.len() > 4 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(PacketError::InvalidChecksum(value.to_string()));
    }
    u16::from_str_radix(digits, 16).map_err(|_| PacketError::InvalidChecksum(value.to_string()))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
