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
use thiserror::Error;
use crate::checksum::crc16_ccitt;

/// One bounded slice of a file, the unit of transfer and acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub seq: u32,
    /// CRC of `payload` before any wire encoding
    pub checksum: u16,
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn new(seq: u32, payload: Vec<u8>) -> Self {
        Chunk { seq, checksum: crc16_ccitt(&payload), payload }
    }

    pub fn is_intact(&self) -> bool {
        crc16_ccitt(&self.payload) == self.checksum
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("incomplete transfer: {missing} of {expected} chunks missing (first missing: {first_missing})")]
pub struct IncompleteError {
    pub expected: u32,
    pub missing: u32,
    pub first_missing: u32,
}

/// Number of chunks `total_size` bytes occupy. A zero-byte file has no chunks.
pub fn chunk_count(total_size: u64, max_chunk_size: usize) -> u32 {
    total_size.div_ceil(max_chunk_size as u64) as u32
}

/// Splits `data` into consecutive chunks numbered from 0. Only the last chunk
/// may be shorter than `max_chunk_size`.
pub fn split(data: &[u8], max_chunk_size: usize) -> Vec<Chunk> {
    assert!(max_chunk_size > 0, "chunk size must be positive");
    data.chunks(max_chunk_size)
        .enumerate()
        .map(|(seq, piece)| Chunk::new(seq as u32, piece.to_vec()))
        .collect()
}

/// Concatenates `chunks` in sequence order. Every sequence number in
/// `0..expected` must be present; arrival order does not matter.
pub fn assemble(chunks: &BTreeMap<u32, Vec<u8>>, expected: u32) -> Result<Vec<u8>, IncompleteError> {
    let present = chunks.range(0..expected).count() as u32;
    if present < expected {
        // Keys are sorted and unique, so the first gap is where key and index part
        let first_missing = chunks
            .range(0..expected)
            .zip(0u32..)
            .find(|((seq, _), index)| **seq != *index)
            .map_or(present, |(_, index)| index);
        return Err(IncompleteError {
            expected,
            missing: expected - present,
            first_missing,
        });
    }

    let mut data = Vec::with_capacity(chunks.values().map(Vec::len).sum());
    for payload in chunks.range(0..expected).map(|(_, payload)| payload) {
        data.extend_from_slice(payload);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_map(chunks: Vec<Chunk>) -> BTreeMap<u32, Vec<u8>> {
        chunks.into_iter().map(|c| (c.seq, c.payload)).collect()
    }

    #[test]
    fn test_split_250_bytes() {
        let data: Vec<u8> = (0..250).map(|i| (i % 256) as u8).collect();
        let chunks = split(&data, 100);

        let sizes: Vec<usize> = chunks.iter().map(|c| c.payload.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(chunks.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(chunks.iter().all(Chunk::is_intact));
        assert_eq!(chunk_count(250, 100), 3);
    }

    #[test]
    fn test_split_empty() {
        assert!(split(&[], 100).is_empty());
        assert_eq!(chunk_count(0, 100), 0);
    }

    #[test]
    fn test_split_exact_multiple() {
        let data = vec![7u8; 300];
        let chunks = split(&data, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunk_count(300, 100), 3);
        assert_eq!(chunk_count(301, 100), 4);
    }

    #[test]
    fn test_assemble_restores_input() {
        for len in [1usize, 2, 99, 100, 101, 250, 1000, 1001] {
            for size in [1usize, 3, 100, 128] {
                let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
                let chunks = split(&data, size);
                assert_eq!(chunks.len() as u32, chunk_count(len as u64, size));
                let count = chunks.len() as u32;
                assert_eq!(assemble(&to_map(chunks), count).unwrap(), data);
            }
        }
    }

    #[test]
    fn test_assemble_out_of_order() {
        let mut received = BTreeMap::new();
        received.insert(2, b"!".to_vec());
        received.insert(0, b"hello".to_vec());
        received.insert(1, b" world".to_vec());

        assert_eq!(assemble(&received, 3).unwrap(), b"hello world!");
    }

    #[test]
    fn test_assemble_missing_chunk() {
        let mut received = BTreeMap::new();
        received.insert(0, b"a".to_vec());
        received.insert(2, b"c".to_vec());

        let err = assemble(&received, 4).unwrap_err();
        assert_eq!(err, IncompleteError { expected: 4, missing: 2, first_missing: 1 });
    }

    #[test]
    fn test_assemble_missing_tail() {
        let mut received = BTreeMap::new();
        received.insert(0, b"a".to_vec());
        received.insert(1, b"b".to_vec());

        let err = assemble(&received, 3).unwrap_err();
        assert_eq!(err, IncompleteError { expected: 3, missing: 1, first_missing: 2 });
    }

    #[test]
    fn test_assemble_huge_expected_count() {
        let mut received = BTreeMap::new();
        received.insert(0, b"x".to_vec());

        let err = assemble(&received, u32::MAX).unwrap_err();
        assert_eq!(err, IncompleteError { expected: u32::MAX, missing: u32::MAX - 1, first_missing: 1 });
    }

    #[test]
    fn test_assemble_zero_chunks() {
        assert_eq!(assemble(&BTreeMap::new(), 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_corrupted_chunk_detected() {
        let mut chunk = Chunk::new(0, b"payload".to_vec());
        chunk.payload[3] ^= 0x01;
        assert!(!chunk.is_intact());
    }
}
