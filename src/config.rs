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

//! Session configuration

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use crate::protocol::*;

/// Tunables for both session roles
#[derive(Debug, Clone)]
pub struct Config {
    /// Raw bytes per DATA packet
    pub chunk_size: usize,

    /// Wait for ACK/NACK per attempt
    pub ack_timeout: Duration,

    /// Attempts per chunk, including the first
    pub max_retries: u32,

    /// Receiver abandons a transfer after this long without DATA or DONE
    pub idle_timeout: Duration,

    /// Receive poll while listening; bounds stop-signal latency
    pub listen_poll: Duration,

    /// Where delivered files are written, created on demand
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: MAX_CHUNK_SIZE,
            ack_timeout: ACK_TIMEOUT,
            max_retries: MAX_RETRIES,
            idle_timeout: IDLE_TIMEOUT,
            listen_poll: LISTEN_POLL,
            output_dir: PathBuf::from(RECEIVE_DIR),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("chunk size must be between 1 and {max} bytes, got {got}")]
    ChunkSize { max: usize, got: usize },
    #[error("at least one attempt per chunk is required")]
    NoRetries,
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("{what} must not exceed {} seconds", .max.as_secs())]
    TimeoutTooLong { what: &'static str, max: Duration },
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CONFIGURABLE_CHUNK_SIZE {
            return Err(ConfigError::ChunkSize {
                max: MAX_CONFIGURABLE_CHUNK_SIZE,
                got: self.chunk_size,
            });
        }
        if self.max_retries == 0 {
            return Err(ConfigError::NoRetries);
        }
        if self.ack_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("ack timeout"));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("idle timeout"));
        }
        for (what, timeout) in [
            ("ack timeout", self.ack_timeout),
            ("idle timeout", self.idle_timeout),
            ("listen poll", self.listen_poll),
        ] {
            if timeout > MAX_TIMEOUT {
                return Err(ConfigError::TimeoutTooLong { what, max: MAX_TIMEOUT });
            }
        }
        Ok(())
    }
}
