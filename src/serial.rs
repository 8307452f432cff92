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

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};
use crate::protocol::*;
use crate::transport::Transport;

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Byte-level serial operations the line transport is built on
pub trait SerialPort: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(SERIAL_POLL)
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        if self.port.timeout() != timeout {
            self.port.set_timeout(timeout).map_err(std::io::Error::other)?;
        }
        self.port.read(buf)
    }
}

/// Longest single blocking read; bounds how long the port lock is held
const SERIAL_POLL: Duration = Duration::from_millis(50);

// ============================================================================
// Line Transport
// ============================================================================

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

fn lock(port: &SharedPort) -> std::io::Result<MutexGuard<'_, Box<dyn SerialPort>>> {
    port.lock().map_err(|_| std::io::Error::other("serial port lock poisoned"))
}

/// Splits the serial byte stream into lines and drops link noise.
pub struct SerialTransport {
    port: SharedPort,
    writer: LineWriter,
    pending: Vec<u8>,
}

impl SerialTransport {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        let port = Arc::new(Mutex::new(port));
        SerialTransport {
            writer: LineWriter { port: port.clone() },
            port,
            pending: Vec::new(),
        }
    }

    /// Handle for writing from another task; each line is written under the port lock.
    #[cfg(test)]
    pub fn writer(&self) -> LineWriter {
        self.writer.clone()
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = raw.trim_ascii();
            if line.is_empty() || line == POWER_ON_BANNER {
                continue;
            }
            return Some(line.to_vec());
        }

        if self.pending.len() > MAX_LINE_LENGTH {
            tracing::warn!(bytes = self.pending.len(), "discarding unterminated input");
            self.pending.clear();
        }
        None
    }

    fn poll_port(&mut self, wait: Duration) -> std::io::Result<()> {
        let mut buf = [0u8; 256];
        let result = lock(&self.port)?.read_timeout(&mut buf, wait);
        match result {
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                Ok(())
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.send(bytes)
    }

    fn receive_line(&mut self, timeout: Duration) -> std::io::Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut polled = false;

        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if polled && remaining.is_zero() {
                return Ok(None);
            }
            // Release the lock between short reads so a LineWriter can get in
            self.poll_port(remaining.clamp(Duration::from_millis(1), SERIAL_POLL))?;
            polled = true;
        }
    }
}

/// Write half of a `SerialTransport`. Clones share the port, and a line is
/// written whole under the port lock.
#[derive(Clone)]
pub struct LineWriter {
    port: SharedPort,
}

impl LineWriter {
    pub fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        lock(&self.port)?.write_all(bytes)
    }
}

// ============================================================================
// Data Mode Check
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeCheck {
    /// The toggle entered command mode, a second toggle left it again
    ToggledBack,
    /// The module was stuck in command mode and the toggle left it
    LeftCommandMode,
    /// No recognizable reply; assumed transparent
    NoReply,
}

/// Makes sure the radio module relays bytes instead of interpreting AT commands.
pub fn ensure_data_mode(port: &mut dyn SerialPort, settle: Duration) -> std::io::Result<ModeCheck> {
    port.write_all(MODE_TOGGLE)?;
    let reply = read_reply(port, settle)?;
    tracing::debug!(reply = %reply.trim(), "mode toggle reply");

    if reply.contains(ENTRY_AT) {
        port.write_all(MODE_TOGGLE)?;
        let reply = read_reply(port, settle)?;
        tracing::debug!(reply = %reply.trim(), "second mode toggle reply");
        Ok(ModeCheck::ToggledBack)
    } else if reply.contains(EXIT_AT) {
        Ok(ModeCheck::LeftCommandMode)
    } else {
        Ok(ModeCheck::NoReply)
    }
}

fn read_reply(port: &mut dyn SerialPort, settle: Duration) -> std::io::Result<String> {
    let mut reply = Vec::new();
    let mut buf = [0u8; 128];
    loop {
        match port.read_timeout(&mut buf, settle) {
            Ok(0) => break,
            Ok(n) => reply.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) => return Err(e),
        }
    }
    Ok(String::from_utf8_lossy(&reply).into_owned())
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    // Data to return on reads (None = timeout)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
        }
    }

    /// Scripted input given as chunks of text, each followed by a timeout
    pub fn from_text(chunks: &[&str], expected_writes: &[u8]) -> Self {
        let mut responses = Vec::new();
        for chunk in chunks {
            responses.extend(chunk.bytes().map(Some));
            responses.push(None);
        }
        MockSerialPort::new(responses, expected_writes.to_vec())
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
        // Out of responses = timeout
        if self.read_pos >= self.read_buffer.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        // If current response is None = timeout
        if self.read_buffer[self.read_pos].is_none() {
            self.read_pos += 1;
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        let mut bytes_read = 0;
        while bytes_read < buf.len() && self.read_pos < self.read_buffer.len() {
            match self.read_buffer[self.read_pos] {
                Some(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                    self.read_pos += 1;
                }
                None => break,  // Stop at timeout marker
            }
        }

        Ok(bytes_read)
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockSerialPort dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            String::from_utf8_lossy(&self.write_log),
            String::from_utf8_lossy(&self.expected_writes),
            "MockSerialPort write log mismatch"
        );
    }
}
