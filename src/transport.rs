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

use std::time::Duration;
use crate::packet::Packet;
use crate::protocol::LINE_DELIMITER;

// ============================================================================
// Transport Trait
// ============================================================================

/// Line-oriented access to the radio link.
pub trait Transport: Send {
    /// Writes raw bytes. Callers framing packets append the delimiter themselves.
    fn send(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Waits up to `timeout` for one line. `Ok(None)` means nothing arrived;
    /// the returned line has its delimiter stripped.
    fn receive_line(&mut self, timeout: Duration) -> std::io::Result<Option<Vec<u8>>>;
}

/// Encodes `packet` and writes it as a single delimited line.
pub fn send_packet(transport: &mut dyn Transport, packet: &Packet) -> std::io::Result<()> {
    let mut line = packet.encode().into_bytes();
    line.extend_from_slice(LINE_DELIMITER);
    transport.send(&line)
}

// ============================================================================
// Test Transports
// ============================================================================

#[cfg(test)]
pub struct MockTransport {
    // Lines to return from receive_line (None = timeout)
    responses: Vec<Option<String>>,
    read_pos: usize,
    sent: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
}

#[cfg(test)]
impl MockTransport {
    pub fn new(responses: Vec<Option<&str>>) -> Self {
        MockTransport {
            responses: responses.into_iter().map(|r| r.map(str::to_string)).collect(),
            read_pos: 0,
            sent: Default::default(),
        }
    }

    /// Handle for inspecting sent lines after the transport has been moved into a session.
    pub fn sent_log(&self) -> std::sync::Arc<std::sync::Mutex<Vec<String>>> {
        self.sent.clone()
    }
}

#[cfg(test)]
impl Transport for MockTransport {
    fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let text = String::from_utf8_lossy(bytes);
        let line = text.strip_suffix("\r\n").expect("packets end with CRLF");
        self.sent.lock().unwrap().push(line.to_string());
        Ok(())
    }

    fn receive_line(&mut self, _timeout: Duration) -> std::io::Result<Option<Vec<u8>>> {
        if self.read_pos >= self.responses.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Mock transport out of responses",
            ));
        }
        let response = self.responses[self.read_pos].clone();
        self.read_pos += 1;
        Ok(response.map(String::into_bytes))
    }
}

/// One end of an in-memory link; lines sent on one end arrive at the other.
#[cfg(test)]
pub struct ChannelTransport {
    tx: crossbeam_channel::Sender<Vec<u8>>,
    rx: crossbeam_channel::Receiver<Vec<u8>>,
    // Sees every outgoing line; may rewrite it or return None to lose it
    filter: Box<dyn FnMut(String) -> Option<String> + Send>,
}

#[cfg(test)]
impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, ChannelTransport) {
        let (a_tx, a_rx) = crossbeam_channel::unbounded();
        let (b_tx, b_rx) = crossbeam_channel::unbounded();
        (
            ChannelTransport { tx: a_tx, rx: b_rx, filter: Box::new(Some::<String>) },
            ChannelTransport { tx: b_tx, rx: a_rx, filter: Box::new(Some::<String>) },
        )
    }

    pub fn with_filter(mut self, filter: impl FnMut(String) -> Option<String> + Send + 'static) -> Self {
        self.filter = Box::new(filter);
        self
    }
}

#[cfg(test)]
impl Transport for ChannelTransport {
    fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let line = bytes.strip_suffix(LINE_DELIMITER).unwrap_or(bytes);
        if let Some(line) = (self.filter)(String::from_utf8_lossy(line).into_owned()) {
            // The peer may already have finished; a dead link just loses the line
            let _ = self.tx.send(line.into_bytes());
        }
        Ok(())
    }

    fn receive_line(&mut self, timeout: Duration) -> std::io::Result<Option<Vec<u8>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(line) => Ok(Some(line)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}
