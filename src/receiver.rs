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

use std::fs::OpenOptions;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};
use crate::config::Config;
use crate::chunker::Chunk;
use crate::events::{Direction, EventSink, TransferEvent};
use crate::packet::{Packet, PacketError};
use crate::transfer::{self, ChunkVerdict, Rejection, TransferOffer, TransferState};
use crate::transport::{Transport, send_packet};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{file_name}: incomplete transfer, {received} of {expected} chunks received ({bytes} bytes)")]
    Incomplete { file_name: String, received: u32, expected: u32, bytes: u64 },
    #[error("{file_name}: file checksum mismatch, expected {expected:04x}, got {actual:04x}")]
    ChecksumMismatch { file_name: String, expected: u16, actual: u16 },
    #[error("{file_name}: size mismatch, offer declared {declared} bytes, received {actual}")]
    SizeMismatch { file_name: String, declared: u64, actual: u64 },
    #[error("{file_name}: transfer aborted by sender")]
    Aborted { file_name: String },
    #[error("receive cancelled")]
    Cancelled,
}

// ============================================================================
// States
// ============================================================================

pub struct Listening;
pub struct Assembling;
pub struct Verifying;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    transport: Box<dyn Transport>,
    config: Config,
    transfer: Option<TransferState>,
    done_checksum: u16,
    last_activity: Instant,
    events: EventSink,
    stop: Arc<AtomicBool>,
}

/// A file that passed every integrity check and was written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Name as offered by the sender
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
    pub checksum: u16,
}

pub enum ReceiverStep {
    Next(Box<dyn ReceiverState>),
    /// Terminal success; the contained state is listening again
    Delivered(Box<dyn ReceiverState>, ReceivedFile),
    /// Terminal failure for one transfer; the contained state is listening again
    Rejected(Box<dyn ReceiverState>, ReceiverError),
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<ReceiverStep, ReceiverError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> ReceiverFsm<S> {
    fn transition<T>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            transport: self.transport,
            config: self.config,
            transfer: self.transfer,
            done_checksum: self.done_checksum,
            last_activity: self.last_activity,
            events: self.events,
            stop: self.stop,
        })
    }

    fn io_error(&self, e: std::io::Error) -> ReceiverError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        ReceiverError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name)
        ))
    }

    fn send(&mut self, packet: &Packet) -> Result<(), ReceiverError> {
        debug!(packet = %packet.summary(), "sent");
        send_packet(self.transport.as_mut(), packet).map_err(|e| self.io_error(e))
    }

    fn receive(&mut self, timeout: std::time::Duration) -> Result<Option<Result<Packet, PacketError>>, ReceiverError> {
        match self.transport.receive_line(timeout) {
            Ok(Some(line)) => Ok(Some(Packet::decode(&line))),
            Ok(None) => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn begin(&mut self, offer: TransferOffer) {
        info!(
            file = %offer.file_name,
            size = offer.total_size,
            chunks = offer.chunk_count,
            "incoming transfer"
        );
        self.events.emit(TransferEvent::Started {
            direction: Direction::Incoming,
            file_name: offer.file_name.clone(),
            chunk_count: offer.chunk_count,
            total_size: offer.total_size,
        });
        self.transfer = Some(TransferState::new(offer));
        self.last_activity = Instant::now();
    }

    /// Drops the in-progress transfer and reports why.
    fn discard(&mut self, err: &ReceiverError) {
        warn!(error = %err, "discarding transfer");
        let file_name = self.transfer.take().map(|t| t.offer().file_name.clone());
        self.events.emit(TransferEvent::Failed {
            direction: Direction::Incoming,
            file_name,
            reason: err.to_string(),
        });
    }

    fn incomplete(&self) -> ReceiverError {
        match &self.transfer {
            Some(t) => ReceiverError::Incomplete {
                file_name: t.offer().file_name.clone(),
                received: t.received_count(),
                expected: t.offer().chunk_count,
                bytes: t.received_bytes(),
            },
            None => ReceiverError::Incomplete { file_name: String::new(), received: 0, expected: 0, bytes: 0 },
        }
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<Listening> {
    fn step(self: Box<Self>) -> Result<ReceiverStep, ReceiverError> {
        let mut fsm = *self;
        if fsm.stopped() {
            return Err(ReceiverError::Cancelled);
        }

        match fsm.receive(fsm.config.listen_poll)? {
            Some(Ok(Packet::Offer(offer))) if !offer.is_plausible() => {
                warn!(size = offer.total_size, chunks = offer.chunk_count, "implausible offer, ignoring");
                Ok(ReceiverStep::Next(Box::new(fsm)))
            }
            Some(Ok(Packet::Offer(offer))) => {
                fsm.begin(offer);
                Ok(ReceiverStep::Next(fsm.transition::<Assembling>()))
            }
            Some(Ok(other)) => {
                debug!(packet = %other.summary(), "no transfer in progress, ignoring");
                Ok(ReceiverStep::Next(Box::new(fsm)))
            }
            Some(Err(e)) => {
                warn!(error = %e, "dropping malformed line");
                Ok(ReceiverStep::Next(Box::new(fsm)))
            }
            None => Ok(ReceiverStep::Next(Box::new(fsm))),
        }
    }
}

impl ReceiverFsm<Assembling> {
    fn handle_chunk(&mut self, chunk: Chunk) -> Result<(), ReceiverError> {
        let Some(transfer) = self.transfer.as_mut() else {
            return Ok(());
        };
        let seq = chunk.seq;
        let declared = chunk.checksum;
        let verdict = transfer.accept_chunk(chunk);
        let received = transfer.received_count();
        let chunk_count = transfer.offer().chunk_count;
        let complete = transfer.is_complete();

        match verdict {
            ChunkVerdict::Accept => {
                self.last_activity = Instant::now();
                self.send(&Packet::Ack(seq))?;
                self.events.emit(TransferEvent::ChunkStored { seq, received, chunk_count });
                if complete {
                    debug!(chunk_count, "all chunks held, waiting for DONE");
                }
            }
            ChunkVerdict::Reject => {
                self.last_activity = Instant::now();
                warn!(seq, declared = %format!("{:04x}", declared), "chunk checksum mismatch");
                self.send(&Packet::Nack(seq))?;
            }
            ChunkVerdict::OutOfRange => {
                warn!(seq, chunk_count, "chunk outside offered range, ignoring");
            }
        }
        Ok(())
    }
}

impl ReceiverState for ReceiverFsm<Assembling> {
    fn step(self: Box<Self>) -> Result<ReceiverStep, ReceiverError> {
        let mut fsm = *self;
        if fsm.stopped() {
            fsm.discard(&ReceiverError::Cancelled);
            return Err(ReceiverError::Cancelled);
        }

        let idle_left = fsm.config.idle_timeout.saturating_sub(fsm.last_activity.elapsed());
        match fsm.receive(idle_left.min(fsm.config.listen_poll))? {
            None => {
                if fsm.last_activity.elapsed() >= fsm.config.idle_timeout {
                    let err = fsm.incomplete();
                    fsm.discard(&err);
                    return Ok(ReceiverStep::Rejected(fsm.transition::<Listening>(), err));
                }
            }
            Some(Ok(Packet::Data(chunk))) => fsm.handle_chunk(chunk)?,
            Some(Ok(Packet::Done(checksum))) => {
                fsm.done_checksum = checksum;
                fsm.last_activity = Instant::now();
                return Ok(ReceiverStep::Next(fsm.transition::<Verifying>()));
            }
            Some(Ok(Packet::Offer(offer))) if !offer.is_plausible() => {
                warn!(size = offer.total_size, chunks = offer.chunk_count, "implausible offer, ignoring");
            }
            Some(Ok(Packet::Offer(offer))) => {
                // One transfer at a time; a fresh offer means the sender started over
                let err = fsm.incomplete();
                fsm.discard(&err);
                fsm.begin(offer);
            }
            Some(Ok(Packet::Abort)) => {
                let err = ReceiverError::Aborted {
                    file_name: fsm.transfer.as_ref().map(|t| t.offer().file_name.clone()).unwrap_or_default(),
                };
                fsm.discard(&err);
                return Ok(ReceiverStep::Rejected(fsm.transition::<Listening>(), err));
            }
            Some(Ok(other)) => debug!(packet = %other.summary(), "ignoring"),
            Some(Err(e)) => warn!(error = %e, "dropping malformed line"),
        }
        Ok(ReceiverStep::Next(Box::new(fsm)))
    }
}

impl ReceiverState for ReceiverFsm<Verifying> {
    fn step(self: Box<Self>) -> Result<ReceiverStep, ReceiverError> {
        let mut fsm = *self;
        let Some(transfer) = fsm.transfer.take() else {
            return Ok(ReceiverStep::Next(fsm.transition::<Listening>()));
        };
        let file_name = transfer.offer().file_name.clone();

        let err = match transfer.finish(fsm.done_checksum) {
            Ok(data) => {
                let path = persist(&fsm.config.output_dir, &file_name, &data)
                    .map_err(|e| fsm.io_error(e))?;
                let delivered = ReceivedFile {
                    file_name,
                    path,
                    size: data.len() as u64,
                    checksum: fsm.done_checksum,
                };
                info!(path = %delivered.path.display(), size = delivered.size, "file delivered");
                fsm.events.emit(TransferEvent::Delivered {
                    path: delivered.path.clone(),
                    size: delivered.size,
                    checksum: delivered.checksum,
                });
                return Ok(ReceiverStep::Delivered(fsm.transition::<Listening>(), delivered));
            }
            Err(Rejection::Incomplete(e)) => ReceiverError::Incomplete {
                file_name,
                received: e.expected - e.missing,
                expected: e.expected,
                bytes: transfer.received_bytes(),
            },
            Err(Rejection::ChecksumMismatch { expected, actual }) => {
                ReceiverError::ChecksumMismatch { file_name, expected, actual }
            }
            Err(Rejection::SizeMismatch { declared, actual }) => {
                ReceiverError::SizeMismatch { file_name, declared, actual }
            }
        };

        fsm.transfer = Some(transfer);
        fsm.discard(&err);
        Ok(ReceiverStep::Rejected(fsm.transition::<Listening>(), err))
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl ReceiverFsm<Listening> {
    pub fn new(
        transport: Box<dyn Transport>,
        config: Config,
        events: EventSink,
        stop: Arc<AtomicBool>,
    ) -> Box<dyn ReceiverState> {
        Box::new(ReceiverFsm {
            state: PhantomData::<Listening>,
            transport,
            config,
            transfer: None,
            done_checksum: 0,
            last_activity: Instant::now(),
            events,
            stop,
        })
    }
}

/// Drives the receiver. Without `keep_listening` the first terminal outcome is
/// returned; otherwise outcomes are only reported as events and the loop ends
/// on cancellation or a link failure.
pub fn run(mut state: Box<dyn ReceiverState>, keep_listening: bool) -> Result<ReceivedFile, ReceiverError> {
    loop {
        match state.step()? {
            ReceiverStep::Next(next) => state = next,
            ReceiverStep::Delivered(next, file) => {
                if !keep_listening {
                    return Ok(file);
                }
                state = next;
            }
            ReceiverStep::Rejected(next, err) => {
                if !keep_listening {
                    return Err(err);
                }
                state = next;
            }
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Writes `data` under `dir` without overwriting: `name`, then `stem_1.ext`, `stem_2.ext`, ...
fn persist(dir: &Path, offered_name: &str, data: &[u8]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let name = transfer::local_file_name(offered_name);

    let mut counter = 0u32;
    loop {
        let path = dir.join(numbered_name(&name, counter));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                fill_or_remove(&path, || {
                    file.write_all(data)?;
                    file.sync_all()
                })?;
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => counter += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Runs `write` against a freshly created file and deletes the file if it fails,
/// so a short write never leaves a partial file behind.
fn fill_or_remove(path: &Path, write: impl FnOnce() -> std::io::Result<()>) -> std::io::Result<()> {
    write().inspect_err(|_| {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "could not remove partial file");
        }
    })
}

fn numbered_name(name: &str, counter: u32) -> String {
    if counter == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &name[..dot], counter, &name[dot..]),
        _ => format!("{}_{}", name, counter),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::checksum::crc16_ccitt;
    use crate::chunker;
    use crate::transport::MockTransport;

    fn data_line(seq: u32, payload: &[u8]) -> String {
        Packet::Data(Chunk::new(seq, payload.to_vec())).encode()
    }

    fn done_line(data: &[u8]) -> String {
        Packet::Done(crc16_ccitt(data)).encode()
    }

    fn config(dir: &Path) -> Config {
        Config { output_dir: dir.to_path_buf(), ..Config::default() }
    }

    fn receiver(responses: Vec<Option<&str>>, config: Config) -> (Box<dyn ReceiverState>, Arc<std::sync::Mutex<Vec<String>>>) {
        let mock = MockTransport::new(responses);
        let log = mock.sent_log();
        let fsm = ReceiverFsm::new(Box::new(mock), config, EventSink::default(), Arc::new(AtomicBool::new(false)));
        (fsm, log)
    }

    #[test]
    fn test_receiver_full_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..250).map(|i| (i % 256) as u8).collect();
        let lines: Vec<String> = chunker::split(&data, 100)
            .into_iter()
            .map(|c| Packet::Data(c).encode())
            .collect();
        let done = done_line(&data);

        let (fsm, log) = receiver(
            vec![Some("FILE:b.bin:3:250"), Some(lines[0].as_str()), Some(lines[1].as_str()), Some(lines[2].as_str()), Some(done.as_str())],
            config(dir.path()),
        );

        let file = run(fsm, false).expect("delivered");

        assert_eq!(*log.lock().unwrap(), vec!["ACK:0", "ACK:1", "ACK:2"]);
        assert_eq!(file.file_name, "b.bin");
        assert_eq!(file.path, dir.path().join("b.bin"));
        assert_eq!(file.size, 250);
        assert_eq!(std::fs::read(&file.path).unwrap(), data);
    }

    #[test]
    fn test_receiver_bad_checksum_nack() {
        let dir = tempfile::tempdir().unwrap();
        let good = data_line(0, b"payload");
        let bad = Packet::Data(Chunk { seq: 0, checksum: crc16_ccitt(b"payload") ^ 0x8000, payload: b"payload".to_vec() }).encode();
        let done = done_line(b"payload");

        let (fsm, log) = receiver(
            vec![Some("FILE:p.txt:1:7"), Some(bad.as_str()), Some(good.as_str()), Some(done.as_str())],
            config(dir.path()),
        );

        let file = run(fsm, false).expect("delivered");

        assert_eq!(*log.lock().unwrap(), vec!["NACK:0", "ACK:0"]);
        assert_eq!(std::fs::read(&file.path).unwrap(), b"payload");
    }

    #[test]
    fn test_receiver_duplicate_chunk_acked_again() {
        let dir = tempfile::tempdir().unwrap();
        let chunk0 = data_line(0, b"abc");
        let chunk1 = data_line(1, b"def");
        let done = done_line(b"abcdef");

        let (fsm, log) = receiver(
            vec![Some("FILE:dup.txt:2:6"), Some(chunk0.as_str()), Some(chunk0.as_str()), Some(chunk1.as_str()), Some(done.as_str())],
            config(dir.path()),
        );

        let file = run(fsm, false).expect("delivered");

        assert_eq!(*log.lock().unwrap(), vec!["ACK:0", "ACK:0", "ACK:1"]);
        assert_eq!(std::fs::read(&file.path).unwrap(), b"abcdef");
    }

    #[test]
    fn test_receiver_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let (fsm, log) = receiver(vec![Some("FILE:empty.txt:0:0"), Some("DONE:ffff")], config(dir.path()));

        let file = run(fsm, false).expect("delivered");

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(file.size, 0);
        assert_eq!(std::fs::read(dir.path().join("empty.txt")).unwrap(), b"");
    }

    #[test]
    fn test_receiver_done_with_missing_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let chunk0 = data_line(0, b"first");
        let done = done_line(b"firstsecond");

        let (fsm, _log) = receiver(
            vec![Some("FILE:gap.txt:2:11"), Some(chunk0.as_str()), Some(done.as_str())],
            config(dir.path()),
        );

        match run(fsm, false) {
            Err(ReceiverError::Incomplete { file_name, received, expected, bytes }) => {
                assert_eq!(file_name, "gap.txt");
                assert_eq!(received, 1);
                assert_eq!(expected, 2);
                assert_eq!(bytes, 5);
            }
            other => panic!("expected incomplete, got {:?}", other),
        }
        assert!(!dir.path().join("gap.txt").exists());
    }

    #[test]
    fn test_receiver_file_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let chunk0 = data_line(0, b"data");
        let wrong = Packet::Done(crc16_ccitt(b"data") ^ 0x0001).encode();

        let (fsm, _log) = receiver(vec![Some("FILE:crc.txt:1:4"), Some(chunk0.as_str()), Some(wrong.as_str())], config(dir.path()));

        assert!(matches!(run(fsm, false), Err(ReceiverError::ChecksumMismatch { .. })));
        assert!(!dir.path().join("crc.txt").exists());
    }

    #[test]
    fn test_receiver_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let chunk0 = data_line(0, b"data");
        let done = done_line(b"data");

        let (fsm, _log) = receiver(vec![Some("FILE:size.txt:1:40"), Some(chunk0.as_str()), Some(done.as_str())], config(dir.path()));

        assert!(matches!(
            run(fsm, false),
            Err(ReceiverError::SizeMismatch { declared: 40, actual: 4, .. })
        ));
    }

    #[test]
    fn test_receiver_new_offer_abandons_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let old = data_line(0, b"old");
        let new = data_line(0, b"new!");
        let done = done_line(b"new!");

        let (fsm, log) = receiver(
            vec![Some("FILE:old.txt:2:6"), Some(old.as_str()), Some("FILE:new.txt:1:4"), Some(new.as_str()), Some(done.as_str())],
            config(dir.path()),
        );

        let file = run(fsm, false).expect("delivered");

        assert_eq!(file.file_name, "new.txt");
        assert_eq!(*log.lock().unwrap(), vec!["ACK:0", "ACK:0"]);
        assert!(!dir.path().join("old.txt").exists());
    }

    #[test]
    fn test_receiver_idle_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { idle_timeout: Duration::ZERO, ..config(dir.path()) };
        let (fsm, _log) = receiver(vec![Some("FILE:slow.txt:3:300"), None], config);

        match run(fsm, false) {
            Err(ReceiverError::Incomplete { received, expected, .. }) => {
                assert_eq!(received, 0);
                assert_eq!(expected, 3);
            }
            other => panic!("expected incomplete, got {:?}", other),
        }
    }

    #[test]
    fn test_receiver_waits_while_not_idle() {
        let dir = tempfile::tempdir().unwrap();
        let chunk0 = data_line(0, b"late");
        let done = done_line(b"late");
        let (fsm, _log) = receiver(
            vec![Some("FILE:late.txt:1:4"), None, None, Some(chunk0.as_str()), None, Some(done.as_str())],
            config(dir.path()),
        );

        assert!(run(fsm, false).is_ok());
    }

    #[test]
    fn test_receiver_abort() {
        let dir = tempfile::tempdir().unwrap();
        let chunk0 = data_line(0, b"part");
        let (fsm, _log) = receiver(vec![Some("FILE:ab.txt:2:8"), Some(chunk0.as_str()), Some("ABORT")], config(dir.path()));

        match run(fsm, false) {
            Err(ReceiverError::Aborted { file_name }) => assert_eq!(file_name, "ab.txt"),
            other => panic!("expected abort, got {:?}", other),
        }
        assert!(!dir.path().join("ab.txt").exists());
    }

    #[test]
    fn test_receiver_ignores_noise_while_listening() {
        let dir = tempfile::tempdir().unwrap();
        let stray = data_line(0, b"stray");
        let chunk0 = data_line(0, b"real");
        let done = done_line(b"real");

        let (fsm, log) = receiver(
            vec![
                None,
                Some("hello over the air"),
                Some("ACK:3"),
                Some(stray.as_str()),
                Some("DONE:1234"),
                Some("FILE:broken:x:1"),
                Some("FILE:ok.txt:1:4"),
                Some("DATA:0:ffff:%%%"),
                Some("DATA:5:ffff:AA=="),
                Some(chunk0.as_str()),
                Some(done.as_str()),
            ],
            config(dir.path()),
        );

        let file = run(fsm, false).expect("delivered");

        assert_eq!(*log.lock().unwrap(), vec!["ACK:0"]);
        assert_eq!(std::fs::read(&file.path).unwrap(), b"real");
    }

    #[test]
    fn test_receiver_ignores_implausible_offers() {
        let dir = tempfile::tempdir().unwrap();
        let chunk0 = data_line(0, b"real");
        let done = done_line(b"real");

        let (fsm, log) = receiver(
            vec![
                Some("FILE:huge.bin:4294967295:1"),
                Some("DONE:ffff"),
                Some("FILE:wide.bin:1:60000000"),
                Some("FILE:ghost.bin:3:0"),
                Some("FILE:ok.txt:1:4"),
                // Must not replace the transfer in progress
                Some("FILE:huge.bin:60000000:1"),
                Some(chunk0.as_str()),
                Some(done.as_str()),
            ],
            config(dir.path()),
        );

        let file = run(fsm, false).expect("delivered");

        assert_eq!(file.file_name, "ok.txt");
        assert_eq!(*log.lock().unwrap(), vec!["ACK:0"]);
        assert!(!dir.path().join("huge.bin").exists());
    }

    #[test]
    fn test_partial_file_removed_on_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"half").unwrap();

        let err = fill_or_remove(&path, || Err(std::io::Error::other("disk full"))).unwrap_err();

        assert_eq!(err.to_string(), "disk full");
        assert!(!path.exists());
    }

    #[test]
    fn test_written_file_kept_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whole.bin");

        fill_or_remove(&path, || std::fs::write(&path, b"whole")).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"whole");
    }

    #[test]
    fn test_receiver_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("same.txt"), b"existing").unwrap();
        std::fs::write(dir.path().join("same_1.txt"), b"existing").unwrap();
        let chunk0 = data_line(0, b"fresh");
        let done = done_line(b"fresh");

        let (fsm, _log) = receiver(vec![Some("FILE:same.txt:1:5"), Some(chunk0.as_str()), Some(done.as_str())], config(dir.path()));

        let file = run(fsm, false).expect("delivered");

        assert_eq!(file.path, dir.path().join("same_2.txt"));
        assert_eq!(std::fs::read(dir.path().join("same.txt")).unwrap(), b"existing");
    }

    #[test]
    fn test_receiver_creates_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("lora_received");
        let chunk0 = data_line(0, b"x");
        let done = done_line(b"x");

        let (fsm, _log) = receiver(vec![Some("FILE:x.bin:1:1"), Some(chunk0.as_str()), Some(done.as_str())], config(&out));

        let file = run(fsm, false).expect("delivered");
        assert_eq!(file.path, out.join("x.bin"));
    }

    #[test]
    fn test_receiver_keep_listening() {
        let dir = tempfile::tempdir().unwrap();
        let a = data_line(0, b"one");
        let b = data_line(0, b"two");
        let done_a = done_line(b"one");
        let done_b = done_line(b"two");

        let (fsm, log) = receiver(
            vec![
                Some("FILE:a.txt:1:3"), Some(a.as_str()), Some(done_a.as_str()),
                Some("FILE:b.txt:1:3"), Some(b.as_str()), Some("DONE:0000"),
                Some("FILE:b.txt:1:3"), Some(b.as_str()), Some(done_b.as_str()),
            ],
            config(dir.path()),
        );

        // The mock runs dry after the last line, which ends the loop
        assert!(matches!(run(fsm, true), Err(ReceiverError::Io(_))));
        assert_eq!(log.lock().unwrap().len(), 3);
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"one");
        assert_eq!(std::fs::read(dir.path().join("b.txt")).unwrap(), b"two");
    }

    #[test]
    fn test_receiver_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new(vec![]);
        let fsm = ReceiverFsm::new(Box::new(mock), config(dir.path()), EventSink::default(), Arc::new(AtomicBool::new(true)));

        assert!(matches!(run(fsm, false), Err(ReceiverError::Cancelled)));
    }

    #[test]
    fn test_receiver_events() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let chunk0 = data_line(0, b"ev");
        let done = done_line(b"ev");
        let mock = MockTransport::new(vec![Some("FILE:ev.txt:1:2"), Some(chunk0.as_str()), Some(done.as_str())]);
        let fsm = ReceiverFsm::new(Box::new(mock), config(dir.path()), EventSink::new(tx), Arc::new(AtomicBool::new(false)));

        run(fsm, false).expect("delivered");

        let events: Vec<TransferEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                TransferEvent::Started {
                    direction: Direction::Incoming,
                    file_name: "ev.txt".to_string(),
                    chunk_count: 1,
                    total_size: 2,
                },
                TransferEvent::ChunkStored { seq: 0, received: 1, chunk_count: 1 },
                TransferEvent::Delivered {
                    path: dir.path().join("ev.txt"),
                    size: 2,
                    checksum: crc16_ccitt(b"ev"),
                },
            ]
        );
    }

    #[test]
    fn test_numbered_name() {
        assert_eq!(numbered_name("report.txt", 0), "report.txt");
        assert_eq!(numbered_name("report.txt", 2), "report_2.txt");
        assert_eq!(numbered_name("archive.tar.gz", 1), "archive.tar_1.gz");
        assert_eq!(numbered_name("README", 1), "README_1");
        assert_eq!(numbered_name(".bashrc", 1), ".bashrc_1");
    }
}
