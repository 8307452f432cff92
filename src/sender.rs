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

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use crate::checksum::crc16_ccitt;
use crate::chunker::{self, Chunk};
use crate::config::Config;
use crate::events::{Direction, EventSink, RetryReason, TransferEvent};
use crate::packet::Packet;
use crate::transfer::TransferOffer;
use crate::transport::{Transport, send_packet};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no acknowledgment for chunk {seq} of {file_name} after {attempts} attempts ({bytes_acked} bytes delivered)")]
    RetryBudgetExhausted {
        file_name: String,
        seq: u32,
        attempts: u32,
        bytes_acked: u64,
    },
    #[error("transfer of {file_name} cancelled at chunk {seq}")]
    Cancelled { file_name: String, seq: u32 },
    #[error("{} has no file name", .0.display())]
    NoFileName(PathBuf),
}

// ============================================================================
// States
// ============================================================================

pub struct Offering;
pub struct AwaitingAck;
pub struct Finishing;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    transport: Box<dyn Transport>,
    config: Config,
    offer: TransferOffer,
    chunks: Vec<Chunk>,
    file_checksum: u16,
    seq: u32,
    attempts: u32,
    retries: Vec<u32>,
    events: EventSink,
    stop: Arc<AtomicBool>,
}

/// Outcome of a completed send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub file_name: String,
    pub chunk_count: u32,
    pub total_size: u64,
    pub checksum: u16,
    /// Retransmissions needed per chunk, indexed by sequence number
    pub retries: Vec<u32>,
}

impl SendReport {
    pub fn total_retries(&self) -> u32 {
        self.retries.iter().sum()
    }
}

pub enum SenderStep {
    Next(Box<dyn SenderState>),
    Complete(SendReport),
}

enum Response {
    Ack,
    Nack,
    Timeout,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<SenderStep, SenderError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> SenderFsm<S> {
    fn transition<T>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            transport: self.transport,
            config: self.config,
            offer: self.offer,
            chunks: self.chunks,
            file_checksum: self.file_checksum,
            seq: self.seq,
            attempts: self.attempts,
            retries: self.retries,
            events: self.events,
            stop: self.stop,
        })
    }

    fn io_error(&self, e: std::io::Error) -> SenderError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        SenderError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name)
        ))
    }

    fn send(&mut self, packet: &Packet) -> Result<(), SenderError> {
        debug!(packet = %packet.summary(), "sent");
        send_packet(self.transport.as_mut(), packet).map_err(|e| self.io_error(e))
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn bytes_acked(&self) -> u64 {
        self.chunks[..self.seq as usize]
            .iter()
            .map(|c| c.payload.len() as u64)
            .sum()
    }

    fn fail(&mut self, reason: String) {
        self.events.emit(TransferEvent::Failed {
            direction: Direction::Outgoing,
            file_name: Some(self.offer.file_name.clone()),
            reason,
        });
    }

    /// Tells the receiver to drop the transfer. Never sends a completion record.
    fn abort(&mut self) {
        if let Err(e) = self.send(&Packet::Abort) {
            warn!(error = %e, "could not send ABORT");
        }
    }

    fn cancelled(mut self, offer_sent: bool) -> SenderError {
        info!(file = %self.offer.file_name, seq = self.seq, "transfer cancelled");
        if offer_sent {
            self.abort();
        }
        let err = SenderError::Cancelled {
            file_name: self.offer.file_name.clone(),
            seq: self.seq,
        };
        self.fail(err.to_string());
        err
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<Offering> {
    fn step(self: Box<Self>) -> Result<SenderStep, SenderError> {
        let mut fsm = *self;
        if fsm.stopped() {
            return Err(fsm.cancelled(false));
        }

        // The offer itself is never acknowledged
        fsm.send(&Packet::Offer(fsm.offer.clone()))?;
        info!(
            file = %fsm.offer.file_name,
            size = fsm.offer.total_size,
            chunks = fsm.offer.chunk_count,
            crc = %format!("{:04x}", fsm.file_checksum),
            "offered transfer"
        );
        fsm.events.emit(TransferEvent::Started {
            direction: Direction::Outgoing,
            file_name: fsm.offer.file_name.clone(),
            chunk_count: fsm.offer.chunk_count,
            total_size: fsm.offer.total_size,
        });

        if fsm.chunks.is_empty() {
            Ok(SenderStep::Next(fsm.transition::<Finishing>()))
        } else {
            Ok(SenderStep::Next(fsm.transition::<AwaitingAck>()))
        }
    }
}

impl SenderFsm<AwaitingAck> {
    /// Waits for the verdict on the current chunk. Lines about other sequence
    /// numbers and undecodable lines are noise: they neither end the wait nor
    /// count against the retry budget.
    ///
    /// The wait is sliced into `listen_poll` reads so a stop request is seen
    /// promptly. Only a read that covered the rest of the window is a timeout.
    fn await_response(&mut self) -> Result<Response, SenderError> {
        let deadline = Instant::now().checked_add(self.config.ack_timeout);
        loop {
            if self.stopped() {
                return Ok(Response::Timeout);
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                return Ok(Response::Timeout);
            }

            let wait = remaining.min(self.config.listen_poll);
            let line = match self.transport.receive_line(wait) {
                Ok(Some(line)) => line,
                Ok(None) if wait == remaining => return Ok(Response::Timeout),
                Ok(None) => continue,
                Err(e) => return Err(self.io_error(e)),
            };

            match Packet::decode(&line) {
                Ok(Packet::Ack(seq)) if seq == self.seq => return Ok(Response::Ack),
                Ok(Packet::Nack(seq)) if seq == self.seq => return Ok(Response::Nack),
                Ok(other) => debug!(expected = self.seq, packet = %other.summary(), "ignoring"),
                Err(e) => warn!(error = %e, "dropping malformed line"),
            }
        }
    }

    fn exhausted(mut self) -> SenderError {
        warn!(
            file = %self.offer.file_name,
            seq = self.seq,
            attempts = self.attempts,
            "retry budget exhausted, aborting transfer"
        );
        self.abort();
        let err = SenderError::RetryBudgetExhausted {
            file_name: self.offer.file_name.clone(),
            seq: self.seq,
            attempts: self.attempts,
            bytes_acked: self.bytes_acked(),
        };
        self.fail(err.to_string());
        err
    }
}

impl SenderState for SenderFsm<AwaitingAck> {
    fn step(self: Box<Self>) -> Result<SenderStep, SenderError> {
        let mut fsm = *self;
        if fsm.stopped() {
            return Err(fsm.cancelled(true));
        }
        if fsm.attempts >= fsm.config.max_retries {
            return Err(fsm.exhausted());
        }

        let chunk = fsm.chunks[fsm.seq as usize].clone();
        fsm.send(&Packet::Data(chunk))?;
        fsm.attempts += 1;
        fsm.events.emit(TransferEvent::ChunkSent { seq: fsm.seq, attempt: fsm.attempts });

        let reason = match fsm.await_response()? {
            Response::Ack => {
                fsm.retries[fsm.seq as usize] = fsm.attempts - 1;
                fsm.seq += 1;
                fsm.attempts = 0;
                debug!(seq = fsm.seq - 1, "acknowledged");
                fsm.events.emit(TransferEvent::ChunkAcked {
                    seq: fsm.seq - 1,
                    chunk_count: fsm.offer.chunk_count,
                    bytes_acked: fsm.bytes_acked(),
                });

                if fsm.seq as usize == fsm.chunks.len() {
                    return Ok(SenderStep::Next(fsm.transition::<Finishing>()));
                }
                return Ok(SenderStep::Next(Box::new(fsm)));
            }
            Response::Nack => RetryReason::Nack,
            Response::Timeout => RetryReason::Timeout,
        };

        if fsm.attempts < fsm.config.max_retries && !fsm.stopped() {
            warn!(seq = fsm.seq, attempt = fsm.attempts, ?reason, "retrying chunk");
            fsm.events.emit(TransferEvent::Retrying { seq: fsm.seq, attempt: fsm.attempts, reason });
        }
        Ok(SenderStep::Next(Box::new(fsm)))
    }
}

impl SenderState for SenderFsm<Finishing> {
    fn step(self: Box<Self>) -> Result<SenderStep, SenderError> {
        let mut fsm = *self;
        if fsm.stopped() {
            return Err(fsm.cancelled(true));
        }

        // Fire and forget; a receiver that misses it times out on its own
        fsm.send(&Packet::Done(fsm.file_checksum))?;
        info!(file = %fsm.offer.file_name, "all chunks acknowledged, completion sent");
        fsm.events.emit(TransferEvent::Finished {
            file_name: fsm.offer.file_name.clone(),
            checksum: fsm.file_checksum,
        });

        Ok(SenderStep::Complete(SendReport {
            file_name: fsm.offer.file_name,
            chunk_count: fsm.offer.chunk_count,
            total_size: fsm.offer.total_size,
            checksum: fsm.file_checksum,
            retries: fsm.retries,
        }))
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl SenderFsm<Offering> {
    pub fn new(
        transport: Box<dyn Transport>,
        file_name: &str,
        data: &[u8],
        config: Config,
        events: EventSink,
        stop: Arc<AtomicBool>,
    ) -> Box<dyn SenderState> {
        let chunks = chunker::split(data, config.chunk_size);
        Box::new(SenderFsm {
            state: PhantomData::<Offering>,
            transport,
            offer: TransferOffer::new(file_name, data.len() as u64, config.chunk_size),
            file_checksum: crc16_ccitt(data),
            seq: 0,
            attempts: 0,
            retries: vec![0; chunks.len()],
            chunks,
            config,
            events,
            stop,
        })
    }
}

/// Reads `path` and drives one transfer to completion or failure.
pub fn send_file(
    transport: Box<dyn Transport>,
    path: &Path,
    config: Config,
    events: EventSink,
    stop: Arc<AtomicBool>,
) -> Result<SendReport, SenderError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| SenderError::NoFileName(path.to_path_buf()))?;
    let data = std::fs::read(path)?;

    run(SenderFsm::new(transport, &file_name, &data, config, events, stop))
}

pub fn run(mut state: Box<dyn SenderState>) -> Result<SendReport, SenderError> {
    loop {
        match state.step()? {
            SenderStep::Next(next) => state = next,
            SenderStep::Complete(report) => return Ok(report),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
