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

// Reliable file transfer over a transparent LoRa serial bridge
mod checksum;
mod chunker;
mod config;
mod events;
mod packet;
mod protocol;
mod receiver;
mod sender;
mod serial;
mod transfer;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use tracing_subscriber::EnvFilter;
use config::Config;
use events::{Direction, EventSink, TransferEvent};
use protocol::*;
use serial::{RealSerialPort, SerialTransport};

#[derive(Parser)]
#[command(name = "loralink")]
#[command(about = "Stop-and-wait file transfer over a transparent LoRa serial link", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "9600")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name="BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name="BITS")]
    stop_bits: u8,

    /// Raw payload bytes per DATA packet
    #[arg(long, default_value_t = MAX_CHUNK_SIZE, value_name = "BYTES")]
    chunk_size: usize,

    /// Seconds to wait for each acknowledgment
    #[arg(long, default_value_t = ACK_TIMEOUT.as_secs(), value_name = "SECS")]
    ack_timeout: u64,

    /// Attempts per chunk before the transfer is abandoned
    #[arg(long, default_value_t = MAX_RETRIES, value_name = "N")]
    retries: u32,

    /// Seconds without chunk activity before the receiver drops a transfer
    /// [default: ack timeout x (retries + 1)]
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Do not toggle the module out of AT command mode on startup
    #[arg(long)]
    skip_mode_check: bool,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file
    Send {
        /// File to send
        file: PathBuf,
    },
    /// Wait for a file and save it
    Receive {
        /// Directory to save received files
        #[arg(short, long, default_value = RECEIVE_DIR)]
        output_dir: PathBuf,

        /// Keep listening for further transfers instead of exiting after one
        #[arg(long)]
        keep_listening: bool,
    },
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn build_config(cli: &Cli) -> Config {
    let ack_timeout = Duration::from_secs(cli.ack_timeout);
    let idle_timeout = match cli.idle_timeout {
        Some(secs) => Duration::from_secs(secs),
        // Saturates; validation rejects anything beyond MAX_TIMEOUT
        None => ack_timeout.saturating_mul(cli.retries.saturating_add(1)),
    };
    let output_dir = match &cli.command {
        Commands::Receive { output_dir, .. } => output_dir.clone(),
        Commands::Send { .. } => PathBuf::from(RECEIVE_DIR),
    };

    Config {
        chunk_size: cli.chunk_size,
        ack_timeout,
        max_retries: cli.retries,
        idle_timeout,
        listen_poll: LISTEN_POLL,
        output_dir,
    }
}

fn exit_with(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let data_bits = parse_data_bits(cli.data_bits).unwrap_or_else(|e| exit_with(e));
    let parity = parse_parity(&cli.parity).unwrap_or_else(|e| exit_with(e));
    let stop_bits = parse_stop_bits(cli.stop_bits).unwrap_or_else(|e| exit_with(e));

    let config = build_config(&cli);
    if let Err(e) = config.validate() {
        exit_with(e);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        tracing::warn!(error = %e, "could not install Ctrl+C handler");
    }

    println!("Opening serial port: {}", cli.port);
    println!("Settings: {} baud, {:?}, {:?}, {:?}", cli.baud, data_bits, parity, stop_bits);

    let mut serial_port = match RealSerialPort::open(&cli.port, cli.baud, data_bits, parity, stop_bits) {
        Ok(port) => port,
        Err(e) => exit_with(format!("Failed to open serial port: {}", e)),
    };

    if !cli.skip_mode_check {
        match serial::ensure_data_mode(&mut serial_port, Duration::from_millis(500)) {
            Ok(check) => tracing::info!(?check, "module in data mode"),
            Err(e) => exit_with(format!("Mode check failed: {}", e)),
        }
    }

    let transport = Box::new(SerialTransport::new(Box::new(serial_port)));
    let (tx, rx) = crossbeam_channel::unbounded();
    let reporter = std::thread::spawn(move || {
        for event in rx {
            report(&event);
        }
    });
    let events = EventSink::new(tx);

    let code = match cli.command {
        Commands::Send { file } => {
            println!("\nSending file: {}", file.display());
            match sender::send_file(transport, &file, config, events, stop) {
                Ok(report) => {
                    println!(
                        "\nFile sent: {} bytes in {} chunks, {} retransmissions",
                        report.total_size,
                        report.chunk_count,
                        report.total_retries()
                    );
                    0
                }
                Err(e) => {
                    eprintln!("Send failed: {}", e);
                    1
                }
            }
        }
        Commands::Receive { keep_listening, .. } => {
            println!("\nReceiving files to: {}", config.output_dir.display());
            let fsm = receiver::ReceiverFsm::new(transport, config, events, stop);
            match receiver::run(fsm, keep_listening) {
                Ok(file) => {
                    println!("\nFile received: {}", file.path.display());
                    0
                }
                Err(receiver::ReceiverError::Cancelled) if keep_listening => 0,
                Err(e) => {
                    eprintln!("Receive failed: {}", e);
                    1
                }
            }
        }
    };

    // The session has dropped its event sender, so the reporter drains and exits
    let _ = reporter.join();
    std::process::exit(code);
}

fn report(event: &TransferEvent) {
    match event {
        TransferEvent::Started { direction, file_name, chunk_count, total_size } => {
            let verb = match direction {
                Direction::Outgoing => "Sending",
                Direction::Incoming => "Receiving",
            };
            println!("[*] {}: {} ({} bytes, {} chunks)", verb, file_name, total_size, chunk_count);
        }
        TransferEvent::ChunkSent { .. } => {}
        TransferEvent::Retrying { seq, attempt, reason } => {
            println!("[!] Chunk {}: {:?}, retry {}", seq, reason, attempt);
        }
        TransferEvent::ChunkAcked { seq, chunk_count, .. } => {
            println!("[*] Progress: {:.1}%", percent(seq + 1, *chunk_count));
        }
        TransferEvent::ChunkStored { received, chunk_count, .. } => {
            println!("[*] Progress: {:.1}%", percent(*received, *chunk_count));
        }
        TransferEvent::Finished { checksum, .. } => {
            println!("[*] All chunks acknowledged, sent DONE:{:04x}", checksum);
        }
        TransferEvent::Delivered { path, size, checksum } => {
            println!("[*] File saved: {} ({} bytes, CRC {:04x})", path.display(), size, checksum);
        }
        TransferEvent::Failed { file_name, reason, .. } => match file_name {
            Some(name) => println!("[!] {}: {}", name, reason),
            None => println!("[!] {}", reason),
        },
    }
}

fn percent(done: u32, total: u32) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 / total as f64 * 100.0
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::crc16_ccitt;
    use crate::receiver::{ReceivedFile, ReceiverError, ReceiverFsm};
    use crate::sender::{SendReport, SenderError, SenderFsm};
    use crate::transport::ChannelTransport;

    type LineFilter = Box<dyn FnMut(String) -> Option<String> + Send>;

    struct Outcome {
        sent: Result<SendReport, SenderError>,
        received: Result<ReceivedFile, ReceiverError>,
        _dir: tempfile::TempDir,
    }

    /// Runs a sender and a receiver on two threads over an in-memory link.
    /// `to_receiver` sees every line the sender writes, `to_sender` every reply.
    fn transfer(name: &str, data: &[u8], to_receiver: LineFilter, to_sender: LineFilter) -> Outcome {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            ack_timeout: Duration::from_millis(300),
            idle_timeout: Duration::from_secs(3),
            listen_poll: Duration::from_millis(50),
            output_dir: dir.path().join("out"),
            ..Config::default()
        };
        let (a, b) = ChannelTransport::pair();
        let a = a.with_filter(to_receiver);
        let b = b.with_filter(to_sender);
        let stop = Arc::new(AtomicBool::new(false));

        let receiver_config = config.clone();
        let receiver_stop = stop.clone();
        let receiving = std::thread::spawn(move || {
            let fsm = ReceiverFsm::new(Box::new(b), receiver_config, EventSink::default(), receiver_stop);
            receiver::run(fsm, false)
        });

        let fsm = SenderFsm::new(Box::new(a), name, data, config, EventSink::default(), stop);
        let sent = sender::run(fsm);
        let received = receiving.join().unwrap();

        Outcome { sent, received, _dir: dir }
    }

    fn pass() -> LineFilter {
        Box::new(Some::<String>)
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 37 % 256) as u8).collect()
    }

    #[test]
    fn test_loopback_three_chunks() {
        let data = sample(250);
        let outcome = transfer("three.bin", &data, pass(), pass());

        let report = outcome.sent.expect("sent");
        assert_eq!(report.chunk_count, 3);
        assert_eq!(report.retries, vec![0, 0, 0]);

        let file = outcome.received.expect("delivered");
        assert_eq!(file.size, 250);
        assert_eq!(std::fs::read(&file.path).unwrap(), data);
    }

    #[test]
    fn test_loopback_corrupted_chunk_is_retried() {
        let data = sample(250);
        let mut corrupted = false;
        let corrupt_chunk1 = Box::new(move |line: String| {
            if !corrupted && line.starts_with("DATA:1:") {
                corrupted = true;
                let mut fields: Vec<String> = line.split(':').map(str::to_string).collect();
                let crc = u16::from_str_radix(&fields[2], 16).unwrap();
                fields[2] = format!("{:04x}", crc ^ 0x0001);
                return Some(fields.join(":"));
            }
            Some(line)
        });

        let outcome = transfer("nack.bin", &data, corrupt_chunk1, pass());

        let report = outcome.sent.expect("sent");
        assert_eq!(report.retries, vec![0, 1, 0]);
        let file = outcome.received.expect("delivered");
        assert_eq!(std::fs::read(&file.path).unwrap(), data);
    }

    #[test]
    fn test_loopback_lost_ack_causes_duplicate() {
        let data = sample(120);
        let mut dropped = false;
        let lose_first_ack = Box::new(move |line: String| {
            if !dropped && line == "ACK:0" {
                dropped = true;
                return None;
            }
            Some(line)
        });

        let outcome = transfer("dup.bin", &data, pass(), lose_first_ack);

        assert_eq!(outcome.sent.expect("sent").retries, vec![1, 0]);
        let file = outcome.received.expect("delivered");
        assert_eq!(std::fs::read(&file.path).unwrap(), data);
    }

    #[test]
    fn test_loopback_silence_exhausts_retries() {
        let data = sample(50);
        let lose_data = Box::new(|line: String| if line.starts_with("DATA:") { None } else { Some(line) });

        let outcome = transfer("silent.bin", &data, lose_data, pass());

        assert!(matches!(
            outcome.sent,
            Err(SenderError::RetryBudgetExhausted { seq: 0, attempts: MAX_RETRIES, .. })
        ));
        assert!(matches!(outcome.received, Err(ReceiverError::Aborted { .. })));
        assert!(!outcome._dir.path().join("out").join("silent.bin").exists());
    }

    #[test]
    fn test_loopback_empty_file() {
        let outcome = transfer("empty.bin", &[], pass(), pass());

        assert_eq!(outcome.sent.expect("sent").chunk_count, 0);
        let file = outcome.received.expect("delivered");
        assert_eq!(file.size, 0);
        assert_eq!(file.checksum, crc16_ccitt(&[]));
        assert_eq!(std::fs::read(&file.path).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_loopback_corrupted_completion_record() {
        let data = sample(180);
        let bad_done = Box::new(|line: String| {
            if line.starts_with("DONE:") {
                return Some("DONE:0bad".to_string());
            }
            Some(line)
        });

        let outcome = transfer("done.bin", &data, bad_done, pass());

        // The sender cannot tell; the receiver refuses to deliver
        assert!(outcome.sent.is_ok());
        assert!(matches!(outcome.received, Err(ReceiverError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_build_config_defaults() {
        let cli = Cli::parse_from(["loralink", "receive"]);
        let config = build_config(&cli);

        assert_eq!(config.chunk_size, MAX_CHUNK_SIZE);
        assert_eq!(config.ack_timeout, ACK_TIMEOUT);
        assert_eq!(config.max_retries, MAX_RETRIES);
        assert_eq!(config.idle_timeout, IDLE_TIMEOUT);
        assert_eq!(config.output_dir, PathBuf::from(RECEIVE_DIR));
    }

    #[test]
    fn test_build_config_overrides() {
        let cli = Cli::parse_from([
            "loralink", "--ack-timeout", "4", "--retries", "2", "--chunk-size", "64",
            "receive", "--output-dir", "/tmp/inbox", "--keep-listening",
        ]);
        let config = build_config(&cli);

        assert_eq!(config.chunk_size, 64);
        assert_eq!(config.idle_timeout, Duration::from_secs(12));
        assert_eq!(config.output_dir, PathBuf::from("/tmp/inbox"));
        assert!(matches!(cli.command, Commands::Receive { keep_listening: true, .. }));
    }

    #[test]
    fn test_build_config_huge_timeouts_rejected() {
        let cli = Cli::parse_from(["loralink", "--ack-timeout", "9223372036854775807", "receive"]);
        let config = build_config(&cli);

        assert_eq!(config.idle_timeout, Duration::MAX);
        assert!(matches!(
            config.validate(),
            Err(config::ConfigError::TimeoutTooLong { what: "ack timeout", .. })
        ));

        let cli = Cli::parse_from(["loralink", "--retries", "4294967295", "--ack-timeout", "1", "send", "x"]);
        assert!(matches!(
            build_config(&cli).validate(),
            Err(config::ConfigError::TimeoutTooLong { what: "idle timeout", .. })
        ));
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100.0);
        assert_eq!(percent(1, 4), 25.0);
    }
}
