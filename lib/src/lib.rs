//! # lokeflash
//!
//! A Rust library for flashing firmware partitions to Samsung mobile devices
//! that have been booted into download mode ("Odin mode") over USB.
//!
//! The device exposes a CDC-class USB interface and speaks a proprietary
//! framed request/response protocol nicknamed "Loke" after the four-byte
//! handshake response it returns. This crate drives the full session:
//! handshake, capability negotiation, optional partition-table (PIT)
//! exchange, per-partition streamed binary upload, and session teardown.
//!
//! ## Main Features
//!
//! - USB device detection for known Samsung download-mode VID/PID pairs
//! - The Loke session state machine (handshake, negotiation, teardown)
//! - Partition table (PIT) parsing, synthesis, and lookup
//! - Chunked, sequenced, acknowledged partition image upload
//! - Progress reporting and event callbacks
//!
//! ## Usage Example
//!
//! ```no_run
//! use lokeflash::{Event, FlashOptions, Orchestrator, PartitionSelector};
//! use std::{fs::File, sync::Arc};
//!
//! let callback = Arc::new(|event: Event| {
//!     if let Event::FlashProgress(progress) = event {
//!         println!("{}: {:.1}%", progress.partition, progress.percent);
//!     }
//! });
//!
//! let orchestrator = Orchestrator::connect(Some(callback)).unwrap();
//! let file = File::open("boot.img").unwrap();
//! let len = file.metadata().unwrap().len();
//! orchestrator
//!     .flash(
//!         vec![(PartitionSelector::Name("BOOT".into()), Box::new(file), len)],
//!         FlashOptions::default(),
//!     )
//!     .unwrap();
//! ```
//!
//! ## Device connection
//!
//! The device must be in download mode (typically entered via a hardware key
//! combination at boot) and connected over USB before any orchestrator entry
//! point is called.

mod config;
mod orchestrator;
mod packet;
mod pit;
mod session;
mod setup;
mod transfer;
mod transport;

pub use config::{ProtocolConfig, RetryPolicy};
pub use orchestrator::{FlashOptions, Orchestrator, PartitionSelector};
pub use pit::{BinaryType, DeviceType as PitDeviceType, PitData, PitEntry};
pub use session::{DeviceType, SessionState};
pub use setup::setup_host_linux as host_setup;
pub use transfer::FlashProgress;
pub use transport::{DeviceIdentifier, RusbTransport, Transport};

use std::sync::Arc;

/// Callback type for receiving flash events.
pub type Callback = Arc<dyn Fn(Event) + Send + Sync>;

/// Events emitted during a flashing session, handed to the caller's [`Callback`].
#[derive(Debug, Clone)]
pub enum Event {
  /// The tool is searching for a connected device.
  FindingDevice,
  /// The interface has been claimed and the handshake completed.
  Connected,
  /// Device-reported packet-size negotiation outcome.
  Negotiated { enlarged: bool },
  /// Progress for the partition currently being uploaded.
  FlashProgress(FlashProgress),
  /// Moved on to uploading a new partition.
  BeginPartition { name: String, index: usize, total: usize },
  /// The session is being torn down.
  EndingSession { reboot: bool },
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the protocol, transport, and orchestration layers.
#[derive(thiserror::Error, Debug)]
pub enum Error {
  /// No device matching a known Samsung download-mode VID/PID was found.
  #[error("device not found")]
  DeviceNotFound,

  /// A libusb-layer failure that persisted after the transport's retry policy.
  #[error("transport error ({kind}) during {context}")]
  Transport { kind: TransportErrorKind, context: String },

  /// The handshake, a response type, or a required result value did not match expectations.
  #[error("protocol error during {operation}: expected {expected}, received {received}")]
  Protocol {
    operation: String,
    expected: String,
    received: String,
  },

  /// A per-chunk acknowledgement carried an unexpected part index.
  #[error("part index mismatch: expected {expected}, received {received}")]
  PartIndexMismatch { expected: u32, received: u32 },

  /// The PIT buffer did not start with the expected magic, or was truncated.
  #[error("not a valid PIT file: {0}")]
  PitFormat(String),

  /// The locally supplied PIT does not structurally match the device's PIT
  /// and repartitioning was not requested.
  #[error("local PIT does not match device PIT")]
  PitMismatch,

  /// No flashable PIT entry matched the requested selector.
  #[error("unknown partition: {0}")]
  UnknownPartition(String),

  /// An orchestrator-level argument was invalid (e.g. a CP identifier override).
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  /// The underlying USB library reported an error outside the retried bulk primitives.
  #[error("USB error: {0}")]
  Usb(#[from] rusb::Error),

  /// I/O error reading a partition source or writing host-setup files.
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

/// Coarse classification of a [`Error::Transport`] failure, mirroring the
/// kinds libusb itself distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
  Timeout,
  Io,
  Access,
  Reset,
}

impl std::fmt::Display for TransportErrorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      TransportErrorKind::Timeout => "timeout",
      TransportErrorKind::Io => "io",
      TransportErrorKind::Access => "access",
      TransportErrorKind::Reset => "reset",
    };
    f.write_str(s)
  }
}
