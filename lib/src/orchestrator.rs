//! Top-level "flash these files to these partitions" entry points.
//!
//! A struct that owns the device connection and callback, with thin public
//! methods each driving one whole operation end to end: open a session,
//! negotiate, resolve a partition table, stream each partition, close.

use std::io::Read;

use crate::config::ProtocolConfig;
use crate::pit::{BinaryType, PitData};
use crate::session::Session;
use crate::transfer;
use crate::transport::{RusbTransport, Transport};
use crate::{Callback, Error, Event, Result};

/// A modem has no partition identifier of its own; CP uploads always carry
/// this wildcard value instead of a PIT-assigned identifier.
const MODEM_IDENTIFIER: u32 = 0xFFFF_FFFF;

/// Flags controlling one `flash` invocation.
#[derive(Debug, Clone, Default)]
pub struct FlashOptions {
  /// Upload `pit` (if supplied) before streaming partition data.
  pub repartition: bool,
  /// Send `EndSession(reboot)` after the last partition completes.
  pub reboot_on_end: bool,
  /// Skip the ODIN/LOKE handshake, assuming a session is already open.
  pub resume: bool,
  /// Redirect writes to an inserted SD card instead of internal eMMC.
  pub tflash: bool,
  /// Caller-supplied PIT bytes, required when `repartition` is set and
  /// otherwise used only to assert a match against the device's PIT.
  pub pit: Option<Vec<u8>>,
}

/// Drives a full Loke session: connect, negotiate, resolve the partition
/// table, stream files, tear down.
pub struct Orchestrator<T: Transport = RusbTransport> {
  transport: T,
  config: ProtocolConfig,
  callback: Option<Callback>,
}

impl Orchestrator<RusbTransport> {
  /// Open a USB connection to a known Samsung download-mode device and
  /// claim its interface. Does not perform the protocol handshake; call one
  /// of the entry points below for that.
  pub fn connect(callback: Option<Callback>) -> Result<Self> {
    Self::connect_with_config(ProtocolConfig::default(), callback)
  }

  pub fn connect_with_config(config: ProtocolConfig, callback: Option<Callback>) -> Result<Self> {
    if let Some(cb) = &callback {
      cb(Event::FindingDevice);
    }

    let transport = RusbTransport::open(&config)?;

    if let Some(cb) = &callback {
      cb(Event::Connected);
    }

    Ok(Self {
      transport,
      config,
      callback,
    })
  }
}

impl<T: Transport> Orchestrator<T> {
  /// Construct directly over an already-open transport (used by tests with
  /// a fake transport, and by callers with a custom backend).
  pub fn with_transport(transport: T, config: ProtocolConfig, callback: Option<Callback>) -> Self {
    Self {
      transport,
      config,
      callback,
    }
  }

  fn emit(&self, event: Event) {
    if let Some(cb) = &self.callback {
      cb(event);
    }
  }

  fn open_session(&self, resume: bool) -> Result<Session<'_, T>> {
    let mut session = Session::new(&self.transport, self.config.clone());
    session.init_protocol(resume)?;
    session.begin_session()?;

    let enlarged = session.state() == crate::session::SessionState::SessionOpenEnlarged;
    self.emit(Event::Negotiated { enlarged });

    Ok(session)
  }

  /// Returns whether a supported device is reachable (interface already
  /// claimed at construction time, so this simply confirms the transport
  /// exists).
  pub fn detect(&self) -> bool {
    true
  }

  /// Download the device's current PIT and return the raw bytes.
  pub fn download_pit(&self, reboot: bool, resume: bool) -> Result<Vec<u8>> {
    let session = self.open_session(resume)?;
    let bytes = transfer::download_pit(&session)?;
    session.end_session(reboot)?;
    self.emit(Event::EndingSession { reboot });
    Ok(bytes)
  }

  /// Download the device's current PIT and parse it.
  pub fn print_pit(&self, resume: bool) -> Result<PitData> {
    let bytes = self.download_pit(false, resume)?;
    PitData::parse(&bytes)
  }

  /// Flash each `(selector, stream)` pair in declaration order.
  ///
  /// `inputs` pairs a partition selector (name or, via
  /// [`PartitionSelector::Id`], numeric identifier) with a byte-stream
  /// source and its exact length.
  pub fn flash(&self, inputs: Vec<(PartitionSelector, Box<dyn Read>, u64)>, options: FlashOptions) -> Result<()> {
    let mut session = self.open_session(options.resume)?;

    if options.tflash {
      session.enable_tflash()?;
    }

    let pit_len = options.pit.as_ref().map(|p| p.len() as u64).unwrap_or(0);
    let total_bytes: u64 = inputs.iter().map(|(_, _, len)| *len).sum::<u64>() + if options.repartition { pit_len } else { 0 };
    session.total_bytes(total_bytes as u32)?;

    let working_pit = self.resolve_pit(&session, &options)?;

    if options.repartition {
      let pit_bytes = options
        .pit
        .as_ref()
        .ok_or_else(|| Error::InvalidArgument("repartition requested without PIT bytes".into()))?;
        transfer::upload_pit(&session, pit_bytes)?;
    }

    let total = inputs.len();
    for (index, (selector, reader, len)) in inputs.into_iter().enumerate() {
      let entry = match &selector {
        PartitionSelector::Name(name) => working_pit.find_by_name(name),
        PartitionSelector::Id(id) => working_pit.find_by_id(*id),
      }
      .ok_or_else(|| Error::UnknownPartition(selector.to_string()))?
      .clone();

      self.emit(Event::BeginPartition {
        name: entry.partition_name.clone(),
        index,
        total,
      });

      let identifier = match entry.binary_type {
        BinaryType::ApplicationProcessor => entry.identifier,
        BinaryType::CommunicationProcessor => MODEM_IDENTIFIER,
      };

      transfer::upload_file(
        &session,
        &entry.partition_name,
        reader,
        len,
        entry.binary_type,
        entry.device_type as u32,
        identifier,
        self.callback.as_ref(),
      )?;
    }

    session.end_session(options.reboot_on_end)?;
    self.emit(Event::EndingSession {
      reboot: options.reboot_on_end,
    });

    Ok(())
  }

  fn resolve_pit(&self, session: &Session<'_, T>, options: &FlashOptions) -> Result<PitData> {
    if options.repartition {
      let bytes = options
        .pit
        .as_ref()
        .ok_or_else(|| Error::InvalidArgument("repartition requested without PIT bytes".into()))?;
      return PitData::parse(bytes);
    }

    let device_bytes = transfer::download_pit(session)?;
    let device_pit = PitData::parse(&device_bytes)?;

    if let Some(local_bytes) = &options.pit {
      let local_pit = PitData::parse(local_bytes)?;
      if !local_pit.matches(&device_pit) {
        return Err(Error::PitMismatch);
      }
    }

    Ok(device_pit)
  }

  /// End the current session without flashing anything, equivalent to
  /// closing the bootloader's download-mode screen.
  pub fn close_pc_screen(&self, reboot: bool, resume: bool) -> Result<()> {
    let session = self.open_session(resume)?;
    session.end_session(reboot)?;
    self.emit(Event::EndingSession { reboot });
    Ok(())
  }

  /// Equivalent to `close_pc_screen(true, resume)`.
  pub fn reboot(&self, resume: bool) -> Result<()> {
    self.close_pc_screen(true, resume)
  }
}

/// How the caller identifies a target partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionSelector {
  Name(String),
  Id(u32),
}

impl std::fmt::Display for PartitionSelector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      PartitionSelector::Name(name) => write!(f, "{name}"),
      PartitionSelector::Id(id) => write!(f, "#{id}"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pit::{attribute, update_attribute, DeviceType as PitDeviceType, PitEntry};
  use crate::transport::fake::FakeTransport;

  fn single_entry_pit() -> PitData {
    PitData {
      unknown1: 0,
      unknown2: 0,
      unknown3: 0,
      unknown4: 0,
      unknown5: 0,
      unknown6: 0,
      unknown7: 0,
      unknown8: 0,
      entries: vec![PitEntry {
        binary_type: BinaryType::ApplicationProcessor,
        device_type: PitDeviceType::Mmc,
        identifier: 5,
        attributes: attribute::WRITE,
        update_attributes: update_attribute::FOTA,
        block_size_or_offset: 0,
        block_count: 10,
        file_offset: 0,
        file_size: 0,
        partition_name: "BOOT".into(),
        flash_filename: "boot.img".into(),
        fota_filename: "boot.img".into(),
      }],
    }
  }

  fn resp(response_type: u32, result: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; 8];
    bytes[0..4].copy_from_slice(&response_type.to_le_bytes());
    bytes[4..8].copy_from_slice(&result.to_le_bytes());
    bytes
  }

  #[test]
  fn unknown_partition_selector_fails_before_any_transfer() {
    let fake = FakeTransport::new();

    let empty_pit = PitData {
      unknown1: 0,
      unknown2: 0,
      unknown3: 0,
      unknown4: 0,
      unknown5: 0,
      unknown6: 0,
      unknown7: 0,
      unknown8: 0,
      entries: vec![],
    };
    let pit_bytes = empty_pit.emit();

    fake.queue_response(b"LOKE\0\0\0".to_vec()); // handshake
    fake.queue_response(resp(0x64, 0)); // begin session, no negotiation
    fake.queue_response(resp(0x64, 0)); // total bytes
    fake.queue_response(resp(0x65, pit_bytes.len() as u32)); // pit dump size
    for chunk in pit_bytes.chunks(crate::packet::PIT_PART_SIZE) {
      fake.queue_response(chunk.to_vec()); // raw dump part, no intervening response
    }
    fake.queue_response(resp(0x65, 0)); // end transfer response

    let orchestrator = Orchestrator::with_transport(fake, ProtocolConfig::default(), None);
    let err = orchestrator
      .flash(
        vec![(PartitionSelector::Name("MISSING".into()), Box::new(std::io::empty()), 0)],
        FlashOptions::default(),
      )
      .unwrap_err();

    assert!(matches!(err, Error::UnknownPartition(_)));
  }

  #[test]
  fn known_partition_resolves_ap_binary_type_and_identifier() {
    let pit = single_entry_pit();
    let entry = pit.find_by_name("BOOT").unwrap();
    assert_eq!(entry.binary_type, BinaryType::ApplicationProcessor);
    assert_eq!(entry.identifier, 5);
  }
}
