//! Partition Information Table (PIT) codec: parse a device-supplied buffer
//! into [`PitData`], or emit one for upload during repartitioning.
//!
//! Uses the `binaryType`/`deviceType`/`attributes`/`updateAttributes` entry
//! layout current devices speak; an older `partitionType`/`partitionFlags`
//! layout exists on some historical devices and is not implemented here.

use crate::{Error, Result};

const MAGIC: u32 = 0x1234_9876;
const HEADER_SIZE: usize = 28;
const ENTRY_SIZE: usize = 132;
const PAD_MULTIPLE: usize = 4096;
const NAME_FIELD_LEN: usize = 32;

/// Application-processor vs communication-processor (modem) target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryType {
  ApplicationProcessor,
  CommunicationProcessor,
}

impl BinaryType {
  fn from_u32(value: u32) -> Self {
    if value == 1 {
      BinaryType::CommunicationProcessor
    } else {
      BinaryType::ApplicationProcessor
    }
  }

  fn to_u32(self) -> u32 {
    match self {
      BinaryType::ApplicationProcessor => 0,
      BinaryType::CommunicationProcessor => 1,
    }
  }
}

/// Storage medium a partition lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
  OneNand,
  File,
  Mmc,
  All,
}

impl DeviceType {
  fn from_u32(value: u32) -> Self {
    match value {
      1 => DeviceType::File,
      2 => DeviceType::Mmc,
      3 => DeviceType::All,
      _ => DeviceType::OneNand,
    }
  }

  fn to_u32(self) -> u32 {
    match self {
      DeviceType::OneNand => 0,
      DeviceType::File => 1,
      DeviceType::Mmc => 2,
      DeviceType::All => 3,
    }
  }
}

/// Bit set: `write = 1`, `stl = 1 << 1`.
pub mod attribute {
  pub const WRITE: u32 = 1;
  pub const STL: u32 = 1 << 1;
}

/// Bit set: `fota = 1`, `secure = 1 << 1`.
pub mod update_attribute {
  pub const FOTA: u32 = 1;
  pub const SECURE: u32 = 1 << 1;
}

/// A single flashable (or table-only) partition record, fixed 132 bytes on
/// the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PitEntry {
  pub binary_type: BinaryType,
  pub device_type: DeviceType,
  pub identifier: u32,
  pub attributes: u32,
  pub update_attributes: u32,
  pub block_size_or_offset: u32,
  pub block_count: u32,
  pub file_offset: u32,
  pub file_size: u32,
  pub partition_name: String,
  pub flash_filename: String,
  pub fota_filename: String,
}

impl PitEntry {
  /// A PitEntry is flashable iff its name is non-empty and not the PIT's
  /// own table entry (`"PIT"`/`"PT"` are never flashable through the
  /// generic path).
  pub fn is_flashable(&self) -> bool {
    !self.partition_name.is_empty() && self.partition_name != "PIT" && self.partition_name != "PT"
  }

  fn pack(&self, buf: &mut [u8]) {
    write_u32(buf, 0, self.binary_type.to_u32());
    write_u32(buf, 4, self.device_type.to_u32());
    write_u32(buf, 8, self.identifier);
    write_u32(buf, 12, self.attributes);
    write_u32(buf, 16, self.update_attributes);
    write_u32(buf, 20, self.block_size_or_offset);
    write_u32(buf, 24, self.block_count);
    write_u32(buf, 28, self.file_offset);
    write_u32(buf, 32, self.file_size);
    write_name(buf, 36, &self.partition_name);
    write_name(buf, 68, &self.flash_filename);
    write_name(buf, 100, &self.fota_filename);
  }

  fn unpack(buf: &[u8]) -> Self {
    Self {
      binary_type: BinaryType::from_u32(read_u32(buf, 0)),
      device_type: DeviceType::from_u32(read_u32(buf, 4)),
      identifier: read_u32(buf, 8),
      attributes: read_u32(buf, 12),
      update_attributes: read_u32(buf, 16),
      block_size_or_offset: read_u32(buf, 20),
      block_count: read_u32(buf, 24),
      file_offset: read_u32(buf, 28),
      file_size: read_u32(buf, 32),
      partition_name: read_name(buf, 36),
      flash_filename: read_name(buf, 68),
      fota_filename: read_name(buf, 100),
    }
  }
}

/// A full partition table: header plus entries. Header carries eight opaque
/// `unknown*` fields that are round-tripped bit-exact but never interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PitData {
  pub unknown1: u32,
  pub unknown2: u32,
  pub unknown3: u16,
  pub unknown4: u16,
  pub unknown5: u16,
  pub unknown6: u16,
  pub unknown7: u16,
  pub unknown8: u16,
  pub entries: Vec<PitEntry>,
}

impl PitData {
  /// Unpadded size: `28 + 132 * entry_count`.
  pub fn data_size(&self) -> usize {
    HEADER_SIZE + ENTRY_SIZE * self.entries.len()
  }

  /// Parse a device-supplied buffer. Fails with [`Error::PitFormat`] if the
  /// magic doesn't match or the buffer is shorter than the declared entry
  /// count requires.
  pub fn parse(bytes: &[u8]) -> Result<Self> {
    if bytes.len() < HEADER_SIZE {
      return Err(Error::PitFormat("buffer shorter than header".into()));
    }

    let magic = read_u32(bytes, 0);
    if magic != MAGIC {
      return Err(Error::PitFormat(format!("bad magic {:#x}", magic)));
    }

    let entry_count = read_u32(bytes, 4) as usize;
    let unknown1 = read_u32(bytes, 8);
    let unknown2 = read_u32(bytes, 12);
    let unknown3 = read_u16(bytes, 16);
    let unknown4 = read_u16(bytes, 18);
    let unknown5 = read_u16(bytes, 20);
    let unknown6 = read_u16(bytes, 22);
    let unknown7 = read_u16(bytes, 24);
    let unknown8 = read_u16(bytes, 26);

    let required = HEADER_SIZE + ENTRY_SIZE * entry_count;
    if bytes.len() < required {
      return Err(Error::PitFormat(format!(
        "buffer has {} bytes, need {} for {} entries",
        bytes.len(),
        required,
        entry_count
      )));
    }

    let mut entries = Vec::with_capacity(entry_count);
    for i in 0..entry_count {
      let offset = HEADER_SIZE + i * ENTRY_SIZE;
      entries.push(PitEntry::unpack(&bytes[offset..offset + ENTRY_SIZE]));
    }

    Ok(Self {
      unknown1,
      unknown2,
      unknown3,
      unknown4,
      unknown5,
      unknown6,
      unknown7,
      unknown8,
      entries,
    })
  }

  /// Emit to a buffer sized `data_size()` and zero-padded up to the next
  /// multiple of 4096 bytes.
  pub fn emit(&self) -> Vec<u8> {
    let data_size = self.data_size();
    let padded_size = data_size.div_ceil(PAD_MULTIPLE) * PAD_MULTIPLE;
    let mut buf = vec![0u8; padded_size];

    write_u32(&mut buf, 0, MAGIC);
    write_u32(&mut buf, 4, self.entries.len() as u32);
    write_u32(&mut buf, 8, self.unknown1);
    write_u32(&mut buf, 12, self.unknown2);
    write_u16(&mut buf, 16, self.unknown3);
    write_u16(&mut buf, 18, self.unknown4);
    write_u16(&mut buf, 20, self.unknown5);
    write_u16(&mut buf, 22, self.unknown6);
    write_u16(&mut buf, 24, self.unknown7);
    write_u16(&mut buf, 26, self.unknown8);

    for (i, entry) in self.entries.iter().enumerate() {
      let offset = HEADER_SIZE + i * ENTRY_SIZE;
      entry.pack(&mut buf[offset..offset + ENTRY_SIZE]);
    }

    buf
  }

  /// First flashable entry whose name matches.
  pub fn find_by_name(&self, name: &str) -> Option<&PitEntry> {
    self.entries.iter().find(|e| e.is_flashable() && e.partition_name == name)
  }

  /// First flashable entry whose identifier matches.
  pub fn find_by_id(&self, id: u32) -> Option<&PitEntry> {
    self.entries.iter().find(|e| e.is_flashable() && e.identifier == id)
  }

  /// Structural bit-equality across every field, including the opaque
  /// header bytes. Used to guard against flashing with a stale local PIT.
  pub fn matches(&self, other: &PitData) -> bool {
    self == other
  }
}

impl std::fmt::Display for PitEntry {
  /// Human-readable field dump, one entry at a time.
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    writeln!(f, "Binary Type: {:?}", self.binary_type)?;
    writeln!(f, "Device Type: {:?}", self.device_type)?;
    writeln!(f, "Identifier: {}", self.identifier)?;
    writeln!(
      f,
      "Attributes: {} ({}{})",
      self.attributes,
      if self.attributes & attribute::WRITE != 0 { "R/W" } else { "R" },
      if self.attributes & attribute::STL != 0 { ", STL" } else { "" }
    )?;
    writeln!(f, "Update Attributes: {}", self.update_attributes)?;
    writeln!(f, "Partition Block Size/Offset: {}", self.block_size_or_offset)?;
    writeln!(f, "Partition Block Count: {}", self.block_count)?;
    writeln!(f, "File Offset: {}", self.file_offset)?;
    writeln!(f, "File Size: {}", self.file_size)?;
    writeln!(f, "Partition Name: {}", self.partition_name)?;
    writeln!(f, "Flash Filename: {}", self.flash_filename)?;
    write!(f, "FOTA Filename: {}", self.fota_filename)
  }
}

impl std::fmt::Display for PitData {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    writeln!(f, "Entry Count: {}", self.entries.len())?;
    writeln!(f, "Unknown 1: {}", self.unknown1)?;
    writeln!(f, "Unknown 2: {}", self.unknown2)?;
    writeln!(f, "Unknown 3: {}", self.unknown3)?;
    writeln!(f, "Unknown 4: {}", self.unknown4)?;
    writeln!(f, "Unknown 5: {}", self.unknown5)?;
    writeln!(f, "Unknown 6: {}", self.unknown6)?;
    writeln!(f, "Unknown 7: {}", self.unknown7)?;
    write!(f, "Unknown 8: {}", self.unknown8)?;

    for (i, entry) in self.entries.iter().enumerate() {
      write!(f, "\n\n--- Entry #{i} ---\n{entry}")?;
    }

    Ok(())
  }
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
  buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
  let mut bytes = [0u8; 4];
  bytes.copy_from_slice(&buf[offset..offset + 4]);
  u32::from_le_bytes(bytes)
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
  buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
  let mut bytes = [0u8; 2];
  bytes.copy_from_slice(&buf[offset..offset + 2]);
  u16::from_le_bytes(bytes)
}

fn write_name(buf: &mut [u8], offset: usize, name: &str) {
  let field = &mut buf[offset..offset + NAME_FIELD_LEN];
  let bytes = name.as_bytes();
  let copy_len = bytes.len().min(NAME_FIELD_LEN - 1);
  field[..copy_len].copy_from_slice(&bytes[..copy_len]);
}

fn read_name(buf: &[u8], offset: usize) -> String {
  let field = &buf[offset..offset + NAME_FIELD_LEN];
  let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
  String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_entry(name: &str, binary_type: BinaryType, identifier: u32) -> PitEntry {
    PitEntry {
      binary_type,
      device_type: DeviceType::Mmc,
      identifier,
      attributes: attribute::WRITE,
      update_attributes: update_attribute::FOTA,
      block_size_or_offset: 0,
      block_count: 100,
      file_offset: 0,
      file_size: 0,
      partition_name: name.to_string(),
      flash_filename: format!("{name}.img"),
      fota_filename: format!("{name}.img"),
    }
  }

  fn sample_pit() -> PitData {
    PitData {
      unknown1: 0xDEAD_BEEF,
      unknown2: 0xF00D_CAFE,
      unknown3: 1,
      unknown4: 2,
      unknown5: 3,
      unknown6: 4,
      unknown7: 5,
      unknown8: 6,
      entries: vec![
        sample_entry("BOOT", BinaryType::ApplicationProcessor, 1),
        sample_entry("SYSTEM", BinaryType::ApplicationProcessor, 2),
        sample_entry("MODEM", BinaryType::CommunicationProcessor, 3),
      ],
    }
  }

  #[test]
  fn round_trip_preserves_structural_equality() {
    let original = sample_pit();
    let bytes = original.emit();
    let parsed = PitData::parse(&bytes).unwrap();
    assert!(original.matches(&parsed));
  }

  #[test]
  fn emit_pads_to_4096_byte_multiple() {
    let pit = sample_pit();
    let bytes = pit.emit();
    assert_eq!(bytes.len() % PAD_MULTIPLE, 0);
    assert_eq!(bytes.len(), PAD_MULTIPLE);
  }

  #[test]
  fn empty_pit_emits_exactly_one_pad_multiple() {
    let pit = PitData {
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
    assert_eq!(pit.emit().len(), PAD_MULTIPLE);
  }

  #[test]
  fn find_by_name_and_id_agree_after_round_trip() {
    let original = sample_pit();
    let parsed = PitData::parse(&original.emit()).unwrap();

    let found = parsed.find_by_name("MODEM").unwrap();
    assert_eq!(found.binary_type, BinaryType::CommunicationProcessor);
    assert_eq!(parsed.find_by_id(found.identifier).unwrap().partition_name, "MODEM");
  }

  #[test]
  fn display_includes_entry_names_and_header_fields() {
    let rendered = sample_pit().to_string();
    assert!(rendered.contains("Entry Count: 3"));
    assert!(rendered.contains("Partition Name: MODEM"));
    assert!(rendered.contains("--- Entry #2 ---"));
  }

  #[test]
  fn pit_and_pt_are_never_flashable() {
    let pit_entry = sample_entry("PIT", BinaryType::ApplicationProcessor, 0);
    let pt_entry = sample_entry("PT", BinaryType::ApplicationProcessor, 0);
    assert!(!pit_entry.is_flashable());
    assert!(!pt_entry.is_flashable());
  }

  #[test]
  fn parse_rejects_bad_magic() {
    let mut bytes = vec![0u8; HEADER_SIZE];
    write_u32(&mut bytes, 0, 0xFFFF_FFFF);
    assert!(matches!(PitData::parse(&bytes), Err(Error::PitFormat(_))));
  }

  #[test]
  fn parse_rejects_truncated_entries() {
    let mut bytes = vec![0u8; HEADER_SIZE];
    write_u32(&mut bytes, 0, MAGIC);
    write_u32(&mut bytes, 4, 1);
    assert!(matches!(PitData::parse(&bytes), Err(Error::PitFormat(_))));
  }
}
