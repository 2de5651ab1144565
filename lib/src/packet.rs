//! On-wire packet layouts for the Loke protocol.
//!
//! Each wire frame is a variant of one of two enums (`Control`, `Response`,
//! plus the header-less file-part buffers handled elsewhere), with
//! `pack`/`unpack` free functions doing the little-endian layout. No virtual
//! dispatch, no heap allocation beyond the buffer itself, and nothing owns a
//! pointer past its scope.

use crate::{Error, Result};

/// Size of every outbound control frame on the wire, payload or not.
pub const CONTROL_FRAME_SIZE: usize = 1024;
/// Size of every inbound response frame.
pub const RESPONSE_FRAME_SIZE: usize = 8;
/// Size of one `DumpPartPit` reply part. Fixed regardless of the negotiated
/// file-transfer packet size.
pub const PIT_PART_SIZE: usize = 500;

const CONTROL_TYPE_SESSION: u32 = 0x64;
const CONTROL_TYPE_PIT_FILE: u32 = 0x65;
const CONTROL_TYPE_FILE_TRANSFER: u32 = 0x66;
const CONTROL_TYPE_END_SESSION: u32 = 0x67;

/// `binary_type` discriminant used in end-of-transfer packets; re-exported
/// through [`crate::pit::BinaryType`] for public use, duplicated here only
/// as a bare integer because the wire layout doesn't know about enums.
pub const DEVICE_TYPE_AP_TARGET: u32 = 0;
pub const DEVICE_TYPE_CP_TARGET: u32 = 1;

/// An outbound Control-family frame (always 1024 bytes on the wire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
  BeginSession,
  EnableTFlash,
  DeviceType,
  TotalBytes { total_bytes: u32 },
  FilePartSize { size: u32 },

  PitFileBegin,
  PitFileDump,
  FlashPartPit { byte_count: u32 },
  DumpPartPit { part_index: u32 },
  EndPitTransfer { byte_count: u32 },

  FlashPartFile { sequence_byte_count: u32 },
  EndPhoneFileTransfer {
    seq_byte_count: u32,
    device_type: u32,
    file_identifier: u32,
    end_of_file: bool,
  },
  EndModemFileTransfer {
    seq_byte_count: u32,
    device_type: u32,
    end_of_file: bool,
  },

  EndSession,
  Reboot,
}

impl Control {
  /// Serialize to a zero-padded 1024-byte buffer.
  pub fn pack(&self) -> [u8; CONTROL_FRAME_SIZE] {
    let mut buf = [0u8; CONTROL_FRAME_SIZE];

    match self {
      Control::BeginSession => {
        write_u32(&mut buf, 0, CONTROL_TYPE_SESSION);
        write_u32(&mut buf, 4, 0);
      }
      Control::EnableTFlash => {
        write_u32(&mut buf, 0, CONTROL_TYPE_SESSION);
        write_u32(&mut buf, 4, 4);
      }
      Control::DeviceType => {
        write_u32(&mut buf, 0, CONTROL_TYPE_SESSION);
        write_u32(&mut buf, 4, 1);
      }
      Control::TotalBytes { total_bytes } => {
        write_u32(&mut buf, 0, CONTROL_TYPE_SESSION);
        write_u32(&mut buf, 4, 2);
        write_u32(&mut buf, 8, *total_bytes);
      }
      Control::FilePartSize { size } => {
        write_u32(&mut buf, 0, CONTROL_TYPE_SESSION);
        write_u32(&mut buf, 4, 5);
        write_u32(&mut buf, 8, *size);
      }
      Control::PitFileBegin => {
        write_u32(&mut buf, 0, CONTROL_TYPE_PIT_FILE);
        write_u32(&mut buf, 4, 0);
      }
      Control::PitFileDump => {
        write_u32(&mut buf, 0, CONTROL_TYPE_PIT_FILE);
        write_u32(&mut buf, 4, 1);
      }
      Control::FlashPartPit { byte_count } => {
        write_u32(&mut buf, 0, CONTROL_TYPE_PIT_FILE);
        write_u32(&mut buf, 4, 2);
        write_u32(&mut buf, 8, *byte_count);
      }
      Control::DumpPartPit { part_index } => {
        write_u32(&mut buf, 0, CONTROL_TYPE_PIT_FILE);
        write_u32(&mut buf, 4, 2);
        write_u32(&mut buf, 8, *part_index);
      }
      Control::EndPitTransfer { byte_count } => {
        write_u32(&mut buf, 0, CONTROL_TYPE_PIT_FILE);
        write_u32(&mut buf, 4, 3);
        write_u32(&mut buf, 8, *byte_count);
      }
      Control::FlashPartFile { sequence_byte_count } => {
        write_u32(&mut buf, 0, CONTROL_TYPE_FILE_TRANSFER);
        write_u32(&mut buf, 4, 0);
        write_u32(&mut buf, 8, *sequence_byte_count);
      }
      Control::EndPhoneFileTransfer {
        seq_byte_count,
        device_type,
        file_identifier,
        end_of_file,
      } => {
        write_u32(&mut buf, 0, CONTROL_TYPE_FILE_TRANSFER);
        write_u32(&mut buf, 4, 3);
        write_u32(&mut buf, 8, DEVICE_TYPE_AP_TARGET);
        write_u32(&mut buf, 12, *seq_byte_count);
        write_u32(&mut buf, 16, 0);
        write_u32(&mut buf, 20, *device_type);
        write_u32(&mut buf, 24, *file_identifier);
        write_u32(&mut buf, 28, *end_of_file as u32);
      }
      Control::EndModemFileTransfer {
        seq_byte_count,
        device_type,
        end_of_file,
      } => {
        write_u32(&mut buf, 0, CONTROL_TYPE_FILE_TRANSFER);
        write_u32(&mut buf, 4, 3);
        write_u32(&mut buf, 8, DEVICE_TYPE_CP_TARGET);
        write_u32(&mut buf, 12, *seq_byte_count);
        write_u32(&mut buf, 16, 0);
        write_u32(&mut buf, 20, *device_type);
        write_u32(&mut buf, 24, *end_of_file as u32);
      }
      Control::EndSession => {
        write_u32(&mut buf, 0, CONTROL_TYPE_END_SESSION);
        write_u32(&mut buf, 4, 0);
      }
      Control::Reboot => {
        write_u32(&mut buf, 0, CONTROL_TYPE_END_SESSION);
        write_u32(&mut buf, 4, 1);
      }
    }

    buf
  }
}

/// The response type byte echoed in an inbound [`Response`], used by callers
/// to assert the reply matches the request family they just sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
  Session,
  PitFile,
  FileTransfer,
  EndSession,
}

impl ResponseKind {
  fn expected_type(self) -> u32 {
    match self {
      ResponseKind::Session => CONTROL_TYPE_SESSION,
      ResponseKind::PitFile => CONTROL_TYPE_PIT_FILE,
      ResponseKind::FileTransfer => CONTROL_TYPE_FILE_TRANSFER,
      ResponseKind::EndSession => CONTROL_TYPE_END_SESSION,
    }
  }
}

/// An inbound 8-byte `[response_type:u32][result:u32]` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
  pub response_type: u32,
  pub result: u32,
}

impl Response {
  /// Validate and parse bytes received from the device, asserting the
  /// response type matches `expected`.
  pub fn unpack(bytes: &[u8], expected: ResponseKind) -> Result<Self> {
    if bytes.len() < RESPONSE_FRAME_SIZE {
      return Err(Error::Protocol {
        operation: "unpack_response".into(),
        expected: format!("{} bytes", RESPONSE_FRAME_SIZE),
        received: format!("{} bytes", bytes.len()),
      });
    }

    let response_type = read_u32(bytes, 0);
    let result = read_u32(bytes, 4);

    if response_type != expected.expected_type() {
      return Err(Error::Protocol {
        operation: "unpack_response".into(),
        expected: format!("response_type {:#x}", expected.expected_type()),
        received: format!("response_type {:#x}", response_type),
      });
    }

    Ok(Self { response_type, result })
  }

  /// Re-serialize; used by the round-trip law `pack(unpack(x)) == x`.
  pub fn pack(&self) -> [u8; RESPONSE_FRAME_SIZE] {
    let mut buf = [0u8; RESPONSE_FRAME_SIZE];
    write_u32(&mut buf, 0, self.response_type);
    write_u32(&mut buf, 4, self.result);
    buf
  }

  /// For `SendFilePartResponse`, the `result` field aliases the acknowledged
  /// chunk's part index.
  pub fn part_index(&self) -> u32 {
    self.result
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

/// How a zero-length framing transfer should be issued relative to a real
/// transfer, replacing the source's `kEmptyTransferBefore/After` bitmask
/// with a small enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyTransfer {
  None,
  Before,
  After,
  BeforeAndAfter,
}

impl EmptyTransfer {
  pub fn before(self) -> bool {
    matches!(self, EmptyTransfer::Before | EmptyTransfer::BeforeAndAfter)
  }

  pub fn after(self) -> bool {
    matches!(self, EmptyTransfer::After | EmptyTransfer::BeforeAndAfter)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn control_frame_is_always_1024_bytes_and_starts_with_type() {
    let buf = Control::BeginSession.pack();
    assert_eq!(buf.len(), CONTROL_FRAME_SIZE);
    assert_eq!(read_u32(&buf, 0), CONTROL_TYPE_SESSION);
    assert_eq!(read_u32(&buf, 4), 0);
  }

  #[test]
  fn file_part_size_encodes_request_five_and_size() {
    let buf = Control::FilePartSize { size: 1_048_576 }.pack();
    assert_eq!(read_u32(&buf, 4), 5);
    assert_eq!(read_u32(&buf, 8), 1_048_576);
  }

  #[test]
  fn flash_part_pit_and_dump_part_pit_share_the_part_sub_request() {
    let flash = Control::FlashPartPit { byte_count: 4096 }.pack();
    let dump = Control::DumpPartPit { part_index: 3 }.pack();
    assert_eq!(read_u32(&flash, 4), 2);
    assert_eq!(read_u32(&dump, 4), 2);
    assert_eq!(read_u32(&flash, 8), 4096);
    assert_eq!(read_u32(&dump, 8), 3);
  }

  #[test]
  fn pit_file_begin_and_dump_are_bare_sub_requests() {
    let begin = Control::PitFileBegin.pack();
    let dump = Control::PitFileDump.pack();
    assert_eq!(read_u32(&begin, 4), 0);
    assert_eq!(read_u32(&dump, 4), 1);
  }

  #[test]
  fn end_phone_file_transfer_matches_offset_table() {
    let buf = Control::EndPhoneFileTransfer {
      seq_byte_count: 250_000,
      device_type: 2,
      file_identifier: 7,
      end_of_file: true,
    }
    .pack();
    assert_eq!(read_u32(&buf, 0), CONTROL_TYPE_FILE_TRANSFER);
    assert_eq!(read_u32(&buf, 4), 3);
    assert_eq!(read_u32(&buf, 8), DEVICE_TYPE_AP_TARGET);
    assert_eq!(read_u32(&buf, 12), 250_000);
    assert_eq!(read_u32(&buf, 16), 0);
    assert_eq!(read_u32(&buf, 20), 2);
    assert_eq!(read_u32(&buf, 24), 7);
    assert_eq!(read_u32(&buf, 28), 1);
  }

  #[test]
  fn response_rejects_mismatched_type() {
    let mut bytes = [0u8; RESPONSE_FRAME_SIZE];
    write_u32(&mut bytes, 0, CONTROL_TYPE_PIT_FILE);
    let err = Response::unpack(&bytes, ResponseKind::Session).unwrap_err();
    assert!(matches!(err, Error::Protocol { .. }));
  }

  #[test]
  fn response_pack_unpack_round_trips() {
    let original = Response {
      response_type: CONTROL_TYPE_SESSION,
      result: 1024,
    };
    let bytes = original.pack();
    let restored = Response::unpack(&bytes, ResponseKind::Session).unwrap();
    assert_eq!(original, restored);
  }

  #[test]
  fn send_file_part_response_aliases_result_as_part_index() {
    let response = Response {
      response_type: CONTROL_TYPE_FILE_TRANSFER,
      result: 3,
    };
    assert_eq!(response.part_index(), 3);
  }
}
