//! The sequenced, chunked bulk file-transfer engine, plus the structurally
//! similar PIT upload/download paths.
//!
//! A progress-callback-driven loop over fixed-size chunks, with
//! elapsed/rate/eta bookkeeping computed once per chunk rather than
//! threaded through every call site.

use std::io::Read;
use std::time::{Duration, Instant};

use crate::packet::{Control, EmptyTransfer, ResponseKind};
use crate::pit::BinaryType;
use crate::session::Session;
use crate::transport::Transport;
use crate::{Callback, Error, Event, Result};

/// A point-in-time progress snapshot for the partition currently uploading.
#[derive(Debug, Clone, PartialEq)]
pub struct FlashProgress {
  pub partition: String,
  pub percent: f64,
  pub elapsed: Duration,
  pub eta: Duration,
  pub rate: f64,
  pub avg_chunk_time: Duration,
  pub avg_rate: f64,
}

/// How many additional attempts a single chunk gets before the whole upload
/// fails (spec: "retry the chunk up to 4 additional times").
const CHUNK_RETRY_ATTEMPTS: u32 = 4;

struct ChunkPlan {
  sequence_count: u64,
  last_seq_len: u64,
  partial: u64,
}

fn plan_chunks(file_size: u64, packet_size: u64, sequence_max_length: u64) -> ChunkPlan {
  if file_size == 0 {
    return ChunkPlan {
      sequence_count: 0,
      last_seq_len: 0,
      partial: 0,
    };
  }

  let seq_capacity = sequence_max_length * packet_size;
  let sequence_count = file_size.div_ceil(seq_capacity);
  let remainder = file_size % seq_capacity;
  let last_seq_len = if remainder == 0 {
    sequence_max_length
  } else {
    remainder.div_ceil(packet_size)
  };
  let partial = file_size % packet_size;

  ChunkPlan {
    sequence_count,
    last_seq_len,
    partial,
  }
}

/// Upload `reader` (exactly `file_size` bytes) to the partition identified
/// by `binary_type`/`device_type`/`identifier`, emitting [`Event::FlashProgress`]
/// through `callback` as chunks complete.
#[allow(clippy::too_many_arguments)]
pub fn upload_file<T: Transport>(
  session: &Session<'_, T>,
  partition_name: &str,
  mut reader: impl Read,
  file_size: u64,
  binary_type: BinaryType,
  device_type: u32,
  identifier: u32,
  callback: Option<&Callback>,
) -> Result<()> {
  let params = session.params();
  let packet_size = params.packet_size as u64;
  let sequence_max_length = params.sequence_max_length as u64;
  let plan = plan_chunks(file_size, packet_size, sequence_max_length);

  let start = Instant::now();
  let mut bytes_sent: u64 = 0;
  let mut chunk_durations: Vec<Duration> = Vec::new();

  for seq_index in 0..plan.sequence_count {
    let is_last_sequence = seq_index + 1 == plan.sequence_count;
    let seq_len = if is_last_sequence { plan.last_seq_len } else { sequence_max_length };

    session.exchange(
      &Control::FlashPartFile {
        sequence_byte_count: (seq_len * packet_size) as u32,
      },
      ResponseKind::FileTransfer,
    )?;

    for chunk_index in 0..seq_len {
      let empty_transfer = if chunk_index == 0 {
        EmptyTransfer::None
      } else {
        EmptyTransfer::Before
      };

      let remaining = file_size - bytes_sent;
      let real_len = remaining.min(packet_size) as usize;

      let mut buf = vec![0u8; packet_size as usize];
      reader.read_exact(&mut buf[..real_len])?;

      let chunk_start = Instant::now();
      send_chunk_with_retry(session, &buf, chunk_index as u32, empty_transfer)?;
      chunk_durations.push(chunk_start.elapsed());

      bytes_sent += real_len as u64;

      if let Some(cb) = callback {
        let progress = build_progress(partition_name, bytes_sent, file_size, start, &chunk_durations);
        cb(Event::FlashProgress(progress));
      }
    }

    let effective_bytes = if is_last_sequence && plan.partial != 0 {
      (seq_len - 1) * packet_size + plan.partial
    } else {
      seq_len * packet_size
    };

    session.empty_transfer()?;
    let end_control = match binary_type {
      BinaryType::ApplicationProcessor => Control::EndPhoneFileTransfer {
        seq_byte_count: effective_bytes as u32,
        device_type,
        file_identifier: identifier,
        end_of_file: is_last_sequence,
      },
      BinaryType::CommunicationProcessor => Control::EndModemFileTransfer {
        seq_byte_count: effective_bytes as u32,
        device_type,
        end_of_file: is_last_sequence,
      },
    };

    session.send_control(&end_control)?;
    session.empty_transfer()?;
    session.receive_response(ResponseKind::FileTransfer, params.sequence_timeout)?;
  }

  Ok(())
}

fn send_chunk_with_retry<T: Transport>(
  session: &Session<'_, T>,
  buf: &[u8],
  expected_part_index: u32,
  empty_transfer: EmptyTransfer,
) -> Result<()> {
  let mut attempt = 0;
  loop {
    if empty_transfer.before() {
      session.empty_transfer()?;
    }

    let send_result = session
      .transport_send(buf, session.config().control_timeout)
      .and_then(|_| session.receive_response(ResponseKind::FileTransfer, session.config().control_timeout));

    match send_result {
      Ok(response) => {
        let received = response.part_index();
        if received != expected_part_index {
          return Err(Error::PartIndexMismatch {
            expected: expected_part_index,
            received,
          });
        }
        return Ok(());
      }
      Err(err) => {
        if attempt >= CHUNK_RETRY_ATTEMPTS {
          return Err(err);
        }
        tracing::warn!(attempt, part_index = expected_part_index, error = %err, "chunk send failed, retrying");
        attempt += 1;
      }
    }
  }
}

fn build_progress(
  partition: &str,
  bytes_sent: u64,
  file_size: u64,
  start: Instant,
  chunk_durations: &[Duration],
) -> FlashProgress {
  let percent = if file_size == 0 {
    100.0
  } else {
    ((bytes_sent as f64 / file_size as f64) * 100.0).min(100.0)
  };

  let elapsed = start.elapsed();
  let rate = if elapsed.as_secs_f64() > 0.0 {
    bytes_sent as f64 / elapsed.as_secs_f64()
  } else {
    0.0
  };

  let remaining = file_size.saturating_sub(bytes_sent);
  let eta = if rate > 0.0 {
    Duration::from_secs_f64(remaining as f64 / rate)
  } else {
    Duration::ZERO
  };

  let avg_chunk_time = if chunk_durations.is_empty() {
    Duration::ZERO
  } else {
    chunk_durations.iter().sum::<Duration>() / chunk_durations.len() as u32
  };

  let avg_rate = if avg_chunk_time.as_secs_f64() > 0.0 {
    (bytes_sent as f64 / chunk_durations.len().max(1) as f64) / avg_chunk_time.as_secs_f64()
  } else {
    0.0
  };

  FlashProgress {
    partition: partition.to_string(),
    percent,
    elapsed,
    eta,
    rate,
    avg_chunk_time,
    avg_rate,
  }
}

/// Upload a PIT buffer to the device:
/// `PitFile(flash) -> FlashPartPit(size) -> FilePart(bytes) -> EndPitTransfer(size)`,
/// expecting a response after each step.
pub fn upload_pit<T: Transport>(session: &Session<'_, T>, pit_bytes: &[u8]) -> Result<()> {
  session.exchange(&Control::PitFileBegin, ResponseKind::PitFile)?;

  session.exchange(
    &Control::FlashPartPit {
      byte_count: pit_bytes.len() as u32,
    },
    ResponseKind::PitFile,
  )?;

  session.transport_send(pit_bytes, session.config().control_timeout)?;
  session.receive_response(ResponseKind::PitFile, session.config().control_timeout)?;

  session.exchange(
    &Control::EndPitTransfer {
      byte_count: pit_bytes.len() as u32,
    },
    ResponseKind::PitFile,
  )?;

  Ok(())
}

/// Download the device's current PIT, the symmetric counterpart to
/// [`upload_pit`]: `PitFile(dump) -> expect size -> DumpPartPit(i)* -> PitFile(end)`.
///
/// Each `DumpPartPit` request is answered with the raw file part directly,
/// not a `Response` frame, so the part is read with a bare bulk-IN receive.
pub fn download_pit<T: Transport>(session: &Session<'_, T>) -> Result<Vec<u8>> {
  let response = session.exchange(&Control::PitFileDump, ResponseKind::PitFile)?;
  let total_size = response.result as usize;

  let chunk_size = crate::packet::PIT_PART_SIZE;
  let chunk_count = total_size.div_ceil(chunk_size.max(1));

  let mut buffer = Vec::with_capacity(total_size);
  for i in 0..chunk_count {
    session.send_control(&Control::DumpPartPit { part_index: i as u32 })?;

    let remaining = total_size - buffer.len();
    let part = session.transport_receive(remaining.min(chunk_size), session.config().control_timeout)?;
    buffer.extend_from_slice(&part);
  }

  session.exchange(&Control::EndPitTransfer { byte_count: 0 }, ResponseKind::PitFile)?;

  Ok(buffer)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ProtocolConfig;
  use crate::transport::fake::FakeTransport;

  #[test]
  fn exact_multiple_of_sequence_capacity_yields_one_full_sequence() {
    let plan = plan_chunks(800 * 131_072, 131_072, 800);
    assert_eq!(plan.sequence_count, 1);
    assert_eq!(plan.last_seq_len, 800);
    assert_eq!(plan.partial, 0);
  }

  #[test]
  fn one_byte_past_sequence_capacity_yields_a_second_tiny_sequence() {
    let plan = plan_chunks(800 * 131_072 + 1, 131_072, 800);
    assert_eq!(plan.sequence_count, 2);
    assert_eq!(plan.last_seq_len, 1);
    assert_eq!(plan.partial, 1);
  }

  #[test]
  fn seed_scenario_250000_bytes_with_default_packet_size() {
    let plan = plan_chunks(250_000, 131_072, 800);
    assert_eq!(plan.sequence_count, 1);
    assert_eq!(plan.last_seq_len, 2);
    assert_eq!(plan.partial, 250_000 % 131_072);

    let effective = if plan.partial != 0 {
      (plan.last_seq_len - 1) * 131_072 + plan.partial
    } else {
      plan.last_seq_len * 131_072
    };
    assert_eq!(effective, 250_000);
  }

  #[test]
  fn empty_file_plans_zero_sequences() {
    let plan = plan_chunks(0, 131_072, 800);
    assert_eq!(plan.sequence_count, 0);
  }

  fn ack(part_index: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; 8];
    bytes[0..4].copy_from_slice(&0x66u32.to_le_bytes());
    bytes[4..8].copy_from_slice(&part_index.to_le_bytes());
    bytes
  }

  fn pit_response(result: u32, response_type: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; 8];
    bytes[0..4].copy_from_slice(&response_type.to_le_bytes());
    bytes[4..8].copy_from_slice(&result.to_le_bytes());
    bytes
  }

  #[test]
  fn flash_one_ap_partition_sends_expected_wire_sequence() {
    let fake = FakeTransport::new();
    fake.queue_response(pit_response(0, 0x66)); // FlashPartFile response
    fake.queue_response(ack(0));
    fake.queue_response(ack(1));
    fake.queue_response(pit_response(0, 0x66)); // end-of-sequence response

    let session = Session::new(&fake, ProtocolConfig::default());
    let data = vec![7u8; 250_000];
    upload_file(
      &session,
      "BOOT",
      data.as_slice(),
      250_000,
      BinaryType::ApplicationProcessor,
      2,
      1,
      None,
    )
    .unwrap();

    let sent = fake.sent.borrow();
    // FlashPartFile control, chunk 0, chunk 1, end-of-sequence control.
    assert!(sent.iter().any(|f| f.len() == 131_072));
    assert!(sent.iter().any(|f| f.is_empty()));
  }

  #[test]
  fn mismatched_part_index_fails_the_upload() {
    let fake = FakeTransport::new();
    fake.queue_response(pit_response(0, 0x66));
    fake.queue_response(ack(9)); // wrong index

    let session = Session::new(&fake, ProtocolConfig::default());
    let data = vec![0u8; 1];
    let err = upload_file(
      &session,
      "BOOT",
      data.as_slice(),
      1,
      BinaryType::ApplicationProcessor,
      2,
      1,
      None,
    )
    .unwrap_err();

    assert!(matches!(err, Error::PartIndexMismatch { .. } | Error::Transport { .. }));
  }

  #[test]
  fn pit_round_trip_through_upload_and_download() {
    let fake = FakeTransport::new();
    fake.queue_response(pit_response(0, 0x65)); // PitFileBegin response
    fake.queue_response(pit_response(0, 0x65)); // FlashPartPit response
    fake.queue_response(pit_response(0, 0x65)); // file part response
    fake.queue_response(pit_response(0, 0x65)); // EndPitTransfer response

    let session = Session::new(&fake, ProtocolConfig::default());
    let pit_bytes = vec![1u8, 2, 3, 4];
    upload_pit(&session, &pit_bytes).unwrap();

    assert!(fake.sent.borrow().iter().any(|f| f == &pit_bytes));
  }
}
