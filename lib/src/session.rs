//! The Loke session state machine: handshake, begin-session negotiation,
//! device-type query, PIT control exchange, and teardown.
//!
//! A single device handle is threaded through a sequence of blocking
//! request/response calls, each one logging at `debug`/`trace` and
//! returning a crate [`Error`] rather than panicking. The engine holds a
//! non-owning reference to a [`Transport`]; it does not attempt
//! cross-packet recovery — only the transport's own bulk-transfer retries
//! apply.

use std::time::Duration;

use crate::config::ProtocolConfig;
use crate::packet::{Control, Response, ResponseKind};
use crate::transport::Transport;
use crate::{Error, Result};

/// Where the session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Disconnected,
  InterfaceClaimed,
  ProtocolInitialised,
  SessionOpen,
  SessionOpenEnlarged,
  SessionClosing,
}

/// Device-type code reported by the bootloader in response to a
/// `DeviceType` control request. The meaning of the code is opaque to this
/// crate; it is surfaced for callers/diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceType(pub u32);

/// Mutable transfer parameters, negotiated once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParams {
  pub packet_size: u32,
  pub sequence_max_length: u32,
  pub sequence_timeout: Duration,
}

impl TransferParams {
  fn defaults(config: &ProtocolConfig) -> Self {
    Self {
      packet_size: config.packet_size_default,
      sequence_max_length: config.sequence_max_length_default,
      sequence_timeout: config.sequence_timeout_default,
    }
  }

  fn enlarged(config: &ProtocolConfig) -> Self {
    Self {
      packet_size: config.packet_size_enlarged,
      sequence_max_length: config.sequence_max_length_enlarged,
      sequence_timeout: config.sequence_timeout_enlarged,
    }
  }
}

/// Drives one Loke session over a borrowed [`Transport`].
pub struct Session<'t, T: Transport> {
  transport: &'t T,
  config: ProtocolConfig,
  state: SessionState,
  params: TransferParams,
}

impl<'t, T: Transport> Session<'t, T> {
  pub fn new(transport: &'t T, config: ProtocolConfig) -> Self {
    let params = TransferParams::defaults(&config);
    Self {
      transport,
      config,
      state: SessionState::InterfaceClaimed,
      params,
    }
  }

  pub fn state(&self) -> SessionState {
    self.state
  }

  pub fn params(&self) -> TransferParams {
    self.params
  }

  /// Send `"ODIN"` and verify the device replies with `"LOKE"` within the
  /// handshake timeout. Skipped entirely when resuming a prior session.
  pub fn init_protocol(&mut self, resume: bool) -> Result<()> {
    if resume {
      tracing::debug!("resume requested, skipping ODIN/LOKE handshake");
      self.state = SessionState::SessionOpen;
      return Ok(());
    }

    tracing::debug!("sending ODIN handshake");
    self.transport.send_bulk(b"ODIN", self.config.handshake_timeout)?;

    let reply = self.transport.receive_bulk(7, self.config.handshake_timeout)?;
    if reply.len() < 4 || &reply[..4] != b"LOKE" {
      return Err(Error::Protocol {
        operation: "init_protocol".into(),
        expected: "LOKE".into(),
        received: String::from_utf8_lossy(&reply).into_owned(),
      });
    }

    self.state = SessionState::ProtocolInitialised;
    Ok(())
  }

  /// Send `BeginSession` and, if the device advertises packet-size
  /// renegotiation support, follow up with `FilePartSize(1 MiB)`.
  pub fn begin_session(&mut self) -> Result<()> {
    let response = self.exchange(&Control::BeginSession, ResponseKind::Session)?;

    if response.result == 0 {
      tracing::debug!("device does not support packet-size renegotiation, keeping defaults");
      self.state = SessionState::SessionOpen;
      return Ok(());
    }

    tracing::info!(advertised = response.result, "negotiating enlarged packet size");
    let negotiated = self.exchange(
      &Control::FilePartSize {
        size: self.config.packet_size_enlarged,
      },
      ResponseKind::Session,
    )?;

    if negotiated.result != 0 {
      return Err(Error::Protocol {
        operation: "negotiate_packet_size".into(),
        expected: "result 0".into(),
        received: format!("result {}", negotiated.result),
      });
    }

    self.params = TransferParams::enlarged(&self.config);
    self.state = SessionState::SessionOpenEnlarged;
    Ok(())
  }

  /// Send `EnableTFlash` and require `result == 0`.
  pub fn enable_tflash(&mut self) -> Result<()> {
    let response = self.exchange(&Control::EnableTFlash, ResponseKind::Session)?;
    if response.result != 0 {
      return Err(Error::Protocol {
        operation: "enable_tflash".into(),
        expected: "result 0".into(),
        received: format!("result {}", response.result),
      });
    }
    Ok(())
  }

  /// Send `DeviceType` and return the bootloader-reported code.
  pub fn device_type(&mut self) -> Result<DeviceType> {
    let response = self.exchange(&Control::DeviceType, ResponseKind::Session)?;
    Ok(DeviceType(response.result))
  }

  /// Send `TotalBytes` ahead of any data transfer.
  pub fn total_bytes(&mut self, total_bytes: u32) -> Result<()> {
    self.exchange(&Control::TotalBytes { total_bytes }, ResponseKind::Session)?;
    Ok(())
  }

  /// `EndSession`, optionally followed by `Reboot`.
  pub fn end_session(&mut self, reboot: bool) -> Result<()> {
    self.state = SessionState::SessionClosing;
    self.exchange(&Control::EndSession, ResponseKind::EndSession)?;

    if reboot {
      self.exchange(&Control::Reboot, ResponseKind::EndSession)?;
    }

    Ok(())
  }

  /// Send a control frame and parse the matching response, using the
  /// session's current control timeout.
  pub(crate) fn exchange(&self, control: &Control, expected: ResponseKind) -> Result<Response> {
    self.send_control(control)?;
    self.receive_response(expected, self.config.control_timeout)
  }

  pub(crate) fn send_control(&self, control: &Control) -> Result<()> {
    let frame = control.pack();
    self.transport.send_bulk(&frame, self.config.control_timeout)
  }

  pub(crate) fn receive_response(&self, expected: ResponseKind, timeout: Duration) -> Result<Response> {
    let bytes = self.transport.receive_bulk(crate::packet::RESPONSE_FRAME_SIZE, timeout)?;
    Response::unpack(&bytes, expected)
  }

  pub(crate) fn empty_transfer(&self) -> Result<()> {
    self.transport.send_bulk(&[], self.config.empty_transfer_timeout)
  }

  /// Raw bulk-OUT send, used by the transfer engine for file-part and PIT
  /// payloads that aren't Control frames.
  pub(crate) fn transport_send(&self, data: &[u8], timeout: Duration) -> Result<()> {
    self.transport.send_bulk(data, timeout)
  }

  /// Raw bulk-IN receive, used by the transfer engine's PIT download path
  /// to read variable-size `ReceiveFilePart` buffers.
  pub(crate) fn transport_receive(&self, capacity: usize, timeout: Duration) -> Result<Vec<u8>> {
    self.transport.receive_bulk(capacity, timeout)
  }

  pub(crate) fn config(&self) -> &ProtocolConfig {
    &self.config
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::fake::FakeTransport;

  fn handshake_ok(fake: &FakeTransport) {
    fake.queue_response(b"LOKE\0\0\0".to_vec());
  }

  #[test]
  fn handshake_happy_path_reaches_protocol_initialised() {
    let fake = FakeTransport::new();
    handshake_ok(&fake);
    let mut session = Session::new(&fake, ProtocolConfig::default());
    session.init_protocol(false).unwrap();
    assert_eq!(session.state(), SessionState::ProtocolInitialised);
  }

  #[test]
  fn handshake_rejection_surfaces_protocol_error() {
    let fake = FakeTransport::new();
    fake.queue_response(b"NOPE".to_vec());
    let mut session = Session::new(&fake, ProtocolConfig::default());
    let err = session.init_protocol(false).unwrap_err();
    match err {
      Error::Protocol { expected, received, .. } => {
        assert_eq!(expected, "LOKE");
        assert_eq!(received, "NOPE");
      }
      other => panic!("expected Protocol error, got {other:?}"),
    }
  }

  #[test]
  fn resume_skips_handshake_straight_to_session_open() {
    let fake = FakeTransport::new();
    let mut session = Session::new(&fake, ProtocolConfig::default());
    session.init_protocol(true).unwrap();
    assert_eq!(session.state(), SessionState::SessionOpen);
    assert!(fake.sent.borrow().is_empty());
  }

  #[test]
  fn negotiation_skipped_when_result_is_zero() {
    let fake = FakeTransport::new();
    let mut response = [0u8; 8];
    response[0..4].copy_from_slice(&0x64u32.to_le_bytes());
    response[4..8].copy_from_slice(&0u32.to_le_bytes());
    fake.queue_response(response.to_vec());

    let mut session = Session::new(&fake, ProtocolConfig::default());
    session.begin_session().unwrap();

    assert_eq!(session.state(), SessionState::SessionOpen);
    assert_eq!(session.params().packet_size, 131_072);
    assert_eq!(session.params().sequence_max_length, 800);
  }

  #[test]
  fn negotiation_applied_when_result_is_nonzero() {
    let fake = FakeTransport::new();
    let mut begin_response = [0u8; 8];
    begin_response[0..4].copy_from_slice(&0x64u32.to_le_bytes());
    begin_response[4..8].copy_from_slice(&1024u32.to_le_bytes());
    fake.queue_response(begin_response.to_vec());

    let mut size_response = [0u8; 8];
    size_response[0..4].copy_from_slice(&0x64u32.to_le_bytes());
    fake.queue_response(size_response.to_vec());

    let mut session = Session::new(&fake, ProtocolConfig::default());
    session.begin_session().unwrap();

    assert_eq!(session.state(), SessionState::SessionOpenEnlarged);
    assert_eq!(session.params().packet_size, 1_048_576);
    assert_eq!(session.params().sequence_max_length, 30);
    assert_eq!(session.params().sequence_timeout, Duration::from_secs(120));
  }
}
