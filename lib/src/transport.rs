//! Abstract bulk-IN/bulk-OUT transport over a claimed USB interface.
//!
//! Hides the USB library behind a small trait (`Transport`) so the session
//! and transfer engines can be exercised against a fake in-memory
//! implementation in tests, and so a future non-rusb backend is a matter of
//! implementing the trait rather than touching protocol code. The concrete
//! `RusbTransport` claims a single CDC-Data interface with one bulk-IN and
//! one bulk-OUT endpoint.

use rusb::{Context, DeviceHandle, Direction, UsbContext};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ProtocolConfig;
use crate::{Error, Result, TransportErrorKind};

const USB_CLASS_CDC_DATA: u8 = 0x0A;

/// A USB vendor/product ID pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentifier(pub u16, pub u16);

/// Blocking bulk-IN/bulk-OUT primitives over a single claimed interface.
///
/// Implementors own the underlying device handle exclusively for their
/// lifetime; dropping a `Transport` must release the interface (and, on
/// Linux, reattach any kernel driver that was detached to claim it).
pub trait Transport {
  /// Send `data` out the bulk-OUT endpoint. `data.len() == 0` issues a
  /// zero-length framing transfer, which never retries regardless of the
  /// configured retry policy.
  fn send_bulk(&self, data: &[u8], timeout: Duration) -> Result<()>;

  /// Receive up to `capacity` bytes from the bulk-IN endpoint, returning
  /// exactly as many bytes as the device transferred (which may be less
  /// than `capacity` for variable-size packet families).
  fn receive_bulk(&self, capacity: usize, timeout: Duration) -> Result<Vec<u8>>;
}

#[derive(Debug)]
pub struct RusbTransport {
  handle: DeviceHandle<Context>,
  interface_number: u8,
  endpoint_in: u8,
  endpoint_out: u8,
  detached_driver: bool,
  retry: crate::config::RetryPolicy,
}

impl RusbTransport {
  /// Enumerate USB devices, open the first one matching a (vendor, product)
  /// pair in `config.supported_devices`, claim its CDC-Data interface, and
  /// locate the two bulk endpoints.
  pub fn open(config: &ProtocolConfig) -> Result<Self> {
    tracing::debug!("enumerating USB devices for a known Samsung download-mode interface");

    let context = Context::new()?;
    let device = context
      .devices()?
      .iter()
      .find(|device| {
        device
          .device_descriptor()
          .map(|desc| {
            config
              .supported_devices
              .iter()
              .any(|id| id.0 == desc.vendor_id() && id.1 == desc.product_id())
          })
          .unwrap_or(false)
      })
      .ok_or(Error::DeviceNotFound)?;

    let handle = device.open()?;
    let device = handle.device();
    let config_desc = device.active_config_descriptor()?;

    let mut found = None;
    for interface in config_desc.interfaces() {
      for descriptor in interface.descriptors() {
        if descriptor.class_code() != USB_CLASS_CDC_DATA {
          continue;
        }

        let mut endpoint_in = None;
        let mut endpoint_out = None;
        for ep in descriptor.endpoint_descriptors() {
          match ep.direction() {
            Direction::In => endpoint_in = Some(ep.address()),
            Direction::Out => endpoint_out = Some(ep.address()),
          }
        }

        if let (Some(in_addr), Some(out_addr)) = (endpoint_in, endpoint_out) {
          if descriptor.endpoint_descriptors().count() == 2 {
            found = Some((interface.number(), in_addr, out_addr));
            break;
          }
        }
      }
      if found.is_some() {
        break;
      }
    }

    let (interface_number, endpoint_in, endpoint_out) = found.ok_or_else(|| Error::Protocol {
      operation: "claim_interface".into(),
      expected: "a CDC-Data interface with two bulk endpoints".into(),
      received: "none found".into(),
    })?;

    let mut detached_driver = false;
    if handle.claim_interface(interface_number).is_err() {
      #[cfg(target_os = "linux")]
      {
        tracing::debug!("claim failed, attempting to detach kernel driver");
        let _ = handle.detach_kernel_driver(interface_number);
        detached_driver = true;
      }
      handle.claim_interface(interface_number)?;
    }

    tracing::info!(interface_number, endpoint_in, endpoint_out, "claimed USB interface");

    Ok(Self {
      handle,
      interface_number,
      endpoint_in,
      endpoint_out,
      detached_driver,
      retry: config.retry,
    })
  }
}

impl Transport for RusbTransport {
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip(self)))]
  fn send_bulk(&self, data: &[u8], timeout: Duration) -> Result<()> {
    if data.is_empty() {
      return self
        .handle
        .write_bulk(self.endpoint_out, data, timeout)
        .map(|_| ())
        .map_err(|e| transport_error(e, "empty send"));
    }

    let mut attempt = 0;
    loop {
      match self.handle.write_bulk(self.endpoint_out, data, timeout) {
        Ok(written) if written == data.len() => return Ok(()),
        Ok(written) => {
          tracing::warn!(written, expected = data.len(), "short bulk write");
          if attempt >= self.retry.max_attempts {
            return Err(Error::Transport {
              kind: TransportErrorKind::Io,
              context: "bulk send (short write)".into(),
            });
          }
        }
        Err(e) => {
          if attempt >= self.retry.max_attempts {
            return Err(transport_error(e, "bulk send"));
          }
          tracing::warn!(error = %e, attempt, "bulk send failed, retrying");
        }
      }

      std::thread::sleep(self.retry.delay_for_attempt(attempt));
      attempt += 1;
    }
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip(self)))]
  fn receive_bulk(&self, capacity: usize, timeout: Duration) -> Result<Vec<u8>> {
    if capacity == 0 {
      let mut dummy = [0u8; 1];
      return self
        .handle
        .read_bulk(self.endpoint_in, &mut dummy, timeout)
        .map(|_| Vec::new())
        .map_err(|e| transport_error(e, "empty receive"));
    }

    let mut attempt = 0;
    let mut buf = vec![0u8; capacity];
    loop {
      match self.handle.read_bulk(self.endpoint_in, &mut buf, timeout) {
        Ok(read) => {
          buf.truncate(read);
          return Ok(buf);
        }
        Err(e) => {
          if attempt >= self.retry.max_attempts {
            return Err(transport_error(e, "bulk receive"));
          }
          tracing::warn!(error = %e, attempt, "bulk receive failed, retrying");
        }
      }

      std::thread::sleep(self.retry.delay_for_attempt(attempt));
      attempt += 1;
      buf.resize(capacity, 0);
    }
  }
}

impl Drop for RusbTransport {
  fn drop(&mut self) {
    if let Err(e) = self.handle.release_interface(self.interface_number) {
      tracing::warn!(error = %e, "failed to release USB interface");
    }

    #[cfg(target_os = "linux")]
    if self.detached_driver {
      if let Err(e) = self.handle.attach_kernel_driver(self.interface_number) {
        tracing::warn!(error = %e, "failed to reattach kernel driver");
      }
    }
  }
}

fn transport_error(error: rusb::Error, context: &str) -> Error {
  let kind = match error {
    rusb::Error::Timeout => TransportErrorKind::Timeout,
    rusb::Error::Access | rusb::Error::Busy => TransportErrorKind::Access,
    rusb::Error::NoDevice | rusb::Error::Io => TransportErrorKind::Io,
    rusb::Error::Pipe | rusb::Error::Interrupted => TransportErrorKind::Reset,
    _ => TransportErrorKind::Io,
  };

  Error::Transport {
    kind,
    context: context.to_string(),
  }
}

#[cfg(test)]
pub(crate) mod fake {
  use super::*;
  use std::cell::RefCell;
  use std::collections::VecDeque;

  /// An in-memory transport for protocol tests: outbound bytes are recorded,
  /// inbound bytes are served from a preloaded queue.
  pub struct FakeTransport {
    pub sent: RefCell<Vec<Vec<u8>>>,
    pub inbound: RefCell<VecDeque<Vec<u8>>>,
    pub fail_next_receive: RefCell<bool>,
  }

  impl FakeTransport {
    pub fn new() -> Self {
      Self {
        sent: RefCell::new(Vec::new()),
        inbound: RefCell::new(VecDeque::new()),
        fail_next_receive: RefCell::new(false),
      }
    }

    pub fn queue_response(&self, bytes: Vec<u8>) {
      self.inbound.borrow_mut().push_back(bytes);
    }
  }

  impl Transport for FakeTransport {
    fn send_bulk(&self, data: &[u8], _timeout: Duration) -> Result<()> {
      self.sent.borrow_mut().push(data.to_vec());
      Ok(())
    }

    fn receive_bulk(&self, capacity: usize, _timeout: Duration) -> Result<Vec<u8>> {
      if *self.fail_next_receive.borrow() {
        *self.fail_next_receive.borrow_mut() = false;
        return Err(Error::Transport {
          kind: TransportErrorKind::Timeout,
          context: "fake failure".into(),
        });
      }

      let mut bytes = self
        .inbound
        .borrow_mut()
        .pop_front()
        .unwrap_or_else(|| vec![0u8; capacity]);
      if bytes.len() > capacity {
        bytes.truncate(capacity);
      }
      Ok(bytes)
    }
  }
}
