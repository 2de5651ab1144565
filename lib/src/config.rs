//! Protocol tunables.
//!
//! Handshake/control/sequence timeouts, default and enlarged packet sizes,
//! and the Samsung VID/PID list are exposed as a `serde`-deserializable
//! struct rather than baked-in constants, so a caller can override them from
//! a config file or environment for an unusual device without touching
//! protocol code.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::transport::DeviceIdentifier;

/// Samsung's USB vendor ID.
pub const VENDOR_ID_SAMSUNG: u16 = 0x04E8;

/// Known download-mode product IDs. Not exhaustive — devices outside this
/// list simply won't be detected by [`crate::Orchestrator::detect`].
pub const KNOWN_PRODUCT_IDS: &[u16] = &[0x6601, 0x685D, 0x68C3];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolConfig {
  /// (vendor, product) pairs accepted during device enumeration.
  pub supported_devices: Vec<DeviceIdentifier>,

  /// Timeout for the ODIN/LOKE handshake.
  #[serde(with = "duration_millis")]
  pub handshake_timeout: Duration,

  /// Timeout for ordinary control exchanges (session setup, PIT control frames).
  #[serde(with = "duration_millis")]
  pub control_timeout: Duration,

  /// Timeout for zero-length framing transfers.
  #[serde(with = "duration_millis")]
  pub empty_transfer_timeout: Duration,

  /// End-of-sequence acknowledgement timeout before packet-size negotiation.
  #[serde(with = "duration_millis")]
  pub sequence_timeout_default: Duration,

  /// End-of-sequence acknowledgement timeout after packet-size negotiation.
  #[serde(with = "duration_millis")]
  pub sequence_timeout_enlarged: Duration,

  pub packet_size_default: u32,
  pub packet_size_enlarged: u32,

  pub sequence_max_length_default: u32,
  pub sequence_max_length_enlarged: u32,

  pub retry: RetryPolicy,
}

impl Default for ProtocolConfig {
  fn default() -> Self {
    Self {
      supported_devices: KNOWN_PRODUCT_IDS
        .iter()
        .map(|&pid| DeviceIdentifier(VENDOR_ID_SAMSUNG, pid))
        .collect(),
      handshake_timeout: Duration::from_secs(1),
      control_timeout: Duration::from_secs(6),
      empty_transfer_timeout: Duration::from_millis(100),
      sequence_timeout_default: Duration::from_secs(30),
      sequence_timeout_enlarged: Duration::from_secs(120),
      packet_size_default: 131_072,
      packet_size_enlarged: 1_048_576,
      sequence_max_length_default: 800,
      sequence_max_length_enlarged: 30,
      retry: RetryPolicy::default(),
    }
  }
}

/// Bulk-transfer retry discipline: `max(250ms, base_delay) * (attempt + 1)`,
/// retried up to `max_attempts` times. Externalized (rather than hardcoded in
/// the transport) so tests can inject a zero-delay policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
  pub max_attempts: u32,
  #[serde(with = "duration_millis")]
  pub base_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      base_delay: Duration::from_millis(250),
    }
  }
}

impl RetryPolicy {
  /// Delay to sleep before the given zero-indexed retry attempt.
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    let base = self.base_delay.max(Duration::from_millis(250));
    base * (attempt + 1)
  }
}

mod duration_millis {
  use serde::{Deserialize, Deserializer, Serialize, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    (value.as_millis() as u64).serialize(serializer)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_config_matches_spec_constants() {
    let config = ProtocolConfig::default();
    assert_eq!(config.packet_size_default, 131_072);
    assert_eq!(config.packet_size_enlarged, 1_048_576);
    assert_eq!(config.sequence_max_length_default, 800);
    assert_eq!(config.sequence_max_length_enlarged, 30);
    assert_eq!(config.supported_devices.len(), KNOWN_PRODUCT_IDS.len());
  }

  #[test]
  fn retry_delay_enforces_floor_and_scales_linearly() {
    let policy = RetryPolicy {
      max_attempts: 5,
      base_delay: Duration::from_millis(10),
    };
    assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
    assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
    assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1250));
  }

  #[test]
  fn config_round_trips_through_json() {
    let config = ProtocolConfig::default();
    let json = serde_json::to_string(&config).expect("serialize");
    let restored: ProtocolConfig = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(restored.packet_size_default, config.packet_size_default);
    assert_eq!(restored.supported_devices, config.supported_devices);
  }
}
