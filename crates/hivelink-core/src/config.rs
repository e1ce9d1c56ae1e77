//! Bridge configuration.
//!
//! Every knob has a default so the bridge is operable with zero
//! configuration; environment variables override individual values.
//! Unparseable values fall back to the default rather than failing startup.

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Default values for the bridge timing knobs.
pub mod defaults {
    /// How long a Sent command may wait for an ack before the sweep forces Timeout.
    pub const ACK_TIMEOUT_MS: u64 = 5_000;
    /// Command timeout sweep interval.
    pub const COMMAND_SWEEP_INTERVAL_MS: u64 = 1_000;
    /// How long a device may go unseen before it is marked offline.
    pub const OFFLINE_THRESHOLD_MS: u64 = 5_000;
    /// Offline sweep interval.
    pub const OFFLINE_SWEEP_INTERVAL_MS: u64 = 1_000;
    /// How long an OTA job may sit in Sent/Downloading before Timeout.
    pub const OTA_TIMEOUT_MS: u64 = 600_000;
    /// OTA timeout sweep interval.
    pub const OTA_SWEEP_INTERVAL_MS: u64 = 30_000;
    /// Publish retry budget.
    pub const PUBLISH_RETRIES: u32 = 3;
    /// Publish backoff ladder in milliseconds.
    pub const PUBLISH_BACKOFF_MS: [u64; 3] = [500, 1_000, 2_000];
    /// Gas concentration alarm threshold in ppm.
    pub const GAS_PPM_THRESHOLD: f64 = 500.0;
    /// Bin fill-level alarm threshold in percent.
    pub const BIN_LEVEL_THRESHOLD: f64 = 80.0;
}

/// Environment variable names.
pub mod env_vars {
    pub const ACK_TIMEOUT_MS: &str = "HIVELINK_ACK_TIMEOUT_MS";
    pub const COMMAND_SWEEP_INTERVAL_MS: &str = "HIVELINK_COMMAND_SWEEP_INTERVAL_MS";
    pub const OFFLINE_THRESHOLD_MS: &str = "HIVELINK_OFFLINE_THRESHOLD_MS";
    pub const OFFLINE_SWEEP_INTERVAL_MS: &str = "HIVELINK_OFFLINE_SWEEP_INTERVAL_MS";
    pub const OTA_TIMEOUT_MS: &str = "HIVELINK_OTA_TIMEOUT_MS";
    pub const OTA_SWEEP_INTERVAL_MS: &str = "HIVELINK_OTA_SWEEP_INTERVAL_MS";
    pub const PUBLISH_RETRIES: &str = "HIVELINK_PUBLISH_RETRIES";
    pub const PUBLISH_BACKOFF_MS: &str = "HIVELINK_PUBLISH_BACKOFF_MS";
    pub const CURRENT_THRESHOLD_A: &str = "HIVELINK_CURRENT_THRESHOLD_A";
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Parse a comma-separated backoff ladder, e.g. `"500,1000,2000"`.
///
/// Returns `None` when the string is empty or any segment fails to parse.
fn parse_backoff_ladder(s: &str) -> Option<Vec<u64>> {
    let delays: Option<Vec<u64>> = s
        .split(',')
        .map(|part| part.trim().parse::<u64>().ok())
        .collect();
    delays.filter(|d| !d.is_empty())
}

/// Alarm threshold configuration for telemetry admission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmThresholds {
    /// Gas concentration threshold in ppm.
    pub gas_ppm: f64,
    /// Bin fill-level threshold in percent.
    pub bin_level: f64,
    /// Optional current draw threshold in amperes. No alarm when unset.
    pub current_a: Option<f64>,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        Self {
            gas_ppm: defaults::GAS_PPM_THRESHOLD,
            bin_level: defaults::BIN_LEVEL_THRESHOLD,
            current_a: None,
        }
    }
}

/// Timing, retry and threshold configuration for the bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    /// How long a Sent command may wait for an ack (ms).
    pub ack_timeout_ms: u64,
    /// Command sweep interval (ms).
    pub command_sweep_interval_ms: u64,
    /// Device offline threshold (ms).
    pub offline_threshold_ms: u64,
    /// Offline sweep interval (ms).
    pub offline_sweep_interval_ms: u64,
    /// OTA job timeout (ms).
    pub ota_timeout_ms: u64,
    /// OTA sweep interval (ms).
    pub ota_sweep_interval_ms: u64,
    /// Publish retry policy.
    pub publish_retry: RetryPolicy,
    /// Telemetry alarm thresholds.
    pub thresholds: AlarmThresholds,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: defaults::ACK_TIMEOUT_MS,
            command_sweep_interval_ms: defaults::COMMAND_SWEEP_INTERVAL_MS,
            offline_threshold_ms: defaults::OFFLINE_THRESHOLD_MS,
            offline_sweep_interval_ms: defaults::OFFLINE_SWEEP_INTERVAL_MS,
            ota_timeout_ms: defaults::OTA_TIMEOUT_MS,
            ota_sweep_interval_ms: defaults::OTA_SWEEP_INTERVAL_MS,
            publish_retry: RetryPolicy::new(
                defaults::PUBLISH_RETRIES,
                defaults::PUBLISH_BACKOFF_MS.to_vec(),
            ),
            thresholds: AlarmThresholds::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let base = Self::default();

        let backoff = std::env::var(env_vars::PUBLISH_BACKOFF_MS)
            .ok()
            .and_then(|s| parse_backoff_ladder(&s))
            .unwrap_or(base.publish_retry.delays_ms);

        let current_a = std::env::var(env_vars::CURRENT_THRESHOLD_A)
            .ok()
            .and_then(|s| s.parse().ok());

        Self {
            ack_timeout_ms: env_u64(env_vars::ACK_TIMEOUT_MS, base.ack_timeout_ms),
            command_sweep_interval_ms: env_u64(
                env_vars::COMMAND_SWEEP_INTERVAL_MS,
                base.command_sweep_interval_ms,
            ),
            offline_threshold_ms: env_u64(env_vars::OFFLINE_THRESHOLD_MS, base.offline_threshold_ms),
            offline_sweep_interval_ms: env_u64(
                env_vars::OFFLINE_SWEEP_INTERVAL_MS,
                base.offline_sweep_interval_ms,
            ),
            ota_timeout_ms: env_u64(env_vars::OTA_TIMEOUT_MS, base.ota_timeout_ms),
            ota_sweep_interval_ms: env_u64(env_vars::OTA_SWEEP_INTERVAL_MS, base.ota_sweep_interval_ms),
            publish_retry: RetryPolicy::new(
                env_u32(env_vars::PUBLISH_RETRIES, base.publish_retry.max_retries),
                backoff,
            ),
            thresholds: AlarmThresholds {
                current_a,
                ..base.thresholds
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_operable() {
        let config = BridgeConfig::default();
        assert_eq!(config.ack_timeout_ms, 5_000);
        assert_eq!(config.ota_timeout_ms, 600_000);
        assert_eq!(config.publish_retry.max_retries, 3);
        assert_eq!(config.publish_retry.delays_ms, vec![500, 1000, 2000]);
        assert_eq!(config.thresholds.gas_ppm, 500.0);
        assert!(config.thresholds.current_a.is_none());
    }

    #[test]
    fn test_parse_backoff_ladder() {
        assert_eq!(
            parse_backoff_ladder("500,1000,2000"),
            Some(vec![500, 1000, 2000])
        );
        assert_eq!(parse_backoff_ladder(" 250 , 750 "), Some(vec![250, 750]));
        assert_eq!(parse_backoff_ladder("abc"), None);
        assert_eq!(parse_backoff_ladder("100,x"), None);
    }
}
