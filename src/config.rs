//! Configuration management for throttlekit.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, ThrottleError};
use crate::throttle::{BandwidthConfig, DEFAULT_SUB_INTERVALS_PER_SECOND};

/// Main configuration for the throttlekit tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrottleKitConfig {
    /// Bandwidth throttling configuration
    #[serde(default)]
    pub throttling: ThrottlingConfig,

    /// Rate measurement configuration
    #[serde(default)]
    pub measurement: MeasurementConfig,

    /// Copy loop configuration
    #[serde(default)]
    pub io: IoConfig,
}

/// Bandwidth throttling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottlingConfig {
    /// Target rate in kilobits per second
    #[serde(default = "default_rate_kbps")]
    pub rate_kbps: i64,

    /// Ceiling that any rate is clamped to
    #[serde(default = "default_absolute_max")]
    pub absolute_max_bytes_per_second: u64,

    /// Budget resets per second
    #[serde(default = "default_sub_intervals")]
    pub sub_intervals_per_second: u32,

    /// Share of the rate available to payload bytes
    #[serde(default = "default_payload_fraction")]
    pub payload_fraction: f64,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            rate_kbps: default_rate_kbps(),
            absolute_max_bytes_per_second: default_absolute_max(),
            sub_intervals_per_second: default_sub_intervals(),
            payload_fraction: default_payload_fraction(),
        }
    }
}

fn default_rate_kbps() -> i64 {
    1024
}

fn default_absolute_max() -> u64 {
    // 1 Gbit/s
    125_000_000
}

fn default_sub_intervals() -> u32 {
    DEFAULT_SUB_INTERVALS_PER_SECOND
}

fn default_payload_fraction() -> f64 {
    1.0
}

impl ThrottlingConfig {
    /// Payload bytes per second the configured rate works out to.
    pub fn effective_bytes_per_second(&self) -> u64 {
        let requested = (self.rate_kbps.max(0) as u64).saturating_mul(1024) / 8;
        let max = requested.min(self.absolute_max_bytes_per_second);
        (max as f64 * self.payload_fraction).floor() as u64
    }

    /// Throttler construction parameters derived from this configuration.
    pub fn bandwidth_config(&self) -> BandwidthConfig {
        BandwidthConfig {
            absolute_max_bytes_per_second: self.absolute_max_bytes_per_second,
            sub_intervals_per_second: self.sub_intervals_per_second,
            payload_fraction: self.payload_fraction,
        }
    }
}

/// Rate measurement configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Log the measured output rate once per second
    #[serde(default)]
    pub enabled: bool,
}

/// Copy loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    /// Size of the buffer used for each read
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_buffer_size() -> usize {
    8192
}

impl ThrottleKitConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ThrottleKitConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ThrottleError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges before any throttler is built.
    pub fn validate(&self) -> Result<()> {
        let throttling = &self.throttling;
        if throttling.rate_kbps <= 0 {
            return Err(ThrottleError::Config(format!(
                "rate_kbps must be positive, got {}",
                throttling.rate_kbps
            )));
        }
        if throttling.absolute_max_bytes_per_second == 0 {
            return Err(ThrottleError::Config(
                "absolute_max_bytes_per_second must be positive".to_string(),
            ));
        }
        let sub_intervals = throttling.sub_intervals_per_second;
        if sub_intervals == 0 || sub_intervals > 1000 || 1000 % sub_intervals != 0 {
            return Err(ThrottleError::Config(format!(
                "sub_intervals_per_second must divide 1000, got {}",
                sub_intervals
            )));
        }
        if !(throttling.payload_fraction > 0.0 && throttling.payload_fraction <= 1.0) {
            return Err(ThrottleError::Config(format!(
                "payload_fraction must be in (0, 1], got {}",
                throttling.payload_fraction
            )));
        }
        let effective = throttling.effective_bytes_per_second();
        if effective < sub_intervals as u64 {
            return Err(ThrottleError::Config(format!(
                "rate of {} bytes/s is below one byte per sub-interval ({} per second)",
                effective, sub_intervals
            )));
        }
        if self.io.buffer_size == 0 {
            return Err(ThrottleError::Config("buffer_size must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ThrottleKitConfig::default();
        assert_eq!(config.throttling.rate_kbps, 1024);
        assert_eq!(config.throttling.sub_intervals_per_second, 20);
        assert_eq!(config.throttling.payload_fraction, 1.0);
        assert!(!config.measurement.enabled);
        assert_eq!(config.io.buffer_size, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
throttling:
  rate_kbps: 256
measurement:
  enabled: true
"#;
        let config = ThrottleKitConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.throttling.rate_kbps, 256);
        assert_eq!(config.throttling.absolute_max_bytes_per_second, 125_000_000);
        assert!(config.measurement.enabled);
        assert_eq!(config.io.buffer_size, 8192);
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = ThrottleKitConfig::from_yaml("{}").unwrap();
        assert_eq!(config.throttling.rate_kbps, 1024);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let err = ThrottleKitConfig::from_yaml("throttling:\n  rate_kbps: 0\n").unwrap_err();
        assert!(matches!(err, ThrottleError::Config(_)));

        assert!(ThrottleKitConfig::from_yaml("throttling:\n  payload_fraction: 0.0\n").is_err());
        let yaml = "throttling:\n  sub_intervals_per_second: 0\n";
        assert!(ThrottleKitConfig::from_yaml(yaml).is_err());
        assert!(ThrottleKitConfig::from_yaml("io:\n  buffer_size: 0\n").is_err());
    }

    #[test]
    fn test_rejects_rates_the_throttler_cannot_schedule() {
        let yaml = "throttling:\n  sub_intervals_per_second: 501\n";
        let err = ThrottleKitConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ThrottleError::Config(_)));

        // 1 kbps is 128 bytes/s, too little for 1000 windows
        let yaml = "throttling:\n  rate_kbps: 1\n  sub_intervals_per_second: 1000\n";
        assert!(ThrottleKitConfig::from_yaml(yaml).is_err());

        let yaml = "throttling:\n  rate_kbps: 1\n  sub_intervals_per_second: 125\n";
        let config = ThrottleKitConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.throttling.effective_bytes_per_second(), 128);
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        let err = ThrottleKitConfig::from_yaml("throttling: [1, 2").unwrap_err();
        assert!(matches!(err, ThrottleError::Config(_)));
    }

    #[test]
    fn test_bandwidth_config_mapping() {
        let mut config = ThrottleKitConfig::default();
        config.throttling.sub_intervals_per_second = 10;
        config.throttling.payload_fraction = 0.9;

        let bandwidth = config.throttling.bandwidth_config();
        assert_eq!(bandwidth.absolute_max_bytes_per_second, 125_000_000);
        assert_eq!(bandwidth.sub_intervals_per_second, 10);
        assert_eq!(bandwidth.payload_fraction, 0.9);
    }
}
