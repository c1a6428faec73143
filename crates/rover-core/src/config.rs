//! Engine configuration.
//!
//! Durations are stored in milliseconds so the configuration reads naturally
//! as TOML:
//!
//! ```toml
//! default_timeout_ms = 3000
//! serial_baud_rate = 115200
//!
//! [ble]
//! scan_timeout_ms = 10000
//! heartbeat_interval_ms = 4000
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rover_types::uuids::DEVICE_NAME_PREFIX;

use crate::error::{Error, Result};

/// Top-level engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout applied when a call passes `None`.
    pub default_timeout_ms: u64,
    /// Baud rate for serial links.
    pub serial_baud_rate: u32,
    /// How long a bulk sensor push stays valid before sensor spam reconfigures it.
    pub cache_use_by_ms: u64,
    /// Bluetooth settings.
    pub ble: BleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 3_000,
            serial_baud_rate: 115_200,
            cache_use_by_ms: 250,
            ble: BleConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default call timeout.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the serial baud rate.
    #[must_use]
    pub fn serial_baud_rate(mut self, baud: u32) -> Self {
        self.serial_baud_rate = baud;
        self
    }

    /// Set the initial cache use-by interval.
    #[must_use]
    pub fn cache_use_by(mut self, use_by: Duration) -> Self {
        self.cache_use_by_ms = duration_ms(use_by);
        self
    }

    /// Replace the Bluetooth settings.
    #[must_use]
    pub fn ble(mut self, ble: BleConfig) -> Self {
        self.ble = ble;
        self
    }

    /// Default call timeout as a [`Duration`].
    pub fn default_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Cache use-by interval as a [`Duration`].
    pub fn cache_use_by_duration(&self) -> Duration {
        Duration::from_millis(self.cache_use_by_ms)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::invalid_config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::invalid_config(format!("failed to serialize config: {e}")))
    }

    /// Reject zero timeouts, intervals and baud rates.
    pub fn validate(&self) -> Result<()> {
        require_nonzero("default_timeout_ms", self.default_timeout_ms)?;
        require_nonzero("cache_use_by_ms", self.cache_use_by_ms)?;
        if self.serial_baud_rate == 0 {
            return Err(Error::invalid_config("serial_baud_rate must be non-zero"));
        }
        self.ble.validate()
    }
}

/// Bluetooth connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// How long to scan for the advertisement.
    pub scan_timeout_ms: u64,
    /// Connection establishment timeout.
    pub connect_timeout_ms: u64,
    /// Service discovery timeout.
    pub discovery_timeout_ms: u64,
    /// Timeout for each characteristic write.
    pub io_timeout_ms: u64,
    /// Interval between liveness checks.
    pub heartbeat_interval_ms: u64,
    /// Timeout for a heartbeat read.
    pub heartbeat_timeout_ms: u64,
    /// Advertised name prefix, followed by the zero-padded bot id.
    pub name_prefix: String,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            discovery_timeout_ms: 10_000,
            io_timeout_ms: 2_000,
            heartbeat_interval_ms: 4_000,
            heartbeat_timeout_ms: 1_600,
            name_prefix: DEVICE_NAME_PREFIX.to_string(),
        }
    }
}

impl BleConfig {
    /// Advertised name for `bot_id`.
    pub fn device_name(&self, bot_id: u16) -> String {
        format!("{}{:04}", self.name_prefix, bot_id)
    }

    /// Scan timeout as a [`Duration`].
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Discovery timeout as a [`Duration`].
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Write timeout as a [`Duration`].
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat read timeout as a [`Duration`].
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        require_nonzero("ble.scan_timeout_ms", self.scan_timeout_ms)?;
        require_nonzero("ble.connect_timeout_ms", self.connect_timeout_ms)?;
        require_nonzero("ble.discovery_timeout_ms", self.discovery_timeout_ms)?;
        require_nonzero("ble.io_timeout_ms", self.io_timeout_ms)?;
        require_nonzero("ble.heartbeat_interval_ms", self.heartbeat_interval_ms)?;
        require_nonzero("ble.heartbeat_timeout_ms", self.heartbeat_timeout_ms)?;
        if self.heartbeat_timeout_ms >= self.heartbeat_interval_ms {
            return Err(Error::invalid_config(
                "ble.heartbeat_timeout_ms must be shorter than ble.heartbeat_interval_ms",
            ));
        }
        Ok(())
    }
}

fn require_nonzero(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(Error::invalid_config(format!("{field} must be non-zero")));
    }
    Ok(())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
