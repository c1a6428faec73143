//! Configuration file management.
//!
//! ```toml
//! tcp = "127.0.0.1:9000"
//!
//! [engine]
//! default_timeout_ms = 3000
//!
//! [engine.ble]
//! scan_timeout_ms = 10000
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rover_core::EngineConfig;
use serde::{Deserialize, Serialize};

use crate::cli::TransportArgs;

/// Configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default simulator address (ADDR:PORT)
    #[serde(default)]
    pub tcp: Option<String>,

    /// Default serial port
    #[serde(default)]
    pub serial: Option<String>,

    /// Default Bluetooth bot id
    #[serde(default)]
    pub ble: Option<u16>,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    /// Get the default config file path
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rover")
            .join("config.toml")
    }

    /// Load the config at `path`, or the default location.
    ///
    /// A missing default file yields defaults; a missing explicit file is an
    /// error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::path(), false),
        };
        if !explicit && !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config
            .engine
            .validate()
            .with_context(|| format!("Invalid engine settings in {}", path.display()))?;
        Ok(config)
    }

    /// Engine settings with command-line overrides applied.
    pub fn engine_config(&self, timeout_ms: Option<u64>) -> EngineConfig {
        let mut engine = self.engine.clone();
        if let Some(ms) = timeout_ms {
            engine.default_timeout_ms = ms;
        }
        engine
    }
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Tcp { address: String, port: u16 },
    Serial(String),
    Ble(u16),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Tcp { address, port } => write!(f, "tcp://{address}:{port}"),
            Target::Serial(port) => write!(f, "serial {port}"),
            Target::Ble(bot_id) => write!(f, "bot {bot_id}"),
        }
    }
}

/// Resolve the link from flags, falling back to the config file.
pub fn resolve_target(args: &TransportArgs, config: &Config) -> Result<Target> {
    if let Some(tcp) = &args.tcp {
        return parse_tcp(tcp);
    }
    if let Some(port) = &args.serial {
        return Ok(Target::Serial(port.clone()));
    }
    if let Some(bot_id) = args.ble {
        return Ok(Target::Ble(bot_id));
    }

    if let Some(tcp) = &config.tcp {
        return parse_tcp(tcp);
    }
    if let Some(port) = &config.serial {
        return Ok(Target::Serial(port.clone()));
    }
    if let Some(bot_id) = config.ble {
        return Ok(Target::Ble(bot_id));
    }
    bail!(
        "No robot specified. Pass --tcp, --serial or --ble, or set a default in {}",
        Config::path().display()
    )
}

fn parse_tcp(value: &str) -> Result<Target> {
    let (address, port) = value
        .rsplit_once(':')
        .with_context(|| format!("Expected ADDR:PORT, got '{value}'"))?;
    if address.is_empty() {
        bail!("Missing address in '{value}'");
    }
    let port = port
        .parse()
        .with_context(|| format!("Invalid port in '{value}'"))?;
    Ok(Target::Tcp {
        address: address.to_string(),
        port,
    })
}
