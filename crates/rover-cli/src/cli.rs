//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use rover_types::AttributeType;

/// Which link to open. At most one may be given; the config file supplies
/// the default otherwise.
#[derive(Debug, Clone, Default, Args)]
#[group(multiple = false)]
pub struct TransportArgs {
    /// Connect to a simulator or bridge at ADDR:PORT
    #[arg(long, value_name = "ADDR:PORT")]
    pub tcp: Option<String>,

    /// Connect over a serial port
    #[arg(long, value_name = "PORT")]
    pub serial: Option<String>,

    /// Connect over Bluetooth to the robot showing BOT_ID
    #[arg(long, value_name = "BOT_ID")]
    pub ble: Option<u16>,
}

#[derive(Parser)]
#[command(name = "rover")]
#[command(author, version, about = "CLI for Micromelon rovers", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Config file (defaults to <config dir>/rover/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Call timeout in milliseconds (overrides config)
    #[arg(short = 'T', long, global = true, value_name = "MS")]
    pub timeout: Option<u64>,

    #[command(flatten)]
    pub transport: TransportArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read one attribute from the robot
    Read {
        /// Attribute name, e.g. ultrasonic or STATE_OF_CHARGE
        #[arg(value_parser = parse_attribute)]
        attribute: AttributeType,
    },

    /// Write raw payload bytes to an attribute
    Write {
        /// Attribute name, e.g. motor_set
        #[arg(value_parser = parse_attribute)]
        attribute: AttributeType,

        /// Payload bytes, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_byte)]
        bytes: Vec<u8>,
    },

    /// Stream cached sensor values using sensor spam
    Monitor {
        /// Stop after this many seconds
        #[arg(short, long, default_value = "10")]
        seconds: u64,
    },

    /// Print link timing statistics
    Stats {
        /// Round trips to perform before reporting
        #[arg(short = 'n', long, default_value = "10")]
        samples: u32,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Parse an attribute by its protocol name, case-insensitively.
pub fn parse_attribute(value: &str) -> Result<AttributeType, String> {
    AttributeType::from_name(value).ok_or_else(|| {
        let known: Vec<_> = AttributeType::ALL
            .iter()
            .map(|a| a.name().to_lowercase())
            .collect();
        format!("unknown attribute '{value}' (expected one of: {})", known.join(", "))
    })
}

/// Parse a payload byte given as decimal (`200`) or hex (`0xC8`).
pub fn parse_byte(value: &str) -> Result<u8, String> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid byte '{value}': {e}"))
}
