//! Command implementations for the CLI.

mod monitor;
mod read;
mod stats;
mod write;

pub use monitor::cmd_monitor;
pub use read::cmd_read;
pub use stats::cmd_stats;
pub use write::cmd_write;

use anyhow::{Context, Result};
use rover_core::{EngineConfig, RoverController};
use tracing::info;

use crate::config::Target;

/// Open a controller and connect it to `target`.
pub fn connect(target: &Target, engine: EngineConfig, quiet: bool) -> Result<RoverController> {
    let rover = RoverController::new(engine).context("Failed to start the engine")?;
    if !quiet {
        eprintln!("Connecting to {target}...");
    }
    let connected = match target {
        Target::Tcp { address, port } => rover.connect_ip(address, *port),
        Target::Serial(port) => rover.connect_serial(port),
        Target::Ble(bot_id) => rover.connect_ble(*bot_id),
    };
    let robot = connected.with_context(|| format!("Failed to connect to {target}"))?;
    info!(
        simulated = rover.connected_robot_is_simulated(),
        battery = ?robot.battery_percentage,
        "Connected"
    );
    Ok(rover)
}
