//! Monitor command implementation.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rover_core::RoverController;
use rover_types::AttributeType;

use crate::format::format_reading;

/// Attributes printed on every tick.
const MONITORED: [AttributeType; 2] = [AttributeType::Ultrasonic, AttributeType::StateOfCharge];

/// Never print faster than this, however quick the link is.
const MIN_TICK: Duration = Duration::from_millis(250);

pub fn cmd_monitor(rover: &RoverController, seconds: u64) -> Result<()> {
    rover
        .start_rover(Some(true))
        .context("Failed to start sensor spam")?;
    let result = watch(rover, Duration::from_secs(seconds));
    rover.stop_rover();
    result
}

fn watch(rover: &RoverController, duration: Duration) -> Result<()> {
    let tick = rover.communicator().cache_use_by().max(MIN_TICK);
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        thread::sleep(tick);
        let line = MONITORED
            .iter()
            .map(|&attribute| {
                rover
                    .read_attribute(attribute, &[], None)
                    .map(|data| format_reading(attribute, &data))
                    .with_context(|| format!("Failed to read {attribute}"))
            })
            .collect::<Result<Vec<_>>>()?
            .join("  ");
        println!("{line}");
    }
    Ok(())
}
