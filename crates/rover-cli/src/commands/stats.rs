//! Stats command implementation.

use anyhow::{Context, Result};
use rover_core::RoverController;
use rover_types::AttributeType;

use crate::format::format_stats;

pub fn cmd_stats(rover: &RoverController, samples: u32, json: bool) -> Result<()> {
    for _ in 0..samples {
        rover
            .read_attribute(AttributeType::StateOfCharge, &[], None)
            .context("Timing sample failed")?;
    }
    let stats = rover
        .comms_timing_stats()
        .context("Failed to collect timing statistics")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print!("{}", format_stats(&stats));
    }
    Ok(())
}
