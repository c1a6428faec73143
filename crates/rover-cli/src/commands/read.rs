//! Read command implementation.

use anyhow::{Context, Result};
use rover_core::RoverController;
use rover_types::AttributeType;

use crate::format::format_reading;

pub fn cmd_read(rover: &RoverController, attribute: AttributeType) -> Result<()> {
    let data = rover
        .read_attribute(attribute, &[], None)
        .with_context(|| format!("Failed to read {attribute}"))?;
    println!("{}", format_reading(attribute, &data));
    Ok(())
}
