//! Write command implementation.

use anyhow::{Context, Result};
use rover_core::RoverController;
use rover_types::AttributeType;

use crate::format::format_bytes;

pub fn cmd_write(
    rover: &RoverController,
    attribute: AttributeType,
    bytes: &[u8],
    quiet: bool,
) -> Result<()> {
    let ack = rover
        .write_attribute(attribute, bytes, None)
        .with_context(|| format!("Failed to write {attribute}"))?;
    if !quiet {
        if ack.is_empty() {
            println!("{attribute}: acknowledged");
        } else {
            println!("{attribute}: acknowledged [{}]", format_bytes(&ack));
        }
    }
    Ok(())
}
