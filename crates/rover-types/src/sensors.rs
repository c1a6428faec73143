//! Layout of the bulk `ALL_SENSORS` buffer.
//!
//! While sensor spam is active the robot periodically pushes every sensor
//! value in one packet. Individual attributes are recovered by slicing the
//! buffer at fixed offsets.

use crate::types::AttributeType;

/// Byte range of one attribute inside the bulk buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSlot {
    /// Attribute stored at this slot.
    pub attribute: AttributeType,
    /// Offset from the start of the buffer.
    pub offset: usize,
    /// Number of bytes.
    pub len: usize,
}

/// Every attribute that can be served from the bulk buffer.
///
/// The byte at offset 57 is padding after the battery percentage and is
/// not exposed.
pub const SENSOR_LAYOUT: [SensorSlot; 9] = [
    slot(AttributeType::Ultrasonic, 0, 2),
    slot(AttributeType::Accl, 2, 6),
    slot(AttributeType::Gyro, 8, 12),
    slot(AttributeType::ColourAll, 20, 30),
    slot(AttributeType::TimeOfFlight, 50, 4),
    slot(AttributeType::BatteryVoltage, 54, 2),
    slot(AttributeType::StateOfCharge, 56, 1),
    slot(AttributeType::CurrentSensor, 58, 2),
    slot(AttributeType::GyroAccum, 60, 12),
];

/// Size of the bulk buffer pushed by current firmware.
pub const ALL_SENSORS_LEN: usize = 62;

const fn slot(attribute: AttributeType, offset: usize, len: usize) -> SensorSlot {
    SensorSlot {
        attribute,
        offset,
        len,
    }
}

/// Look up the slot for `attribute`, if it is part of the bulk buffer.
#[must_use]
pub fn sensor_slot(attribute: AttributeType) -> Option<SensorSlot> {
    SENSOR_LAYOUT
        .iter()
        .copied()
        .find(|slot| slot.attribute == attribute)
}

/// Extract `attribute` from a bulk buffer.
///
/// A slot that runs past the end of `buffer` is truncated to the bytes
/// present; a slot that starts past the end yields `None`.
///
/// # Examples
///
/// ```
/// use rover_types::{AttributeType, sensors::slice_sensor};
///
/// let buffer: Vec<u8> = (0..62).collect();
/// assert_eq!(slice_sensor(&buffer, AttributeType::Ultrasonic), Some(&[0u8, 1][..]));
/// assert_eq!(slice_sensor(&buffer, AttributeType::MotorSet), None);
/// ```
#[must_use]
pub fn slice_sensor(buffer: &[u8], attribute: AttributeType) -> Option<&[u8]> {
    let slot = sensor_slot(attribute)?;
    if slot.offset >= buffer.len() {
        return None;
    }
    let end = (slot.offset + slot.len).min(buffer.len());
    Some(&buffer[slot.offset..end])
}
