//! Bluetooth identifiers for the rover.
//!
//! The robot exposes one primary service carrying a bidirectional UART
//! characteristic and a heartbeat characteristic used for liveness reads.

use uuid::{Uuid, uuid};

/// Primary service. A peripheral without it is not a rover.
pub const ROVER_SERVICE: Uuid = uuid!("00000001-0000-1000-8000-00805f9b34fb");

/// Packet transport characteristic (write with response + notify).
pub const UART_CHARACTERISTIC: Uuid = uuid!("00001111-0000-1000-8000-00805f9b34fb");

/// Liveness characteristic, read periodically by the heartbeat.
pub const HEARTBEAT_CHARACTERISTIC: Uuid = uuid!("00001112-0000-1000-8000-00805f9b34fb");

/// Prefix of the advertised device name.
pub const DEVICE_NAME_PREFIX: &str = "Micromelon";

/// Advertised name for a numeric bot id, e.g. `Micromelon0042`.
#[must_use]
pub fn device_name(bot_id: u16) -> String {
    format!("{DEVICE_NAME_PREFIX}{bot_id:04}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_name_zero_padded() {
        assert_eq!(device_name(7), "Micromelon0007");
        assert_eq!(device_name(1234), "Micromelon1234");
        assert_eq!(device_name(12345), "Micromelon12345");
    }

    #[test]
    fn test_uuids_are_distinct() {
        assert_ne!(ROVER_SERVICE, UART_CHARACTERISTIC);
        assert_ne!(UART_CHARACTERISTIC, HEARTBEAT_CHARACTERISTIC);
    }

    #[test]
    fn test_uuid_strings() {
        assert_eq!(
            UART_CHARACTERISTIC.to_string(),
            "00001111-0000-1000-8000-00805f9b34fb"
        );
        assert!(ROVER_SERVICE.to_string().starts_with("00000001"));
    }
}
