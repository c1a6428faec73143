//! Hardware integration tests for rover-core
//!
//! These tests require a powered rover in Bluetooth range and should be run with:
//! ```
//! cargo test --package rover-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! Configure the robot via environment variables:
//! - `ROVER_BOT_ID`: numeric bot id printed on the robot (required)
//! - `ROVER_SERIAL_PORT`: serial device for the UART tests
//!
//! Example:
//! ```
//! ROVER_BOT_ID=42 cargo test --package rover-core --test hardware_tests -- --ignored --nocapture
//! ```

use std::env;
use std::time::Duration;

use rover_core::{AttributeType, ConnectionStatus, EngineConfig, RetryConfig, RoverController};

/// Default timeout for BLE transactions
const BLE_TIMEOUT: Duration = Duration::from_secs(5);

fn bot_id() -> Option<u16> {
    env::var("ROVER_BOT_ID")
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn serial_port() -> Option<String> {
    env::var("ROVER_SERIAL_PORT").ok().filter(|s| !s.is_empty())
}

fn controller() -> RoverController {
    RoverController::new(EngineConfig::default().default_timeout(BLE_TIMEOUT)).unwrap()
}

// =============================================================================
// Bluetooth
// =============================================================================

#[test]
#[ignore = "requires BLE hardware"]
fn test_ble_connect_and_interrogate() {
    let Some(bot_id) = bot_id() else {
        println!("Skipping: ROVER_BOT_ID not set");
        return;
    };

    let rover = controller();
    let info = rover
        .connect_ble_with_retry(bot_id, &RetryConfig::for_connect())
        .expect("connect to rover");
    println!("Connected to bot {bot_id}: {info:?}");

    assert!(rover.is_connected());
    assert!(rover.communicator().is_bluetooth());
    assert_eq!(
        rover.communicator().connection_status(),
        ConnectionStatus::Connected
    );
    assert!(!rover.connected_robot_is_simulated());

    if let Some(battery) = info.battery_percentage {
        assert!(battery <= 100, "battery out of range: {battery}");
    }

    rover.end().unwrap();
}

#[test]
#[ignore = "requires BLE hardware"]
fn test_ble_sensor_spam() {
    let Some(bot_id) = bot_id() else {
        println!("Skipping: ROVER_BOT_ID not set");
        return;
    };

    let rover = controller();
    rover.connect_ble(bot_id).unwrap();
    rover.start_rover(Some(true)).unwrap();
    std::thread::sleep(Duration::from_millis(500));

    let comms = rover.communicator();
    assert!(comms.sensor_spam_active());
    println!("Cache valid for {:?}", comms.cache_use_by());

    let ultrasonic = rover
        .read_attribute(AttributeType::Ultrasonic, &[], None)
        .unwrap();
    assert_eq!(ultrasonic.len(), 2);
    println!("Ultrasonic: {ultrasonic:?}");

    rover.stop_rover();
    rover.end().unwrap();
}

#[test]
#[ignore = "requires BLE hardware"]
fn test_ble_heartbeat_pause_keeps_link() {
    let Some(bot_id) = bot_id() else {
        println!("Skipping: ROVER_BOT_ID not set");
        return;
    };

    let rover = controller();
    rover.connect_ble(bot_id).unwrap();

    let comms = rover.communicator();
    comms.pause_heartbeat(true);
    std::thread::sleep(Duration::from_secs(3));
    comms.pause_heartbeat(false);
    std::thread::sleep(Duration::from_secs(3));
    assert!(comms.is_connected());

    let stats = rover.comms_timing_stats().unwrap();
    println!("Timing: {stats:?}");

    rover.end().unwrap();
}

#[test]
#[ignore = "requires BLE hardware"]
fn test_ble_user_disconnect() {
    let Some(bot_id) = bot_id() else {
        println!("Skipping: ROVER_BOT_ID not set");
        return;
    };

    let rover = controller();
    rover.connect_ble(bot_id).unwrap();
    let mut status = rover.communicator().watch_status();

    rover.disconnect();
    assert!(!rover.is_connected());
    assert_eq!(*status.borrow_and_update(), ConnectionStatus::Disconnected);
    assert!(
        rover
            .read_attribute(AttributeType::StateOfCharge, &[], None)
            .is_err()
    );

    rover.end().unwrap();
}

// =============================================================================
// Serial
// =============================================================================

#[test]
#[ignore = "requires a rover on a serial port"]
fn test_serial_connect() {
    let Some(port) = serial_port() else {
        println!("Skipping: ROVER_SERIAL_PORT not set");
        return;
    };

    let rover = controller();
    let info = rover.connect_serial(&port).unwrap();
    println!("Connected on {port}: {info:?}");
    assert!(rover.communicator().is_serial());

    rover.end().unwrap();
}
