//! Communication engine for Micromelon rovers.
//!
//! This crate turns blocking calls from any number of threads ("set the
//! motors", "read the battery") into framed packets on whichever link is
//! active, and turns acknowledgements and notifications from the robot back
//! into results.
//!
//! # Features
//!
//! - **Three transports**: Bluetooth LE, serial UART and TCP (simulator)
//! - **Ordered dispatch**: one engine thread serializes all protocol state
//! - **Request correlation**: per-attribute FIFO matching of responses
//! - **Sensor spam**: cached reads from the robot's periodic sensor push
//! - **Adaptive polling**: push interval derived from measured write latency
//! - **BLE keepalive**: heartbeat reads detect silent link loss
//!
//! # Quick Start
//!
//! ```no_run
//! use rover_core::{EngineConfig, RoverController};
//! use rover_types::AttributeType;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let rover = RoverController::new(EngineConfig::default())?;
//!     let info = rover.connect_ip("127.0.0.1", 9000)?;
//!     println!("Battery: {:?}%", info.battery_percentage);
//!
//!     rover.start_rover(Some(true))?;
//!     let distance = rover.read_attribute(AttributeType::Ultrasonic, &[], None)?;
//!     println!("Ultrasonic: {distance:?}");
//!
//!     rover.stop_rover();
//!     rover.end()?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod communicator;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod retry;
pub mod transport;

pub use cache::ReadCache;
pub use communicator::{MotorWatcher, RobotCommunicator};
pub use config::{BleConfig, EngineConfig};
pub use controller::{MOTOR_OPERATION_TIMEOUT, RoverController, RoverInfo};
pub use dispatch::{Dispatcher, Pending};
pub use error::{Error, Result};
pub use metrics::{CommsTimingStats, MovingAverage};
pub use protocol::{NotifyCallback, UartController};
pub use retry::{RetryConfig, with_retry};
pub use transport::{Transport, TransportEvents, TransportKind};

// Re-export from rover-types
pub use rover_types::uuids;
pub use rover_types::{AttributeType, ConnectionStatus, OpCode, Packet, RunningState};
