//! Platform-agnostic protocol types for Micromelon rovers.
//!
//! This crate holds the wire vocabulary shared by every transport: opcodes,
//! attribute identifiers, the packet codec, the bulk sensor layout and the
//! Bluetooth identifiers. It performs no I/O.
//!
//! # Example
//!
//! ```
//! use rover_types::{AttributeType, OpCode, Packet};
//!
//! let packet = Packet::new(OpCode::Write, AttributeType::SpamMode, vec![1]).unwrap();
//! assert_eq!(packet.encode().unwrap(), vec![1, 18, 1, 1]);
//! ```

pub mod binary;
pub mod error;
pub mod packet;
pub mod sensors;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use packet::{HEADER_LEN, MAX_PAYLOAD_LEN, Packet, START_BYTE};
pub use sensors::{ALL_SENSORS_LEN, SENSOR_LAYOUT, SensorSlot};
pub use types::{AttributeType, ConnectionStatus, OpCode, RunningState};
pub use uuid as uuids;
