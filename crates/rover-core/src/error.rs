//! Error types for rover-core.
//!
//! Every fallible engine operation returns [`Result<T>`]. Errors raised while
//! a unit of work runs on the engine thread are carried back to the blocking
//! caller as values; they never cross threads as panics.
//!
//! # Recovery
//!
//! | Error Type | Strategy |
//! |------------|----------|
//! | [`Error::Timeout`] | Retry; the robot may be busy or the link congested |
//! | [`Error::NotConnected`] | Reconnect |
//! | [`Error::Device`] | Do not retry; check the firmware version |
//! | [`Error::Cancelled`] | The engine was reset; reissue after reconnecting |
//! | [`Error::Io`] / [`Error::Serial`] / [`Error::Bluetooth`] | Reconnect |
//! | [`Error::DeviceNotFound`] | Check the bot id and that the robot is on |
//! | [`Error::EngineStopped`] | Construct a new communicator |

use std::time::Duration;

use thiserror::Error;

use rover_types::{AttributeType, OpCode, ParseError};

/// Errors that can occur when talking to a rover.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Operation attempted with no connected transport.
    #[error("Not connected to rover")]
    NotConnected,

    /// No resolving packet arrived before the deadline.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// The robot answered a request with an `ERROR_*` opcode.
    #[error("{message} ({op_code} on {attribute}, request: {request})")]
    Device {
        /// Attribute of the failed request.
        attribute: AttributeType,
        /// Error opcode returned by the robot.
        op_code: OpCode,
        /// Description of the request that failed.
        request: String,
        /// Human readable explanation.
        message: String,
    },

    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Socket or stream I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// A received packet could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ParseError),

    /// The robot broke the protocol in a way the codec cannot describe.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The request was discarded by a reset or disconnect.
    #[error("Operation cancelled")]
    Cancelled,

    /// The robot was not found while scanning.
    #[error("Rover not found: {0}")]
    DeviceNotFound(String),

    /// Connecting to the robot failed.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The device identifier that failed to connect.
        device_id: Option<String>,
        /// Why the connection failed.
        reason: String,
    },

    /// A required GATT characteristic is missing.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The engine thread is not running.
    #[error("Engine is not running")]
    EngineStopped,

    /// A unit of work panicked on the engine thread.
    #[error("Engine task panicked: {0}")]
    TaskPanicked(String),
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a device error for an `ERROR_*` response.
    ///
    /// `ERROR_NOT_IMPLEMENTED` gets a firmware hint; other codes use the
    /// opcode name.
    pub fn device(attribute: AttributeType, op_code: OpCode, request: impl Into<String>) -> Self {
        let message = match op_code {
            OpCode::ErrorNotImplemented => format!(
                "{attribute} attribute not implemented on this robot. Check that firmware is updated."
            ),
            other => format!("Robot rejected request with {other}"),
        };
        Self::Device {
            attribute,
            op_code,
            request: request.into(),
            message,
        }
    }

    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(identifier.into())
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create a connection failure.
    pub fn connection_failed(device_id: Option<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            device_id,
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether the error came from the physical link rather than the robot.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Serial(_) | Self::Bluetooth(_))
    }
}

/// Result type alias using rover-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
