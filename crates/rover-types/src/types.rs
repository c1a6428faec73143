//! Core protocol enumerations for the rover.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Packet operation code.
///
/// The first byte of every packet. `Read` and `Write` are requests sent by
/// the host; the remaining codes are responses or pushes from the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum OpCode {
    /// Read an attribute.
    Read = 0,
    /// Write an attribute.
    Write = 1,
    /// Successful reply to a request.
    Ack = 2,
    /// Unsolicited push from the robot.
    Notify = 3,
    /// The robot did not recognise the request opcode.
    ErrorInvalidOpCode = 4,
    /// The request payload had the wrong size for the attribute.
    ErrorInvalidPayloadSize = 5,
    /// The request failed checksum validation.
    ErrorInvalidChecksum = 6,
    /// The attribute is not implemented by this firmware.
    ErrorNotImplemented = 7,
}

impl OpCode {
    /// Every opcode, in wire order.
    pub const ALL: [OpCode; 8] = [
        OpCode::Read,
        OpCode::Write,
        OpCode::Ack,
        OpCode::Notify,
        OpCode::ErrorInvalidOpCode,
        OpCode::ErrorInvalidPayloadSize,
        OpCode::ErrorInvalidChecksum,
        OpCode::ErrorNotImplemented,
    ];

    /// Wire value.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this opcode reports a failed request.
    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(
            self,
            OpCode::ErrorInvalidOpCode
                | OpCode::ErrorInvalidPayloadSize
                | OpCode::ErrorInvalidChecksum
                | OpCode::ErrorNotImplemented
        )
    }

    /// Upper-case protocol name, as used in log output.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Read => "READ",
            OpCode::Write => "WRITE",
            OpCode::Ack => "ACK",
            OpCode::Notify => "NOTIFY",
            OpCode::ErrorInvalidOpCode => "ERROR_INVALID_OP_CODE",
            OpCode::ErrorInvalidPayloadSize => "ERROR_INVALID_PAYLOAD_SIZE",
            OpCode::ErrorInvalidChecksum => "ERROR_INVALID_CHECKSUM",
            OpCode::ErrorNotImplemented => "ERROR_NOT_IMPLEMENTED",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ParseError;

    /// Convert a byte value to an `OpCode`.
    ///
    /// # Examples
    ///
    /// ```
    /// use rover_types::OpCode;
    ///
    /// assert_eq!(OpCode::try_from(2), Ok(OpCode::Ack));
    /// assert!(OpCode::try_from(0x42).is_err());
    /// ```
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        OpCode::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(ParseError::UnknownOpCode(value))
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifier of a readable or writable robot attribute.
///
/// The set is fixed by the robot firmware. Values outside it are rejected
/// by [`TryFrom<u8>`] rather than carried around as raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum AttributeType {
    /// Left/right motor set-points.
    MotorSet = 0,
    /// Turn by a number of degrees using the IMU.
    TurnDegrees = 1,
    /// Servo positions.
    ServoMotors = 2,
    /// RGB LED colours.
    Rgbs = 3,
    /// Buzzer frequency.
    BuzzerFreq = 4,
    /// Buzzer tune playback.
    BuzzerTune = 5,
    /// Text on the robot display.
    DisplayText = 6,
    /// Ultrasonic distance.
    Ultrasonic = 7,
    /// Accelerometer.
    Accl = 8,
    /// Gyroscope.
    Gyro = 9,
    /// Accumulated gyroscope angles.
    GyroAccum = 10,
    /// All colour sensor channels.
    ColourAll = 11,
    /// Time-of-flight (IR) distance sensors.
    TimeOfFlight = 12,
    /// Battery voltage.
    BatteryVoltage = 13,
    /// Battery percentage.
    StateOfCharge = 14,
    /// Battery current.
    CurrentSensor = 15,
    /// Button press / running state.
    ButtonPress = 16,
    /// Sensor error bit mask.
    SensorErrors = 17,
    /// Enables or disables the bulk sensor push.
    SpamMode = 18,
    /// Interval of the bulk sensor push in milliseconds.
    SpamRate = 19,
    /// Bulk buffer of every sensor value.
    AllSensors = 20,
    /// Selects UART (expansion header) or Bluetooth control.
    ControlMode = 21,
    /// I2C passthrough on the expansion header.
    I2cHeader = 22,
    /// Non-zero when the robot is a simulator instance.
    SimulatorInfo = 23,
    /// Camera capture from a Raspberry Pi backpack.
    RpiImage = 24,
    /// Robot display name.
    RobotName = 25,
    /// Numeric robot id.
    BotId = 26,
}

impl AttributeType {
    /// Every attribute type, in wire order.
    pub const ALL: [AttributeType; 27] = [
        AttributeType::MotorSet,
        AttributeType::TurnDegrees,
        AttributeType::ServoMotors,
        AttributeType::Rgbs,
        AttributeType::BuzzerFreq,
        AttributeType::BuzzerTune,
        AttributeType::DisplayText,
        AttributeType::Ultrasonic,
        AttributeType::Accl,
        AttributeType::Gyro,
        AttributeType::GyroAccum,
        AttributeType::ColourAll,
        AttributeType::TimeOfFlight,
        AttributeType::BatteryVoltage,
        AttributeType::StateOfCharge,
        AttributeType::CurrentSensor,
        AttributeType::ButtonPress,
        AttributeType::SensorErrors,
        AttributeType::SpamMode,
        AttributeType::SpamRate,
        AttributeType::AllSensors,
        AttributeType::ControlMode,
        AttributeType::I2cHeader,
        AttributeType::SimulatorInfo,
        AttributeType::RpiImage,
        AttributeType::RobotName,
        AttributeType::BotId,
    ];

    /// Wire value.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Upper-case protocol name, as used in log output and error messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            AttributeType::MotorSet => "MOTOR_SET",
            AttributeType::TurnDegrees => "TURN_DEGREES",
            AttributeType::ServoMotors => "SERVO_MOTORS",
            AttributeType::Rgbs => "RGBS",
            AttributeType::BuzzerFreq => "BUZZER_FREQ",
            AttributeType::BuzzerTune => "BUZZER_TUNE",
            AttributeType::DisplayText => "DISPLAY_TEXT",
            AttributeType::Ultrasonic => "ULTRASONIC",
            AttributeType::Accl => "ACCL",
            AttributeType::Gyro => "GYRO",
            AttributeType::GyroAccum => "GYRO_ACCUM",
            AttributeType::ColourAll => "COLOUR_ALL",
            AttributeType::TimeOfFlight => "TIME_OF_FLIGHT",
            AttributeType::BatteryVoltage => "BATTERY_VOLTAGE",
            AttributeType::StateOfCharge => "STATE_OF_CHARGE",
            AttributeType::CurrentSensor => "CURRENT_SENSOR",
            AttributeType::ButtonPress => "BUTTON_PRESS",
            AttributeType::SensorErrors => "SENSOR_ERRORS",
            AttributeType::SpamMode => "SPAM_MODE",
            AttributeType::SpamRate => "SPAM_RATE",
            AttributeType::AllSensors => "ALL_SENSORS",
            AttributeType::ControlMode => "CONTROL_MODE",
            AttributeType::I2cHeader => "I2C_HEADER",
            AttributeType::SimulatorInfo => "SIMULATOR_INFO",
            AttributeType::RpiImage => "RPI_IMAGE",
            AttributeType::RobotName => "ROBOT_NAME",
            AttributeType::BotId => "BOTID",
        }
    }

    /// Look up an attribute by its protocol name (case-insensitive).
    ///
    /// # Examples
    ///
    /// ```
    /// use rover_types::AttributeType;
    ///
    /// assert_eq!(AttributeType::from_name("ultrasonic"), Some(AttributeType::Ultrasonic));
    /// assert_eq!(AttributeType::from_name("STATE_OF_CHARGE"), Some(AttributeType::StateOfCharge));
    /// assert_eq!(AttributeType::from_name("warp_drive"), None);
    /// ```
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let wanted = name.trim().replace('-', "_");
        AttributeType::ALL
            .into_iter()
            .find(|attr| attr.name().eq_ignore_ascii_case(&wanted))
    }
}

impl TryFrom<u8> for AttributeType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        AttributeType::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(ParseError::UnknownAttribute(value))
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Link state reported by a transport.
///
/// BLE walks the full sequence; serial and TCP jump straight from
/// `NotConnected` to `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConnectionStatus {
    /// No connection has been attempted, or the last search failed.
    #[default]
    NotConnected,
    /// Scanning for the robot's advertisement.
    Searching,
    /// Establishing the link.
    Connecting,
    /// Discovering services and characteristics.
    Interrogating,
    /// Ready for traffic.
    Connected,
    /// The link was closed by the user or lost.
    Disconnected,
}

impl ConnectionStatus {
    /// Whether traffic may be sent.
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::NotConnected => write!(f, "not connected"),
            ConnectionStatus::Searching => write!(f, "searching"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Interrogating => write!(f, "interrogating"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Program state written to [`AttributeType::ButtonPress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum RunningState {
    /// The host program has ended.
    Closed = 0,
    /// The host program is running.
    Running = 1,
    /// The host program is paused.
    Paused = 2,
}

impl From<RunningState> for u8 {
    fn from(state: RunningState) -> Self {
        state as u8
    }
}
