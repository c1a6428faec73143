//! High-level rover session.
//!
//! [`RoverController`] wraps a [`RobotCommunicator`] with the sequencing
//! user programs need: putting a serial-attached robot into UART mode,
//! interrogating the robot after connecting, entering and leaving the
//! running state, and waiting for motor operations that report completion
//! asynchronously.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use rover_types::binary::bytes_to_u16s;
use rover_types::{AttributeType, OpCode, RunningState};

use crate::communicator::RobotCommunicator;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::metrics::CommsTimingStats;
use crate::retry::{RetryConfig, with_retry};

/// How long a motor operation may take before giving up.
pub const MOTOR_OPERATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for each best-effort write in [`RoverController::stop_rover`].
const STOP_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// What the robot reported right after connecting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoverInfo {
    /// Simulator flag; `0` for a physical robot.
    pub simulator_info: u8,
    /// Battery charge in percent, if it could be read.
    pub battery_percentage: Option<u8>,
    /// Sensor error bit mask, if it could be read.
    pub sensor_error_mask: Option<u16>,
}

/// Session with one rover.
///
/// Construct one per robot; there is no process-wide instance.
///
/// ```no_run
/// use rover_core::{EngineConfig, RoverController};
/// use rover_types::AttributeType;
///
/// # fn main() -> rover_core::Result<()> {
/// let rover = RoverController::new(EngineConfig::default())?;
/// rover.connect_ble(42)?;
/// rover.start_rover(None)?;
/// rover.write_attribute(AttributeType::MotorSet, &[1, 30, 30, 0, 0, 0, 0], None)?;
/// rover.stop_rover();
/// rover.end()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RoverController {
    comms: RobotCommunicator,
    default_timeout: Mutex<Duration>,
    info: Mutex<RoverInfo>,
}

impl RoverController {
    /// Start a communicator with `config`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let default_timeout = config.default_timeout_duration();
        Ok(Self {
            comms: RobotCommunicator::new(config)?,
            default_timeout: Mutex::new(default_timeout),
            info: Mutex::new(RoverInfo::default()),
        })
    }

    /// The underlying communicator.
    pub fn communicator(&self) -> &RobotCommunicator {
        &self.comms
    }

    /// Timeout used when a call passes `None`.
    pub fn default_timeout(&self) -> Duration {
        *self.default_timeout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the fallback timeout.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for a zero timeout.
    pub fn set_default_timeout(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::invalid_config("default timeout must be greater than zero"));
        }
        *self.default_timeout.lock().unwrap_or_else(PoisonError::into_inner) = timeout;
        Ok(())
    }

    fn timeout_or_default(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or_else(|| self.default_timeout())
    }

    /// Connect over serial, switch the robot to UART mode and interrogate it.
    pub fn connect_serial(&self, port: &str) -> Result<RoverInfo> {
        self.comms.connect_serial(port)?;
        self.set_rover_to_uart(true)?;
        Ok(self.post_connection_setup())
    }

    /// Connect over TCP and interrogate the robot.
    pub fn connect_ip(&self, address: &str, port: u16) -> Result<RoverInfo> {
        self.comms.connect_ip(address, port)?;
        Ok(self.post_connection_setup())
    }

    /// Connect over BLE to the robot showing `bot_id` and interrogate it.
    pub fn connect_ble(&self, bot_id: u16) -> Result<RoverInfo> {
        self.comms.connect_ble(bot_id)?;
        Ok(self.post_connection_setup())
    }

    /// [`connect_serial`](Self::connect_serial) with retries.
    pub fn connect_serial_with_retry(&self, port: &str, retry: &RetryConfig) -> Result<RoverInfo> {
        with_retry(retry, "serial connect", || self.connect_serial(port))
    }

    /// [`connect_ip`](Self::connect_ip) with retries.
    pub fn connect_ip_with_retry(
        &self,
        address: &str,
        port: u16,
        retry: &RetryConfig,
    ) -> Result<RoverInfo> {
        with_retry(retry, "TCP connect", || self.connect_ip(address, port))
    }

    /// [`connect_ble`](Self::connect_ble) with retries.
    pub fn connect_ble_with_retry(&self, bot_id: u16, retry: &RetryConfig) -> Result<RoverInfo> {
        with_retry(retry, "BLE connect", || self.connect_ble(bot_id))
    }

    /// Read simulator flag, battery and sensor errors. Never fails.
    fn post_connection_setup(&self) -> RoverInfo {
        let mut info = RoverInfo::default();

        match self.read_attribute(AttributeType::SimulatorInfo, &[], None) {
            Ok(data) => {
                info.simulator_info = data.first().copied().unwrap_or(0);
                debug!(simulator_info = info.simulator_info, "Rover simulator info");
            }
            Err(e) => info!("Rover simulator info read failed, assuming a physical robot: {e}"),
        }

        let health = self
            .read_attribute(AttributeType::StateOfCharge, &[], None)
            .and_then(|charge| {
                let percentage = charge.first().copied();
                if let Some(percentage) = percentage {
                    info!("Rover battery at {percentage}%");
                }
                info.battery_percentage = percentage;
                self.read_attribute(AttributeType::SensorErrors, &[], None)
            })
            .and_then(|mask| Ok(bytes_to_u16s(&mask)?.first().copied()));
        match health {
            Ok(Some(0)) => {
                info.sensor_error_mask = Some(0);
                info!("No sensor errors detected");
            }
            Ok(mask) => {
                info.sensor_error_mask = mask;
                warn!(mask = ?mask, "Sensor errors detected");
            }
            Err(e) => error!("Failed to read battery and error mask: {e}"),
        }

        *self.info.lock().unwrap_or_else(PoisonError::into_inner) = info;
        info
    }

    /// Close the link.
    pub fn disconnect(&self) {
        self.comms.disconnect();
    }

    /// Stop the communicator and its threads. Idempotent.
    pub fn end(&self) -> Result<()> {
        self.comms.stop()
    }

    /// Whether a robot is connected.
    pub fn is_connected(&self) -> bool {
        self.comms.is_connected()
    }

    /// Whether the connected robot is a simulator instance.
    pub fn connected_robot_is_simulated(&self) -> bool {
        self.is_connected() && self.info().simulator_info != 0
    }

    /// What the robot reported on the last connect.
    pub fn info(&self) -> RoverInfo {
        *self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Battery charge read on the last connect.
    pub fn battery_percentage(&self) -> Option<u8> {
        self.info().battery_percentage
    }

    /// Sensor error mask read on the last connect.
    pub fn sensor_error_mask(&self) -> Option<u16> {
        self.info().sensor_error_mask
    }

    /// Enter the running state.
    ///
    /// Sensor spam starts by default over BLE, or whenever `spam_override`
    /// is `Some(true)`. Serial-attached robots are not sent a running state.
    pub fn start_rover(&self, spam_override: Option<bool>) -> Result<()> {
        let spam = spam_override.unwrap_or_else(|| self.comms.is_bluetooth());
        if spam {
            self.comms.start_sensor_spam(None)?;
        }
        if !self.comms.is_serial() {
            self.write_attribute(
                AttributeType::ButtonPress,
                &[u8::from(RunningState::Running)],
                None,
            )?;
        }
        Ok(())
    }

    /// Best-effort halt: spam off, motors and buzzer off, leave running state.
    ///
    /// Writes are not acknowledged and failures are only logged.
    pub fn stop_rover(&self) {
        let mut writes: Vec<(AttributeType, Vec<u8>)> = vec![
            (AttributeType::SpamMode, vec![0]),
            (AttributeType::MotorSet, vec![0; 7]),
            (AttributeType::BuzzerFreq, vec![0; 2]),
        ];
        if !self.comms.is_serial() {
            writes.push((AttributeType::ButtonPress, vec![u8::from(RunningState::Closed)]));
        }
        for (attribute, data) in writes {
            if let Err(e) = self.comms.write_packet(
                OpCode::Write,
                attribute,
                &data,
                false,
                Some(STOP_WRITE_TIMEOUT),
            ) {
                debug!("Not all robot stop commands completed: {e}");
                return;
            }
        }
    }

    /// Switch between UART (expansion header) and Bluetooth control.
    pub fn set_rover_to_uart(&self, uart_mode: bool) -> Result<()> {
        self.write_packet(
            OpCode::Write,
            AttributeType::ControlMode,
            &[u8::from(uart_mode)],
            true,
            None,
        )
        .map(|_| ())
    }

    /// Write an attribute and wait for the acknowledgement.
    pub fn write_attribute(
        &self,
        attribute: AttributeType,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.comms
            .write_attribute(attribute, data, Some(self.timeout_or_default(timeout)))
    }

    /// Read an attribute, from the sensor cache when fresh.
    pub fn read_attribute(
        &self,
        attribute: AttributeType,
        extra: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.comms
            .read_attribute(attribute, extra, Some(self.timeout_or_default(timeout)))
    }

    /// Write a raw packet, optionally waiting for its acknowledgement.
    pub fn write_packet(
        &self,
        op_code: OpCode,
        attribute: AttributeType,
        data: &[u8],
        wait_for_ack: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.comms.write_packet(
            op_code,
            attribute,
            data,
            wait_for_ack,
            Some(self.timeout_or_default(timeout)),
        )
    }

    /// Write a motor command and wait for the robot to report completion.
    ///
    /// Encoder and IMU driven moves acknowledge immediately and send a
    /// `MOTOR_SET` notification when done. `timeout` defaults to
    /// [`MOTOR_OPERATION_TIMEOUT`].
    pub fn do_motor_operation(
        &self,
        attribute: AttributeType,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.comms.clear_motor_watchers();
        let watcher = self.comms.motor_watcher();
        self.write_attribute(attribute, data, None)?;
        watcher.wait(timeout.unwrap_or(MOTOR_OPERATION_TIMEOUT))
    }

    /// Mean time to transmit one packet, in milliseconds.
    pub fn transmit_average_ms(&self) -> Result<f64> {
        Ok(self.comms.comms_timing_stats()?.average_write_ms)
    }

    /// Mean time for a full transaction, in milliseconds.
    pub fn transaction_average_ms(&self) -> Result<f64> {
        Ok(self.comms.comms_timing_stats()?.average_transaction_ms)
    }

    /// All timing statistics for the current link.
    pub fn comms_timing_stats(&self) -> Result<CommsTimingStats> {
        self.comms.comms_timing_stats()
    }
}
