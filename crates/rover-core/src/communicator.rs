//! The communication engine.
//!
//! [`RobotCommunicator`] owns one [`Dispatcher`] whose state is the protocol
//! table, the read cache and the active link. Every request from user code
//! becomes a unit on the command lane; every packet from a transport becomes a
//! unit on the event lane. Protocol state is only ever touched from the
//! dispatcher thread.
//!
//! ```no_run
//! use rover_core::{EngineConfig, RobotCommunicator};
//! use rover_types::AttributeType;
//!
//! # fn main() -> rover_core::Result<()> {
//! let comms = RobotCommunicator::new(EngineConfig::default())?;
//! comms.connect_ip("127.0.0.1", 9000)?;
//! let distance = comms.read_attribute(AttributeType::Ultrasonic, &[], None)?;
//! println!("{distance:?}");
//! comms.stop()?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use rover_types::binary::u16s_to_bytes;
use rover_types::{AttributeType, ConnectionStatus, OpCode, Packet};

use crate::cache::ReadCache;
use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, Pending};
use crate::error::{Error, Result};
use crate::metrics::{CommsTimingStats, LATENCY_WINDOW, MovingAverage};
use crate::protocol::{self, NotifyCallback, UartController};
use crate::transport::{
    BleTransport, Link, SerialTransport, TcpTransport, Transport, TransportEvents, TransportKind,
};

/// Extra time a blocked caller waits beyond the engine-side deadline, so
/// the engine's own timeout error is the one reported.
const CALLER_MARGIN: Duration = Duration::from_millis(100);

/// A sensor push stays valid for 1.8 push intervals (microseconds per ms).
const USE_BY_MICROS_PER_MS: u64 = 1_800;

type Watchers = Arc<Mutex<Vec<std_mpsc::SyncSender<()>>>>;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn release_watchers(watchers: &Mutex<Vec<std_mpsc::SyncSender<()>>>) {
    for watcher in guard(watchers).drain(..) {
        let _ = watcher.try_send(());
    }
}

fn big_endian(data: &[u8]) -> u64 {
    data.iter().fold(0, |acc, &b| (acc << 8) | u64::from(b))
}

/// State owned by the engine thread.
struct EngineCore {
    protocol: Mutex<UartController>,
    cache: Arc<Mutex<ReadCache>>,
    motor_watchers: Watchers,
    link: Mutex<Option<Arc<Link>>>,
    generation: AtomicU64,
    status: watch::Sender<ConnectionStatus>,
    transaction_timings: Mutex<MovingAverage>,
}

impl EngineCore {
    fn new(config: &EngineConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::NotConnected);
        let core = Self {
            protocol: Mutex::new(UartController::new()),
            cache: Arc::new(Mutex::new(ReadCache::new(config.cache_use_by_duration()))),
            motor_watchers: Arc::new(Mutex::new(Vec::new())),
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            status,
            transaction_timings: Mutex::new(MovingAverage::new(LATENCY_WINDOW)),
        };
        core.install_builtin_subscriptions(&mut guard(&core.protocol));
        core
    }

    fn install_builtin_subscriptions(&self, uart: &mut UartController) {
        let cache = Arc::clone(&self.cache);
        uart.subscribe(
            AttributeType::AllSensors,
            Arc::new(move |data: &[u8]| guard(&cache).update_all_sensors(data)),
        );

        let watchers = Arc::clone(&self.motor_watchers);
        uart.subscribe(
            AttributeType::MotorSet,
            Arc::new(move |_: &[u8]| release_watchers(&watchers)),
        );

        uart.subscribe(
            AttributeType::ButtonPress,
            Arc::new(|data: &[u8]| info!(code = big_endian(data), "Button pressed")),
        );
        uart.subscribe(
            AttributeType::StateOfCharge,
            Arc::new(|data: &[u8]| info!("Battery percentage update: {}%", big_endian(data))),
        );
        uart.subscribe(
            AttributeType::SensorErrors,
            Arc::new(|data: &[u8]| info!(mask = big_endian(data), "Sensor error mask received")),
        );
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn link(&self) -> Result<Arc<Link>> {
        guard(&self.link).clone().ok_or(Error::NotConnected)
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn set_status(&self, generation: u64, status: ConnectionStatus) {
        if !self.is_current(generation) {
            debug!(generation, %status, "Ignoring status from a replaced link");
            return;
        }
        let previous = self.status.send_replace(status);
        if previous != status {
            info!(%status, "Connection status changed");
        }
    }

    fn handle_packet(&self, generation: u64, packet: Packet) {
        if !self.is_current(generation) {
            debug!(generation, "Ignoring packet from a replaced link");
            return;
        }
        // Callbacks run after the table lock is released.
        let notification = protocol::lock(&self.protocol).route(packet);
        if let Some(notification) = notification {
            notification.deliver();
        }
    }

    fn reset_protocol(&self) {
        let mut uart = protocol::lock(&self.protocol);
        uart.reset();
        self.install_builtin_subscriptions(&mut uart);
    }
}

/// Bridges transport callbacks onto the engine.
///
/// Each connection gets its own sink tagged with that connection's
/// generation; the engine ignores anything from an older generation.
struct EngineEvents {
    generation: u64,
    engine: Weak<Dispatcher<EngineCore>>,
}

impl TransportEvents for EngineEvents {
    fn on_packet(&self, packet: Packet) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let generation = self.generation;
        let _ = engine.submit_event(move |core| async move {
            core.handle_packet(generation, packet);
            Ok(())
        });
    }

    fn on_status(&self, status: ConnectionStatus) {
        if let Some(engine) = self.engine.upgrade() {
            engine.state().set_status(self.generation, status);
        }
    }
}

/// Resolves when the robot reports that a motor operation finished.
#[derive(Debug)]
pub struct MotorWatcher {
    rx: std_mpsc::Receiver<()>,
}

impl MotorWatcher {
    /// Block until the next `MOTOR_SET` notification.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when nothing arrives in time, or
    /// [`Error::EngineStopped`] if the watcher list was dropped.
    pub fn wait(self, timeout: Duration) -> Result<()> {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(Error::timeout("motor operation", timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(Error::EngineStopped),
        }
    }
}

/// Thread-safe, blocking interface to one robot.
///
/// Any number of threads may call into a communicator concurrently. Calls
/// that talk to the robot are queued on the engine's command lane and run
/// one at a time in submission order.
pub struct RobotCommunicator {
    engine: Arc<Dispatcher<EngineCore>>,
    config: EngineConfig,
    sensor_spam_active: AtomicBool,
}

impl RobotCommunicator {
    /// Validate `config` and start the engine thread.
    ///
    /// Blocks until the engine is ready to accept work.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let core = Arc::new(EngineCore::new(&config));
        let engine = Arc::new(Dispatcher::new("rover-engine", core));
        engine.start()?;
        Ok(Self {
            engine,
            config,
            sensor_spam_active: AtomicBool::new(false),
        })
    }

    fn core(&self) -> &EngineCore {
        self.engine.state()
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Connect over a serial port at the configured baud rate.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn connect_serial(&self, port: &str) -> Result<()> {
        let baud_rate = self.config.serial_baud_rate;
        self.replace_link(|events| {
            SerialTransport::connect(port, baud_rate, events).map(|t| Box::new(t) as Box<dyn Transport>)
        })
    }

    /// Connect to a robot listening on `address:port` (simulator or bridge).
    #[tracing::instrument(level = "info", skip(self))]
    pub fn connect_ip(&self, address: &str, port: u16) -> Result<()> {
        let connect_timeout = self.config.default_timeout_duration();
        self.replace_link(|events| {
            TcpTransport::connect(address, port, connect_timeout, events)
                .map(|t| Box::new(t) as Box<dyn Transport>)
        })
    }

    /// Scan for and connect to the robot showing `bot_id` on its screen.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn connect_ble(&self, bot_id: u16) -> Result<()> {
        let ble = self.config.ble.clone();
        self.replace_link(|events| {
            BleTransport::connect(bot_id, ble, events).map(|t| Box::new(t) as Box<dyn Transport>)
        })
    }

    fn replace_link<F>(&self, connect: F) -> Result<()>
    where
        F: FnOnce(Arc<dyn TransportEvents>) -> Result<Box<dyn Transport>>,
    {
        self.disconnect();
        let core = self.core();
        if let Some(old) = guard(&core.link).take() {
            old.stop();
        }

        let generation = core.generation.fetch_add(1, Ordering::AcqRel) + 1;
        guard(&core.transaction_timings).reset();
        self.sensor_spam_active.store(false, Ordering::Release);

        let events: Arc<dyn TransportEvents> = Arc::new(EngineEvents {
            generation,
            engine: Arc::downgrade(&self.engine),
        });
        let transport = connect(events)?;
        let link = Link::new(transport, generation);
        info!(kind = %link.kind(), generation, "Link established");
        *guard(&core.link) = Some(Arc::new(link));
        Ok(())
    }

    /// Close the active link and reset protocol state.
    ///
    /// Safe to call when nothing is connected or after [`stop`](Self::stop).
    #[tracing::instrument(level = "info", skip(self))]
    pub fn disconnect(&self) {
        let link = guard(&self.core().link).clone();
        if let Some(link) = link {
            link.disconnect();
        }
        self.reset_communications();
    }

    /// Shut down the link and the engine thread. Idempotent.
    pub fn stop(&self) -> Result<()> {
        self.disconnect();
        if let Some(link) = guard(&self.core().link).take() {
            link.stop();
        }
        self.engine.stop()
    }

    /// Invalidate the cache, cancel queued work and clear protocol state.
    ///
    /// Every request still waiting for a response fails with
    /// [`Error::Cancelled`]. User subscriptions are dropped; the built-in
    /// ones are installed again.
    pub fn reset_communications(&self) {
        if !self.engine.is_running() {
            guard(&self.core().cache).invalidate();
            return;
        }
        self.engine.cancel_queued();
        let reset = self
            .engine
            .submit_event(|core| async move {
                guard(&core.cache).invalidate();
                core.reset_protocol();
                Ok(())
            })
            .named("reset communications")
            .wait(Some(self.config.default_timeout_duration()));
        if let Err(e) = reset {
            warn!("Communication reset did not complete: {e}");
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Current connection status.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.core().status()
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.core().status.subscribe()
    }

    /// Whether a robot is connected.
    pub fn is_connected(&self) -> bool {
        self.connection_status().is_connected()
    }

    /// Kind of the current (or last) link.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        guard(&self.core().link).as_ref().map(|link| link.kind())
    }

    /// Whether the current link is BLE.
    pub fn is_bluetooth(&self) -> bool {
        self.transport_kind() == Some(TransportKind::Ble)
    }

    /// Whether the current link is TCP.
    pub fn is_tcp(&self) -> bool {
        self.transport_kind() == Some(TransportKind::Tcp)
    }

    /// Whether the current link is serial.
    pub fn is_serial(&self) -> bool {
        self.transport_kind() == Some(TransportKind::Serial)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    // ------------------------------------------------------------------
    // Attribute access
    // ------------------------------------------------------------------

    /// Write `data` to `attribute` and wait for the acknowledgement.
    ///
    /// `timeout` defaults to the configured default timeout.
    pub fn write_attribute(
        &self,
        attribute: AttributeType,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        self.timed_transaction(OpCode::Write, attribute, data.to_vec(), timeout)
    }

    /// Read `attribute`, answering from the sensor cache when it is fresh.
    ///
    /// `extra` is sent as the request payload for attributes that take read
    /// parameters.
    pub fn read_attribute(
        &self,
        attribute: AttributeType,
        extra: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        let cached = guard(&self.core().cache).read(attribute);
        if let Some(cached) = cached {
            debug!(%attribute, "Read served from cache");
            return Ok(cached);
        }
        self.timed_transaction(OpCode::Read, attribute, extra.to_vec(), timeout)
    }

    /// Send an arbitrary packet.
    ///
    /// With `wait_for_ack` the call resolves with the response payload. Without
    /// it the packet is only written and an empty payload is returned once the
    /// write completes.
    pub fn write_packet(
        &self,
        op_code: OpCode,
        attribute: AttributeType,
        data: &[u8],
        wait_for_ack: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        if wait_for_ack {
            return self.timed_transaction(op_code, attribute, data.to_vec(), timeout);
        }
        let timeout = self.effective_timeout(timeout);
        let payload = data.to_vec();
        self.engine
            .submit_command(move |core| async move {
                let link = core.link()?;
                protocol::send_unacknowledged(&link, op_code, attribute, payload).await?;
                Ok(Vec::new())
            })
            .named(format!("write {op_code} {attribute}"))
            .wait(Some(timeout + CALLER_MARGIN))
    }

    fn effective_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or_else(|| self.config.default_timeout_duration())
    }

    fn submit_transaction(
        &self,
        op_code: OpCode,
        attribute: AttributeType,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Pending<Vec<u8>> {
        self.engine
            .submit_command(move |core| async move {
                let link = core.link()?;
                protocol::transaction(&core.protocol, &link, op_code, attribute, payload, timeout)
                    .await
            })
            .named(format!("{op_code} {attribute}"))
    }

    fn timed_transaction(
        &self,
        op_code: OpCode,
        attribute: AttributeType,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let timeout = self.effective_timeout(timeout);
        let started = Instant::now();
        let result = self
            .submit_transaction(op_code, attribute, payload, timeout)
            .wait(Some(timeout + CALLER_MARGIN))?;
        guard(&self.core().transaction_timings).record_duration(started.elapsed());
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Sensor spam
    // ------------------------------------------------------------------

    /// Ask the robot to push `ALL_SENSORS` periodically.
    ///
    /// The interval is `interval_override` when given, otherwise the
    /// recommendation derived from measured write latency. Cached reads stay
    /// valid for 1.8 intervals; values cached under a previous interval are
    /// discarded once the robot acknowledges the new one.
    pub fn start_sensor_spam(&self, interval_override: Option<u64>) -> Result<()> {
        self.ensure_connected()?;
        let link = self.core().link()?;
        let interval_ms = interval_override
            .filter(|ms| *ms > 0)
            .unwrap_or_else(|| link.recommended_interval_ms());
        let wire_interval = u16::try_from(interval_ms).map_err(|_| {
            Error::invalid_config(format!("sensor interval {interval_ms}ms exceeds 65535ms"))
        })?;

        let use_by = Duration::from_micros(interval_ms.saturating_mul(USE_BY_MICROS_PER_MS));
        self.write_attribute(AttributeType::SpamRate, &u16s_to_bytes(&[wire_interval]), None)?;
        // Pushes at the old rate precede the ACK on the event lane.
        self.reconfigure_cache(use_by)?;
        self.write_attribute(AttributeType::SpamMode, &[1], None)?;
        self.sensor_spam_active.store(true, Ordering::Release);
        debug!(interval_ms, "Sensor spam activated");
        Ok(())
    }

    /// Set the cache lifetime and drop everything cached under the old one.
    fn reconfigure_cache(&self, use_by: Duration) -> Result<()> {
        self.engine
            .submit_event(move |core| async move {
                let mut cache = guard(&core.cache);
                cache.set_use_by(use_by)?;
                cache.invalidate();
                Ok(())
            })
            .named("reconfigure cache")
            .wait(Some(self.config.default_timeout_duration()))
    }

    /// Stop the periodic sensor push.
    pub fn stop_sensor_spam(&self) -> Result<()> {
        self.write_attribute(AttributeType::SpamMode, &[0], None)?;
        self.sensor_spam_active.store(false, Ordering::Release);
        Ok(())
    }

    /// Whether sensor spam was started on the current link.
    pub fn sensor_spam_active(&self) -> bool {
        self.sensor_spam_active.load(Ordering::Acquire)
    }

    /// How long cached sensor values stay valid.
    pub fn cache_use_by(&self) -> Duration {
        guard(&self.core().cache).use_by()
    }

    // ------------------------------------------------------------------
    // Subscriptions and watchers
    // ------------------------------------------------------------------

    /// Call `callback` with the payload of every `NOTIFY` for `attribute`.
    ///
    /// Callbacks run on the engine thread and must not block on the
    /// communicator. They are dropped by the next reset.
    pub fn subscribe<F>(&self, attribute: AttributeType, callback: F) -> Result<()>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let callback: NotifyCallback = Arc::new(callback);
        self.engine
            .submit_command(move |core| async move {
                protocol::lock(&core.protocol).subscribe(attribute, callback);
                Ok(())
            })
            .named(format!("subscribe {attribute}"))
            .wait(Some(self.config.default_timeout_duration()))
    }

    /// Remove every callback for `attribute`, built-in ones included.
    pub fn unsubscribe(&self, attribute: AttributeType) -> Result<()> {
        self.engine
            .submit_command(move |core| async move {
                protocol::lock(&core.protocol).unsubscribe(attribute);
                Ok(())
            })
            .named(format!("unsubscribe {attribute}"))
            .wait(Some(self.config.default_timeout_duration()))
    }

    /// Release everyone waiting on a motor completion.
    pub fn clear_motor_watchers(&self) {
        release_watchers(&self.core().motor_watchers);
    }

    /// Watcher released by the next `MOTOR_SET` notification.
    pub fn motor_watcher(&self) -> MotorWatcher {
        let (tx, rx) = std_mpsc::sync_channel(1);
        guard(&self.core().motor_watchers).push(tx);
        MotorWatcher { rx }
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Write and transaction latency for the current link.
    pub fn comms_timing_stats(&self) -> Result<CommsTimingStats> {
        let link = self.core().link()?;
        Ok(CommsTimingStats {
            average_write_ms: link.average_write_ms(),
            recommended_interval_ms: link.recommended_interval_ms(),
            average_transaction_ms: guard(&self.core().transaction_timings).average(),
        })
    }

    /// Suppress BLE heartbeats ahead of a dense burst of traffic.
    pub fn pause_heartbeat(&self, paused: bool) {
        if let Ok(link) = self.core().link() {
            link.pause_heartbeat(paused);
        }
    }
}

impl Drop for RobotCommunicator {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            debug!("Engine stop during drop failed: {e}");
        }
    }
}

impl std::fmt::Debug for RobotCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotCommunicator")
            .field("status", &self.connection_status())
            .field("transport", &self.transport_kind())
            .finish_non_exhaustive()
    }
}
