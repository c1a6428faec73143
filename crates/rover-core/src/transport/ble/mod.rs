//! Bluetooth Low Energy link.
//!
//! btleplug is future based, so all BLE traffic runs on a dedicated
//! [`Dispatcher`] worker with its own runtime. [`BleTransport`] is the
//! blocking face of that worker; [`BleController`] is the state machine that
//! runs inside it:
//!
//! ```text
//! NotConnected -> Searching -> Connecting -> Interrogating -> Connected -> Disconnected
//! ```
//!
//! Once connected a heartbeat task reads the heartbeat characteristic
//! whenever the link has been idle for most of the heartbeat interval and no
//! write is in flight, and a watcher task tears the session down on link
//! loss signalled by the adapter.
//!
//! The Bluetooth stack itself sits behind [`BleBackend`] and
//! [`RoverPeripheral`]; [`BtleplugBackend`] is the production implementation.

mod backend;
#[cfg(test)]
mod mock;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use rover_types::uuids::UART_CHARACTERISTIC;
use rover_types::{AttributeType, ConnectionStatus, Packet};

use crate::config::BleConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvents, TransportKind};

pub use backend::{BleBackend, BleNotification, BtleplugBackend, RoverPeripheral};

/// How often the peripheral list is polled while scanning.
const SCAN_POLL: Duration = Duration::from_millis(100);

/// Fraction of the heartbeat interval the link may sit idle before a read.
const HEARTBEAT_IDLE_FRACTION: f64 = 0.8;

/// Whether the heartbeat should read the link.
fn heartbeat_due(idle: Duration, interval: Duration, suppressed: bool) -> bool {
    !suppressed && idle > interval.mul_f64(HEARTBEAT_IDLE_FRACTION)
}

/// Run `fut`, failing with [`Error::Timeout`] after `limit`.
async fn bounded<T>(
    operation: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    timeout(limit, fut)
        .await
        .map_err(|_| Error::timeout(operation, limit))?
}

/// Counts a write for as long as it is in flight.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A live connection and the tasks serving it.
struct Session {
    peripheral: Arc<dyn RoverPeripheral>,
    tasks: Vec<JoinHandle<()>>,
}

/// BLE connection state machine.
///
/// Lives on the BLE worker; every async method runs on that worker's runtime.
/// Each call into the Bluetooth stack is bounded by a configured timeout.
pub struct BleController {
    config: BleConfig,
    backend: Arc<dyn BleBackend>,
    events: Arc<dyn TransportEvents>,
    status: Mutex<ConnectionStatus>,
    session: Mutex<Option<Session>>,
    last_io: Mutex<Instant>,
    heartbeat_paused: AtomicBool,
    writes_in_flight: AtomicUsize,
    user_disconnected: AtomicBool,
}

impl BleController {
    /// Create a disconnected controller over `backend`.
    pub fn new(
        config: BleConfig,
        backend: Arc<dyn BleBackend>,
        events: Arc<dyn TransportEvents>,
    ) -> Self {
        Self {
            config,
            backend,
            events,
            status: Mutex::new(ConnectionStatus::NotConnected),
            session: Mutex::new(None),
            last_io: Mutex::new(Instant::now()),
            heartbeat_paused: AtomicBool::new(false),
            writes_in_flight: AtomicUsize::new(0),
            user_disconnected: AtomicBool::new(false),
        }
    }

    /// Current state.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the last disconnect was requested rather than a link loss.
    pub fn disconnected_by_user(&self) -> bool {
        self.user_disconnected.load(Ordering::Acquire)
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = {
            let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = *current != status;
            *current = status;
            changed
        };
        if changed {
            debug!(%status, "BLE status");
            self.events.on_status(status);
        }
    }

    fn touch(&self) {
        *self.last_io.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_io
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn set_heartbeat_paused(&self, paused: bool) {
        self.heartbeat_paused.store(paused, Ordering::Release);
    }

    /// Paused by the user, or a write is in flight.
    fn heartbeat_suppressed(&self) -> bool {
        self.heartbeat_paused.load(Ordering::Acquire)
            || self.writes_in_flight.load(Ordering::Acquire) > 0
    }

    fn peripheral(&self) -> Result<Arc<dyn RoverPeripheral>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| Arc::clone(&session.peripheral))
            .ok_or(Error::NotConnected)
    }

    /// Scan for `bot_id`, connect, discover and subscribe.
    #[tracing::instrument(level = "info", skip(self), fields(name = tracing::field::Empty))]
    pub async fn connect(self: Arc<Self>, bot_id: u16) -> Result<()> {
        self.teardown().await;
        self.user_disconnected.store(false, Ordering::Release);
        let name = self.config.device_name(bot_id);
        tracing::Span::current().record("name", name.as_str());

        self.set_status(ConnectionStatus::Searching);
        let peripheral = match self.find_peripheral(&name).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                self.set_status(ConnectionStatus::NotConnected);
                return Err(e);
            }
        };

        self.set_status(ConnectionStatus::Connecting);
        match Arc::clone(&self).establish(Arc::clone(&peripheral)).await {
            Ok(session) => {
                *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
                self.touch();
                self.set_status(ConnectionStatus::Connected);
                self.spawn_heartbeat();
                info!("Connected over BLE");
                Ok(())
            }
            Err(e) => {
                warn!("BLE connection failed: {e}");
                self.set_status(ConnectionStatus::Disconnected);
                self.close(peripheral.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn find_peripheral(&self, name: &str) -> Result<Arc<dyn RoverPeripheral>> {
        info!(name, "Scanning for rover");
        let io_timeout = self.config.io_timeout();
        bounded("start scan", io_timeout, self.backend.start_scan()).await?;

        let scan = async {
            loop {
                sleep(SCAN_POLL).await;
                if let Some(peripheral) = self.backend.find(name).await? {
                    return Ok::<_, Error>(peripheral);
                }
            }
        };
        let found = timeout(self.config.scan_timeout(), scan).await;

        if let Err(e) = bounded("stop scan", io_timeout, self.backend.stop_scan()).await {
            debug!("Failed to stop scan: {e}");
        }
        match found {
            Ok(result) => result,
            Err(_) => Err(Error::device_not_found(format!(
                "'{name}' not seen within {:?}",
                self.config.scan_timeout()
            ))),
        }
    }

    async fn establish(self: Arc<Self>, peripheral: Arc<dyn RoverPeripheral>) -> Result<Session> {
        let io_timeout = self.config.io_timeout();
        bounded(
            "connect to rover",
            self.config.connect_timeout(),
            peripheral.connect(),
        )
        .await?;

        self.set_status(ConnectionStatus::Interrogating);
        bounded(
            "discover services",
            self.config.discovery_timeout(),
            peripheral.discover(),
        )
        .await?;

        // Take the stream before subscribing so no notification is missed.
        let mut notifications =
            bounded("open notifications", io_timeout, peripheral.notifications()).await?;
        bounded("subscribe", io_timeout, peripheral.subscribe()).await?;
        let link_lost = bounded("watch adapter events", io_timeout, peripheral.link_lost()).await?;

        let ble = Arc::clone(&self);
        let reader = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                ble.touch();
                if notification.characteristic != UART_CHARACTERISTIC {
                    continue;
                }
                match Packet::parse(&notification.value) {
                    Ok(packet) => ble.events.on_packet(packet),
                    Err(e) => {
                        let attribute = notification
                            .value
                            .get(1)
                            .and_then(|&b| AttributeType::try_from(b).ok());
                        warn!(?attribute, "Dropping undecodable BLE packet: {e}");
                    }
                }
            }
            debug!("Notification stream ended");
        });

        let ble = Arc::clone(&self);
        let watcher = tokio::spawn(async move {
            link_lost.await;
            info!("BLE disconnected event");
            ble.drop_link();
        });

        Ok(Session {
            peripheral,
            tasks: vec![reader, watcher],
        })
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(session) = session.as_mut() else {
            return;
        };
        let ble = Arc::clone(self);
        let peripheral = Arc::clone(&session.peripheral);
        session.tasks.push(tokio::spawn(ble.heartbeat(peripheral)));
    }

    /// Keep the link alive while it is otherwise quiet.
    ///
    /// A failed or late heartbeat read tears the connection down.
    async fn heartbeat(self: Arc<Self>, peripheral: Arc<dyn RoverPeripheral>) {
        let interval = self.config.heartbeat_interval();
        let read_timeout = self.config.heartbeat_timeout();
        loop {
            if !self.status().is_connected() {
                return;
            }
            if heartbeat_due(self.idle_for(), interval, self.heartbeat_suppressed()) {
                match timeout(read_timeout, peripheral.read_heartbeat()).await {
                    Ok(Ok(())) => self.touch(),
                    Ok(Err(e)) => {
                        warn!("Heartbeat read failed: {e}");
                        self.drop_link();
                        return;
                    }
                    Err(_) => {
                        warn!("Heartbeat timed out after {read_timeout:?}");
                        self.drop_link();
                        return;
                    }
                }
            }
            sleep(interval).await;
        }
    }

    /// Disconnect from inside a session task without aborting the caller.
    fn drop_link(self: &Arc<Self>) {
        let ble = Arc::clone(self);
        tokio::spawn(async move { ble.disconnect(false).await });
    }

    /// Write one packet with response.
    pub async fn write_uart(&self, packet: &[u8]) -> Result<()> {
        let peripheral = self.peripheral()?;
        let _in_flight = InFlight::enter(&self.writes_in_flight);
        bounded("BLE write", self.config.io_timeout(), peripheral.write_uart(packet)).await?;
        self.touch();
        Ok(())
    }

    /// Close the connection and report [`ConnectionStatus::Disconnected`].
    pub async fn disconnect(&self, by_user: bool) {
        self.user_disconnected.store(by_user, Ordering::Release);
        self.set_status(ConnectionStatus::Disconnected);
        self.teardown().await;
    }

    async fn teardown(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            for task in session.tasks {
                task.abort();
            }
            self.close(session.peripheral.as_ref()).await;
        }
    }

    async fn close(&self, peripheral: &dyn RoverPeripheral) {
        let io_timeout = self.config.io_timeout();
        if let Err(e) = bounded("BLE disconnect", io_timeout, peripheral.disconnect()).await {
            debug!("BLE disconnect failed: {e}");
        }
    }
}

/// Margin on top of the worker-side timeouts when waiting from outside.
const HANDOFF_MARGIN: Duration = Duration::from_millis(500);

/// Bounded stack calls on the connect path besides scan, connect and
/// discovery: teardown, scan start and stop, notifications, subscribe,
/// the adapter event stream and the cleanup disconnect.
const CONNECT_IO_STEPS: u32 = 7;

/// Packet link over BLE, driven by its own worker thread.
pub struct BleTransport {
    worker: Dispatcher<BleController>,
    io_timeout: Duration,
    name: String,
}

impl BleTransport {
    /// Find and connect to rover `bot_id` through btleplug.
    ///
    /// Blocks until connected or failed. Status transitions are reported to
    /// `events` as they happen.
    pub fn connect(
        bot_id: u16,
        config: BleConfig,
        events: Arc<dyn TransportEvents>,
    ) -> Result<Self> {
        Self::connect_with(Arc::new(BtleplugBackend::new()), bot_id, config, events)
    }

    /// Find and connect to rover `bot_id` through `backend`.
    pub fn connect_with(
        backend: Arc<dyn BleBackend>,
        bot_id: u16,
        config: BleConfig,
        events: Arc<dyn TransportEvents>,
    ) -> Result<Self> {
        let name = config.device_name(bot_id);
        let io_timeout = config.io_timeout();
        let deadline = config.scan_timeout()
            + config.connect_timeout()
            + config.discovery_timeout()
            + io_timeout * CONNECT_IO_STEPS
            + HANDOFF_MARGIN;

        let controller = BleController::new(config, backend, events);
        let worker = Dispatcher::new("rover-ble", Arc::new(controller));
        worker.start()?;
        let connected = worker
            .submit_command(move |ble| ble.connect(bot_id))
            .named("BLE connect")
            .wait(Some(deadline));
        if let Err(e) = connected {
            // A connect that missed its deadline may still be stuck in the
            // stack; joining the worker would block on it.
            if matches!(e, Error::Timeout { .. }) {
                worker.detach();
            } else if let Err(stop_error) = worker.stop() {
                debug!("BLE worker did not stop cleanly: {stop_error}");
            }
            return Err(e);
        }
        Ok(Self {
            worker,
            io_timeout,
            name,
        })
    }

    /// Advertised name of the connected rover.
    pub fn device_name(&self) -> &str {
        &self.name
    }

    /// Current state of the BLE state machine.
    pub fn status(&self) -> ConnectionStatus {
        self.worker.state().status()
    }

    fn disconnect_within(&self) -> Result<()> {
        self.worker
            .submit_command(|ble| async move {
                ble.disconnect(true).await;
                Ok(())
            })
            .named("BLE disconnect")
            .wait(Some(self.io_timeout + HANDOFF_MARGIN))
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn fakes_ack(&self) -> bool {
        true
    }

    async fn write(&self, packet: &[u8]) -> Result<()> {
        let data = packet.to_vec();
        let pending = self
            .worker
            .submit_command(move |ble| async move { ble.write_uart(&data).await })
            .named("BLE write");
        let deadline = self.io_timeout + HANDOFF_MARGIN;
        tokio::task::spawn_blocking(move || pending.wait(Some(deadline)))
            .await
            .map_err(|e| Error::TaskPanicked(e.to_string()))?
    }

    fn pause_heartbeat(&self, paused: bool) {
        self.worker.state().set_heartbeat_paused(paused);
    }

    fn disconnect(&self) {
        if let Err(e) = self.disconnect_within() {
            debug!(name = %self.name, "BLE disconnect did not complete: {e}");
        }
    }

    fn stop(&self) {
        if self.worker.is_running() && self.disconnect_within().is_err() {
            warn!(name = %self.name, "BLE disconnect stalled, detaching worker");
            self.worker.detach();
            return;
        }
        if let Err(e) = self.worker.stop() {
            warn!("BLE worker did not stop cleanly: {e}");
        }
    }
}
