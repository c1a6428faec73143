//! In-memory Bluetooth stack for exercising the BLE state machine.
//!
//! - **Visibility**: the rover is only found once it advertises
//! - **Failure injection**: heartbeat reads can fail, subscribing can hang
//! - **Traffic**: notifications and link loss are pushed by the test

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::backend::{BleBackend, BleNotification, RoverPeripheral};

/// A rover that lives in memory.
#[derive(Default)]
pub struct MockPeripheral {
    writes: Mutex<Vec<Vec<u8>>>,
    heartbeat_reads: AtomicUsize,
    disconnects: AtomicUsize,
    fail_heartbeat: AtomicBool,
    hang_subscribe: AtomicBool,
    hold_writes: AtomicBool,
    write_release: Notify,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<BleNotification>>>,
    lost_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl MockPeripheral {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Push a notification as the rover would.
    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        if let Some(tx) = self.notify_tx.lock().unwrap().as_ref() {
            let _ = tx.unbounded_send(BleNotification {
                characteristic,
                value,
            });
        }
    }

    /// Report the peripheral gone, as the adapter does on link loss.
    pub fn lose_link(&self) {
        if let Some(tx) = self.lost_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    pub fn fail_heartbeat(&self, fail: bool) {
        self.fail_heartbeat.store(fail, Ordering::SeqCst);
    }

    pub fn hang_subscribe(&self) {
        self.hang_subscribe.store(true, Ordering::SeqCst);
    }

    /// Park every write until [`release_write`](Self::release_write).
    pub fn hold_writes(&self) {
        self.hold_writes.store(true, Ordering::SeqCst);
    }

    pub fn release_write(&self) {
        self.hold_writes.store(false, Ordering::SeqCst);
        self.write_release.notify_one();
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn heartbeat_reads(&self) -> usize {
        self.heartbeat_reads.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoverPeripheral for MockPeripheral {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn discover(&self) -> Result<()> {
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, BleNotification>> {
        let (tx, rx) = mpsc::unbounded();
        *self.notify_tx.lock().unwrap() = Some(tx);
        Ok(rx.boxed())
    }

    async fn subscribe(&self) -> Result<()> {
        if self.hang_subscribe.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn link_lost(&self) -> Result<BoxFuture<'static, ()>> {
        let (tx, rx) = oneshot::channel();
        *self.lost_tx.lock().unwrap() = Some(tx);
        Ok(async move {
            let _ = rx.await;
        }
        .boxed())
    }

    async fn write_uart(&self, data: &[u8]) -> Result<()> {
        if self.hold_writes.load(Ordering::SeqCst) {
            self.write_release.notified().await;
        }
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn read_heartbeat(&self) -> Result<()> {
        self.heartbeat_reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_heartbeat.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scanner that finds one [`MockPeripheral`] once it advertises.
pub struct MockBackend {
    peripheral: Arc<MockPeripheral>,
    advertising: AtomicBool,
    scans_stopped: AtomicUsize,
}

impl MockBackend {
    /// Backend whose rover is advertising.
    pub fn new(peripheral: Arc<MockPeripheral>) -> Arc<Self> {
        Arc::new(Self {
            peripheral,
            advertising: AtomicBool::new(true),
            scans_stopped: AtomicUsize::new(0),
        })
    }

    /// Backend whose rover is out of range.
    pub fn silent(peripheral: Arc<MockPeripheral>) -> Arc<Self> {
        let backend = Self::new(peripheral);
        backend.advertising.store(false, Ordering::SeqCst);
        backend
    }

    pub fn scans_stopped(&self) -> usize {
        self.scans_stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleBackend for MockBackend {
    async fn start_scan(&self) -> Result<()> {
        Ok(())
    }

    async fn find(&self, _name: &str) -> Result<Option<Arc<dyn RoverPeripheral>>> {
        if !self.advertising.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let peripheral: Arc<dyn RoverPeripheral> = self.peripheral.clone();
        Ok(Some(peripheral))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scans_stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
