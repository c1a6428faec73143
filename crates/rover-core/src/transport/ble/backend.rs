//! The Bluetooth stack behind [`BleController`](super::BleController).
//!
//! [`BleBackend`] finds the rover and [`RoverPeripheral`] drives one
//! connection to it. The controller bounds every call with its own timeouts,
//! so implementations may block for as long as the platform does.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

use rover_types::uuids::{HEARTBEAT_CHARACTERISTIC, ROVER_SERVICE, UART_CHARACTERISTIC};

use crate::error::{Error, Result};

/// A value pushed by the rover on one of its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleNotification {
    /// Characteristic the value arrived on.
    pub characteristic: Uuid,
    /// Raw value.
    pub value: Vec<u8>,
}

/// Scanning side of a Bluetooth stack.
#[async_trait]
pub trait BleBackend: Send + Sync {
    /// Start listening for advertisements.
    async fn start_scan(&self) -> Result<()>;

    /// The peripheral advertising `name`, if one has been seen yet.
    async fn find(&self, name: &str) -> Result<Option<Arc<dyn RoverPeripheral>>>;

    /// Stop listening for advertisements.
    async fn stop_scan(&self) -> Result<()>;
}

/// One rover as seen by the Bluetooth stack.
#[async_trait]
pub trait RoverPeripheral: Send + Sync {
    /// Open the GATT connection.
    async fn connect(&self) -> Result<()>;

    /// Discover services and locate the UART and heartbeat characteristics.
    async fn discover(&self) -> Result<()>;

    /// Stream of notifications. Taken before [`subscribe`](Self::subscribe).
    async fn notifications(&self) -> Result<BoxStream<'static, BleNotification>>;

    /// Enable notifications on the UART and heartbeat characteristics.
    async fn subscribe(&self) -> Result<()>;

    /// Resolves once the stack reports this peripheral gone.
    async fn link_lost(&self) -> Result<BoxFuture<'static, ()>>;

    /// Write one packet to the UART characteristic with response.
    async fn write_uart(&self, data: &[u8]) -> Result<()>;

    /// Read the heartbeat characteristic.
    async fn read_heartbeat(&self) -> Result<()>;

    /// Close the GATT connection.
    async fn disconnect(&self) -> Result<()>;
}

/// btleplug on the first available adapter.
#[derive(Default)]
pub struct BtleplugBackend {
    adapter: OnceCell<Adapter>,
}

impl BtleplugBackend {
    /// Backend that opens the adapter on first use.
    pub fn new() -> Self {
        Self::default()
    }

    async fn adapter(&self) -> Result<&Adapter> {
        self.adapter.get_or_try_init(first_adapter).await
    }
}

async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::device_not_found("no Bluetooth adapter available"))
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    async fn start_scan(&self) -> Result<()> {
        self.adapter().await?.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn find(&self, name: &str) -> Result<Option<Arc<dyn RoverPeripheral>>> {
        let adapter = self.adapter().await?;
        for peripheral in adapter.peripherals().await? {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            if properties.local_name.as_deref() == Some(name) {
                info!(address = %properties.address, "Found rover");
                let rover: Arc<dyn RoverPeripheral> = Arc::new(BtleplugPeripheral {
                    name: name.to_string(),
                    adapter: adapter.clone(),
                    peripheral,
                    characteristics: OnceLock::new(),
                });
                return Ok(Some(rover));
            }
        }
        Ok(None)
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter().await?.stop_scan().await?;
        Ok(())
    }
}

struct Characteristics {
    uart: Characteristic,
    heartbeat: Characteristic,
}

struct BtleplugPeripheral {
    name: String,
    adapter: Adapter,
    peripheral: Peripheral,
    characteristics: OnceLock<Characteristics>,
}

impl BtleplugPeripheral {
    fn characteristics(&self) -> Result<&Characteristics> {
        self.characteristics.get().ok_or(Error::NotConnected)
    }
}

#[async_trait]
impl RoverPeripheral for BtleplugPeripheral {
    async fn connect(&self) -> Result<()> {
        self.peripheral.connect().await?;
        Ok(())
    }

    async fn discover(&self) -> Result<()> {
        self.peripheral.discover_services().await?;
        let services = self.peripheral.services();
        debug!("Found {} services", services.len());
        if !services.iter().any(|service| service.uuid == ROVER_SERVICE) {
            return Err(Error::connection_failed(
                Some(self.name.clone()),
                format!("required service {ROVER_SERVICE} not found"),
            ));
        }
        let find = |uuid: Uuid| {
            services
                .iter()
                .flat_map(|service| service.characteristics.iter())
                .find(|characteristic| characteristic.uuid == uuid)
                .cloned()
                .ok_or_else(|| Error::characteristic_not_found(uuid.to_string(), services.len()))
        };
        let found = Characteristics {
            uart: find(UART_CHARACTERISTIC)?,
            heartbeat: find(HEARTBEAT_CHARACTERISTIC)?,
        };
        // A rediscovery finds the same characteristics.
        let _ = self.characteristics.set(found);
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, BleNotification>> {
        let stream = self.peripheral.notifications().await?;
        Ok(stream
            .map(|notification| BleNotification {
                characteristic: notification.uuid,
                value: notification.value,
            })
            .boxed())
    }

    async fn subscribe(&self) -> Result<()> {
        let characteristics = self.characteristics()?;
        self.peripheral.subscribe(&characteristics.uart).await?;
        self.peripheral.subscribe(&characteristics.heartbeat).await?;
        Ok(())
    }

    async fn link_lost(&self) -> Result<BoxFuture<'static, ()>> {
        let mut events = self.adapter.events().await?;
        let id = self.peripheral.id();
        Ok(async move {
            while let Some(event) = events.next().await {
                if matches!(&event, CentralEvent::DeviceDisconnected(lost) if *lost == id) {
                    return;
                }
            }
            debug!("Adapter event stream ended");
        }
        .boxed())
    }

    async fn write_uart(&self, data: &[u8]) -> Result<()> {
        let uart = &self.characteristics()?.uart;
        self.peripheral
            .write(uart, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn read_heartbeat(&self) -> Result<()> {
        let heartbeat = &self.characteristics()?.heartbeat;
        self.peripheral.read(heartbeat).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
