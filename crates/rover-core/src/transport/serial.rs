//! Serial UART link, e.g. a Raspberry Pi on the expansion header.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info};

use rover_types::{ConnectionStatus, START_BYTE};

use crate::error::{Error, Result};
use crate::transport::framing::spawn_reader;
use crate::transport::{Transport, TransportEvents, TransportKind};

/// Read timeout on the port; bounds how long a stop waits for the reader.
const READ_POLL: Duration = Duration::from_millis(200);

/// Packet link over a serial port.
pub struct SerialTransport {
    port: Mutex<Option<Box<dyn SerialPort>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    events: Arc<dyn TransportEvents>,
    path: String,
}

impl SerialTransport {
    /// Open `path` at `baud_rate`, flush both directions and start the reader.
    ///
    /// Reports [`ConnectionStatus::Connected`] once the port is open.
    pub fn connect(path: &str, baud_rate: u32, events: Arc<dyn TransportEvents>) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(READ_POLL)
            .open()
            .map_err(|e| {
                Error::connection_failed(Some(path.to_string()), format!("cannot open port: {e}"))
            })?;
        port.clear(ClearBuffer::All)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader(
            "rover-serial-reader",
            port.try_clone()?,
            Arc::clone(&shutdown),
            Arc::clone(&events),
        )?;

        info!(port = path, baud_rate, "Connected over serial");
        events.on_status(ConnectionStatus::Connected);
        Ok(Self {
            port: Mutex::new(Some(port)),
            reader: Mutex::new(Some(reader)),
            shutdown,
            events,
            path: path.to_string(),
        })
    }

    fn close(&self) -> bool {
        let port = self
            .port
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(port) = port else {
            return false;
        };
        self.shutdown.store(true, Ordering::Release);
        drop(port);
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            if reader.join().is_err() {
                debug!(port = %self.path, "Serial reader panicked");
            }
        }
        true
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn write(&self, packet: &[u8]) -> Result<()> {
        let mut guard = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        let port = guard.as_mut().ok_or(Error::NotConnected)?;
        let mut framed = Vec::with_capacity(packet.len() + 1);
        framed.push(START_BYTE);
        framed.extend_from_slice(packet);
        port.write_all(&framed)?;
        Ok(())
    }

    fn disconnect(&self) {
        if self.close() {
            info!(port = %self.path, "Disconnected");
            self.events.on_status(ConnectionStatus::Disconnected);
        }
    }

    fn stop(&self) {
        self.disconnect();
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
