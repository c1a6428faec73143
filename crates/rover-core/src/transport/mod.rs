//! Physical links to the rover.
//!
//! Every link implements [`Transport`]: a timed packet write plus teardown.
//! Inbound traffic flows the other way through [`TransportEvents`], which
//! each transport calls from its own reader thread or BLE task.

mod ble;
mod framing;
mod serial;
mod tcp;

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;

use rover_types::{ConnectionStatus, Packet};

use crate::error::Result;
use crate::metrics::MovingAverage;

pub use ble::{
    BleBackend, BleController, BleNotification, BleTransport, BtleplugBackend, RoverPeripheral,
};
pub use framing::FrameReader;
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

/// Sensor push interval used before any write latency has been measured.
pub const DEFAULT_SPAM_INTERVAL_MS: u64 = 50;

/// Lower bound for the recommended sensor push interval.
pub const MIN_SPAM_INTERVAL_MS: u64 = 10;

/// Which kind of link a transport drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Bluetooth Low Energy.
    Ble,
    /// Serial UART (e.g. the expansion header).
    Serial,
    /// TCP socket (simulator or network bridge).
    Tcp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ble => write!(f, "BLE"),
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Tcp => write!(f, "TCP"),
        }
    }
}

/// Receiver for everything a transport produces.
pub trait TransportEvents: Send + Sync {
    /// A complete packet arrived.
    fn on_packet(&self, packet: Packet);

    /// The link changed state.
    fn on_status(&self, status: ConnectionStatus);
}

/// A connected physical link.
///
/// Connecting is transport specific and happens before a value is
/// constructed; a `Transport` is always either connected or torn down.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Kind of link.
    fn kind(&self) -> TransportKind;

    /// Whether a successful write already confirms delivery.
    ///
    /// BLE writes with response are acknowledged by the GATT layer, so the
    /// protocol synthesizes the ACK locally instead of waiting for one.
    fn fakes_ack(&self) -> bool {
        false
    }

    /// Write one encoded packet (without start byte).
    async fn write(&self, packet: &[u8]) -> Result<()>;

    /// Suppress or resume keepalive traffic, where the link has any.
    fn pause_heartbeat(&self, _paused: bool) {}

    /// Close the link. Reports [`ConnectionStatus::Disconnected`].
    fn disconnect(&self);

    /// Release background threads. Implies [`Transport::disconnect`].
    fn stop(&self);
}

/// Recommended sensor push interval for a link with the given write latency.
///
/// Links that manage their own acknowledgements get more headroom.
///
/// # Examples
///
/// ```
/// use rover_core::transport::recommended_interval;
///
/// assert_eq!(recommended_interval(10.0, true), 11);
/// assert_eq!(recommended_interval(10.0, false), 18);
/// assert_eq!(recommended_interval(0.0, false), 50);
/// ```
pub fn recommended_interval(average_write_ms: f64, fakes_ack: bool) -> u64 {
    if average_write_ms <= 0.0 {
        return DEFAULT_SPAM_INTERVAL_MS;
    }
    let factor = if fakes_ack { 1.1 } else { 1.8 };
    let interval = (average_write_ms * factor).round();
    if interval < MIN_SPAM_INTERVAL_MS as f64 {
        MIN_SPAM_INTERVAL_MS
    } else {
        interval as u64
    }
}

/// The active transport together with its write timings.
///
/// A new `Link` is built for every connection; `generation` identifies it so
/// events from a replaced link can be ignored.
pub struct Link {
    transport: Box<dyn Transport>,
    generation: u64,
    write_timings: Mutex<MovingAverage>,
}

impl Link {
    /// Wrap a connected transport.
    pub fn new(transport: Box<dyn Transport>, generation: u64) -> Self {
        Self {
            transport,
            generation,
            write_timings: Mutex::new(MovingAverage::default()),
        }
    }

    /// Kind of the wrapped transport.
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// See [`Transport::fakes_ack`].
    pub fn fakes_ack(&self) -> bool {
        self.transport.fakes_ack()
    }

    /// Connection generation this link belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Write a packet, recording how long a successful write took.
    pub async fn write_timed(&self, packet: &[u8]) -> Result<()> {
        let started = Instant::now();
        self.transport.write(packet).await?;
        self.timings().record_duration(started.elapsed());
        Ok(())
    }

    /// Mean duration of recent writes in milliseconds.
    pub fn average_write_ms(&self) -> f64 {
        self.timings().average()
    }

    /// Sensor push interval suited to this link.
    pub fn recommended_interval_ms(&self) -> u64 {
        recommended_interval(self.average_write_ms(), self.fakes_ack())
    }

    /// See [`Transport::pause_heartbeat`].
    pub fn pause_heartbeat(&self, paused: bool) {
        self.transport.pause_heartbeat(paused);
    }

    /// See [`Transport::disconnect`].
    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    /// See [`Transport::stop`].
    pub fn stop(&self) {
        self.transport.stop();
    }

    fn timings(&self) -> std::sync::MutexGuard<'_, MovingAverage> {
        self.write_timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("kind", &self.kind())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_recommended_interval() {
        assert_eq!(recommended_interval(10.0, true), 11);
        assert_eq!(recommended_interval(10.0, false), 18);
        assert_eq!(recommended_interval(0.0, true), DEFAULT_SPAM_INTERVAL_MS);
        assert_eq!(recommended_interval(-3.0, false), DEFAULT_SPAM_INTERVAL_MS);
        assert_eq!(recommended_interval(2.0, false), MIN_SPAM_INTERVAL_MS);
        assert_eq!(recommended_interval(30.0, true), 33);
    }

    struct CountingTransport {
        writes: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Tcp
        }

        async fn write(&self, _packet: &[u8]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(crate::Error::NotConnected);
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            Ok(())
        }

        fn disconnect(&self) {}

        fn stop(&self) {}
    }

    #[tokio::test]
    async fn test_write_timed_records_successes_only() {
        let writes = Arc::new(AtomicUsize::new(0));
        let link = Link::new(
            Box::new(CountingTransport {
                writes: Arc::clone(&writes),
                fail: false,
            }),
            1,
        );
        assert_eq!(link.recommended_interval_ms(), DEFAULT_SPAM_INTERVAL_MS);
        link.write_timed(&[1, 2, 0]).await.unwrap();
        assert!(link.average_write_ms() >= 5.0);
        assert_eq!(writes.load(Ordering::SeqCst), 1);

        let failing = Link::new(
            Box::new(CountingTransport {
                writes,
                fail: true,
            }),
            2,
        );
        assert!(failing.write_timed(&[1, 2, 0]).await.is_err());
        assert_eq!(failing.average_write_ms(), 0.0);
        assert_eq!(failing.generation(), 2);
    }
}
