//! TCP link, used by the simulator and network bridges.

use std::io::{BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use rover_types::{ConnectionStatus, START_BYTE};

use crate::error::{Error, Result};
use crate::transport::framing::spawn_reader;
use crate::transport::{Transport, TransportEvents, TransportKind};

/// Lowest port accepted for a robot listener.
pub const MIN_TCP_PORT: u16 = 1024;

const READ_POLL: Duration = Duration::from_millis(200);

/// Packet link over a TCP socket.
pub struct TcpTransport {
    stream: Mutex<Option<TcpStream>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    events: Arc<dyn TransportEvents>,
    peer: String,
}

impl TcpTransport {
    /// Connect to `address:port` and start the reader thread.
    ///
    /// Reports [`ConnectionStatus::Connected`] once the socket is open.
    pub fn connect(
        address: &str,
        port: u16,
        connect_timeout: Duration,
        events: Arc<dyn TransportEvents>,
    ) -> Result<Self> {
        if port < MIN_TCP_PORT {
            return Err(Error::invalid_config(format!(
                "TCP port must be between {MIN_TCP_PORT} and 65535, got {port}"
            )));
        }
        let peer = format!("{address}:{port}");
        let target = (address, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::connection_failed(Some(peer.clone()), "address did not resolve"))?;

        let stream = TcpStream::connect_timeout(&target, connect_timeout).map_err(|e| {
            warn!(peer = %peer, "Failed to connect to IP robot, check that it is on and listening");
            Error::connection_failed(Some(peer.clone()), e.to_string())
        })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_POLL))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader(
            "rover-tcp-reader",
            BufReader::new(stream.try_clone()?),
            Arc::clone(&shutdown),
            Arc::clone(&events),
        )?;

        info!(peer = %peer, "Connected over TCP");
        events.on_status(ConnectionStatus::Connected);
        Ok(Self {
            stream: Mutex::new(Some(stream)),
            reader: Mutex::new(Some(reader)),
            shutdown,
            events,
            peer,
        })
    }

    fn close(&self) -> bool {
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(stream) = stream else {
            return false;
        };
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = stream.shutdown(Shutdown::Both) {
            debug!("Socket shutdown failed: {e}");
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            let _ = reader.join();
        }
        true
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn write(&self, packet: &[u8]) -> Result<()> {
        let mut guard = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        let stream = guard.as_mut().ok_or(Error::NotConnected)?;
        let mut framed = Vec::with_capacity(packet.len() + 1);
        framed.push(START_BYTE);
        framed.extend_from_slice(packet);
        stream.write_all(&framed)?;
        Ok(())
    }

    fn disconnect(&self) {
        if self.close() {
            info!(peer = %self.peer, "Disconnected");
            self.events.on_status(ConnectionStatus::Disconnected);
        }
    }

    fn stop(&self) {
        self.disconnect();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rover_types::{AttributeType, Packet};
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::mpsc;

    struct Forward {
        packets: Mutex<mpsc::Sender<Packet>>,
        statuses: Mutex<mpsc::Sender<ConnectionStatus>>,
    }

    impl TransportEvents for Forward {
        fn on_packet(&self, packet: Packet) {
            let _ = self.packets.lock().unwrap().send(packet);
        }

        fn on_status(&self, status: ConnectionStatus) {
            let _ = self.statuses.lock().unwrap().send(status);
        }
    }

    #[test]
    fn test_low_port_rejected() {
        let (packets, _) = mpsc::channel();
        let (statuses, _) = mpsc::channel();
        let events = Arc::new(Forward {
            packets: Mutex::new(packets),
            statuses: Mutex::new(statuses),
        });
        let result = TcpTransport::connect("127.0.0.1", 80, Duration::from_secs(1), events);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let robot = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut frame = [0u8; 5];
            socket.read_exact(&mut frame).unwrap();
            // Echo an ACK for whatever attribute was written.
            socket.write_all(&[START_BYTE, 2, frame[2], 0]).unwrap();
            frame
        });

        let (packet_tx, packet_rx) = mpsc::channel();
        let (status_tx, status_rx) = mpsc::channel();
        let events = Arc::new(Forward {
            packets: Mutex::new(packet_tx),
            statuses: Mutex::new(status_tx),
        });
        let transport =
            TcpTransport::connect("127.0.0.1", port, Duration::from_secs(2), events).unwrap();
        assert_eq!(status_rx.recv().unwrap(), ConnectionStatus::Connected);

        transport.write(&[1, 18, 1, 1]).await.unwrap();
        assert_eq!(robot.join().unwrap(), [START_BYTE, 1, 18, 1, 1]);
        assert_eq!(
            packet_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Packet::ack(AttributeType::SpamMode)
        );

        // The robot hung up after one exchange.
        assert_eq!(
            status_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            ConnectionStatus::Disconnected
        );
        transport.stop();
    }
}
