//! Start-byte framing for byte-stream links (serial and TCP).
//!
//! On a stream every packet is preceded by [`START_BYTE`]. The framer strips
//! it, reads the three-byte header and then the payload. An `ACK` for
//! `RPI_IMAGE` is special: its declared payload is a little-endian
//! `(width, height)` prefix, and the real payload that follows is
//! `width * height * 3` bytes of pixel data.

use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use bytes::Buf;
use tracing::{debug, info, warn};

use rover_types::{AttributeType, ConnectionStatus, OpCode, Packet, START_BYTE};

use crate::error::{Error, Result};
use crate::transport::TransportEvents;

/// Largest image payload accepted from the stream.
pub const MAX_IMAGE_BYTES: usize = 32 * 1024 * 1024;

/// Reads framed packets from a blocking byte stream.
///
/// Read timeouts on the underlying stream are retried until the shared
/// shutdown flag is raised, so a reader blocked on a quiet link can still be
/// stopped.
pub struct FrameReader<R> {
    inner: R,
    shutdown: Arc<AtomicBool>,
}

impl<R: Read> FrameReader<R> {
    /// Wrap a stream.
    pub fn new(inner: R, shutdown: Arc<AtomicBool>) -> Self {
        Self { inner, shutdown }
    }

    /// Read the next packet.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] means one packet was skipped but the stream is
    /// still aligned. Any other error means the stream is unusable.
    pub fn read_packet(&mut self) -> Result<Packet> {
        self.sync_to_start()?;

        let mut header = [0u8; 3];
        self.fill(&mut header)?;
        let [op, attr, declared] = header;
        let mut len = usize::from(declared);

        if op == OpCode::Ack.as_u8() && attr == AttributeType::RpiImage.as_u8() && len > 0 {
            len = self.read_image_len(len)?;
        }

        let mut payload = vec![0u8; len];
        self.fill(&mut payload)?;

        Ok(Packet {
            op_code: OpCode::try_from(op)?,
            attribute: AttributeType::try_from(attr)?,
            payload,
        })
    }

    fn sync_to_start(&mut self) -> Result<()> {
        let mut skipped = 0usize;
        let mut byte = [0u8; 1];
        loop {
            self.fill(&mut byte)?;
            if byte[0] == START_BYTE {
                if skipped > 0 {
                    warn!(skipped, "Discarded bytes before start of frame");
                }
                return Ok(());
            }
            skipped += 1;
        }
    }

    fn read_image_len(&mut self, prefix_len: usize) -> Result<usize> {
        let mut prefix = vec![0u8; prefix_len];
        self.fill(&mut prefix)?;
        if prefix.len() < 4 {
            return Err(Error::ProtocolViolation(format!(
                "image dimension prefix is {prefix_len} bytes, expected 4"
            )));
        }
        let mut dims = &prefix[..];
        let width = dims.get_u16_le();
        let height = dims.get_u16_le();
        // Sized in u64: the product overflows a 32-bit usize.
        let len = u64::from(width) * u64::from(height) * 3;
        match usize::try_from(len) {
            Ok(len) if len <= MAX_IMAGE_BYTES => {
                debug!(width, height, "Receiving image");
                Ok(len)
            }
            _ => Err(Error::ProtocolViolation(format!(
                "image of {width}x{height} exceeds {MAX_IMAGE_BYTES} bytes"
            ))),
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => return Err(Error::Io(ErrorKind::UnexpectedEof.into())),
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    if self.shutdown.load(Ordering::Acquire) {
                        return Err(Error::Io(e));
                    }
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }
}

/// Spawn the background reader for a stream transport.
///
/// The thread forwards packets to `events` until the stream fails. A failure
/// is reported as [`ConnectionStatus::Disconnected`] unless `shutdown` was
/// raised, in which case the closing side reports it.
pub(crate) fn spawn_reader<R>(
    name: &str,
    reader: R,
    shutdown: Arc<AtomicBool>,
    events: Arc<dyn TransportEvents>,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let mut frames = FrameReader::new(reader, Arc::clone(&shutdown));
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            loop {
                match frames.read_packet() {
                    Ok(packet) => events.on_packet(packet),
                    Err(Error::Protocol(e)) => warn!("Dropping undecodable packet: {e}"),
                    Err(e) => {
                        if !shutdown.load(Ordering::Acquire) {
                            info!("Connection closed: {e}");
                            events.on_status(ConnectionStatus::Disconnected);
                        }
                        return;
                    }
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;

    fn reader(bytes: Vec<u8>) -> FrameReader<Cursor<Vec<u8>>> {
        FrameReader::new(Cursor::new(bytes), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_reads_consecutive_packets() {
        let mut frames = reader(vec![
            START_BYTE, 2, 18, 0, // ACK SPAM_MODE
            START_BYTE, 3, 14, 1, 87, // NOTIFY STATE_OF_CHARGE
        ]);
        assert_eq!(frames.read_packet().unwrap(), Packet::ack(AttributeType::SpamMode));
        let notify = frames.read_packet().unwrap();
        assert_eq!(notify.op_code, OpCode::Notify);
        assert_eq!(notify.attribute, AttributeType::StateOfCharge);
        assert_eq!(notify.payload, vec![87]);
    }

    #[test]
    fn test_resyncs_on_garbage() {
        let mut frames = reader(vec![0x00, 0xFF, START_BYTE, 2, 0, 0]);
        assert_eq!(frames.read_packet().unwrap(), Packet::ack(AttributeType::MotorSet));
    }

    #[test]
    fn test_image_payload_uses_dimensions() {
        let mut bytes = vec![START_BYTE, 2, 24, 4, 2, 0, 3, 0];
        bytes.extend((0..18).map(|i| i as u8));
        let mut frames = reader(bytes);
        let packet = frames.read_packet().unwrap();
        assert_eq!(packet.attribute, AttributeType::RpiImage);
        assert_eq!(packet.payload.len(), 2 * 3 * 3);
        assert_eq!(packet.payload[17], 17);
    }

    #[test]
    fn test_oversized_image_rejected() {
        // 4096x2731 is just over the cap; 65535x65535 overflows 32-bit sizes.
        for dims in [[0x00, 0x10, 0xAB, 0x0A], [0xFF, 0xFF, 0xFF, 0xFF]] {
            let mut bytes = vec![START_BYTE, 2, 24, 4];
            bytes.extend(dims);
            match reader(bytes).read_packet() {
                Err(Error::ProtocolViolation(message)) => {
                    assert!(message.contains("exceeds"), "{message}");
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }

    #[test]
    fn test_image_ack_without_payload() {
        let mut frames = reader(vec![START_BYTE, 2, 24, 0]);
        assert!(frames.read_packet().unwrap().payload.is_empty());
    }

    #[test]
    fn test_unknown_opcode_keeps_alignment() {
        let mut frames = reader(vec![START_BYTE, 9, 0, 1, 0xAA, START_BYTE, 2, 7, 0]);
        assert!(matches!(frames.read_packet(), Err(Error::Protocol(_))));
        assert_eq!(frames.read_packet().unwrap(), Packet::ack(AttributeType::Ultrasonic));
    }

    #[test]
    fn test_short_read_is_fatal() {
        let mut frames = reader(vec![START_BYTE, 3, 20, 62, 1, 2]);
        match frames.read_packet() {
            Err(Error::Io(e)) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[derive(Default)]
    struct Recorder {
        packets: Mutex<Vec<Packet>>,
        statuses: Mutex<Vec<ConnectionStatus>>,
    }

    impl TransportEvents for Recorder {
        fn on_packet(&self, packet: Packet) {
            self.packets.lock().unwrap().push(packet);
        }

        fn on_status(&self, status: ConnectionStatus) {
            self.statuses.lock().unwrap().push(status);
        }
    }

    #[test]
    fn test_reader_thread_reports_disconnect() {
        let recorder = Arc::new(Recorder::default());
        let handle = spawn_reader(
            "test-reader",
            Cursor::new(vec![START_BYTE, 2, 1, 0]),
            Arc::new(AtomicBool::new(false)),
            recorder.clone(),
        )
        .unwrap();
        handle.join().unwrap();
        assert_eq!(recorder.packets.lock().unwrap().len(), 1);
        assert_eq!(
            *recorder.statuses.lock().unwrap(),
            vec![ConnectionStatus::Disconnected]
        );
    }

    #[test]
    fn test_reader_thread_silent_on_shutdown() {
        let recorder = Arc::new(Recorder::default());
        let handle = spawn_reader(
            "test-reader",
            Cursor::new(Vec::new()),
            Arc::new(AtomicBool::new(true)),
            recorder.clone(),
        )
        .unwrap();
        handle.join().unwrap();
        assert!(recorder.statuses.lock().unwrap().is_empty());
    }
}
