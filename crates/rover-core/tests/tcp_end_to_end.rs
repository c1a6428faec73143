//! End-to-end tests over TCP against an in-process stub robot.
//!
//! The stub ACKs every WRITE within a few milliseconds, answers READs from a
//! fixed table and, once `SPAM_MODE` is switched on, pushes a known 62-byte
//! `ALL_SENSORS` buffer at the rate last written to `SPAM_RATE` (100 ms until
//! one is written).

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rover_core::{
    AttributeType, ConnectionStatus, EngineConfig, Error, OpCode, RetryConfig, RobotCommunicator,
    RoverController,
};
use rover_types::{ALL_SENSORS_LEN, START_BYTE};

const DEFAULT_PUSH_MS: u64 = 100;

fn sensor_buffer() -> Vec<u8> {
    (0..ALL_SENSORS_LEN).map(|i| i as u8).collect()
}

/// Minimal robot firmware over a socket.
struct StubRobot {
    port: u16,
    reads: Arc<Mutex<Vec<AttributeType>>>,
    writes: Arc<Mutex<Vec<(AttributeType, Vec<u8>)>>>,
    hang_up: Arc<AtomicBool>,
    ignore_reads: Arc<AtomicBool>,
}

impl StubRobot {
    fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let reads = Arc::new(Mutex::new(Vec::new()));
        let writes = Arc::new(Mutex::new(Vec::new()));
        let hang_up = Arc::new(AtomicBool::new(false));
        let ignore_reads = Arc::new(AtomicBool::new(false));

        let robot = Self {
            port,
            reads: Arc::clone(&reads),
            writes: Arc::clone(&writes),
            hang_up: Arc::clone(&hang_up),
            ignore_reads: Arc::clone(&ignore_reads),
        };
        thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            serve(socket, reads, writes, hang_up, ignore_reads);
        });
        robot
    }

    fn read_count(&self, attribute: AttributeType) -> usize {
        self.reads
            .lock()
            .unwrap()
            .iter()
            .filter(|a| **a == attribute)
            .count()
    }

    fn writes_to(&self, attribute: AttributeType) -> Vec<Vec<u8>> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| *a == attribute)
            .map(|(_, data)| data.clone())
            .collect()
    }
}

fn read_reply(attribute: AttributeType) -> (u8, Vec<u8>) {
    match attribute {
        AttributeType::TimeOfFlight => (OpCode::ErrorNotImplemented.as_u8(), vec![]),
        AttributeType::SimulatorInfo => (OpCode::Ack.as_u8(), vec![1]),
        AttributeType::StateOfCharge => (OpCode::Ack.as_u8(), vec![87]),
        AttributeType::SensorErrors => (OpCode::Ack.as_u8(), vec![0, 0]),
        AttributeType::Ultrasonic => (OpCode::Ack.as_u8(), vec![0x2C, 0x01]),
        _ => (OpCode::Ack.as_u8(), vec![0]),
    }
}

fn send(writer: &Mutex<TcpStream>, op: u8, attribute: AttributeType, payload: &[u8]) -> bool {
    let mut frame = vec![START_BYTE, op, attribute.as_u8(), payload.len() as u8];
    frame.extend_from_slice(payload);
    writer.lock().unwrap().write_all(&frame).is_ok()
}

fn serve(
    mut socket: TcpStream,
    reads: Arc<Mutex<Vec<AttributeType>>>,
    writes: Arc<Mutex<Vec<(AttributeType, Vec<u8>)>>>,
    hang_up: Arc<AtomicBool>,
    ignore_reads: Arc<AtomicBool>,
) {
    let writer = Arc::new(Mutex::new(socket.try_clone().unwrap()));
    let spamming = Arc::new(AtomicBool::new(false));
    let push_ms = Arc::new(AtomicU64::new(DEFAULT_PUSH_MS));
    socket
        .set_read_timeout(Some(Duration::from_millis(20)))
        .unwrap();

    loop {
        if hang_up.load(Ordering::SeqCst) {
            spamming.store(false, Ordering::SeqCst);
            let _ = socket.shutdown(std::net::Shutdown::Both);
            return;
        }
        let mut header = [0u8; 4];
        match socket.read(&mut header[..1]) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(_) => break,
        }
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        if socket.read_exact(&mut header[1..]).is_err() {
            break;
        }
        assert_eq!(header[0], START_BYTE);
        let mut payload = vec![0u8; usize::from(header[3])];
        if socket.read_exact(&mut payload).is_err() {
            break;
        }
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();

        let attribute = AttributeType::try_from(header[2]).unwrap();
        match OpCode::try_from(header[1]).unwrap() {
            OpCode::Write => {
                writes.lock().unwrap().push((attribute, payload.clone()));
                if attribute == AttributeType::SpamRate && payload.len() == 2 {
                    let ms = u16::from_le_bytes([payload[0], payload[1]]);
                    push_ms.store(u64::from(ms), Ordering::SeqCst);
                }
                if attribute == AttributeType::SpamMode {
                    let on = payload.first() == Some(&1);
                    let was_on = spamming.swap(on, Ordering::SeqCst);
                    if on && !was_on {
                        spawn_pusher(
                            Arc::clone(&writer),
                            Arc::clone(&spamming),
                            Arc::clone(&push_ms),
                        );
                    }
                }
                thread::sleep(Duration::from_millis(2));
                send(&writer, OpCode::Ack.as_u8(), attribute, &[]);
            }
            OpCode::Read => {
                reads.lock().unwrap().push(attribute);
                if ignore_reads.load(Ordering::SeqCst) {
                    continue;
                }
                let (op, data) = read_reply(attribute);
                send(&writer, op, attribute, &data);
            }
            _ => {}
        }
    }
    spamming.store(false, Ordering::SeqCst);
}

fn spawn_pusher(writer: Arc<Mutex<TcpStream>>, spamming: Arc<AtomicBool>, push_ms: Arc<AtomicU64>) {
    thread::spawn(move || {
        let buffer = sensor_buffer();
        while spamming.load(Ordering::SeqCst) {
            if !send(&writer, OpCode::Notify.as_u8(), AttributeType::AllSensors, &buffer) {
                return;
            }
            thread::sleep(Duration::from_millis(push_ms.load(Ordering::SeqCst)));
        }
    });
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn communicator() -> RobotCommunicator {
    init_tracing();
    RobotCommunicator::new(EngineConfig::default().default_timeout(Duration::from_secs(1))).unwrap()
}

#[test]
fn test_sensor_spam_serves_reads_from_cache() {
    let robot = StubRobot::spawn();
    let comms = communicator();
    comms.connect_ip("127.0.0.1", robot.port).unwrap();
    assert!(comms.is_tcp());
    assert!(comms.is_connected());

    comms.start_sensor_spam(None).unwrap();
    assert!(comms.sensor_spam_active());
    // No latency measured before the first write, so the default interval applies.
    assert_eq!(robot.writes_to(AttributeType::SpamRate), vec![vec![50, 0]]);
    assert_eq!(robot.writes_to(AttributeType::SpamMode), vec![vec![1]]);
    assert_eq!(comms.cache_use_by(), Duration::from_millis(90));

    thread::sleep(Duration::from_millis(150));
    let ultrasonic = comms
        .read_attribute(AttributeType::Ultrasonic, &[], None)
        .unwrap();
    assert_eq!(ultrasonic, sensor_buffer()[0..2].to_vec());
    assert_eq!(robot.read_count(AttributeType::Ultrasonic), 0);

    comms.stop_sensor_spam().unwrap();
    comms.stop().unwrap();
}

#[test]
fn test_new_interval_discards_cached_push() {
    let robot = StubRobot::spawn();
    let comms = communicator();
    comms.connect_ip("127.0.0.1", robot.port).unwrap();

    comms.start_sensor_spam(Some(1_000)).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(
        comms
            .read_attribute(AttributeType::Ultrasonic, &[], None)
            .unwrap(),
        sensor_buffer()[0..2].to_vec()
    );
    assert_eq!(robot.read_count(AttributeType::Ultrasonic), 0);

    // The next push is most of a second away.
    comms.start_sensor_spam(Some(2_000)).unwrap();
    assert_eq!(comms.cache_use_by(), Duration::from_millis(3_600));
    let ultrasonic = comms
        .read_attribute(AttributeType::Ultrasonic, &[], None)
        .unwrap();
    assert_eq!(ultrasonic, vec![0x2C, 0x01]);
    assert_eq!(robot.read_count(AttributeType::Ultrasonic), 1);

    comms.stop().unwrap();
}

#[test]
fn test_reset_cancels_outstanding_reads() {
    let robot = StubRobot::spawn();
    let comms = Arc::new(communicator());
    comms.connect_ip("127.0.0.1", robot.port).unwrap();
    robot.ignore_reads.store(true, Ordering::SeqCst);

    let started = Instant::now();
    let callers: Vec<_> = [
        AttributeType::Ultrasonic,
        AttributeType::Gyro,
        AttributeType::StateOfCharge,
    ]
    .into_iter()
    .map(|attribute| {
        let comms = Arc::clone(&comms);
        thread::spawn(move || {
            comms.read_attribute(attribute, &[], Some(Duration::from_secs(5)))
        })
    })
    .collect();

    // One read is on the wire, the other two are queued behind it.
    let deadline = Instant::now() + Duration::from_secs(2);
    while robot.read_count(AttributeType::Ultrasonic)
        + robot.read_count(AttributeType::Gyro)
        + robot.read_count(AttributeType::StateOfCharge)
        == 0
    {
        assert!(Instant::now() < deadline, "no read reached the robot");
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(100));
    comms.reset_communications();

    for caller in callers {
        let result = caller.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");
    }
    assert!(started.elapsed() < Duration::from_secs(2));

    // Built-in subscriptions are back: a push fills the cache again.
    robot.ignore_reads.store(false, Ordering::SeqCst);
    comms.start_sensor_spam(Some(100)).unwrap();
    thread::sleep(Duration::from_millis(150));
    let reads_before = robot.read_count(AttributeType::Ultrasonic);
    assert_eq!(
        comms
            .read_attribute(AttributeType::Ultrasonic, &[], None)
            .unwrap(),
        sensor_buffer()[0..2].to_vec()
    );
    assert_eq!(robot.read_count(AttributeType::Ultrasonic), reads_before);

    comms.stop_sensor_spam().unwrap();
    comms.stop().unwrap();
}

#[test]
fn test_reads_and_writes_round_trip() {
    let robot = StubRobot::spawn();
    let comms = communicator();
    comms.connect_ip("127.0.0.1", robot.port).unwrap();

    let ultrasonic = comms
        .read_attribute(AttributeType::Ultrasonic, &[], None)
        .unwrap();
    assert_eq!(ultrasonic, vec![0x2C, 0x01]);
    assert_eq!(robot.read_count(AttributeType::Ultrasonic), 1);

    let ack = comms
        .write_attribute(AttributeType::MotorSet, &[1, 30, 30, 0, 0, 0, 0], None)
        .unwrap();
    assert!(ack.is_empty());
    assert_eq!(
        robot.writes_to(AttributeType::MotorSet),
        vec![vec![1, 30, 30, 0, 0, 0, 0]]
    );

    let stats = comms.comms_timing_stats().unwrap();
    assert!(stats.average_write_ms > 0.0);
    assert!(stats.average_transaction_ms > 0.0);
    assert!(stats.recommended_interval_ms >= 10);

    comms.stop().unwrap();
}

#[test]
fn test_concurrent_callers_are_serialized() {
    let robot = StubRobot::spawn();
    let comms = Arc::new(communicator());
    comms.connect_ip("127.0.0.1", robot.port).unwrap();

    let handles: Vec<_> = (0..4u8)
        .map(|i| {
            let comms = Arc::clone(&comms);
            thread::spawn(move || {
                comms
                    .write_attribute(AttributeType::Rgbs, &[i, i, i], None)
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(robot.writes_to(AttributeType::Rgbs).len(), 4);
    comms.stop().unwrap();
}

#[test]
fn test_not_implemented_reported_to_caller() {
    let robot = StubRobot::spawn();
    let comms = communicator();
    comms.connect_ip("127.0.0.1", robot.port).unwrap();

    match comms.read_attribute(AttributeType::TimeOfFlight, &[], None) {
        Err(Error::Device { message, .. }) => {
            assert!(message.contains("not implemented"), "{message}");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    // The link is still usable afterwards.
    comms
        .read_attribute(AttributeType::StateOfCharge, &[], None)
        .unwrap();
    comms.stop().unwrap();
}

#[test]
fn test_write_without_ack_does_not_wait() {
    let robot = StubRobot::spawn();
    let comms = communicator();
    comms.connect_ip("127.0.0.1", robot.port).unwrap();

    let result = comms
        .write_packet(OpCode::Write, AttributeType::BuzzerFreq, &[0, 0], false, None)
        .unwrap();
    assert!(result.is_empty());
    // The unsolicited ACK that follows must not break later requests.
    comms
        .write_attribute(AttributeType::BuzzerFreq, &[0x10, 0x01], None)
        .unwrap();
    comms.stop().unwrap();
}

#[test]
fn test_robot_hang_up_reports_disconnected() {
    let robot = StubRobot::spawn();
    let comms = communicator();
    let mut status = comms.watch_status();
    comms.connect_ip("127.0.0.1", robot.port).unwrap();
    assert_eq!(*status.borrow_and_update(), ConnectionStatus::Connected);

    robot.hang_up.store(true, Ordering::SeqCst);
    let deadline = Instant::now() + Duration::from_secs(2);
    while comms.connection_status() != ConnectionStatus::Disconnected {
        assert!(Instant::now() < deadline, "no disconnect reported");
        thread::sleep(Duration::from_millis(10));
    }
    assert!(matches!(
        comms.write_attribute(AttributeType::MotorSet, &[0; 7], None),
        Err(Error::NotConnected)
    ));
    comms.stop().unwrap();
}

#[test]
fn test_controller_interrogates_after_connect() {
    init_tracing();
    let robot = StubRobot::spawn();
    let rover = RoverController::new(EngineConfig::default()).unwrap();
    let info = rover
        .connect_ip_with_retry("127.0.0.1", robot.port, &RetryConfig::none())
        .unwrap();

    assert_eq!(info.simulator_info, 1);
    assert_eq!(info.battery_percentage, Some(87));
    assert_eq!(info.sensor_error_mask, Some(0));
    assert!(rover.connected_robot_is_simulated());

    rover.start_rover(Some(false)).unwrap();
    assert_eq!(robot.writes_to(AttributeType::ButtonPress), vec![vec![1]]);
    assert!(robot.writes_to(AttributeType::SpamMode).is_empty());

    rover.stop_rover();
    let deadline = Instant::now() + Duration::from_secs(2);
    while robot.writes_to(AttributeType::ButtonPress).len() < 2 {
        assert!(Instant::now() < deadline, "stop sequence not received");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(robot.writes_to(AttributeType::MotorSet), vec![vec![0; 7]]);
    assert_eq!(robot.writes_to(AttributeType::ButtonPress)[1], vec![0]);
    rover.end().unwrap();
}
