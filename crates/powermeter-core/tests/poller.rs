use powermeter_core::config::MeterConfig;
use powermeter_core::meter::{MeterReader, Reading, ReadingMode};
use powermeter_core::poller::{Poller, PollerConfig, PollerState};
use powermeter_core::protocol::frame::read_request;
use powermeter_core::protocol::{
    ModbusMaster, ProtocolError, SerialLink, SerialSettings, Transport, TransportError,
};
use powermeter_core::simulator::SimulatedMeter;
use powermeter_core::storage::{load_readings, JsonLinesSink, ReadingSink, SinkError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fast_config(mode: ReadingMode) -> PollerConfig {
    PollerConfig {
        mode,
        poll_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(2),
    }
}

fn simulated_reader() -> MeterReader {
    let mut settings = SerialSettings::for_port("simulated");
    settings.timeout_ms = 200;
    let transport = Transport::with_link(settings, Box::new(SimulatedMeter::with_seed(1, 11)));
    MeterReader::new(Arc::new(ModbusMaster::new(transport, 1)))
}

fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Sink that keeps readings in memory
#[derive(Clone, Default)]
struct MemorySink {
    readings: Arc<Mutex<Vec<Reading>>>,
}

impl ReadingSink for MemorySink {
    fn store_reading(&mut self, reading: &Reading) -> Result<(), SinkError> {
        self.readings.lock().unwrap().push(reading.clone());
        Ok(())
    }
}

/// Sink that always fails
struct BrokenSink;

impl ReadingSink for BrokenSink {
    fn store_reading(&mut self, _reading: &Reading) -> Result<(), SinkError> {
        Err(SinkError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk full",
        )))
    }
}

#[test]
fn test_poller_publishes_snapshots() {
    init_tracing();
    let sink = MemorySink::default();
    let mut poller = Poller::new(simulated_reader(), fast_config(ReadingMode::Detailed))
        .with_sink(Box::new(sink.clone()));
    let handle = poller.handle();
    assert_eq!(poller.state(), PollerState::Idle);
    assert!(handle.latest_snapshot().is_none());

    poller.start().unwrap();
    assert_eq!(poller.state(), PollerState::Polling);
    assert!(wait_for(|| sink.readings.lock().unwrap().len() >= 3));

    let latest = handle.latest_snapshot().unwrap();
    assert_eq!(latest.mode(), ReadingMode::Detailed);
    assert_eq!(latest.data_scalar(), 3);

    poller.stop();
    assert_eq!(poller.state(), PollerState::Stopped);

    // Snapshots stay readable after stopping
    assert!(handle.latest_snapshot().is_some());
}

#[test]
fn test_on_demand_reads_share_the_transport() {
    init_tracing();
    let mut poller = Poller::new(simulated_reader(), fast_config(ReadingMode::Basic));
    let handle = poller.handle();
    poller.start().unwrap();

    for _ in 0..20 {
        assert_eq!(handle.read_register(44602).unwrap(), 3);
        assert_eq!(handle.read_registers(44001, 64).unwrap().len(), 64);
    }
    poller.stop();
}

#[test]
fn test_read_registers_clamps_count() {
    let poller = Poller::new(simulated_reader(), fast_config(ReadingMode::Basic));
    let handle = poller.handle();
    // Count 0 becomes 1
    assert_eq!(handle.read_registers(44602, 0).unwrap(), vec![3]);
    // 1000 becomes 125, which runs past the measurement block
    assert!(matches!(
        handle.read_registers(44001, 1000),
        Err(ProtocolError::Exception(e)) if e.code == 2
    ));
}

#[test]
fn test_raw_command_through_handle() {
    let poller = Poller::new(simulated_reader(), fast_config(ReadingMode::Basic));
    let handle = poller.handle();
    let command = read_request(1, 44602, 1).unwrap();
    let raw = handle.send_raw_command(&command).unwrap();
    let parsed = handle.parse_response(&command, &raw).unwrap();
    assert_eq!(parsed.registers(), Some(&[3u16][..]));
}

#[test]
fn test_failed_connect_is_reported_once() {
    init_tracing();
    let transport = Transport::with_opener(
        SerialSettings::for_port("/dev/does-not-exist"),
        Box::new(|s: &SerialSettings| -> Result<Box<dyn SerialLink>, TransportError> {
            Err(TransportError::ConnectionFailed {
                port: s.port.clone(),
                reason: "no such device".to_string(),
            })
        }),
    );
    let reader = MeterReader::new(Arc::new(ModbusMaster::new(transport, 1)));
    let mut poller = Poller::new(reader, fast_config(ReadingMode::Basic));

    assert!(poller.start().is_err());
    assert_eq!(poller.state(), PollerState::Failed);
    assert!(poller.handle().latest_snapshot().is_none());
}

#[test]
fn test_cycle_failures_do_not_stop_polling() {
    init_tracing();
    // Meter at address 1, poller asking address 2: every cycle times out
    let mut settings = SerialSettings::for_port("simulated");
    settings.timeout_ms = 10;
    let transport = Transport::with_link(settings, Box::new(SimulatedMeter::with_seed(1, 5)));
    let reader = MeterReader::new(Arc::new(ModbusMaster::new(transport, 2)));
    let mut poller = Poller::new(reader, fast_config(ReadingMode::Basic));

    poller.start().unwrap();
    thread::sleep(Duration::from_millis(150));
    assert_eq!(poller.state(), PollerState::Polling);
    assert!(poller.handle().latest_snapshot().is_none());
    poller.stop();
    assert_eq!(poller.state(), PollerState::Stopped);
}

#[test]
fn test_sink_failures_do_not_block_publication() {
    let mut poller = Poller::new(simulated_reader(), fast_config(ReadingMode::Basic))
        .with_sink(Box::new(BrokenSink));
    let handle = poller.handle();
    poller.start().unwrap();
    assert!(wait_for(|| handle.latest_snapshot().is_some()));
    poller.stop();
}

#[test]
fn test_stop_wakes_a_long_sleep() {
    let config = PollerConfig {
        mode: ReadingMode::Basic,
        poll_interval: Duration::from_secs(60),
        shutdown_timeout: Duration::from_secs(5),
    };
    // Stopping closes the link, so restarting needs a transport that can reopen it
    let master = Arc::new(ModbusMaster::new(SimulatedMeter::transport(1), 1));
    let mut poller = Poller::new(MeterReader::new(master), config);
    let handle = poller.handle();
    poller.start().unwrap();
    assert!(wait_for(|| handle.latest_snapshot().is_some()));

    let started = Instant::now();
    poller.stop();
    assert!(started.elapsed() < Duration::from_secs(2));

    // The reader came back, so the poller can run again
    poller.start().unwrap();
    assert_eq!(poller.state(), PollerState::Polling);
    poller.stop();
}

#[test]
fn test_json_lines_storage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("readings.jsonl");

    let sink = JsonLinesSink::open(&path).unwrap();
    assert_eq!(sink.path(), path.as_path());
    let mut poller = Poller::new(simulated_reader(), fast_config(ReadingMode::Detailed))
        .with_sink(Box::new(sink));
    poller.start().unwrap();
    assert!(wait_for(|| load_readings(&path)
        .map(|r| r.len() >= 2)
        .unwrap_or(false)));
    poller.stop();

    let stored = load_readings(&path).unwrap();
    assert!(stored.iter().all(|r| r.mode() == ReadingMode::Detailed));
    assert!(stored.windows(2).all(|w| w[0].timestamp() <= w[1].timestamp()));
}

#[test]
fn test_poller_from_config() {
    let config = MeterConfig {
        detailed: false,
        poll_interval_secs: 1,
        ..MeterConfig::default()
    };
    let master = Arc::new(ModbusMaster::new(SimulatedMeter::transport(1), 1));
    let mut poller = Poller::new(config.reader(master), config.poller_config());
    let handle = poller.handle();
    poller.start().unwrap();
    assert!(wait_for(|| handle.latest_snapshot().is_some()));
    assert_eq!(
        handle.latest_snapshot().map(|r| r.mode()),
        Some(ReadingMode::Basic)
    );
    poller.stop();
}
