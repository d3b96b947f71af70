//! Acquisition engine behaviour against a scripted data source

use emu_telemetry::{
    AcquisitionEngine, DataSource, EngineConfig, EngineState, Field, FieldStatus, Frame, RecvError,
    Result, SnapshotReceiver, SourceEvent, TelemetryError, TelemetrySnapshot,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// What the scripted bus does, shared between the test and the engine thread
#[derive(Default)]
struct Bus {
    plugged: bool,
    /// Frames delivered once, before the repeating feed
    queue: VecDeque<Frame>,
    /// Frames delivered round-robin while plugged
    feed: Vec<(u32, Vec<u8>)>,
    feed_index: usize,
    opens: u32,
    closes: u32,
}

#[derive(Clone)]
struct ScriptedSource {
    bus: Arc<Mutex<Bus>>,
}

impl ScriptedSource {
    fn new() -> Self {
        let bus = Bus {
            plugged: true,
            ..Bus::default()
        };
        Self {
            bus: Arc::new(Mutex::new(bus)),
        }
    }

    fn feed(&self, frames: Vec<(u32, Vec<u8>)>) {
        let mut bus = self.bus.lock();
        bus.feed = frames;
        bus.feed_index = 0;
    }

    fn push(&self, id: u32, payload: &[u8]) {
        self.bus.lock().queue.push_back(Frame::new(id, payload).unwrap());
    }

    fn set_plugged(&self, plugged: bool) {
        self.bus.lock().plugged = plugged;
    }

    fn opens(&self) -> u32 {
        self.bus.lock().opens
    }

    fn closes(&self) -> u32 {
        self.bus.lock().closes
    }
}

impl DataSource for ScriptedSource {
    fn open(&mut self) -> Result<()> {
        let mut bus = self.bus.lock();
        bus.opens += 1;
        if bus.plugged {
            Ok(())
        } else {
            Err(TelemetryError::SourceOpen {
                source_name: "scripted".to_string(),
                reason: "unplugged".to_string(),
            })
        }
    }

    fn next_frame(&mut self, timeout: Duration) -> SourceEvent {
        let step = {
            let mut bus = self.bus.lock();
            if !bus.plugged {
                Some(SourceEvent::Disconnected)
            } else if let Some(frame) = bus.queue.pop_front() {
                Some(SourceEvent::Frame(frame))
            } else if !bus.feed.is_empty() {
                let index = bus.feed_index % bus.feed.len();
                bus.feed_index += 1;
                let (id, payload) = bus.feed[index].clone();
                Some(SourceEvent::Frame(Frame::new(id, &payload).unwrap()))
            } else {
                None
            }
        };

        match step {
            Some(SourceEvent::Frame(frame)) => {
                // roughly a 500 Hz bus
                thread::sleep(Duration::from_millis(2).min(timeout));
                SourceEvent::Frame(frame)
            }
            Some(event) => {
                thread::sleep(Duration::from_millis(2).min(timeout));
                event
            }
            None => {
                thread::sleep(timeout);
                SourceEvent::Timeout
            }
        }
    }

    fn close(&mut self) {
        self.bus.lock().closes += 1;
    }

    fn describe(&self) -> String {
        "scripted bus".to_string()
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig::new()
        .with_update_rate(100)
        .with_poll_timeout(Duration::from_millis(5))
        .with_staleness_timeout(Duration::from_millis(150))
        .with_link_grace(Duration::from_millis(200))
        .with_reconnect_backoff(Duration::from_millis(10), Duration::from_millis(40))
        .with_smoothing(Field::Rpm, 1.0)
}

fn rpm_frame(rpm: u16) -> (u32, Vec<u8>) {
    let bytes = rpm.to_le_bytes();
    (0x600, vec![bytes[0], bytes[1], 0, 0, 0x10, 0x04, 0, 0])
}

/// Receive until a snapshot matches or the deadline passes
fn wait_for<F>(receiver: &mut SnapshotReceiver, timeout: Duration, mut predicate: F) -> Arc<TelemetrySnapshot>
where
    F: FnMut(&TelemetrySnapshot) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(remaining.max(Duration::from_millis(1))) {
            Ok(snapshot) if predicate(&snapshot) => return snapshot,
            Ok(_) => {}
            Err(e) => panic!("no matching snapshot: {}", e),
        }
        if Instant::now() > deadline {
            panic!("no matching snapshot within {:?}", timeout);
        }
    }
}

#[test]
fn test_snapshots_are_published_with_increasing_sequence() {
    let source = ScriptedSource::new();
    source.feed(vec![rpm_frame(3500)]);

    let engine = AcquisitionEngine::new(fast_config()).unwrap();
    let (mut handle, mut receiver) = engine.spawn(source.clone()).unwrap();

    let snapshot = wait_for(&mut receiver, Duration::from_secs(5), |s| {
        s.link.state == EngineState::Running && s.value(Field::Rpm).is_some()
    });
    assert_eq!(snapshot.value(Field::Rpm), Some(3500.0));
    assert_eq!(handle.state(), EngineState::Running);

    let mut last = snapshot.sequence;
    for _ in 0..10 {
        let next = receiver.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(next.sequence > last);
        last = next.sequence;
    }

    handle.stop().unwrap();
    assert_eq!(handle.state(), EngineState::Stopped);
    assert!(source.closes() >= 1);
}

#[test]
fn test_disconnect_then_reconnect_without_restart() {
    let source = ScriptedSource::new();
    source.feed(vec![rpm_frame(2000)]);

    let engine = AcquisitionEngine::new(fast_config()).unwrap();
    let (mut handle, mut receiver) = engine.spawn(source.clone()).unwrap();
    wait_for(&mut receiver, Duration::from_secs(5), |s| s.link.state == EngineState::Running);

    source.set_plugged(false);
    let down = wait_for(&mut receiver, Duration::from_secs(5), |s| {
        s.link.state == EngineState::Disconnected
    });
    assert_eq!(down.status(Field::Rpm), FieldStatus::Stale);
    assert_eq!(down.value(Field::Rpm), None);
    assert_eq!(handle.state(), EngineState::Disconnected);

    // a single disconnected snapshot, then silence
    assert_eq!(
        receiver.recv_timeout(Duration::from_millis(150)).unwrap_err(),
        RecvError::Timeout
    );

    let opens_while_down = source.opens();
    source.set_plugged(true);
    let up = wait_for(&mut receiver, Duration::from_secs(5), |s| {
        s.link.state == EngineState::Running && s.value(Field::Rpm).is_some()
    });
    assert!(up.sequence > down.sequence);
    assert!(up.link.reconnect_attempts >= 1);
    assert!(source.opens() > opens_while_down);
    assert!(handle.is_running());

    handle.stop().unwrap();
}

#[test]
fn test_bus_silence_is_a_disconnect() {
    let source = ScriptedSource::new();
    source.push(0x600, &rpm_frame(1500).1);

    let engine = AcquisitionEngine::new(fast_config()).unwrap();
    let (mut handle, mut receiver) = engine.spawn(source.clone()).unwrap();

    let snapshot = wait_for(&mut receiver, Duration::from_secs(5), |s| {
        s.link.state == EngineState::Disconnected
    });
    assert_eq!(snapshot.live_count(), 0);
    handle.stop().unwrap();
}

#[test]
fn test_field_goes_stale_while_link_is_alive() {
    let source = ScriptedSource::new();
    // oil pressure 3.0 bar once, then only RPM
    source.push(0x604, &[0x2C, 0x01, 0, 0, 0, 0, 0, 0]);
    source.feed(vec![rpm_frame(900)]);

    let config = fast_config().with_smoothing(Field::OilPressure, 1.0);
    let engine = AcquisitionEngine::new(config).unwrap();
    let (mut handle, mut receiver) = engine.spawn(source).unwrap();

    let snapshot = wait_for(&mut receiver, Duration::from_secs(5), |s| {
        s.status(Field::OilPressure) == FieldStatus::Stale
    });
    assert_eq!(snapshot.link.state, EngineState::Running);
    assert_eq!(snapshot.value(Field::OilPressure), None);
    assert_eq!(snapshot.level(Field::OilPressure), emu_telemetry::WarningLevel::Normal);
    assert_eq!(snapshot.status(Field::Rpm), FieldStatus::Live);

    handle.stop().unwrap();
}

#[test]
fn test_unknown_identifiers_leave_fields_untouched() {
    let source = ScriptedSource::new();
    source.push(0x600, &rpm_frame(4200).1);
    source.feed(vec![rpm_frame(4200), (0x123, vec![0xFF; 8]), (0x7E8, vec![0; 8])]);

    let config = fast_config().with_error_window(Duration::from_secs(1), 5);
    let engine = AcquisitionEngine::new(config).unwrap();
    let (mut handle, mut receiver) = engine.spawn(source).unwrap();

    let snapshot = wait_for(&mut receiver, Duration::from_secs(5), |s| s.link.degraded);
    assert_eq!(snapshot.value(Field::Rpm), Some(4200.0));
    assert!(snapshot.link.unknown_identifiers >= 5);
    assert_eq!(snapshot.link.truncated_frames, 0);
    assert_eq!(snapshot.link.state, EngineState::Running);

    handle.stop().unwrap();
}

#[test]
fn test_truncated_frames_are_counted() {
    let source = ScriptedSource::new();
    source.feed(vec![rpm_frame(3000), (0x603, vec![0x10])]);

    let engine = AcquisitionEngine::new(fast_config()).unwrap();
    let (mut handle, mut receiver) = engine.spawn(source).unwrap();

    let snapshot = wait_for(&mut receiver, Duration::from_secs(5), |s| s.link.truncated_frames > 0);
    assert_eq!(snapshot.status(Field::CoolantTemp), FieldStatus::Unknown);
    assert!(snapshot.value(Field::Rpm).is_some());

    handle.stop().unwrap();
}

#[test]
fn test_stop_closes_channel_and_source() {
    let source = ScriptedSource::new();
    source.feed(vec![rpm_frame(1000)]);

    let engine = AcquisitionEngine::new(fast_config()).unwrap();
    let (mut handle, mut receiver) = engine.spawn(source.clone()).unwrap();
    wait_for(&mut receiver, Duration::from_secs(5), |s| s.link.state == EngineState::Running);

    handle.stop().unwrap();
    let last = receiver.latest().map(|s| s.sequence);

    // drain anything published before the stop, then the channel reports closed
    loop {
        match receiver.recv_timeout(Duration::from_secs(2)) {
            Ok(_) => continue,
            Err(e) => {
                assert_eq!(e, RecvError::Closed);
                break;
            }
        }
    }
    assert_eq!(receiver.latest().map(|s| s.sequence), last);
    assert_eq!(source.closes(), 1);

    // second stop is a no-op
    handle.stop().unwrap();
    assert_eq!(source.closes(), 1);
}

#[test]
fn test_dropping_handle_stops_engine() {
    let source = ScriptedSource::new();
    source.feed(vec![rpm_frame(1000)]);

    let engine = AcquisitionEngine::new(fast_config()).unwrap();
    let (handle, receiver) = engine.spawn(source.clone()).unwrap();
    drop(handle);

    assert!(receiver.is_closed());
    assert_eq!(source.closes(), 1);
}

#[test]
fn test_open_failure_processes_nothing() {
    let source = ScriptedSource::new();
    source.set_plugged(false);

    let engine = AcquisitionEngine::new(fast_config()).unwrap();
    let result = engine.spawn(source.clone());
    assert!(matches!(result, Err(TelemetryError::SourceOpen { .. })));
    assert_eq!(source.opens(), 1);
}

#[test]
fn test_restart_continues_sequence() {
    let source = ScriptedSource::new();
    source.feed(vec![rpm_frame(1000)]);
    let engine = AcquisitionEngine::new(fast_config()).unwrap();

    let (mut first, mut receiver) = engine.spawn(source.clone()).unwrap();
    let before = wait_for(&mut receiver, Duration::from_secs(5), |_| true).sequence;
    first.stop().unwrap();

    let (mut second, mut receiver) = engine.spawn(source).unwrap();
    let after = wait_for(&mut receiver, Duration::from_secs(5), |_| true).sequence;
    assert!(after > before);
    second.stop().unwrap();
}
