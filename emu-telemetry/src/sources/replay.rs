//! candump log replay
//!
//! Replays logs written by `candump -l` (or `candump -L`):
//!
//! ```text
//! (1436509052.249713) can0 600#AC0D6E1E2C030000
//! ```
//!
//! Standard identifiers have three hex digits, extended identifiers eight.
//! Remote frames are skipped; CAN FD lines (`##`) are rejected.

use super::{DataSource, SourceEvent};
use crate::types::{Frame, Result, TelemetryError, MAX_PAYLOAD};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// One frame line of a candump log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRecord {
    /// Capture time as recorded in the log
    pub time: Duration,
    pub interface: String,
    pub id: u32,
    pub extended: bool,
    pub data: Vec<u8>,
}

/// Parse a single candump line
///
/// Returns `Ok(None)` for blank lines, comments and remote frames.
pub fn parse_candump_line(line: &str, line_number: usize) -> Result<Option<ReplayRecord>> {
    let invalid = |reason: String| TelemetryError::Replay {
        line: line_number,
        reason,
    };

    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let (Some(stamp), Some(interface), Some(frame)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid(format!("expected '(time) iface ID#DATA', got '{}'", line)));
    };

    let time = stamp
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| invalid(format!("malformed timestamp '{}'", stamp)))
        .and_then(|s| parse_timestamp(s).ok_or_else(|| invalid(format!("malformed timestamp '{}'", stamp))))?;

    let (id_text, data_text) = frame
        .split_once('#')
        .ok_or_else(|| invalid(format!("missing '#' in '{}'", frame)))?;

    if data_text.starts_with('#') {
        return Err(invalid("CAN FD frames are not supported".to_string()));
    }
    if data_text.starts_with('R') || data_text.starts_with('r') {
        log::trace!("Line {}: skipping remote frame", line_number);
        return Ok(None);
    }

    if id_text.is_empty() || !id_text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid(format!("bad identifier '{}'", id_text)));
    }
    let extended = id_text.len() > 3;
    let id = u32::from_str_radix(id_text, 16)
        .map_err(|e| invalid(format!("bad identifier '{}': {}", id_text, e)))?;

    let hex = data_text.as_bytes();
    if hex.len() % 2 != 0 || hex.len() > MAX_PAYLOAD * 2 || !hex.iter().all(u8::is_ascii_hexdigit) {
        return Err(invalid(format!("bad payload '{}'", data_text)));
    }
    let data = hex
        .chunks(2)
        .map(|pair| (hex_value(pair[0]) << 4) | hex_value(pair[1]))
        .collect();

    Ok(Some(ReplayRecord {
        time,
        interface: interface.to_string(),
        id,
        extended,
        data,
    }))
}

/// Value of one ASCII hex digit, already checked by the caller
fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        b'A'..=b'F' => digit - b'A' + 10,
        _ => 0,
    }
}

/// `secs.micros` without going through a float
fn parse_timestamp(text: &str) -> Option<Duration> {
    let (secs, frac) = text.split_once('.').unwrap_or((text, "0"));
    let secs: u64 = secs.parse().ok()?;
    if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let nanos: u32 = format!("{:0<9}", frac).parse().ok()?;
    Some(Duration::new(secs, nanos))
}

/// Parse a whole log, skipping lines that carry no frame
pub fn parse_candump(text: &str) -> Result<Vec<ReplayRecord>> {
    let mut records = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if let Some(record) = parse_candump_line(line, index + 1)? {
            records.push(record);
        }
    }
    Ok(records)
}

/// [`DataSource`] that replays a candump log
///
/// Opening (or reopening) rewinds to the first record.
pub struct ReplaySource {
    path: Option<PathBuf>,
    name: String,
    records: Vec<ReplayRecord>,
    position: usize,
    realtime: bool,
    looping: bool,
    /// Wall-clock instant that corresponds to the first record
    epoch: Instant,
    open: bool,
}

impl ReplaySource {
    /// Replay the log at `path`; the file is read on `open`
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: format!("candump replay {}", path.display()),
            path: Some(path),
            records: Vec::new(),
            position: 0,
            realtime: true,
            looping: false,
            epoch: Instant::now(),
            open: false,
        }
    }

    /// Replay records already in memory
    pub fn from_records(records: Vec<ReplayRecord>) -> Self {
        Self {
            path: None,
            name: format!("in-memory replay ({} frames)", records.len()),
            records,
            position: 0,
            realtime: false,
            looping: false,
            epoch: Instant::now(),
            open: false,
        }
    }

    /// Builder method: honour recorded inter-frame timing
    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Builder method: start over at end of log instead of disconnecting
    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn rewind(&mut self) {
        self.position = 0;
        self.epoch = Instant::now();
    }

    /// Time the record at `position` is due, relative to the replay epoch
    fn due(&self, record: &ReplayRecord) -> Instant {
        let first = self.records.first().map(|r| r.time).unwrap_or_default();
        self.epoch + record.time.saturating_sub(first)
    }
}

impl DataSource for ReplaySource {
    fn open(&mut self) -> Result<()> {
        if let Some(path) = &self.path {
            let text = fs::read_to_string(path).map_err(|e| TelemetryError::SourceOpen {
                source_name: self.name.clone(),
                reason: e.to_string(),
            })?;
            self.records = parse_candump(&text)?;
            log::info!("Loaded {} frames from {}", self.records.len(), path.display());
        }
        self.rewind();
        self.open = true;
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> SourceEvent {
        if !self.open {
            return SourceEvent::Disconnected;
        }

        if self.position >= self.records.len() {
            if self.looping && !self.records.is_empty() {
                log::debug!("{}: end of log, looping", self.name);
                self.rewind();
            } else {
                log::info!("{}: end of log", self.name);
                return SourceEvent::Disconnected;
            }
        }

        let record = &self.records[self.position];
        if self.realtime {
            let due = self.due(record);
            let now = Instant::now();
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    thread::sleep(timeout);
                    return SourceEvent::Timeout;
                }
                thread::sleep(wait);
            }
        }

        let record = &self.records[self.position];
        self.position += 1;
        match Frame::with_timestamp(record.id, record.extended, &record.data, Instant::now()) {
            Ok(frame) => SourceEvent::Frame(frame),
            Err(e) => {
                log::debug!("{}: skipping record {}: {}", self.name, self.position, e);
                SourceEvent::Timeout
            }
        }
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
