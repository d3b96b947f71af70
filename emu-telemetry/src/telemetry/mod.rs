//! Telemetry state and snapshots
//!
//! [`TelemetryState`] is the mutable accumulator owned by the acquisition
//! thread. It merges field updates, smooths numeric fields, evaluates warning
//! thresholds and tracks staleness. Consumers never see it directly: they get
//! immutable [`TelemetrySnapshot`]s.

pub mod smoothing;
pub mod threshold;

pub use smoothing::Ema;
pub use threshold::{ThresholdState, WarningLevel};

use crate::config::EngineConfig;
use crate::engine::EngineState;
use crate::types::{EngineFlags, Field, FieldUpdate, FieldValue, Gear, Timestamp, WarningFlags};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Freshness of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldStatus {
    /// Never received since start or reset
    Unknown,
    /// Updated within the staleness timeout
    Live,
    /// Previously received but too old to trust
    Stale,
}

/// One field as seen by consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldReading {
    pub status: FieldStatus,
    /// Smoothed value; only present while the field is live
    pub value: Option<FieldValue>,
    /// Last decoded value, kept for diagnostics even when stale
    pub raw: Option<FieldValue>,
    #[serde(skip)]
    pub updated_at: Option<Instant>,
    pub age_ms: Option<u64>,
    pub level: WarningLevel,
}

impl FieldReading {
    fn unknown() -> Self {
        Self {
            status: FieldStatus::Unknown,
            value: None,
            raw: None,
            updated_at: None,
            age_ms: None,
            level: WarningLevel::Normal,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status == FieldStatus::Live
    }
}

/// Link health published with every snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkStatus {
    pub state: EngineState,
    /// Decode error rate above the configured threshold
    pub degraded: bool,
    pub source: String,
    pub frames_received: u64,
    pub unknown_identifiers: u64,
    pub truncated_frames: u64,
    pub reconnect_attempts: u64,
}

impl LinkStatus {
    pub fn new(state: EngineState, source: impl Into<String>) -> Self {
        Self {
            state,
            degraded: false,
            source: source.into(),
            frames_received: 0,
            unknown_identifiers: 0,
            truncated_frames: 0,
            reconnect_attempts: 0,
        }
    }

    pub fn decode_errors(&self) -> u64 {
        self.unknown_identifiers + self.truncated_frames
    }
}

/// Immutable view of the telemetry at one publish tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Strictly increasing per engine
    pub sequence: u64,
    #[serde(skip)]
    pub captured_at: Instant,
    pub published_at: Timestamp,
    pub fields: BTreeMap<Field, FieldReading>,
    pub link: LinkStatus,
}

impl TelemetrySnapshot {
    pub fn reading(&self, field: Field) -> Option<&FieldReading> {
        self.fields.get(&field)
    }

    pub fn status(&self, field: Field) -> FieldStatus {
        self.reading(field)
            .map(|r| r.status)
            .unwrap_or(FieldStatus::Unknown)
    }

    /// Smoothed numeric value, `None` unless the field is live
    pub fn value(&self, field: Field) -> Option<f64> {
        self.field_value(field).and_then(|v| v.as_f64())
    }

    /// Smoothed value of any kind, `None` unless the field is live
    pub fn field_value(&self, field: Field) -> Option<FieldValue> {
        self.reading(field).filter(|r| r.is_live()).and_then(|r| r.value)
    }

    pub fn gear(&self) -> Option<Gear> {
        self.field_value(Field::Gear).and_then(|v| v.as_gear())
    }

    pub fn engine_flags(&self) -> Option<EngineFlags> {
        self.field_value(Field::EngineFlags)
            .and_then(|v| v.as_flags())
            .map(|bits| EngineFlags(bits as u8))
    }

    pub fn warning_flags(&self) -> Option<WarningFlags> {
        self.field_value(Field::WarningFlags)
            .and_then(|v| v.as_flags())
            .map(WarningFlags)
    }

    pub fn level(&self, field: Field) -> WarningLevel {
        self.reading(field).map(|r| r.level).unwrap_or_default()
    }

    /// Highest warning level across all fields
    pub fn max_level(&self) -> WarningLevel {
        self.fields.values().map(|r| r.level).max().unwrap_or_default()
    }

    /// Fields at warning level or above, most severe first
    pub fn alerts(&self) -> Vec<(Field, WarningLevel)> {
        let mut alerts: Vec<_> = self
            .fields
            .iter()
            .filter(|(_, r)| r.level > WarningLevel::Normal)
            .map(|(field, r)| (*field, r.level))
            .collect();
        alerts.sort_by(|a, b| b.1.cmp(&a.1));
        alerts
    }

    pub fn live_count(&self) -> usize {
        self.fields.values().filter(|r| r.is_live()).count()
    }
}

/// Per-field accumulator state
#[derive(Debug, Clone)]
struct Channel {
    status: FieldStatus,
    raw: Option<FieldValue>,
    smoothed: Option<FieldValue>,
    updated_at: Option<Instant>,
    filter: Option<Ema>,
    threshold: Option<ThresholdState>,
}

impl Channel {
    fn new(field: Field, config: &EngineConfig) -> Self {
        let numeric = !field.is_discrete();
        Self {
            status: FieldStatus::Unknown,
            raw: None,
            smoothed: None,
            updated_at: None,
            filter: numeric.then(|| Ema::new(config.alpha_for(field))),
            threshold: config
                .threshold_for(field)
                .filter(|_| numeric)
                .map(|t| ThresholdState::new(*t)),
        }
    }

    fn apply(&mut self, update: &FieldUpdate) {
        self.raw = Some(update.value);
        self.updated_at = Some(update.timestamp);
        self.status = FieldStatus::Live;

        self.smoothed = match (update.value, self.filter.as_mut()) {
            (FieldValue::Number(raw), Some(filter)) => {
                let smoothed = filter.update(raw);
                if let Some(threshold) = self.threshold.as_mut() {
                    threshold.evaluate(smoothed);
                }
                Some(FieldValue::Number(smoothed))
            }
            (value, _) => Some(value),
        };
    }

    /// Drop filter and warning state; keep the last raw value for diagnostics
    fn invalidate(&mut self) {
        if self.status == FieldStatus::Unknown {
            return;
        }
        self.status = FieldStatus::Stale;
        self.smoothed = None;
        if let Some(filter) = self.filter.as_mut() {
            filter.reset();
        }
        if let Some(threshold) = self.threshold.as_mut() {
            threshold.reset();
        }
    }

    fn level(&self) -> WarningLevel {
        self.threshold.map(|t| t.level()).unwrap_or_default()
    }
}

/// Duration of one four-stroke cycle (two revolutions) at 1 rpm, in ms
const CYCLE_MS_AT_ONE_RPM: f64 = 120_000.0;

/// Accumulated, smoothed, threshold-evaluated telemetry record
#[derive(Debug, Clone)]
pub struct TelemetryState {
    channels: BTreeMap<Field, Channel>,
    staleness_timeout: Duration,
    config: EngineConfig,
}

impl TelemetryState {
    /// Create an all-unknown state from a validated configuration
    pub fn new(config: &EngineConfig) -> Self {
        let channels = Field::ALL
            .iter()
            .map(|field| (*field, Channel::new(*field, config)))
            .collect();
        Self {
            channels,
            staleness_timeout: config.staleness_timeout(),
            config: config.clone(),
        }
    }

    /// Apply field updates in order; the last writer wins per field
    ///
    /// Injector duty is recomputed whenever pulse width or RPM changes, from
    /// the latest raw values of both while they are live.
    pub fn merge(&mut self, updates: &[FieldUpdate]) {
        let mut duty_inputs_at = None;
        for update in updates {
            if let Some(channel) = self.channels.get_mut(&update.field) {
                channel.apply(update);
            }
            if matches!(update.field, Field::Rpm | Field::InjectorPulseWidth) {
                duty_inputs_at = Some(update.timestamp);
            }
        }

        if let Some(timestamp) = duty_inputs_at {
            if let Some(duty) = self.injector_duty() {
                let update = FieldUpdate {
                    field: Field::InjectorDuty,
                    value: FieldValue::Number(duty),
                    timestamp,
                };
                if let Some(channel) = self.channels.get_mut(&Field::InjectorDuty) {
                    channel.apply(&update);
                }
            }
        }
    }

    /// Share of the four-stroke cycle the injector is open, in percent
    fn injector_duty(&self) -> Option<f64> {
        let live_raw = |field: Field| {
            self.channels
                .get(&field)
                .filter(|c| c.status == FieldStatus::Live)
                .and_then(|c| c.raw)
                .and_then(|v| v.as_f64())
        };
        let rpm = live_raw(Field::Rpm)?;
        let pulse_ms = live_raw(Field::InjectorPulseWidth)?;
        if rpm <= 0.0 {
            return None;
        }
        let cycle_ms = CYCLE_MS_AT_ONE_RPM / rpm;
        Some((pulse_ms / cycle_ms * 100.0).clamp(0.0, 100.0))
    }

    /// Mark fields not updated within the staleness timeout as stale
    ///
    /// Returns how many fields expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let timeout = self.staleness_timeout;
        let mut expired = 0;
        for (field, channel) in self.channels.iter_mut() {
            let too_old = channel.status == FieldStatus::Live
                && channel
                    .updated_at
                    .map_or(false, |at| now.saturating_duration_since(at) > timeout);
            if too_old {
                log::debug!("{} is stale", field);
                channel.invalidate();
                expired += 1;
            }
        }
        expired
    }

    /// Mark every previously seen field as stale
    pub fn invalidate_all(&mut self) {
        for channel in self.channels.values_mut() {
            channel.invalidate();
        }
    }

    /// Return to the initial all-unknown state
    pub fn reset(&mut self) {
        *self = Self::new(&self.config);
    }

    pub fn status(&self, field: Field) -> FieldStatus {
        self.channels
            .get(&field)
            .map(|c| c.status)
            .unwrap_or(FieldStatus::Unknown)
    }

    /// Build an immutable snapshot
    ///
    /// A field whose age already exceeds the timeout is reported stale even
    /// if [`TelemetryState::expire`] has not run yet.
    pub fn snapshot(&self, now: Instant, sequence: u64, link: LinkStatus) -> TelemetrySnapshot {
        let fields = self
            .channels
            .iter()
            .map(|(field, channel)| (*field, self.reading(channel, now)))
            .collect();

        TelemetrySnapshot {
            sequence,
            captured_at: now,
            published_at: Utc::now(),
            fields,
            link,
        }
    }

    fn reading(&self, channel: &Channel, now: Instant) -> FieldReading {
        if channel.status == FieldStatus::Unknown {
            return FieldReading::unknown();
        }

        let age = channel.updated_at.map(|at| now.saturating_duration_since(at));
        let live = channel.status == FieldStatus::Live
            && age.map_or(false, |age| age <= self.staleness_timeout);

        FieldReading {
            status: if live { FieldStatus::Live } else { FieldStatus::Stale },
            value: if live { channel.smoothed } else { None },
            raw: channel.raw,
            updated_at: channel.updated_at,
            age_ms: age.map(|age| age.as_millis() as u64),
            level: if live { channel.level() } else { WarningLevel::Normal },
        }
    }
}
