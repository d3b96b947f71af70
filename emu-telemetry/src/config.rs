//! Engine configuration types
//!
//! The configuration is an immutable value copied into the engine at start.
//! Changing it means stopping the engine and starting a new one. Everything
//! here is serde-deserialisable so the application layer can load it from a
//! file, and every value is checked by [`EngineConfig::validate`].

use crate::protocol::map::{EMU_DEFAULT_BASE_ID, EMU_FRAME_COUNT};
use crate::types::{Field, Result, TelemetryError, MAX_EXTENDED_ID, MAX_STANDARD_ID};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Which side of the boundary is dangerous
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// High values are bad (temperatures, RPM, boost)
    Above,
    /// Low values are bad (oil pressure)
    Below,
    /// Both ends are bad (battery voltage: flat below, overcharging above)
    Outside,
}

/// Warning and critical boundaries for one field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub direction: Direction,
    pub warning: f64,
    pub critical: f64,
    /// Margin the value must move back past a boundary before de-escalating
    #[serde(default)]
    pub hysteresis: f64,
    /// Lower pair for `outside`; `warning` and `critical` are then the upper pair
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_warning: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_critical: Option<f64>,
}

impl Threshold {
    pub fn above(warning: f64, critical: f64, hysteresis: f64) -> Self {
        Self {
            direction: Direction::Above,
            warning,
            critical,
            hysteresis,
            low_warning: None,
            low_critical: None,
        }
    }

    pub fn below(warning: f64, critical: f64, hysteresis: f64) -> Self {
        Self {
            direction: Direction::Below,
            warning,
            critical,
            hysteresis,
            low_warning: None,
            low_critical: None,
        }
    }

    /// Safe band with a warning and a critical boundary on each side
    pub fn outside(
        low_critical: f64,
        low_warning: f64,
        warning: f64,
        critical: f64,
        hysteresis: f64,
    ) -> Self {
        Self {
            direction: Direction::Outside,
            warning,
            critical,
            hysteresis,
            low_warning: Some(low_warning),
            low_critical: Some(low_critical),
        }
    }

    /// Check ordering and margin for a field
    pub fn validate(&self, field: Field) -> Result<()> {
        let invalid = |reason: String| TelemetryError::InvalidThreshold { field, reason };

        if field.is_discrete() {
            return Err(invalid("discrete fields cannot carry thresholds".to_string()));
        }
        let low = [self.low_warning, self.low_critical];
        if !self.warning.is_finite()
            || !self.critical.is_finite()
            || !self.hysteresis.is_finite()
            || low.iter().flatten().any(|v| !v.is_finite())
        {
            return Err(invalid("boundaries must be finite numbers".to_string()));
        }
        if self.hysteresis < 0.0 {
            return Err(invalid(format!("hysteresis {} is negative", self.hysteresis)));
        }
        match self.direction {
            Direction::Above if self.warning > self.critical => Err(invalid(format!(
                "warning {} must not exceed critical {} for an upper limit",
                self.warning, self.critical
            ))),
            Direction::Below if self.warning < self.critical => Err(invalid(format!(
                "warning {} must not be below critical {} for a lower limit",
                self.warning, self.critical
            ))),
            Direction::Above | Direction::Below if low.iter().any(Option::is_some) => Err(invalid(
                "low_warning and low_critical only apply to an outside limit".to_string(),
            )),
            Direction::Outside => match (self.low_critical, self.low_warning) {
                (Some(low_critical), Some(low_warning))
                    if low_critical <= low_warning
                        && low_warning < self.warning
                        && self.warning <= self.critical =>
                {
                    Ok(())
                }
                (Some(low_critical), Some(low_warning)) => Err(invalid(format!(
                    "outside limit needs low_critical {} <= low_warning {} < warning {} <= critical {}",
                    low_critical, low_warning, self.warning, self.critical
                ))),
                _ => Err(invalid(
                    "outside limit needs both low_warning and low_critical".to_string(),
                )),
            },
            _ => Ok(()),
        }
    }
}

/// Unit preference for presentation; the decoder always emits metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitSystem {
    #[default]
    Metric,
    Imperial,
}

/// Configuration for the acquisition engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// CAN identifier of frame 0 of the EMU stream
    #[serde(default = "default_base_id")]
    pub base_id: u32,

    /// Whether the ECU sends 29-bit identifiers
    #[serde(default)]
    pub extended_ids: bool,

    /// SocketCAN interface name
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Bus bitrate, recorded for diagnostics only (interface setup is external)
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,

    /// Snapshot publish cadence
    #[serde(default = "default_update_rate")]
    pub update_rate_hz: u32,

    /// Upper bound of a single blocking read on the data source
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,

    /// Fields not updated within this window are reported stale
    #[serde(default = "default_staleness_timeout")]
    pub staleness_timeout_ms: u64,

    /// Silence on the bus for this long means the link is down
    #[serde(default = "default_link_grace")]
    pub link_grace_ms: u64,

    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    /// Rolling window for the decode error rate
    #[serde(default = "default_error_window")]
    pub error_window_ms: u64,

    /// Errors within the window that mark the link degraded
    #[serde(default = "default_max_decode_errors")]
    pub max_decode_errors: u32,

    /// EMA weight for fields without an explicit entry
    #[serde(default = "default_alpha")]
    pub default_alpha: f64,

    /// Per-field EMA weight, in (0, 1]
    #[serde(default = "default_smoothing")]
    pub smoothing: BTreeMap<Field, f64>,

    /// Per-field warning thresholds
    #[serde(default = "default_thresholds")]
    pub thresholds: BTreeMap<Field, Threshold>,

    #[serde(default)]
    pub units: UnitSystem,
}

fn default_base_id() -> u32 {
    EMU_DEFAULT_BASE_ID
}

fn default_channel() -> String {
    "can0".to_string()
}

fn default_bitrate() -> u32 {
    500_000
}

fn default_update_rate() -> u32 {
    30
}

fn default_poll_timeout() -> u64 {
    20
}

fn default_staleness_timeout() -> u64 {
    500
}

fn default_link_grace() -> u64 {
    1000
}

fn default_reconnect_initial() -> u64 {
    250
}

fn default_reconnect_max() -> u64 {
    5000
}

fn default_error_window() -> u64 {
    1000
}

fn default_max_decode_errors() -> u32 {
    25
}

fn default_alpha() -> f64 {
    0.3
}

/// Default EMA weights: fast for RPM, slow for temperatures
pub fn default_smoothing() -> BTreeMap<Field, f64> {
    BTreeMap::from([
        (Field::Rpm, 0.4),
        (Field::VehicleSpeed, 0.25),
        (Field::CoolantTemp, 0.1),
        (Field::OilTemp, 0.1),
        (Field::IntakeTemp, 0.1),
        (Field::Egt1, 0.1),
        (Field::Egt2, 0.1),
    ])
}

/// Default warning thresholds for a street-driven EMU Black install
pub fn default_thresholds() -> BTreeMap<Field, Threshold> {
    BTreeMap::from([
        (Field::Rpm, Threshold::above(6800.0, 7200.0, 200.0)),
        (Field::CoolantTemp, Threshold::above(105.0, 110.0, 5.0)),
        (Field::OilTemp, Threshold::above(120.0, 140.0, 5.0)),
        (Field::OilPressure, Threshold::below(1.0, 0.7, 0.2)),
        (Field::BatteryVoltage, Threshold::outside(12.0, 12.5, 15.0, 15.5, 0.2)),
        (Field::Boost, Threshold::above(2.0, 2.3, 0.1)),
        (Field::IntakeTemp, Threshold::above(45.0, 60.0, 3.0)),
        (Field::Egt1, Threshold::above(700.0, 850.0, 25.0)),
        (Field::Egt2, Threshold::above(700.0, 850.0, 25.0)),
    ])
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_id: default_base_id(),
            extended_ids: false,
            channel: default_channel(),
            bitrate: default_bitrate(),
            update_rate_hz: default_update_rate(),
            poll_timeout_ms: default_poll_timeout(),
            staleness_timeout_ms: default_staleness_timeout(),
            link_grace_ms: default_link_grace(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
            error_window_ms: default_error_window(),
            max_decode_errors: default_max_decode_errors(),
            default_alpha: default_alpha(),
            smoothing: default_smoothing(),
            thresholds: default_thresholds(),
            units: UnitSystem::default(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the stream base identifier
    pub fn with_base_id(mut self, base_id: u32) -> Self {
        self.base_id = base_id;
        self
    }

    /// Builder method: use 29-bit identifiers
    pub fn with_extended_ids(mut self, extended: bool) -> Self {
        self.extended_ids = extended;
        self
    }

    /// Builder method: set the SocketCAN interface
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Builder method: set the snapshot publish rate
    pub fn with_update_rate(mut self, hz: u32) -> Self {
        self.update_rate_hz = hz;
        self
    }

    /// Builder method: set the poll timeout
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder method: set the staleness timeout
    pub fn with_staleness_timeout(mut self, timeout: Duration) -> Self {
        self.staleness_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder method: set the link grace period
    pub fn with_link_grace(mut self, grace: Duration) -> Self {
        self.link_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Builder method: set reconnect backoff bounds
    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial_ms = initial.as_millis() as u64;
        self.reconnect_max_ms = max.as_millis() as u64;
        self
    }

    /// Builder method: set the decode error window and threshold
    pub fn with_error_window(mut self, window: Duration, max_errors: u32) -> Self {
        self.error_window_ms = window.as_millis() as u64;
        self.max_decode_errors = max_errors;
        self
    }

    /// Builder method: set the EMA weight of one field
    pub fn with_smoothing(mut self, field: Field, alpha: f64) -> Self {
        self.smoothing.insert(field, alpha);
        self
    }

    /// Builder method: set or replace the threshold of one field
    pub fn with_threshold(mut self, field: Field, threshold: Threshold) -> Self {
        self.thresholds.insert(field, threshold);
        self
    }

    /// Builder method: remove the threshold of one field
    pub fn without_threshold(mut self, field: Field) -> Self {
        self.thresholds.remove(&field);
        self
    }

    /// Builder method: set the presentation unit system
    pub fn with_units(mut self, units: UnitSystem) -> Self {
        self.units = units;
        self
    }

    /// EMA weight for a field
    pub fn alpha_for(&self, field: Field) -> f64 {
        self.smoothing.get(&field).copied().unwrap_or(self.default_alpha)
    }

    pub fn threshold_for(&self, field: Field) -> Option<&Threshold> {
        self.thresholds.get(&field)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.update_rate_hz.max(1) as u64)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_millis(self.staleness_timeout_ms)
    }

    pub fn link_grace(&self) -> Duration {
        Duration::from_millis(self.link_grace_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_millis(self.error_window_ms)
    }

    /// Check every invariant; the first violation is returned
    pub fn validate(&self) -> Result<()> {
        let max_id = if self.extended_ids {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        let last_offset = EMU_FRAME_COUNT - 1;
        if self.base_id.checked_add(last_offset).map_or(true, |last| last > max_id) {
            return Err(TelemetryError::InvalidBaseId {
                base_id: self.base_id,
                reason: format!(
                    "base + {} exceeds the {}-bit identifier range",
                    last_offset,
                    if self.extended_ids { 29 } else { 11 }
                ),
            });
        }

        if self.channel.trim().is_empty() {
            return Err(TelemetryError::InvalidConfig("channel name is empty".to_string()));
        }
        if self.update_rate_hz == 0 || self.update_rate_hz > 1000 {
            return Err(TelemetryError::InvalidConfig(format!(
                "update_rate_hz {} must be within 1..=1000",
                self.update_rate_hz
            )));
        }

        let positive = [
            ("poll_timeout_ms", self.poll_timeout_ms),
            ("staleness_timeout_ms", self.staleness_timeout_ms),
            ("link_grace_ms", self.link_grace_ms),
            ("reconnect_initial_ms", self.reconnect_initial_ms),
            ("reconnect_max_ms", self.reconnect_max_ms),
            ("error_window_ms", self.error_window_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(TelemetryError::InvalidConfig(format!("{} must be greater than zero", name)));
        }
        if self.reconnect_initial_ms > self.reconnect_max_ms {
            return Err(TelemetryError::InvalidConfig(format!(
                "reconnect_initial_ms {} exceeds reconnect_max_ms {}",
                self.reconnect_initial_ms, self.reconnect_max_ms
            )));
        }
        if self.max_decode_errors == 0 {
            return Err(TelemetryError::InvalidConfig(
                "max_decode_errors must be greater than zero".to_string(),
            ));
        }

        if !valid_alpha(self.default_alpha) {
            return Err(TelemetryError::InvalidConfig(format!(
                "default_alpha {} must be in (0, 1]",
                self.default_alpha
            )));
        }
        for (field, alpha) in &self.smoothing {
            if !valid_alpha(*alpha) {
                return Err(TelemetryError::InvalidSmoothing {
                    field: *field,
                    alpha: *alpha,
                });
            }
        }

        for (field, threshold) in &self.thresholds {
            threshold.validate(*field)?;
        }

        Ok(())
    }
}

fn valid_alpha(alpha: f64) -> bool {
    alpha > 0.0 && alpha <= 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.base_id, 0x600);
        assert_eq!(config.update_rate_hz, 30);
        assert_eq!(config.alpha_for(Field::Rpm), 0.4);
        assert_eq!(config.alpha_for(Field::ThrottlePosition), 0.3);
        assert_eq!(config.staleness_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_builder_methods() {
        let config = EngineConfig::new()
            .with_base_id(0x700)
            .with_channel("vcan0")
            .with_update_rate(60)
            .with_smoothing(Field::Rpm, 1.0)
            .without_threshold(Field::Boost);

        assert_eq!(config.base_id, 0x700);
        assert_eq!(config.channel, "vcan0");
        assert_eq!(config.alpha_for(Field::Rpm), 1.0);
        assert!(config.threshold_for(Field::Boost).is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_base_id_out_of_range() {
        let result = EngineConfig::new().with_base_id(0x7FC).validate();
        assert!(matches!(result, Err(TelemetryError::InvalidBaseId { .. })));

        let result = EngineConfig::new()
            .with_base_id(0x7FC)
            .with_extended_ids(true)
            .validate();
        assert!(result.is_ok());
    }

    #[test]
    fn test_invalid_smoothing_weight() {
        let result = EngineConfig::new().with_smoothing(Field::OilTemp, 0.0).validate();
        assert!(matches!(
            result,
            Err(TelemetryError::InvalidSmoothing {
                field: Field::OilTemp,
                ..
            })
        ));
        assert!(EngineConfig::new().with_smoothing(Field::OilTemp, 1.5).validate().is_err());
    }

    #[test]
    fn test_threshold_ordering() {
        let inverted = EngineConfig::new().with_threshold(Field::CoolantTemp, Threshold::above(110.0, 105.0, 5.0));
        assert!(matches!(
            inverted.validate(),
            Err(TelemetryError::InvalidThreshold {
                field: Field::CoolantTemp,
                ..
            })
        ));

        let lower = EngineConfig::new().with_threshold(Field::OilPressure, Threshold::below(0.7, 1.0, 0.1));
        assert!(lower.validate().is_err());

        let negative = EngineConfig::new().with_threshold(Field::Rpm, Threshold::above(6000.0, 7000.0, -1.0));
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_outside_threshold_needs_ordered_pairs() {
        let battery = Threshold::outside(12.0, 12.5, 15.0, 15.5, 0.2);
        assert!(battery.validate(Field::BatteryVoltage).is_ok());

        let overlapping = Threshold::outside(12.0, 15.0, 14.0, 15.5, 0.2);
        assert!(overlapping.validate(Field::BatteryVoltage).is_err());

        let missing = Threshold {
            low_critical: None,
            ..battery
        };
        assert!(missing.validate(Field::BatteryVoltage).is_err());

        let stray = Threshold {
            low_warning: Some(1.0),
            ..Threshold::above(105.0, 110.0, 5.0)
        };
        assert!(stray.validate(Field::CoolantTemp).is_err());

        let infinite = Threshold {
            low_critical: Some(f64::NEG_INFINITY),
            ..battery
        };
        assert!(infinite.validate(Field::BatteryVoltage).is_err());
    }

    #[test]
    fn test_threshold_on_discrete_field_is_rejected() {
        let config = EngineConfig::new().with_threshold(Field::Gear, Threshold::above(5.0, 6.0, 0.0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        let config = EngineConfig {
            link_grace_ms: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(TelemetryError::InvalidConfig(_))));

        let config = EngineConfig::new().with_update_rate(0);
        assert!(config.validate().is_err());

        let config = EngineConfig::new()
            .with_reconnect_backoff(Duration::from_secs(10), Duration::from_secs(5));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_update_interval() {
        let config = EngineConfig::new().with_update_rate(50);
        assert_eq!(config.update_interval(), Duration::from_millis(20));
    }
}
