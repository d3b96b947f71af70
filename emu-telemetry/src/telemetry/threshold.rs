//! Warning level evaluation with hysteresis

use crate::config::{Direction, Threshold};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a field reading, ordered `Normal < Warning < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    #[default]
    Normal,
    Warning,
    Critical,
}

impl fmt::Display for WarningLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarningLevel::Normal => write!(f, "normal"),
            WarningLevel::Warning => write!(f, "WARNING"),
            WarningLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Level tracker for one field
///
/// Escalation is immediate once a boundary is reached. De-escalation needs
/// the value to move past the boundary by the hysteresis margin, so a value
/// oscillating around a boundary does not flicker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdState {
    threshold: Threshold,
    level: WarningLevel,
}

impl ThresholdState {
    pub fn new(threshold: Threshold) -> Self {
        Self {
            threshold,
            level: WarningLevel::Normal,
        }
    }

    pub fn level(&self) -> WarningLevel {
        self.level
    }

    pub fn threshold(&self) -> &Threshold {
        &self.threshold
    }

    /// Evaluate a (smoothed) value and return the new level
    pub fn evaluate(&mut self, value: f64) -> WarningLevel {
        let t = &self.threshold;
        let raw = classify(t, value, 0.0);
        let held = classify(t, value, t.hysteresis);
        self.level = raw.max(self.level.min(held));
        self.level
    }

    pub fn reset(&mut self) {
        self.level = WarningLevel::Normal;
    }
}

/// Level of `value` with boundaries relaxed by `margin` towards the safe side
fn classify(t: &Threshold, value: f64, margin: f64) -> WarningLevel {
    match t.direction {
        Direction::Above => upper(value, t.warning, t.critical, margin),
        Direction::Below => lower(value, t.warning, t.critical, margin),
        Direction::Outside => {
            let high = upper(value, t.warning, t.critical, margin);
            match (t.low_warning, t.low_critical) {
                (Some(warning), Some(critical)) => high.max(lower(value, warning, critical, margin)),
                _ => high,
            }
        }
    }
}

fn upper(value: f64, warning: f64, critical: f64, margin: f64) -> WarningLevel {
    if value >= critical - margin {
        WarningLevel::Critical
    } else if value >= warning - margin {
        WarningLevel::Warning
    } else {
        WarningLevel::Normal
    }
}

fn lower(value: f64, warning: f64, critical: f64, margin: f64) -> WarningLevel {
    if value <= critical + margin {
        WarningLevel::Critical
    } else if value <= warning + margin {
        WarningLevel::Warning
    } else {
        WarningLevel::Normal
    }
}
