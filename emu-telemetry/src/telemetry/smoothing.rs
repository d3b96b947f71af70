//! Exponential moving average

/// Single-pole EMA filter: `smoothed = alpha * raw + (1 - alpha) * previous`
///
/// The first sample seeds the filter so there is no ramp up from zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    /// `alpha` must be in (0, 1]; the engine configuration guarantees it
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Feed a sample and return the new smoothed value
    pub fn update(&mut self, raw: f64) -> f64 {
        let next = match self.value {
            Some(previous) => self.alpha * raw + (1.0 - self.alpha) * previous,
            None => raw,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Forget history; the next sample seeds the filter again
    pub fn reset(&mut self) {
        self.value = None;
    }
}
