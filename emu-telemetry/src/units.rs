//! Unit conversion for presentation
//!
//! The decoder and telemetry state only ever hold canonical metric values.
//! Consumers call into this module at the display boundary.

use crate::config::UnitSystem;
use crate::types::{Field, Unit};

pub const KMH_PER_MPH: f64 = 1.609_344;
pub const PSI_PER_BAR: f64 = 14.503_773_8;
pub const KPA_PER_BAR: f64 = 100.0;

pub fn kmh_to_mph(kmh: f64) -> f64 {
    kmh / KMH_PER_MPH
}

pub fn mph_to_kmh(mph: f64) -> f64 {
    mph * KMH_PER_MPH
}

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

pub fn fahrenheit_to_celsius(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

pub fn bar_to_psi(bar: f64) -> f64 {
    bar * PSI_PER_BAR
}

pub fn psi_to_bar(psi: f64) -> f64 {
    psi / PSI_PER_BAR
}

pub fn bar_to_kpa(bar: f64) -> f64 {
    bar * KPA_PER_BAR
}

pub fn kpa_to_bar(kpa: f64) -> f64 {
    kpa / KPA_PER_BAR
}

pub fn kpa_to_psi(kpa: f64) -> f64 {
    bar_to_psi(kpa_to_bar(kpa))
}

/// Convert a canonical field value into the requested unit system
///
/// Returns the converted value and its unit label. Fields without an imperial
/// counterpart pass through unchanged.
pub fn display(field: Field, value: f64, system: UnitSystem) -> (f64, &'static str) {
    let unit = field.unit();
    if system == UnitSystem::Metric {
        return (value, unit.symbol());
    }
    match unit {
        Unit::KilometersPerHour => (kmh_to_mph(value), "mph"),
        Unit::Celsius => (celsius_to_fahrenheit(value), "°F"),
        Unit::Bar => (bar_to_psi(value), "psi"),
        Unit::Kilopascal => (kpa_to_psi(value), "psi"),
        other => (value, other.symbol()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_speed_conversion() {
        assert!(close(kmh_to_mph(100.0), 62.137_119));
        assert!(close(mph_to_kmh(kmh_to_mph(88.0)), 88.0));
    }

    #[test]
    fn test_temperature_conversion() {
        assert!(close(celsius_to_fahrenheit(100.0), 212.0));
        assert!(close(celsius_to_fahrenheit(-40.0), -40.0));
        assert!(close(fahrenheit_to_celsius(32.0), 0.0));
    }

    #[test]
    fn test_pressure_conversion() {
        assert!(close(bar_to_psi(1.0), 14.503_773_8));
        assert!(close(psi_to_bar(bar_to_psi(2.3)), 2.3));
        assert!(close(bar_to_kpa(1.013), 101.3));
        assert!(close(kpa_to_bar(250.0), 2.5));
    }

    #[test]
    fn test_display_by_field() {
        let (value, unit) = display(Field::CoolantTemp, 90.0, UnitSystem::Imperial);
        assert!(close(value, 194.0));
        assert_eq!(unit, "°F");

        let (value, unit) = display(Field::CoolantTemp, 90.0, UnitSystem::Metric);
        assert!(close(value, 90.0));
        assert_eq!(unit, "°C");

        let (value, unit) = display(Field::Rpm, 3500.0, UnitSystem::Imperial);
        assert!(close(value, 3500.0));
        assert_eq!(unit, "rpm");

        let (_, unit) = display(Field::Boost, -0.5, UnitSystem::Imperial);
        assert_eq!(unit, "psi");
    }
}
