//! Core types for the EMU Black telemetry library
//!
//! This module defines the raw CAN frame model, the set of telemetry fields the
//! decoder knows about, decoded field values and the error types shared by the
//! rest of the crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Wall-clock timestamp type used for published snapshots
pub type Timestamp = DateTime<Utc>;

/// Result type for library operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Maximum payload of a classic CAN frame
pub const MAX_PAYLOAD: usize = 8;

/// Largest 11-bit identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest 29-bit identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Raw CAN frame as delivered by a data source
///
/// Frames are immutable once constructed. The payload is stored inline so a
/// frame can be copied freely between the source and the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    id: u32,
    extended: bool,
    len: u8,
    data: [u8; MAX_PAYLOAD],
    timestamp: Instant,
}

impl Frame {
    /// Create a standard (11-bit) frame stamped with the current instant
    pub fn new(id: u32, payload: &[u8]) -> Result<Self> {
        Self::with_timestamp(id, false, payload, Instant::now())
    }

    /// Create an extended (29-bit) frame stamped with the current instant
    pub fn new_extended(id: u32, payload: &[u8]) -> Result<Self> {
        Self::with_timestamp(id, true, payload, Instant::now())
    }

    /// Create a frame with an explicit arrival time
    pub fn with_timestamp(
        id: u32,
        extended: bool,
        payload: &[u8],
        timestamp: Instant,
    ) -> Result<Self> {
        let max_id = if extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID };
        if id > max_id {
            return Err(TelemetryError::InvalidFrame(format!(
                "identifier 0x{:X} exceeds {}-bit range",
                id,
                if extended { 29 } else { 11 }
            )));
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(TelemetryError::InvalidFrame(format!(
                "payload of {} bytes exceeds {} bytes",
                payload.len(),
                MAX_PAYLOAD
            )));
        }

        let mut data = [0u8; MAX_PAYLOAD];
        data[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            id,
            extended,
            len: payload.len() as u8,
            data,
            timestamp,
        })
    }

    /// CAN identifier (11-bit or 29-bit)
    pub fn id(&self) -> u32 {
        self.id
    }

    /// True if this frame carries a 29-bit identifier
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Data length code - number of payload bytes
    pub fn dlc(&self) -> usize {
        self.len as usize
    }

    /// Monotonic arrival time
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }
}

/// Every telemetry channel the EMU Black stream carries
///
/// Values are always decoded into a single canonical metric unit, see
/// [`Field::unit`]. Conversion for display happens in [`crate::units`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Rpm,
    ThrottlePosition,
    IntakeTemp,
    ManifoldPressure,
    Boost,
    InjectorPulseWidth,
    /// Injector duty cycle, computed from pulse width and RPM
    InjectorDuty,
    LambdaTarget,
    Lambda,
    Afr,
    FuelPressure,
    VehicleSpeed,
    Gear,
    IgnitionAngle,
    BatteryVoltage,
    CoolantTemp,
    OilTemp,
    OilPressure,
    Egt1,
    Egt2,
    EngineFlags,
    WarningFlags,
    DbwPosition,
}

impl Field {
    /// All tracked fields, in display order
    pub const ALL: [Field; 23] = [
        Field::Rpm,
        Field::ThrottlePosition,
        Field::IntakeTemp,
        Field::ManifoldPressure,
        Field::Boost,
        Field::InjectorPulseWidth,
        Field::InjectorDuty,
        Field::LambdaTarget,
        Field::Lambda,
        Field::Afr,
        Field::FuelPressure,
        Field::VehicleSpeed,
        Field::Gear,
        Field::IgnitionAngle,
        Field::BatteryVoltage,
        Field::CoolantTemp,
        Field::OilTemp,
        Field::OilPressure,
        Field::Egt1,
        Field::Egt2,
        Field::EngineFlags,
        Field::WarningFlags,
        Field::DbwPosition,
    ];

    /// Snake-case name, identical to the serialized form
    pub fn name(&self) -> &'static str {
        match self {
            Field::Rpm => "rpm",
            Field::ThrottlePosition => "throttle_position",
            Field::IntakeTemp => "intake_temp",
            Field::ManifoldPressure => "manifold_pressure",
            Field::Boost => "boost",
            Field::InjectorPulseWidth => "injector_pulse_width",
            Field::InjectorDuty => "injector_duty",
            Field::LambdaTarget => "lambda_target",
            Field::Lambda => "lambda",
            Field::Afr => "afr",
            Field::FuelPressure => "fuel_pressure",
            Field::VehicleSpeed => "vehicle_speed",
            Field::Gear => "gear",
            Field::IgnitionAngle => "ignition_angle",
            Field::BatteryVoltage => "battery_voltage",
            Field::CoolantTemp => "coolant_temp",
            Field::OilTemp => "oil_temp",
            Field::OilPressure => "oil_pressure",
            Field::Egt1 => "egt1",
            Field::Egt2 => "egt2",
            Field::EngineFlags => "engine_flags",
            Field::WarningFlags => "warning_flags",
            Field::DbwPosition => "dbw_position",
        }
    }

    /// Canonical unit the decoder produces for this field
    pub fn unit(&self) -> Unit {
        match self {
            Field::Rpm => Unit::Rpm,
            Field::ThrottlePosition | Field::DbwPosition | Field::InjectorDuty => Unit::Percent,
            Field::IntakeTemp
            | Field::CoolantTemp
            | Field::OilTemp
            | Field::Egt1
            | Field::Egt2 => Unit::Celsius,
            Field::ManifoldPressure => Unit::Kilopascal,
            Field::Boost | Field::FuelPressure | Field::OilPressure => Unit::Bar,
            Field::InjectorPulseWidth => Unit::Millisecond,
            Field::LambdaTarget | Field::Lambda => Unit::Lambda,
            Field::Afr => Unit::Ratio,
            Field::VehicleSpeed => Unit::KilometersPerHour,
            Field::IgnitionAngle => Unit::Degree,
            Field::BatteryVoltage => Unit::Volt,
            Field::Gear | Field::EngineFlags | Field::WarningFlags => Unit::None,
        }
    }

    /// Fields no frame carries; the telemetry state computes them across frames
    pub fn is_computed(&self) -> bool {
        matches!(self, Field::InjectorDuty)
    }

    /// Discrete fields update instantly and are never smoothed or thresholded
    pub fn is_discrete(&self) -> bool {
        matches!(self, Field::Gear | Field::EngineFlags | Field::WarningFlags)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Physical unit tag attached to a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Rpm,
    Percent,
    Celsius,
    Kilopascal,
    Bar,
    Millisecond,
    Lambda,
    Ratio,
    KilometersPerHour,
    Degree,
    Volt,
    None,
}

impl Unit {
    /// Short label used by text consumers
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Rpm => "rpm",
            Unit::Percent => "%",
            Unit::Celsius => "°C",
            Unit::Kilopascal => "kPa",
            Unit::Bar => "bar",
            Unit::Millisecond => "ms",
            Unit::Lambda => "λ",
            Unit::Ratio => ":1",
            Unit::KilometersPerHour => "km/h",
            Unit::Degree => "°",
            Unit::Volt => "V",
            Unit::None => "",
        }
    }
}

/// Transmission gear as reported by the ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gear {
    Neutral,
    Forward(u8),
    Reverse,
    /// Raw value outside the defined codes (bus noise, unsupported gearbox)
    Unknown(u8),
}

impl Gear {
    /// Raw code the ECU uses for reverse
    pub const REVERSE_CODE: u8 = 7;

    /// Signed -1, the code older EMU firmware sends for reverse
    pub const REVERSE_CODE_SIGNED: u8 = 0xFF;

    /// Highest forward gear
    pub const TOP_GEAR: u8 = 6;

    /// Map a raw gear byte to a gear; never fails
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Gear::Neutral,
            1..=Self::TOP_GEAR => Gear::Forward(raw),
            Self::REVERSE_CODE | Self::REVERSE_CODE_SIGNED => Gear::Reverse,
            other => Gear::Unknown(other),
        }
    }

    /// Raw byte for this gear
    pub fn to_raw(&self) -> u8 {
        match self {
            Gear::Neutral => 0,
            Gear::Forward(n) => *n,
            Gear::Reverse => Self::REVERSE_CODE,
            Gear::Unknown(raw) => *raw,
        }
    }
}

impl fmt::Display for Gear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gear::Neutral => write!(f, "N"),
            Gear::Forward(n) => write!(f, "{}", n),
            Gear::Reverse => write!(f, "R"),
            Gear::Unknown(_) => write!(f, "?"),
        }
    }
}

/// Engine status bitfield (frame 5, byte 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineFlags(pub u8);

impl EngineFlags {
    pub const GEARCUT: EngineFlags = EngineFlags(0x01);
    pub const ANTI_LAG: EngineFlags = EngineFlags(0x02);
    pub const LAUNCH_CONTROL: EngineFlags = EngineFlags(0x04);
    pub const IDLE: EngineFlags = EngineFlags(0x08);
    pub const TABLE_SET: EngineFlags = EngineFlags(0x10);
    pub const TC_INTERVENTION: EngineFlags = EngineFlags(0x20);
    pub const PIT_LIMITER: EngineFlags = EngineFlags(0x40);
    pub const BRAKE_SWITCH: EngineFlags = EngineFlags(0x80);

    pub fn contains(&self, other: EngineFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// ECU warning bitfield (frame 5, bytes 1-2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WarningFlags(pub u16);

impl WarningFlags {
    pub const CLT_SENSOR: WarningFlags = WarningFlags(0x0001);
    pub const IAT_SENSOR: WarningFlags = WarningFlags(0x0002);
    pub const MAP_SENSOR: WarningFlags = WarningFlags(0x0004);
    pub const WBO_SENSOR: WarningFlags = WarningFlags(0x0008);
    pub const EGT1_SENSOR: WarningFlags = WarningFlags(0x0010);
    pub const EGT2_SENSOR: WarningFlags = WarningFlags(0x0020);
    pub const EGT_ALARM: WarningFlags = WarningFlags(0x0040);
    pub const KNOCKING: WarningFlags = WarningFlags(0x0080);
    pub const FUEL_PRESSURE: WarningFlags = WarningFlags(0x0100);
    pub const OIL_PRESSURE: WarningFlags = WarningFlags(0x0200);
    pub const BATTERY_LOW: WarningFlags = WarningFlags(0x0400);

    /// Mask of every sensor-fault bit
    pub const SENSOR_FAULTS: WarningFlags = WarningFlags(0x003F);

    pub fn contains(&self, other: WarningFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn any(&self) -> bool {
        self.0 != 0
    }

    pub fn has_sensor_fault(&self) -> bool {
        self.0 & Self::SENSOR_FAULTS.0 != 0
    }
}

/// A decoded field value in canonical units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    /// Scaled physical value
    Number(f64),
    /// Enumerated gear
    Gear(Gear),
    /// Raw bitfield
    Flags(u16),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(v) => write!(f, "{:.2}", v),
            FieldValue::Gear(g) => write!(f, "{}", g),
            FieldValue::Flags(bits) => write!(f, "0x{:04X}", bits),
        }
    }
}

impl FieldValue {
    /// Numeric view of the value, `None` for gear and flags
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Gear(_) | FieldValue::Flags(_) => None,
        }
    }

    pub fn as_gear(&self) -> Option<Gear> {
        match self {
            FieldValue::Gear(g) => Some(*g),
            _ => None,
        }
    }

    pub fn as_flags(&self) -> Option<u16> {
        match self {
            FieldValue::Flags(bits) => Some(*bits),
            _ => None,
        }
    }
}

/// One field update extracted from a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldUpdate {
    pub field: Field,
    pub value: FieldValue,
    /// Arrival time of the frame the value came from
    pub timestamp: Instant,
}

/// Recoverable, frame-local decoding failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Unknown CAN identifier 0x{0:X}")]
    UnknownIdentifier(u32),

    #[error("Truncated frame 0x{id:X}: rules need {needed} bytes, payload has {available}")]
    Truncated {
        id: u32,
        needed: usize,
        available: usize,
    },
}

/// Errors surfaced to callers of the library
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid threshold for {field}: {reason}")]
    InvalidThreshold { field: Field, reason: String },

    #[error("Invalid smoothing weight {alpha} for {field}: must be in (0, 1]")]
    InvalidSmoothing { field: Field, alpha: f64 },

    #[error("Invalid base identifier 0x{base_id:X}: {reason}")]
    InvalidBaseId { base_id: u32, reason: String },

    #[error("Invalid protocol map: {0}")]
    InvalidProtocolMap(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Failed to open data source {source_name}: {reason}")]
    SourceOpen { source_name: String, reason: String },

    #[error("Failed to parse replay log line {line}: {reason}")]
    Replay { line: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn acquisition thread: {0}")]
    ThreadSpawn(String),

    #[error("Acquisition thread terminated abnormally")]
    EngineTerminated,
}
