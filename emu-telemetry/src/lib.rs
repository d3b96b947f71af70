//! EMU Black Telemetry Library
//!
//! Turns the CAN stream of an ECUMaster EMU Black into a continuously updated,
//! smoothed and threshold-evaluated telemetry state for a dashboard.
//!
//! # Architecture
//!
//! Data flows one way:
//!
//! data source → frame → decoder → field updates → telemetry merge →
//! smoothing / thresholds → snapshot → latest-value channel → consumer
//!
//! - The protocol map and decoder are pure: one frame in, field updates out
//! - One producer thread owns the data source and the telemetry state
//! - Consumers only ever see immutable snapshots shared through `Arc`
//! - Live SocketCAN, the simulator and candump replay share one trait
//!
//! The library does NOT render anything, configure the CAN interface, or
//! know about ECUs other than the EMU Black. Presentation lives in the
//! application layer (emu-dash-cli).
//!
//! # Example Usage
//!
//! ```no_run
//! use emu_telemetry::{AcquisitionEngine, EngineConfig, Field, SimulatedSource, SimulatorConfig};
//! use std::time::Duration;
//!
//! let config = EngineConfig::new().with_update_rate(30);
//! let engine = AcquisitionEngine::new(config.clone()).unwrap();
//! let source = SimulatedSource::from_engine_config(&config, SimulatorConfig::default());
//!
//! let (mut handle, mut receiver) = engine.spawn(source).unwrap();
//! while let Ok(snapshot) = receiver.recv_timeout(Duration::from_secs(1)) {
//!     if let Some(rpm) = snapshot.value(Field::Rpm) {
//!         println!("#{} {:.0} rpm in gear {:?}", snapshot.sequence, rpm, snapshot.gear());
//!     }
//!     if snapshot.sequence > 300 {
//!         break;
//!     }
//! }
//! handle.stop().unwrap();
//! ```

// Public modules
pub mod config;
pub mod decoder;
pub mod engine;
pub mod protocol;
pub mod sources;
pub mod telemetry;
pub mod types;
pub mod units;

// Re-export main types for convenience
pub use config::{Direction, EngineConfig, Threshold, UnitSystem};
pub use decoder::Decoder;
pub use engine::{
    snapshot_channel, AcquisitionEngine, EngineHandle, EngineState, RecvError, SnapshotPublisher,
    SnapshotReceiver,
};
pub use protocol::{FrameEncoder, ProtocolMap};
pub use sources::{DataSource, ReplaySource, RpmReadout, SimulatedSource, SimulatorConfig, SourceEvent};
#[cfg(target_os = "linux")]
pub use sources::SocketCanSource;
pub use telemetry::{FieldReading, FieldStatus, LinkStatus, TelemetrySnapshot, TelemetryState, WarningLevel};
pub use types::{
    DecodeError, EngineFlags, Field, FieldUpdate, FieldValue, Frame, Gear, Result, TelemetryError,
    Timestamp, Unit, WarningFlags,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        // Smoke test: default engine builds and covers all eight frames
        let engine = AcquisitionEngine::new(EngineConfig::default()).unwrap();
        assert_eq!(engine.decoder().identifiers().len(), 8);
        assert!(!VERSION.is_empty());
    }
}
