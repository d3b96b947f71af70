//! Configuration loading and parsing

use anyhow::{bail, Context, Result};
use emu_telemetry::{EngineConfig, SimulatorConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from config.toml)
///
/// Every section is optional; an empty file yields the defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Built-in engine simulator
    #[default]
    Mock,
    /// Live SocketCAN interface
    Can,
    /// candump log file
    Replay,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,

    /// candump log for `kind = "replay"`
    pub replay_file: Option<PathBuf>,

    /// Start the log over instead of disconnecting at its end
    #[serde(default)]
    pub looping: bool,

    /// Pace replay and simulation in wall-clock time
    #[serde(default = "default_realtime")]
    pub realtime: bool,

    pub seed: Option<u64>,

    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,

    /// Let the simulator raise the EMU warning bits
    #[serde(default)]
    pub enable_warnings: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            replay_file: None,
            looping: false,
            realtime: default_realtime(),
            seed: None,
            tick_hz: default_tick_hz(),
            enable_warnings: false,
        }
    }
}

impl SourceConfig {
    pub fn simulator(&self) -> SimulatorConfig {
        SimulatorConfig {
            tick_hz: self.tick_hz,
            seed: self.seed,
            enable_warnings: self.enable_warnings,
            realtime: self.realtime,
        }
    }
}

fn default_realtime() -> bool {
    true
}

fn default_tick_hz() -> u32 {
    50
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    /// One JSON object per snapshot
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DisplayConfig {
    #[serde(default)]
    pub format: OutputFormat,

    /// Print every Nth snapshot
    #[serde(default = "default_every")]
    pub every: u32,

    /// Fields listed in text mode, by name; empty means a built-in summary
    #[serde(default)]
    pub fields: Vec<String>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            every: default_every(),
            fields: Vec::new(),
        }
    }
}

fn default_every() -> u32 {
    10
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config.validate()?;
    Ok(config)
}

impl AppConfig {
    /// Engine settings are checked again by the engine; this covers the CLI sections
    pub fn validate(&self) -> Result<()> {
        self.engine.validate().context("Invalid [engine] section")?;

        if self.source.kind == SourceKind::Replay && self.source.replay_file.is_none() {
            bail!("Replay source selected but no replay file given");
        }
        if self.source.tick_hz == 0 {
            bail!("source.tick_hz must be at least 1");
        }
        if self.display.every == 0 {
            bail!("display.every must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_telemetry::{Direction, Field, UnitSystem};
    use std::io::Write;

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
            [engine]
            base_id = 0x700
            channel = "vcan0"
            update_rate_hz = 20
            units = "imperial"

            [engine.smoothing]
            rpm = 0.8

            [engine.thresholds.coolant_temp]
            direction = "above"
            warning = 100.0
            critical = 110.0
            hysteresis = 3.0

            [source]
            kind = "replay"
            replay_file = "drive.log"
            looping = true

            [display]
            format = "json"
            every = 1
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.engine.base_id, 0x700);
        assert_eq!(config.engine.channel, "vcan0");
        assert_eq!(config.engine.units, UnitSystem::Imperial);
        assert_eq!(config.engine.alpha_for(Field::Rpm), 0.8);
        assert_eq!(config.engine.threshold_for(Field::CoolantTemp).unwrap().critical, 110.0);
        assert_eq!(config.source.kind, SourceKind::Replay);
        assert!(config.source.looping);
        assert!(config.source.realtime);
        assert_eq!(config.display.format, OutputFormat::Json);
        config.validate().unwrap();
    }

    #[test]
    fn test_two_sided_battery_threshold() {
        let toml_content = r#"
            [engine.thresholds.battery_voltage]
            direction = "outside"
            low_critical = 11.5
            low_warning = 12.0
            warning = 14.8
            critical = 15.2
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        let battery = config.engine.threshold_for(Field::BatteryVoltage).unwrap();
        assert_eq!(battery.direction, Direction::Outside);
        assert_eq!(battery.low_warning, Some(12.0));
        assert_eq!(battery.low_critical, Some(11.5));
        config.validate().unwrap();

        let config: AppConfig =
            toml::from_str("[engine.thresholds.battery_voltage]\ndirection = \"outside\"\nwarning = 14.8\ncritical = 15.2\n")
                .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.source.kind, SourceKind::Mock);
        assert_eq!(config.source.tick_hz, 50);
        assert_eq!(config.display.every, 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_replay_without_file_is_rejected() {
        let config: AppConfig = toml::from_str("[source]\nkind = \"replay\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nupdate_rate_hz = 0").unwrap();
        file.flush().unwrap();

        let err = load_config(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("[engine]"));

        assert!(load_config(Path::new("/nonexistent/emu-dash.toml")).is_err());
    }
}
