//! EMU Black Dashboard CLI
//!
//! Command-line consumer of the emu-telemetry library. It selects a data
//! source (simulator, live SocketCAN, or candump replay), runs the
//! acquisition engine and prints snapshots as text or JSON lines. It stands
//! in for the graphical dashboard, which consumes the same snapshots.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use emu_telemetry::{
    units, AcquisitionEngine, DataSource, EngineState, Field, FieldStatus, FieldValue, RecvError,
    ReplaySource, SimulatedSource, TelemetrySnapshot, UnitSystem,
};
use log::LevelFilter;
use std::path::PathBuf;
use std::time::{Duration, Instant};

mod config;

use config::{AppConfig, OutputFormat, SourceKind};

/// Fields printed in text mode when the configuration lists none
const SUMMARY_FIELDS: [Field; 10] = [
    Field::Rpm,
    Field::VehicleSpeed,
    Field::Gear,
    Field::ThrottlePosition,
    Field::Boost,
    Field::Afr,
    Field::CoolantTemp,
    Field::OilTemp,
    Field::OilPressure,
    Field::BatteryVoltage,
];

/// EMU Dash - Live telemetry from an ECUMaster EMU Black
#[derive(Parser, Debug)]
#[command(name = "emu-dash")]
#[command(about = "Decode and display EMU Black CAN telemetry", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Data source, overrides the configuration file
    #[arg(short, long, value_enum)]
    source: Option<SourceKind>,

    /// candump log to replay (implies --source replay)
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// SocketCAN interface name
    #[arg(long, value_name = "IFACE")]
    channel: Option<String>,

    /// CAN identifier of EMU frame 0, in hex (e.g. 600)
    #[arg(long, value_name = "HEX", value_parser = parse_hex_id)]
    base_id: Option<u32>,

    /// Snapshot publish rate in Hz
    #[arg(long, value_name = "HZ")]
    rate: Option<u32>,

    /// Stop after this many seconds
    #[arg(short, long, value_name = "SECS")]
    duration: Option<u64>,

    /// Simulator RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Print snapshots as JSON lines
    #[arg(long)]
    json: bool,

    /// Print every Nth snapshot
    #[arg(long, value_name = "N")]
    every: Option<u32>,

    /// Show imperial units
    #[arg(long)]
    imperial: bool,

    /// Loop the replay log instead of exiting at its end
    #[arg(long = "loop")]
    looping: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn parse_hex_id(text: &str) -> Result<u32, String> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("'{}' is not a hex identifier: {}", text, e))
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("EMU Dash CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using telemetry library v{}", emu_telemetry::VERSION);

    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate()?;

    run(&config, args.duration.map(Duration::from_secs))
}

/// Command-line flags win over the configuration file
fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(kind) = args.source {
        config.source.kind = kind;
    }
    if let Some(path) = &args.replay {
        config.source.kind = SourceKind::Replay;
        config.source.replay_file = Some(path.clone());
    }
    if let Some(channel) = &args.channel {
        config.engine.channel = channel.clone();
    }
    if let Some(base_id) = args.base_id {
        config.engine.base_id = base_id;
    }
    if let Some(rate) = args.rate {
        config.engine.update_rate_hz = rate;
    }
    if let Some(seed) = args.seed {
        config.source.seed = Some(seed);
    }
    if let Some(every) = args.every {
        config.display.every = every;
    }
    if args.json {
        config.display.format = OutputFormat::Json;
    }
    if args.imperial {
        config.engine.units = UnitSystem::Imperial;
    }
    if args.looping {
        config.source.looping = true;
    }
}

fn build_source(config: &AppConfig, frame_count: u32) -> Result<Box<dyn DataSource>> {
    let source: Box<dyn DataSource> = match config.source.kind {
        SourceKind::Mock => Box::new(SimulatedSource::from_engine_config(
            &config.engine,
            config.source.simulator(),
        )),
        SourceKind::Replay => {
            let path = config
                .source
                .replay_file
                .as_ref()
                .ok_or_else(|| anyhow!("Replay source selected but no replay file given"))?;
            Box::new(
                ReplaySource::new(path)
                    .with_realtime(config.source.realtime)
                    .with_looping(config.source.looping),
            )
        }
        SourceKind::Can => can_source(config, frame_count)?,
    };
    Ok(source)
}

#[cfg(target_os = "linux")]
fn can_source(config: &AppConfig, frame_count: u32) -> Result<Box<dyn DataSource>> {
    Ok(Box::new(emu_telemetry::SocketCanSource::from_config(
        &config.engine,
        frame_count,
    )))
}

#[cfg(not(target_os = "linux"))]
fn can_source(_config: &AppConfig, _frame_count: u32) -> Result<Box<dyn DataSource>> {
    Err(anyhow!("SocketCAN is only available on Linux; use --source mock or --replay"))
}

fn run(config: &AppConfig, duration: Option<Duration>) -> Result<()> {
    let engine = AcquisitionEngine::new(config.engine.clone()).context("Invalid engine configuration")?;
    let frame_count = engine.decoder().identifiers().len() as u32;
    let fields = display_fields(&config.display.fields)?;

    let source = build_source(config, frame_count)?;
    let (mut handle, mut receiver) = engine
        .spawn(source)
        .context("Failed to start acquisition")?;

    // A finished, non-looping replay never comes back
    let exit_on_disconnect = config.source.kind == SourceKind::Replay && !config.source.looping;
    let started = Instant::now();
    let mut received: u64 = 0;
    let mut last_state = EngineState::Starting;
    let mut last_snapshot = None;

    loop {
        if duration.map_or(false, |d| started.elapsed() >= d) {
            log::info!("Requested duration reached");
            break;
        }

        match receiver.recv_timeout(Duration::from_millis(500)) {
            Ok(snapshot) => {
                received += 1;
                let state = snapshot.link.state;
                let changed = state != last_state;
                if changed {
                    log::info!("Link state: {}", state);
                    last_state = state;
                }

                if changed || received % u64::from(config.display.every) == 0 {
                    print_snapshot(&snapshot, config, &fields)?;
                }

                let done = exit_on_disconnect && state == EngineState::Disconnected;
                last_snapshot = Some(snapshot);
                if done {
                    log::info!("Replay finished");
                    break;
                }
            }
            Err(RecvError::Timeout) => {
                log::debug!("No snapshot in 500 ms (engine {})", handle.state());
            }
            Err(RecvError::Closed) => {
                log::warn!("Snapshot channel closed");
                break;
            }
        }
    }

    handle.stop().context("Acquisition did not stop cleanly")?;

    if let Some(snapshot) = last_snapshot {
        let link = &snapshot.link;
        log::info!(
            "{} snapshots, {} frames, {} unknown ids, {} truncated, {} reconnects",
            received,
            link.frames_received,
            link.unknown_identifiers,
            link.truncated_frames,
            link.reconnect_attempts
        );
    }
    Ok(())
}

fn display_fields(names: &[String]) -> Result<Vec<Field>> {
    if names.is_empty() {
        return Ok(SUMMARY_FIELDS.to_vec());
    }
    names
        .iter()
        .map(|name| {
            Field::ALL
                .into_iter()
                .find(|field| field.name() == name.as_str())
                .ok_or_else(|| anyhow!("Unknown field '{}' in display.fields", name))
        })
        .collect()
}

fn print_snapshot(snapshot: &TelemetrySnapshot, config: &AppConfig, fields: &[Field]) -> Result<()> {
    match config.display.format {
        OutputFormat::Json => {
            let line = serde_json::to_string(snapshot).context("Failed to serialize snapshot")?;
            println!("{}", line);
        }
        OutputFormat::Text => println!("{}", format_snapshot(snapshot, fields, config.engine.units)),
    }
    Ok(())
}

/// One status line: time, sequence, link, selected fields, then alerts
fn format_snapshot(snapshot: &TelemetrySnapshot, fields: &[Field], units: UnitSystem) -> String {
    let time = snapshot
        .published_at
        .with_timezone(&chrono::Local)
        .format("%H:%M:%S%.3f");

    let mut line = format!("[{}] #{:<6} {:<12}", time, snapshot.sequence, snapshot.link.state);
    if snapshot.link.degraded {
        line.push_str(" DEGRADED");
    }

    for field in fields {
        line.push_str(" | ");
        line.push_str(field.name());
        line.push(' ');
        line.push_str(&format_reading(snapshot, *field, units));
    }

    let alerts = snapshot.alerts();
    if !alerts.is_empty() {
        let list: Vec<String> = alerts
            .iter()
            .map(|(field, level)| format!("{}={}", field.name(), level))
            .collect();
        line.push_str(" | ALERT ");
        line.push_str(&list.join(","));
    }
    line
}

fn format_reading(snapshot: &TelemetrySnapshot, field: Field, units: UnitSystem) -> String {
    match snapshot.status(field) {
        FieldStatus::Unknown => "??".to_string(),
        FieldStatus::Stale => "--".to_string(),
        FieldStatus::Live => match snapshot.field_value(field) {
            Some(FieldValue::Number(value)) => {
                let (shown, unit) = units::display(field, value, units);
                if unit.is_empty() {
                    format!("{:.1}", shown)
                } else {
                    format!("{:.1} {}", shown, unit)
                }
            }
            Some(other) => other.to_string(),
            None => "--".to_string(),
        },
    }
}

/// Initialize logging based on verbosity level
/// Level for our own crates; bus and OS crates stay at warn until `-vv`
fn log_level(verbose: u8, quiet: bool) -> (LevelFilter, LevelFilter) {
    match (quiet, verbose) {
        (true, _) => (LevelFilter::Error, LevelFilter::Error),
        (false, 0) => (LevelFilter::Info, LevelFilter::Warn),
        (false, 1) => (LevelFilter::Debug, LevelFilter::Warn),
        (false, _) => (LevelFilter::Trace, LevelFilter::Debug),
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::{Builder, Target};
    use std::io::Write;

    let (ours, others) = log_level(verbose, quiet);

    // stdout carries snapshots (JSON lines in --json mode)
    Builder::new()
        .target(Target::Stderr)
        .filter_level(others)
        .filter_module("emu_telemetry", ours)
        .filter_module("emu_dash_cli", ours)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
