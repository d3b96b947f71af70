//! Standalone candump decoder tool
//!
//! Decodes a `candump -l` log with the EMU Black protocol map and prints
//! every field update, then a per-identifier summary. No engine, no
//! smoothing: this shows exactly what the wire carried.
//!
//! Usage:
//!   decode_candump <log_file> [--base <hex id>] [--limit <count>]
//!
//! Example:
//!   decode_candump drive.log --base 600 --limit 100

use emu_telemetry::sources::replay::parse_candump;
use emu_telemetry::{DecodeError, Decoder, Frame, ProtocolMap};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::time::Instant;

#[derive(Default)]
struct DecodeStats {
    frames: usize,
    updates: usize,
    unknown: usize,
    truncated: usize,
    per_id: BTreeMap<u32, usize>,
}

impl DecodeStats {
    fn print_summary(&self) {
        println!("\n=== DECODING SUMMARY ===");
        println!("Frames processed: {}", self.frames);
        println!("Field updates: {}", self.updates);
        println!("Unknown identifiers: {}", self.unknown);
        println!("Truncated frames: {}", self.truncated);
        println!("\nFrames per identifier:");
        for (id, count) in &self.per_id {
            println!("  0x{:03X}: {}", id, count);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <log_file> [--base <hex id>] [--limit <count>]", args[0]);
        std::process::exit(1);
    }

    let mut base_id = 0x600;
    let mut limit = usize::MAX;
    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--base" if i + 1 < args.len() => {
                base_id = u32::from_str_radix(args[i + 1].trim_start_matches("0x"), 16)?;
                i += 2;
            }
            "--limit" if i + 1 < args.len() => {
                limit = args[i + 1].parse()?;
                i += 2;
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                std::process::exit(1);
            }
        }
    }

    let text = fs::read_to_string(&args[1])?;
    let records = parse_candump(&text)?;
    let decoder = Decoder::new(ProtocolMap::emu_black(), base_id)?;
    println!("Decoding {} frames from {} (base 0x{:X})", records.len(), args[1], base_id);

    let mut stats = DecodeStats::default();
    for record in records.iter().take(limit) {
        let frame = Frame::with_timestamp(record.id, record.extended, &record.data, Instant::now())?;
        stats.frames += 1;
        *stats.per_id.entry(record.id).or_insert(0) += 1;

        match decoder.decode(&frame) {
            Ok(updates) => {
                let fields: Vec<String> = updates
                    .iter()
                    .map(|u| format!("{}={}", u.field.name(), u.value))
                    .collect();
                println!(
                    "{:>10.6} 0x{:03X} {}",
                    record.time.as_secs_f64(),
                    record.id,
                    fields.join(" ")
                );
                stats.updates += updates.len();
            }
            Err(DecodeError::UnknownIdentifier(_)) => stats.unknown += 1,
            Err(e @ DecodeError::Truncated { .. }) => {
                println!("{:>10.6} {}", record.time.as_secs_f64(), e);
                stats.truncated += 1;
            }
        }
    }

    stats.print_summary();
    Ok(())
}
