//! Simulated EMU Black
//!
//! A physics-lite vehicle model for bench work and tests. Every simulation
//! tick is encoded into the eight EMU frames with the same protocol map the
//! decoder uses, so the simulated path exercises exactly the live decode
//! path.

use super::{DataSource, SourceEvent};
use crate::config::EngineConfig;
use crate::protocol::{FrameEncoder, ProtocolMap};
use crate::types::{EngineFlags, Field, FieldValue, Frame, Gear, Result, WarningFlags};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Gear ratios 1st..6th
pub const GEAR_RATIOS: [f64; 6] = [3.827, 2.360, 1.685, 1.312, 1.000, 0.793];
pub const FINAL_DRIVE: f64 = 3.538;
/// Tire rolling circumference in metres
pub const TIRE_CIRCUMFERENCE: f64 = 2.0;

pub const IDLE_RPM: f64 = 850.0;
pub const REDLINE_RPM: f64 = 7200.0;
pub const REV_LIMIT_RPM: f64 = 7500.0;
pub const UPSHIFT_RPM: f64 = 6800.0;
pub const DOWNSHIFT_RPM: f64 = 2500.0;

const COOLANT_BASE: f64 = 88.0;
const OIL_BASE: f64 = 95.0;
const AMBIENT: f64 = 20.0;

/// Read-only RPM for an audio synthesiser running on another thread
#[derive(Debug, Clone, Default)]
pub struct RpmReadout {
    bits: Arc<AtomicU32>,
}

impl RpmReadout {
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    fn set(&self, rpm: f64) {
        self.bits.store((rpm as f32).to_bits(), Ordering::Relaxed);
    }
}

/// Vehicle model state
#[derive(Debug, Clone)]
pub struct Simulator {
    rng: StdRng,
    time: f64,
    running_time: f64,
    gear: u8,
    rpm: f64,
    throttle: f64,
    accelerating: bool,
    coolant_temp: f64,
    oil_temp: f64,
    enable_warnings: bool,
}

impl Simulator {
    /// Cold engine idling in first gear; `seed` makes runs reproducible
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            time: 0.0,
            running_time: 0.0,
            gear: 1,
            rpm: IDLE_RPM,
            throttle: 0.0,
            accelerating: true,
            coolant_temp: AMBIENT,
            oil_temp: AMBIENT,
            enable_warnings: false,
        }
    }

    /// Builder method: randomly raise the knock warning
    pub fn with_warnings(mut self, enabled: bool) -> Self {
        self.enable_warnings = enabled;
        self
    }

    pub fn rpm(&self) -> f64 {
        self.rpm
    }

    pub fn gear(&self) -> u8 {
        self.gear
    }

    pub fn throttle(&self) -> f64 {
        self.throttle
    }

    pub fn coolant_temp(&self) -> f64 {
        self.coolant_temp
    }

    pub fn oil_temp(&self) -> f64 {
        self.oil_temp
    }

    /// Force a gear (0 = neutral)
    pub fn set_gear(&mut self, gear: u8) {
        self.gear = gear.min(Gear::TOP_GEAR);
    }

    pub fn set_rpm(&mut self, rpm: f64) {
        self.rpm = rpm.clamp(0.0, REV_LIMIT_RPM);
    }

    /// Road speed in km/h implied by RPM and gear
    pub fn speed_kmh(&self) -> f64 {
        let Some(ratio) = self.ratio() else {
            return 0.0;
        };
        let metres_per_second = self.rpm * TIRE_CIRCUMFERENCE / (ratio * FINAL_DRIVE * 60.0);
        (metres_per_second * 3.6).max(0.0)
    }

    fn ratio(&self) -> Option<f64> {
        match self.gear {
            0 => None,
            n => GEAR_RATIOS.get(n as usize - 1).copied(),
        }
    }

    /// Advance the model by `dt` seconds and return every field value
    pub fn step(&mut self, dt: f64) -> BTreeMap<Field, FieldValue> {
        self.time += dt;
        self.running_time += dt;

        self.update_throttle(dt);
        self.update_rpm(dt);
        self.check_gear_change();
        self.update_temperatures(dt);

        self.values()
    }

    fn noise(&mut self, amplitude: f64) -> f64 {
        self.rng.gen_range(-amplitude..=amplitude)
    }

    fn update_throttle(&mut self, dt: f64) {
        let cycle = (self.time * 0.3).sin() * 0.5 + 0.5;

        // occasional full lift
        if self.rng.gen_bool(0.002) {
            self.accelerating = false;
            self.throttle = 0.0;
        }

        if self.accelerating {
            let target = 70.0 + cycle * 30.0;
            self.throttle = (self.throttle + 150.0 * dt).min(100.0);
            if self.throttle >= target && self.rng.gen_bool(0.015) {
                self.accelerating = false;
            }
        } else {
            let rate = if self.throttle > 50.0 { 300.0 } else { 150.0 };
            self.throttle = (self.throttle - rate * dt).max(0.0);

            let resume_chance = if self.rpm < 3000.0 { 0.03 } else { 0.02 };
            if self.throttle <= 15.0 && self.rng.gen_bool(resume_chance) {
                self.accelerating = true;
            }
        }
    }

    fn update_rpm(&mut self, dt: f64) {
        if self.throttle > 50.0 {
            self.rpm += (self.throttle - 30.0) * 15.0 * dt;
        } else if self.throttle > 10.0 {
            let target = IDLE_RPM + self.throttle / 10.0 * 2000.0;
            self.rpm += (target - self.rpm) * dt * 2.0;
        } else {
            self.rpm = (self.rpm - 800.0 * dt).max(IDLE_RPM);
        }
        let jitter = self.noise(20.0);
        self.rpm = (self.rpm + jitter).clamp(0.0, REV_LIMIT_RPM);
    }

    fn check_gear_change(&mut self) {
        if self.gear == 0 {
            return;
        }
        if self.rpm >= UPSHIFT_RPM && self.gear < Gear::TOP_GEAR {
            self.shift(self.gear + 1);
        } else if self.rpm <= DOWNSHIFT_RPM && self.gear > 1 && self.throttle < 30.0 {
            self.shift(self.gear - 1);
        }
    }

    fn shift(&mut self, next: u8) {
        let (Some(from), Some(to)) = (self.ratio(), GEAR_RATIOS.get(next as usize - 1).copied()) else {
            return;
        };
        let previous = self.gear;
        self.gear = next;
        self.rpm = (self.rpm * to / from).min(REDLINE_RPM);
        log::trace!("Simulator shift {} -> {} at {:.0} rpm", previous, next, self.rpm);
    }

    fn load(&self) -> f64 {
        (self.throttle / 100.0) * (self.rpm / REDLINE_RPM)
    }

    fn update_temperatures(&mut self, dt: f64) {
        let load = self.load();
        let sustained = self.gear >= 5 && self.rpm > 6000.0 && self.throttle > 80.0;
        let (coolant_target, oil_target) = if sustained {
            (COOLANT_BASE + 25.0 + load * 15.0, OIL_BASE + 35.0 + load * 20.0)
        } else {
            (COOLANT_BASE + load * 15.0, OIL_BASE + load * 20.0)
        };

        let rate = if self.running_time < 60.0 {
            0.5
        } else if self.coolant_temp > coolant_target {
            0.15
        } else {
            0.2
        };

        self.coolant_temp += (coolant_target - self.coolant_temp) * rate * dt;
        self.oil_temp += (oil_target - self.oil_temp) * rate * dt;

        let coolant_noise = self.noise(0.3);
        let oil_noise = self.noise(0.3);
        self.coolant_temp = (self.coolant_temp + coolant_noise).clamp(AMBIENT, 130.0);
        self.oil_temp = (self.oil_temp + oil_noise).clamp(AMBIENT, 150.0);
    }

    fn boost(&mut self) -> f64 {
        if self.rpm < 2500.0 || self.throttle < 50.0 {
            return -0.5 + self.noise(0.1);
        }
        let rpm_factor = ((self.rpm - 2500.0) / 4000.0).min(1.0);
        let throttle_factor = (self.throttle - 50.0) / 50.0;
        1.8 * rpm_factor * throttle_factor + self.noise(0.05)
    }

    fn afr(&mut self) -> f64 {
        if self.throttle > 80.0 {
            11.5 + self.noise(0.3)
        } else if self.throttle > 30.0 {
            13.5 + self.noise(0.3)
        } else {
            14.7 + self.noise(0.2)
        }
    }

    /// Injector pulse width in ms from duty cycle and engine cycle time
    fn injector_pulse_width(&mut self) -> f64 {
        let duty = ((self.rpm / REDLINE_RPM) * 50.0 + self.throttle / 100.0 * 40.0 + self.noise(2.0)).min(95.0);
        let cycle_ms = 120_000.0 / self.rpm.max(IDLE_RPM);
        duty / 100.0 * cycle_ms
    }

    fn ignition_angle(&mut self) -> f64 {
        let base = 35.0 - self.throttle / 100.0 * 20.0;
        let advance = ((self.rpm - IDLE_RPM) / 500.0).min(10.0);
        base + advance + self.noise(1.0)
    }

    fn engine_flags(&self) -> EngineFlags {
        let mut bits = 0;
        if self.rpm < 1000.0 {
            bits |= EngineFlags::IDLE.0;
        }
        if self.rpm >= UPSHIFT_RPM && self.throttle > 90.0 {
            bits |= EngineFlags::GEARCUT.0;
        }
        EngineFlags(bits)
    }

    fn warning_flags(&mut self) -> WarningFlags {
        if self.enable_warnings && self.rng.gen_bool(0.001) {
            WarningFlags::KNOCKING
        } else {
            WarningFlags::default()
        }
    }

    fn values(&mut self) -> BTreeMap<Field, FieldValue> {
        let boost = self.boost();
        let afr = self.afr();
        let injector = self.injector_pulse_width();
        let ignition = self.ignition_angle();
        let intake = 25.0 + self.noise(2.0);
        let fuel_pressure = 3.0 + self.noise(0.1);
        let battery = 13.8 + self.noise(0.3);
        let oil_pressure = 1.0 + self.rpm / 1000.0 * 0.8 + self.noise(0.2);
        let egt = 350.0 + self.load() * 500.0 + self.noise(10.0);
        let egt_spread = self.noise(15.0);
        let lambda_target = if self.throttle > 80.0 { 0.85 } else { 1.0 };
        let warnings = self.warning_flags();

        let number = FieldValue::Number;
        BTreeMap::from([
            (Field::Rpm, number(self.rpm)),
            (Field::ThrottlePosition, number(self.throttle)),
            (Field::IntakeTemp, number(intake)),
            (Field::Boost, number(boost)),
            (Field::InjectorPulseWidth, number(injector)),
            (Field::LambdaTarget, number(lambda_target)),
            (Field::Lambda, number(afr / crate::protocol::AFR_STOICH)),
            (Field::FuelPressure, number(fuel_pressure)),
            (Field::VehicleSpeed, number(self.speed_kmh())),
            (Field::Gear, FieldValue::Gear(Gear::from_raw(self.gear))),
            (Field::IgnitionAngle, number(ignition)),
            (Field::BatteryVoltage, number(battery)),
            (Field::CoolantTemp, number(self.coolant_temp)),
            (Field::OilTemp, number(self.oil_temp)),
            (Field::OilPressure, number(oil_pressure)),
            (Field::Egt1, number(egt)),
            (Field::Egt2, number(egt + egt_spread)),
            (Field::EngineFlags, FieldValue::Flags(self.engine_flags().0 as u16)),
            (Field::WarningFlags, FieldValue::Flags(warnings.0)),
            (Field::DbwPosition, number(self.throttle)),
        ])
    }
}

/// Simulation source settings
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    /// Simulation steps per second; each step emits the full frame set
    pub tick_hz: u32,
    pub seed: Option<u64>,
    pub enable_warnings: bool,
    /// Pace ticks against the wall clock; off for fast tests
    pub realtime: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tick_hz: 50,
            seed: None,
            enable_warnings: false,
            realtime: true,
        }
    }
}

impl SimulatorConfig {
    /// Builder method: fixed RNG seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builder method: toggle wall-clock pacing
    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Builder method: toggle random knock warnings
    pub fn with_warnings(mut self, enabled: bool) -> Self {
        self.enable_warnings = enabled;
        self
    }

    fn tick(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.tick_hz.max(1) as u64)
    }
}

/// [`DataSource`] that emits simulator ticks as EMU frames
pub struct SimulatedSource {
    simulator: Simulator,
    encoder: FrameEncoder,
    config: SimulatorConfig,
    pending: VecDeque<Frame>,
    next_tick: Instant,
    open: bool,
    readout: RpmReadout,
}

impl SimulatedSource {
    pub fn new(config: SimulatorConfig, encoder: FrameEncoder) -> Self {
        let simulator = Simulator::new(config.seed).with_warnings(config.enable_warnings);
        let readout = RpmReadout::default();
        readout.set(simulator.rpm());
        Self {
            simulator,
            encoder,
            config,
            pending: VecDeque::new(),
            next_tick: Instant::now(),
            open: false,
            readout,
        }
    }

    /// Simulated ECU on the configured base identifier
    pub fn from_engine_config(engine: &EngineConfig, config: SimulatorConfig) -> Self {
        let encoder = FrameEncoder::new(ProtocolMap::emu_black(), engine.base_id)
            .with_extended_ids(engine.extended_ids);
        Self::new(config, encoder)
    }

    pub fn rpm_readout(&self) -> RpmReadout {
        self.readout.clone()
    }

    pub fn simulator(&self) -> &Simulator {
        &self.simulator
    }

    pub fn simulator_mut(&mut self) -> &mut Simulator {
        &mut self.simulator
    }

    fn generate(&mut self, now: Instant) {
        let dt = self.config.tick().as_secs_f64();
        let values = self.simulator.step(dt);
        self.readout.set(self.simulator.rpm());

        match self.encoder.encode_all(&values, now) {
            Ok(frames) => self.pending.extend(frames),
            Err(e) => log::warn!("Simulator produced an unencodable tick: {}", e),
        }
    }
}

impl DataSource for SimulatedSource {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        self.pending.clear();
        self.next_tick = Instant::now();
        log::info!(
            "Simulator running at {} Hz (seed {:?})",
            self.config.tick_hz,
            self.config.seed
        );
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> SourceEvent {
        if !self.open {
            return SourceEvent::Disconnected;
        }
        if let Some(frame) = self.pending.pop_front() {
            return SourceEvent::Frame(frame);
        }

        if self.config.realtime {
            let now = Instant::now();
            if now < self.next_tick {
                let wait = self.next_tick - now;
                if wait > timeout {
                    thread::sleep(timeout);
                    return SourceEvent::Timeout;
                }
                thread::sleep(wait);
            }
            let now = Instant::now();
            self.next_tick += self.config.tick();
            if self.next_tick < now {
                self.next_tick = now + self.config.tick();
            }
            self.generate(now);
        } else {
            self.generate(Instant::now());
        }

        match self.pending.pop_front() {
            Some(frame) => SourceEvent::Frame(frame),
            None => SourceEvent::Timeout,
        }
    }

    fn close(&mut self) {
        self.open = false;
        self.pending.clear();
    }

    fn describe(&self) -> String {
        format!("simulated EMU Black (base 0x{:X})", self.encoder.base_id())
    }
}
