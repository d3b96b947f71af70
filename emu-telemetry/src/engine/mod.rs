//! Acquisition engine
//!
//! One background thread (`emu-acquisition`) owns the data source. It pulls
//! frames with a bounded wait, decodes and merges them into the telemetry
//! state, and publishes a snapshot at a fixed cadence regardless of how fast
//! frames arrive. Link loss is handled inside the thread: fields are
//! invalidated, the source is reopened with exponential backoff, and the
//! engine returns to `Running` on the first frame afterwards.

pub mod channel;
pub mod link;

pub use channel::{snapshot_channel, RecvError, SnapshotPublisher, SnapshotReceiver};
pub use link::{Backoff, ErrorWindow, StopSignal};

use crate::config::EngineConfig;
use crate::decoder::Decoder;
use crate::protocol::ProtocolMap;
use crate::sources::{DataSource, SourceEvent};
use crate::telemetry::{LinkStatus, TelemetryState};
use crate::types::{DecodeError, Frame, Result, TelemetryError};
use channel::ChannelCloser;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Name of the producer thread
pub const ACQUISITION_THREAD_NAME: &str = "emu-acquisition";

/// Shortest wait handed to a source, avoids spinning when a publish is due
const MIN_POLL: Duration = Duration::from_millis(1);

/// Lifecycle of the acquisition engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Source open, waiting for the first frame
    Starting,
    Running,
    /// Link lost, reconnecting with backoff
    Disconnected,
    Stopping,
    Stopped,
}

impl EngineState {
    fn is_final(&self) -> bool {
        matches!(self, EngineState::Stopping | EngineState::Stopped)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Disconnected => "disconnected",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
        };
        f.pad(name)
    }
}

/// Closes the wrapped source when dropped, including during unwinding
pub struct SourceGuard<S: DataSource> {
    source: S,
}

impl<S: DataSource> SourceGuard<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: DataSource> Deref for SourceGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.source
    }
}

impl<S: DataSource> DerefMut for SourceGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

impl<S: DataSource> Drop for SourceGuard<S> {
    fn drop(&mut self) {
        log::debug!("Closing {}", self.source.describe());
        self.source.close();
    }
}

/// Validated engine, ready to start on a data source
///
/// The engine can be started again after its handle has been stopped;
/// snapshot sequence numbers keep increasing across runs.
#[derive(Debug)]
pub struct AcquisitionEngine {
    config: EngineConfig,
    decoder: Decoder,
    sequence: Arc<AtomicU64>,
}

impl AcquisitionEngine {
    /// Validate the configuration and build the decoder for the EMU Black map
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_protocol_map(config, ProtocolMap::emu_black())
    }

    /// Same as [`AcquisitionEngine::new`] with a custom protocol map
    pub fn with_protocol_map(config: EngineConfig, map: ProtocolMap) -> Result<Self> {
        config.validate()?;
        let decoder = Decoder::with_id_kind(map, config.base_id, config.extended_ids)?;

        log::info!(
            "Acquisition engine configured: base 0x{:X}, {} Hz, channel {} @ {} bit/s",
            config.base_id,
            config.update_rate_hz,
            config.channel,
            config.bitrate
        );

        Ok(Self {
            config,
            decoder,
            sequence: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Open the source on the calling thread and start the producer thread
    ///
    /// Nothing is processed if opening fails. If the thread cannot be
    /// spawned the source is closed before the error is returned.
    pub fn start<S>(&self, mut source: S, publisher: SnapshotPublisher) -> Result<EngineHandle>
    where
        S: DataSource + 'static,
    {
        let source_name = source.describe();
        log::info!("Opening {}", source_name);

        if let Err(e) = source.open() {
            log::error!("Failed to open {}: {}", source_name, e);
            return Err(match e {
                err @ TelemetryError::SourceOpen { .. } => err,
                other => TelemetryError::SourceOpen {
                    source_name,
                    reason: other.to_string(),
                },
            });
        }

        let guard = SourceGuard::new(source);
        let state = Arc::new(Mutex::new(EngineState::Starting));
        let stop = StopSignal::new();
        let closer = publisher.closer();

        let mut worker = Worker::new(
            guard,
            self.decoder.clone(),
            self.config.clone(),
            publisher,
            stop.clone(),
            Arc::clone(&state),
            Arc::clone(&self.sequence),
            source_name.clone(),
        );

        let thread = thread::Builder::new()
            .name(ACQUISITION_THREAD_NAME.to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                log::error!("Failed to spawn {}: {}", ACQUISITION_THREAD_NAME, e);
                TelemetryError::ThreadSpawn(e.to_string())
            })?;

        Ok(EngineHandle {
            thread: Some(thread),
            stop,
            closer,
            state,
            source_name,
        })
    }

    /// Create a channel, start on `source`, and return the handle with a receiver
    pub fn spawn<S>(&self, source: S) -> Result<(EngineHandle, SnapshotReceiver)>
    where
        S: DataSource + 'static,
    {
        let (publisher, receiver) = snapshot_channel();
        let handle = self.start(source, publisher)?;
        Ok((handle, receiver))
    }
}

/// Control handle of a running engine
///
/// Dropping a handle that was not stopped stops the engine.
#[derive(Debug)]
pub struct EngineHandle {
    thread: Option<JoinHandle<()>>,
    stop: StopSignal,
    closer: ChannelCloser,
    state: Arc<Mutex<EngineState>>,
    source_name: String,
}

impl EngineHandle {
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// True until the producer thread has exited
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Stop the engine and wait for the producer thread
    ///
    /// The channel is closed first so no snapshot is delivered after this
    /// call begins. Calling `stop` again is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        log::info!("Stopping acquisition from {}", self.source_name);
        self.closer.close();
        *self.state.lock() = EngineState::Stopping;
        self.stop.stop();

        let joined = thread.join();
        *self.state.lock() = EngineState::Stopped;

        match joined {
            Ok(()) => {
                log::info!("Acquisition stopped");
                Ok(())
            }
            Err(_) => {
                log::error!("{} panicked", ACQUISITION_THREAD_NAME);
                Err(TelemetryError::EngineTerminated)
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Engine did not stop cleanly: {}", e);
        }
    }
}

/// State owned by the producer thread
struct Worker<S: DataSource> {
    source: SourceGuard<S>,
    decoder: Decoder,
    config: EngineConfig,
    telemetry: TelemetryState,
    publisher: SnapshotPublisher,
    stop: StopSignal,
    state: Arc<Mutex<EngineState>>,
    sequence: Arc<AtomicU64>,
    link: LinkStatus,
    backoff: Backoff,
    errors: ErrorWindow,
    last_frame: Instant,
    /// Set after a successful reopen while waiting for the first frame
    reopened_at: Option<Instant>,
}

impl<S: DataSource> Worker<S> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        source: SourceGuard<S>,
        decoder: Decoder,
        config: EngineConfig,
        publisher: SnapshotPublisher,
        stop: StopSignal,
        state: Arc<Mutex<EngineState>>,
        sequence: Arc<AtomicU64>,
        source_name: String,
    ) -> Self {
        Self {
            source,
            telemetry: TelemetryState::new(&config),
            backoff: Backoff::new(config.reconnect_initial(), config.reconnect_max()),
            errors: ErrorWindow::new(config.error_window(), config.max_decode_errors),
            link: LinkStatus::new(EngineState::Starting, source_name),
            decoder,
            config,
            publisher,
            stop,
            state,
            sequence,
            last_frame: Instant::now(),
            reopened_at: None,
        }
    }

    fn run(&mut self) {
        let interval = self.config.update_interval();
        let poll_timeout = self.config.poll_timeout();
        let mut next_publish = Instant::now() + interval;

        log::info!(
            "Acquisition started on {} ({} Hz publish)",
            self.link.source,
            self.config.update_rate_hz
        );

        while !self.stop.is_stopped() {
            if self.state() == EngineState::Disconnected && self.reopened_at.is_none() {
                if !self.reconnect() {
                    break;
                }
                continue;
            }

            let now = Instant::now();
            if now >= next_publish {
                self.publish(now);
                next_publish += interval;
                if next_publish <= now {
                    next_publish = now + interval;
                }
            }

            let wait = next_publish
                .saturating_duration_since(Instant::now())
                .min(poll_timeout)
                .max(MIN_POLL);

            match self.source.next_frame(wait) {
                SourceEvent::Frame(frame) => self.handle_frame(frame),
                SourceEvent::Timeout => {}
                SourceEvent::Disconnected => {
                    if self.state() == EngineState::Disconnected {
                        log::debug!("{} dropped again after reopening", self.link.source);
                        self.reopened_at = None;
                    } else {
                        self.enter_disconnected("source reported disconnect");
                    }
                }
            }

            self.check_link();
        }

        log::info!(
            "Acquisition loop exiting after {} frames",
            self.link.frames_received
        );
    }

    fn state(&self) -> EngineState {
        *self.state.lock()
    }

    fn set_state(&mut self, next: EngineState) {
        let mut state = self.state.lock();
        if state.is_final() || *state == next {
            return;
        }
        log::info!("Engine state: {} -> {}", *state, next);
        *state = next;
        self.link.state = next;
    }

    fn handle_frame(&mut self, frame: Frame) {
        let now = Instant::now();
        self.link.frames_received += 1;
        self.last_frame = now;

        if self.state() != EngineState::Running {
            if self.reopened_at.take().is_some() {
                log::info!("Link restored on {}", self.link.source);
            }
            self.backoff.reset();
            self.set_state(EngineState::Running);
        }

        match self.decoder.decode(&frame) {
            Ok(updates) => self.telemetry.merge(&updates),
            Err(e) => {
                match e {
                    DecodeError::UnknownIdentifier(id) => {
                        self.link.unknown_identifiers += 1;
                        log::trace!("Skipping frame 0x{:X}: not part of the EMU stream", id);
                    }
                    DecodeError::Truncated { .. } => {
                        self.link.truncated_frames += 1;
                        log::debug!("Skipping frame: {}", e);
                    }
                }
                self.errors.record(now);
            }
        }
    }

    /// Grace expiry for a live link, or for a reopened source that stays quiet
    fn check_link(&mut self) {
        let grace = self.config.link_grace();
        match self.state() {
            EngineState::Starting | EngineState::Running => {
                if self.last_frame.elapsed() > grace {
                    self.enter_disconnected("no frames within link grace");
                }
            }
            EngineState::Disconnected => {
                if let Some(at) = self.reopened_at {
                    if at.elapsed() > grace {
                        log::debug!("Still no frames from {} after reopening", self.link.source);
                        self.reopened_at = None;
                    }
                }
            }
            EngineState::Stopping | EngineState::Stopped => {}
        }
    }

    fn enter_disconnected(&mut self, reason: &str) {
        log::warn!("Link to {} lost: {}", self.link.source, reason);
        self.set_state(EngineState::Disconnected);
        self.reopened_at = None;
        self.telemetry.invalidate_all();
        self.errors.clear();
        self.link.degraded = false;

        let now = Instant::now();
        let sequence = self.next_sequence();
        let snapshot = self.telemetry.snapshot(now, sequence, self.link.clone());
        self.publisher.publish(snapshot);
    }

    /// Wait out the backoff, then close and reopen the source
    ///
    /// Returns `false` if a stop was requested during the wait.
    fn reconnect(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        log::debug!("Reconnecting to {} in {:?}", self.link.source, delay);
        if self.stop.wait_timeout(delay) {
            return false;
        }

        self.link.reconnect_attempts += 1;
        self.source.close();
        match self.source.open() {
            Ok(()) => {
                log::info!("Reopened {}, waiting for frames", self.link.source);
                self.reopened_at = Some(Instant::now());
            }
            Err(e) => log::warn!("Reconnect attempt {} failed: {}", self.link.reconnect_attempts, e),
        }
        true
    }

    fn publish(&mut self, now: Instant) {
        if self.state() == EngineState::Disconnected {
            return;
        }

        let expired = self.telemetry.expire(now);
        if expired > 0 {
            log::trace!("{} fields expired", expired);
        }

        let degraded = self.errors.is_degraded(now);
        if degraded != self.link.degraded {
            if degraded {
                log::warn!(
                    "Link degraded: {} decode errors within {:?}",
                    self.errors.count(now),
                    self.config.error_window()
                );
            } else {
                log::info!("Decode error rate back to normal");
            }
            self.link.degraded = degraded;
        }

        let sequence = self.next_sequence();
        let snapshot = self.telemetry.snapshot(now, sequence, self.link.clone());
        self.publisher.publish(snapshot);
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }
}
