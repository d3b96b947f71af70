//! Frame sources
//!
//! Everything the acquisition engine reads from implements [`DataSource`]:
//! the live SocketCAN bus, the simulator, and candump log replay. The engine
//! cannot tell them apart.

pub mod replay;
pub mod simulator;
#[cfg(target_os = "linux")]
pub mod socketcan;

pub use replay::{parse_candump_line, ReplaySource};
pub use simulator::{RpmReadout, SimulatedSource, Simulator, SimulatorConfig};
#[cfg(target_os = "linux")]
pub use self::socketcan::SocketCanSource;

use crate::types::{Frame, Result};
use std::time::Duration;

/// Outcome of one bounded read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    Frame(Frame),
    /// Nothing arrived within the timeout
    Timeout,
    /// The source is gone (interface down, end of log)
    Disconnected,
}

/// A source of CAN frames
///
/// `next_frame` must return within roughly `timeout` so the engine can keep
/// its publish cadence and notice stop requests.
pub trait DataSource: Send {
    /// Open or reopen the underlying connection
    fn open(&mut self) -> Result<()>;

    /// Wait up to `timeout` for the next frame
    fn next_frame(&mut self, timeout: Duration) -> SourceEvent;

    /// Release the connection; must be safe to call more than once
    fn close(&mut self);

    /// Human-readable description for logs and status
    fn describe(&self) -> String;
}

impl<S: DataSource + ?Sized> DataSource for Box<S> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn next_frame(&mut self, timeout: Duration) -> SourceEvent {
        (**self).next_frame(timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
