//! Live SocketCAN source (Linux only)
//!
//! Opens a SocketCAN interface by name and installs kernel filters so only
//! the EMU stream identifiers reach user space. Bringing the interface up and
//! setting its bitrate is left to the OS (`ip link set can0 up type can
//! bitrate 500000`).

use super::{DataSource, SourceEvent};
use crate::config::EngineConfig;
use crate::types::{Frame, Result, TelemetryError};
use socketcan::{CanFilter, CanSocket, EmbeddedFrame, Frame as _, Socket, SocketOptions};
use std::io::ErrorKind;
use std::time::{Duration, Instant};

const CAN_EFF_FLAG: u32 = 0x8000_0000;
const CAN_SFF_MASK: u32 = 0x0000_07FF;
const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// Reads EMU frames from a SocketCAN interface
pub struct SocketCanSource {
    interface: String,
    bitrate: u32,
    identifiers: Vec<u32>,
    extended: bool,
    socket: Option<CanSocket>,
}

impl SocketCanSource {
    /// Source for `identifiers` on `interface`
    pub fn new(interface: impl Into<String>, identifiers: Vec<u32>, extended: bool) -> Self {
        Self {
            interface: interface.into(),
            bitrate: 0,
            identifiers,
            extended,
            socket: None,
        }
    }

    /// Source listening for base+0 .. base+frame_count-1 as configured
    pub fn from_config(config: &EngineConfig, frame_count: u32) -> Self {
        let identifiers = (0..frame_count).map(|offset| config.base_id + offset).collect();
        Self {
            bitrate: config.bitrate,
            ..Self::new(config.channel.clone(), identifiers, config.extended_ids)
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn filters(&self) -> Vec<CanFilter> {
        self.identifiers
            .iter()
            .map(|id| {
                if self.extended {
                    CanFilter::new(id | CAN_EFF_FLAG, CAN_EFF_MASK | CAN_EFF_FLAG)
                } else {
                    CanFilter::new(*id, CAN_SFF_MASK | CAN_EFF_FLAG)
                }
            })
            .collect()
    }
}

impl DataSource for SocketCanSource {
    fn open(&mut self) -> Result<()> {
        let socket = CanSocket::open(&self.interface).map_err(|e| TelemetryError::SourceOpen {
            source_name: self.describe(),
            reason: e.to_string(),
        })?;

        if !self.identifiers.is_empty() {
            socket
                .set_filters(&self.filters())
                .map_err(|e| TelemetryError::SourceOpen {
                    source_name: self.describe(),
                    reason: format!("failed to install filters: {}", e),
                })?;
        }

        log::info!(
            "CAN socket opened on {} with {} filters",
            self.interface,
            self.identifiers.len()
        );
        self.socket = Some(socket);
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> SourceEvent {
        let Some(socket) = self.socket.as_ref() else {
            return SourceEvent::Disconnected;
        };

        match socket.read_frame_timeout(timeout) {
            Ok(frame) => {
                if frame.is_error_frame() {
                    log::debug!("{}: bus error frame 0x{:X}", self.interface, frame.raw_id());
                    return SourceEvent::Timeout;
                }
                let extended = EmbeddedFrame::is_extended(&frame);
                let payload = EmbeddedFrame::data(&frame);
                match Frame::with_timestamp(frame.raw_id(), extended, payload, Instant::now()) {
                    Ok(frame) => SourceEvent::Frame(frame),
                    Err(e) => {
                        log::debug!("{}: dropping frame: {}", self.interface, e);
                        SourceEvent::Timeout
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => SourceEvent::Timeout,
            Err(e) => {
                log::error!("CAN read error on {}: {}", self.interface, e);
                SourceEvent::Disconnected
            }
        }
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::debug!("CAN socket on {} closed", self.interface);
        }
    }

    fn describe(&self) -> String {
        if self.bitrate > 0 {
            format!("SocketCAN {} @ {} bit/s", self.interface, self.bitrate)
        } else {
            format!("SocketCAN {}", self.interface)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_covers_stream() {
        let config = EngineConfig::default().with_channel("vcan0");
        let source = SocketCanSource::from_config(&config, 8);
        assert_eq!(source.interface(), "vcan0");
        assert_eq!(source.identifiers, (0x600..=0x607).collect::<Vec<_>>());
        assert_eq!(source.filters().len(), 8);
        assert_eq!(source.describe(), "SocketCAN vcan0 @ 500000 bit/s");
    }

    #[test]
    fn test_missing_interface_fails_to_open() {
        let mut source = SocketCanSource::new("emu-missing0", vec![0x600], false);
        assert!(matches!(source.open(), Err(TelemetryError::SourceOpen { .. })));
        assert_eq!(source.next_frame(Duration::from_millis(1)), SourceEvent::Disconnected);
    }
}
