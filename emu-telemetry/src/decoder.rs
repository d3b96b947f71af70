//! Frame decoder
//!
//! The decoder applies the protocol map to one frame at a time. It is pure:
//! it only turns a frame into field updates and never touches telemetry
//! state, so the acquisition loop decides what to do with errors.

use crate::protocol::extract::{read_raw, to_value};
use crate::protocol::map::{ProtocolMap, EMU_DEFAULT_BASE_ID};
use crate::types::{
    DecodeError, Field, FieldUpdate, FieldValue, Frame, Result, TelemetryError, MAX_EXTENDED_ID,
    MAX_STANDARD_ID,
};

/// Decodes EMU Black frames into field updates
#[derive(Debug, Clone)]
pub struct Decoder {
    map: ProtocolMap,
    base_id: u32,
    extended: bool,
}

impl Decoder {
    /// Create a decoder for 11-bit identifiers starting at `base_id`
    ///
    /// Fails if the highest frame of the map would not fit the identifier range.
    pub fn new(map: ProtocolMap, base_id: u32) -> Result<Self> {
        Self::with_id_kind(map, base_id, false)
    }

    /// Create a decoder for 11-bit or 29-bit identifiers
    pub fn with_id_kind(map: ProtocolMap, base_id: u32, extended: bool) -> Result<Self> {
        let max_id = if extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID };
        let last = base_id.checked_add(map.max_offset());
        match last {
            Some(last) if last <= max_id => {}
            _ => {
                return Err(TelemetryError::InvalidBaseId {
                    base_id,
                    reason: format!(
                        "base + {} exceeds the {}-bit identifier range",
                        map.max_offset(),
                        if extended { 29 } else { 11 }
                    ),
                })
            }
        }

        log::debug!(
            "Decoder ready: base 0x{:X}, {} frames, {} identifiers",
            base_id,
            map.frame_count(),
            if extended { "extended" } else { "standard" }
        );

        Ok(Self {
            map,
            base_id,
            extended,
        })
    }

    pub fn base_id(&self) -> u32 {
        self.base_id
    }

    pub fn map(&self) -> &ProtocolMap {
        &self.map
    }

    /// Identifiers this decoder understands, in ascending order
    pub fn identifiers(&self) -> Vec<u32> {
        self.map
            .frames()
            .map(|(offset, _)| self.base_id + offset)
            .collect()
    }

    /// Decode one frame
    ///
    /// A frame may update several fields; derived fields follow the decoded
    /// ones. A payload shorter than any rule needs rejects the whole frame.
    pub fn decode(&self, frame: &Frame) -> std::result::Result<Vec<FieldUpdate>, DecodeError> {
        let id = frame.id();
        if frame.is_extended() != self.extended {
            return Err(DecodeError::UnknownIdentifier(id));
        }

        let layout = id
            .checked_sub(self.base_id)
            .and_then(|offset| self.map.layout(offset))
            .ok_or(DecodeError::UnknownIdentifier(id))?;

        let needed = layout.required_len();
        if frame.dlc() < needed {
            return Err(DecodeError::Truncated {
                id,
                needed,
                available: frame.dlc(),
            });
        }

        let timestamp = frame.timestamp();
        let mut updates = Vec::with_capacity(layout.rules.len() + layout.derived.len());

        for rule in &layout.rules {
            let raw = read_raw(frame.data(), rule).ok_or(DecodeError::Truncated {
                id,
                needed,
                available: frame.dlc(),
            })?;
            updates.push(FieldUpdate {
                field: rule.field,
                value: to_value(rule, raw),
                timestamp,
            });
        }

        for derived in &layout.derived {
            let source = updates
                .iter()
                .find(|u| u.field == derived.source)
                .and_then(|u| u.value.as_f64());
            if let Some(source) = source {
                updates.push(FieldUpdate {
                    field: derived.target,
                    value: FieldValue::Number(source * derived.scale + derived.offset),
                    timestamp,
                });
            }
        }

        log::trace!("Decoded 0x{:X}: {} updates", id, updates.len());
        Ok(updates)
    }

    /// Convenience: decode and return the value of one field, if present
    pub fn decode_field(&self, frame: &Frame, field: Field) -> Option<FieldValue> {
        self.decode(frame)
            .ok()?
            .into_iter()
            .find(|u| u.field == field)
            .map(|u| u.value)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            map: ProtocolMap::emu_black(),
            base_id: EMU_DEFAULT_BASE_ID,
            extended: false,
        }
    }
}
