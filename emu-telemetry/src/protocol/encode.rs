//! Frame encoder
//!
//! The inverse of the decoder for a single frame offset. The simulator uses
//! it to emit the same byte layout a live ECU sends, which keeps the mock
//! path and the live path on one decoder.

use super::extract::{to_raw, write_raw};
use super::map::ProtocolMap;
use crate::types::{Field, FieldValue, Frame, Result, TelemetryError, MAX_PAYLOAD};
use std::collections::BTreeMap;
use std::time::Instant;

/// Encodes field values into EMU frames
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    map: ProtocolMap,
    base_id: u32,
    extended: bool,
}

impl FrameEncoder {
    /// Create an encoder for standard identifiers
    pub fn new(map: ProtocolMap, base_id: u32) -> Self {
        Self {
            map,
            base_id,
            extended: false,
        }
    }

    /// Builder method: emit 29-bit identifiers
    pub fn with_extended_ids(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }

    pub fn map(&self) -> &ProtocolMap {
        &self.map
    }

    pub fn base_id(&self) -> u32 {
        self.base_id
    }

    /// Encode the frame at `offset` from whatever values are present
    ///
    /// Fields without a value are left as zero bytes. When a derived field is
    /// given but its source is not, the source is recovered by inverting the
    /// derivation (boost is enough to encode MAP). The payload is always the
    /// full 8 bytes, like the ECU sends.
    pub fn encode(
        &self,
        offset: u32,
        values: &BTreeMap<Field, FieldValue>,
        timestamp: Instant,
    ) -> Result<Frame> {
        let layout = self.map.layout(offset).ok_or_else(|| {
            TelemetryError::InvalidFrame(format!("no layout for frame offset +{}", offset))
        })?;

        let mut inverted: BTreeMap<Field, FieldValue> = BTreeMap::new();
        for derived in &layout.derived {
            if values.contains_key(&derived.source) {
                continue;
            }
            if let Some(target) = values.get(&derived.target).and_then(FieldValue::as_f64) {
                let source = (target - derived.offset) / derived.scale;
                inverted.insert(derived.source, FieldValue::Number(source));
            }
        }

        let mut data = [0u8; MAX_PAYLOAD];
        for rule in &layout.rules {
            let value = values.get(&rule.field).or_else(|| inverted.get(&rule.field));
            let Some(value) = value else {
                continue;
            };
            match to_raw(rule, value) {
                Some(raw) => write_raw(&mut data, rule, raw),
                None => {
                    return Err(TelemetryError::InvalidFrame(format!(
                        "value {} does not fit the {:?} rule of {}",
                        value, rule.kind, rule.field
                    )))
                }
            }
        }

        let id = self.base_id + offset;
        Frame::with_timestamp(id, self.extended, &data, timestamp)
    }

    /// Encode every frame of the map in offset order
    pub fn encode_all(
        &self,
        values: &BTreeMap<Field, FieldValue>,
        timestamp: Instant,
    ) -> Result<Vec<Frame>> {
        self.map
            .frames()
            .map(|(offset, _)| self.encode(offset, values, timestamp))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Gear;

    fn encoder() -> FrameEncoder {
        FrameEncoder::new(ProtocolMap::emu_black(), 0x600)
    }

    #[test]
    fn test_encode_rpm_little_endian() {
        let mut values = BTreeMap::new();
        values.insert(Field::Rpm, FieldValue::Number(3500.0));
        let frame = encoder().encode(0, &values, Instant::now()).unwrap();
        assert_eq!(frame.id(), 0x600);
        assert_eq!(frame.dlc(), 8);
        assert_eq!(&frame.data()[0..2], &[0xAC, 0x0D]);
    }

    #[test]
    fn test_encode_inverts_derived_boost() {
        let mut values = BTreeMap::new();
        values.insert(Field::Boost, FieldValue::Number(0.987));
        let frame = encoder().encode(0, &values, Instant::now()).unwrap();
        // 2.0 bar absolute = 200.0 kPa = raw 2000
        assert_eq!(&frame.data()[4..6], &2000u16.to_le_bytes());
    }

    #[test]
    fn test_encode_gear_and_saturation() {
        let mut values = BTreeMap::new();
        values.insert(Field::Gear, FieldValue::Gear(Gear::Reverse));
        values.insert(Field::BatteryVoltage, FieldValue::Number(99.0));
        let frame = encoder().encode(2, &values, Instant::now()).unwrap();
        assert_eq!(frame.data()[2], Gear::REVERSE_CODE);
        assert_eq!(frame.data()[4], 0xFF);
    }

    #[test]
    fn test_encode_rejects_mismatched_value_kind() {
        let mut values = BTreeMap::new();
        values.insert(Field::Gear, FieldValue::Number(3.0));
        assert!(encoder().encode(2, &values, Instant::now()).is_err());
    }

    #[test]
    fn test_encode_all_produces_every_frame() {
        let frames = encoder()
            .with_extended_ids(true)
            .encode_all(&BTreeMap::new(), Instant::now())
            .unwrap();
        assert_eq!(frames.len(), 8);
        assert_eq!(frames[7].id(), 0x607);
        assert!(frames.iter().all(Frame::is_extended));
    }

    #[test]
    fn test_unknown_offset_is_an_error() {
        assert!(encoder().encode(9, &BTreeMap::new(), Instant::now()).is_err());
    }
}
