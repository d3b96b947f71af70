//! Raw integer extraction and insertion
//!
//! Reads and writes the raw integer of a [`FieldRule`] with the rule's width,
//! byte order and signedness. Callers check payload length beforehand.

use super::map::{ByteOrder, FieldRule, RuleKind, ValueType, Width};
use crate::types::{FieldValue, Gear};
use byteorder::{BigEndian, ByteOrder as _, LittleEndian};

/// Extract the raw integer a rule describes
///
/// Returns `None` if the payload is too short for the rule.
pub fn read_raw(data: &[u8], rule: &FieldRule) -> Option<i64> {
    let bytes = data.get(rule.offset..rule.end())?;

    let value = match (rule.width, rule.value_type) {
        (Width::One, ValueType::Unsigned) => bytes[0] as i64,
        (Width::One, ValueType::Signed) => bytes[0] as i8 as i64,
        (Width::Two, ValueType::Unsigned) => match rule.byte_order {
            ByteOrder::LittleEndian => LittleEndian::read_u16(bytes) as i64,
            ByteOrder::BigEndian => BigEndian::read_u16(bytes) as i64,
        },
        (Width::Two, ValueType::Signed) => match rule.byte_order {
            ByteOrder::LittleEndian => LittleEndian::read_i16(bytes) as i64,
            ByteOrder::BigEndian => BigEndian::read_i16(bytes) as i64,
        },
        (Width::Four, ValueType::Unsigned) => match rule.byte_order {
            ByteOrder::LittleEndian => LittleEndian::read_u32(bytes) as i64,
            ByteOrder::BigEndian => BigEndian::read_u32(bytes) as i64,
        },
        (Width::Four, ValueType::Signed) => match rule.byte_order {
            ByteOrder::LittleEndian => LittleEndian::read_i32(bytes) as i64,
            ByteOrder::BigEndian => BigEndian::read_i32(bytes) as i64,
        },
    };

    Some(value)
}

/// Convert a raw integer to a field value according to the rule kind
pub fn to_value(rule: &FieldRule, raw: i64) -> FieldValue {
    match rule.kind {
        RuleKind::Linear { scale, offset } => FieldValue::Number(raw as f64 * scale + offset),
        RuleKind::Gear => {
            let gear = Gear::from_raw(raw as u8);
            if let Gear::Unknown(code) = gear {
                log::trace!("{}: unknown gear code 0x{:02X}", rule.field, code);
            }
            FieldValue::Gear(gear)
        }
        RuleKind::Flags => FieldValue::Flags(raw as u16),
    }
}

/// Convert a field value back to the raw integer the rule would read
///
/// Returns `None` when the value kind does not match the rule kind.
pub fn to_raw(rule: &FieldRule, value: &FieldValue) -> Option<i64> {
    match (rule.kind, value) {
        (RuleKind::Linear { scale, offset }, FieldValue::Number(v)) => {
            let raw = ((v - offset) / scale).round();
            if raw.is_finite() {
                Some(raw as i64)
            } else {
                None
            }
        }
        (RuleKind::Gear, FieldValue::Gear(gear)) => Some(gear.to_raw() as i64),
        (RuleKind::Flags, FieldValue::Flags(bits)) => Some(*bits as i64),
        _ => None,
    }
}

/// Inclusive raw range representable by a rule
pub fn raw_range(rule: &FieldRule) -> (i64, i64) {
    let bits = rule.width.bits();
    match rule.value_type {
        ValueType::Unsigned => (0, (1i64 << bits) - 1),
        ValueType::Signed => (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1),
    }
}

/// Write a raw integer into the rule's byte range, saturating to the width
pub fn write_raw(data: &mut [u8], rule: &FieldRule, raw: i64) {
    let (min, max) = raw_range(rule);
    let raw = raw.clamp(min, max);
    let Some(bytes) = data.get_mut(rule.offset..rule.end()) else {
        log::warn!("{} does not fit a {}-byte payload, not written", rule.field, data.len());
        return;
    };

    match rule.width {
        Width::One => bytes[0] = raw as u8,
        Width::Two => match rule.byte_order {
            ByteOrder::LittleEndian => LittleEndian::write_u16(bytes, raw as u16),
            ByteOrder::BigEndian => BigEndian::write_u16(bytes, raw as u16),
        },
        Width::Four => match rule.byte_order {
            ByteOrder::LittleEndian => LittleEndian::write_u32(bytes, raw as u32),
            ByteOrder::BigEndian => BigEndian::write_u32(bytes, raw as u32),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::map::RuleKind;
    use crate::types::Field;

    fn rule(width: Width, value_type: ValueType, byte_order: ByteOrder) -> FieldRule {
        FieldRule {
            field: Field::Rpm,
            offset: 1,
            width,
            byte_order,
            value_type,
            kind: RuleKind::Linear {
                scale: 1.0,
                offset: 0.0,
            },
        }
    }

    #[test]
    fn test_read_little_endian_u16() {
        let data = [0x00, 0xAC, 0x0D, 0x00];
        let value = read_raw(&data, &rule(Width::Two, ValueType::Unsigned, ByteOrder::LittleEndian));
        assert_eq!(value, Some(3500));
    }

    #[test]
    fn test_read_big_endian_u16() {
        let data = [0x00, 0x0D, 0xAC, 0x00];
        let value = read_raw(&data, &rule(Width::Two, ValueType::Unsigned, ByteOrder::BigEndian));
        assert_eq!(value, Some(3500));
    }

    #[test]
    fn test_read_signed_values() {
        let data = [0x00, 0xCE, 0xFF];
        let value = read_raw(&data, &rule(Width::Two, ValueType::Signed, ByteOrder::LittleEndian));
        assert_eq!(value, Some(-50));

        let value = read_raw(&data, &rule(Width::One, ValueType::Signed, ByteOrder::LittleEndian));
        assert_eq!(value, Some(-50));
    }

    #[test]
    fn test_read_four_bytes() {
        let data = [0x00, 0xFF, 0xFF, 0xFF, 0xFF];
        let unsigned = read_raw(&data, &rule(Width::Four, ValueType::Unsigned, ByteOrder::BigEndian));
        assert_eq!(unsigned, Some(0xFFFF_FFFF));
        let signed = read_raw(&data, &rule(Width::Four, ValueType::Signed, ByteOrder::BigEndian));
        assert_eq!(signed, Some(-1));
    }

    #[test]
    fn test_read_short_payload() {
        let data = [0x00, 0x01];
        assert_eq!(read_raw(&data, &rule(Width::Two, ValueType::Unsigned, ByteOrder::LittleEndian)), None);
    }

    #[test]
    fn test_gear_rule_tolerates_unknown_codes() {
        let mut r = rule(Width::One, ValueType::Unsigned, ByteOrder::LittleEndian);
        r.kind = RuleKind::Gear;
        assert_eq!(to_value(&r, 7), FieldValue::Gear(Gear::Reverse));
        assert_eq!(to_value(&r, 9), FieldValue::Gear(Gear::Unknown(9)));
    }

    #[test]
    fn test_linear_value_conversion() {
        let mut r = rule(Width::Two, ValueType::Signed, ByteOrder::LittleEndian);
        r.kind = RuleKind::Linear {
            scale: 0.1,
            offset: 0.0,
        };
        let value = to_value(&r, -50).as_f64().unwrap();
        assert!((value + 5.0).abs() < 1e-9);
        assert_eq!(to_raw(&r, &FieldValue::Number(-5.0)), Some(-50));
        assert_eq!(to_raw(&r, &FieldValue::Flags(3)), None);
    }

    #[test]
    fn test_write_saturates() {
        let mut data = [0u8; 8];
        let r = rule(Width::One, ValueType::Unsigned, ByteOrder::LittleEndian);
        write_raw(&mut data, &r, 300);
        assert_eq!(data[1], 0xFF);
        write_raw(&mut data, &r, -4);
        assert_eq!(data[1], 0x00);
    }

    #[test]
    fn test_write_outside_payload_is_skipped() {
        let mut data = [0u8; 8];
        let mut r = rule(Width::Two, ValueType::Unsigned, ByteOrder::LittleEndian);
        r.offset = 7;
        write_raw(&mut data, &r, 0x1234);
        assert_eq!(data, [0u8; 8]);
    }

    #[test]
    fn test_write_then_read_signed_big_endian() {
        let mut data = [0u8; 8];
        let r = rule(Width::Two, ValueType::Signed, ByteOrder::BigEndian);
        write_raw(&mut data, &r, -1234);
        assert_eq!(read_raw(&data, &r), Some(-1234));
    }
}
