//! EMU Black protocol map
//!
//! A static table of decode rules keyed by identifier offset from the
//! configured base ID. The map is built once at startup and validated so that
//! every rule fits in a classic CAN payload and no two rules of one frame
//! share a byte.

use crate::types::{Field, Result, TelemetryError, MAX_PAYLOAD};
use std::collections::BTreeMap;

/// Number of frames the EMU Black streams (base+0 .. base+7)
pub const EMU_FRAME_COUNT: u32 = 8;

/// Default stream base identifier
pub const EMU_DEFAULT_BASE_ID: u32 = 0x600;

/// Standard atmosphere in bar, used to derive boost from MAP
pub const ATMOSPHERE_BAR: f64 = 1.013;

/// Stoichiometric AFR for gasoline
pub const AFR_STOICH: f64 = 14.7;

/// Byte order for multi-byte fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format) - the EMU Black native order
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for raw integer interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Signed,
    Unsigned,
}

/// Field width in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    One,
    Two,
    Four,
}

impl Width {
    pub fn bytes(&self) -> usize {
        match self {
            Width::One => 1,
            Width::Two => 2,
            Width::Four => 4,
        }
    }

    pub fn bits(&self) -> u32 {
        self.bytes() as u32 * 8
    }
}

/// How the raw integer becomes a field value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RuleKind {
    /// `physical = raw * scale + offset`
    Linear { scale: f64, offset: f64 },
    /// Enumerated gear code
    Gear,
    /// Bitfield passed through unchanged
    Flags,
}

/// Decode rule for a single field within a frame
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    pub field: Field,
    /// Byte offset within the payload
    pub offset: usize,
    pub width: Width,
    pub byte_order: ByteOrder,
    pub value_type: ValueType,
    pub kind: RuleKind,
}

impl FieldRule {
    /// Create a linearly scaled rule
    pub fn linear(
        field: Field,
        offset: usize,
        width: Width,
        value_type: ValueType,
        scale: f64,
        value_offset: f64,
    ) -> Result<Self> {
        Self::checked(FieldRule {
            field,
            offset,
            width,
            byte_order: ByteOrder::LittleEndian,
            value_type,
            kind: RuleKind::Linear {
                scale,
                offset: value_offset,
            },
        })
    }

    /// Create an enumerated gear rule (one unsigned byte)
    pub fn gear(field: Field, offset: usize) -> Result<Self> {
        Self::checked(FieldRule {
            field,
            offset,
            width: Width::One,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            kind: RuleKind::Gear,
        })
    }

    /// Create a bitfield rule
    pub fn flags(field: Field, offset: usize, width: Width) -> Result<Self> {
        Self::checked(FieldRule {
            field,
            offset,
            width,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            kind: RuleKind::Flags,
        })
    }

    /// Builder method: change byte order
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Exclusive end of the byte range this rule reads
    pub fn end(&self) -> usize {
        self.offset + self.width.bytes()
    }

    /// Check the rule fits the payload and its conversion is usable
    pub fn validate(&self) -> Result<()> {
        if self.end() > MAX_PAYLOAD {
            return Err(TelemetryError::InvalidProtocolMap(format!(
                "rule for {} reads bytes {}..{} beyond the {}-byte payload",
                self.field,
                self.offset,
                self.end(),
                MAX_PAYLOAD
            )));
        }
        match self.kind {
            RuleKind::Linear { scale, offset } => check_linear(self.field, scale, offset),
            RuleKind::Gear if self.width != Width::One => Err(TelemetryError::InvalidProtocolMap(format!(
                "gear rule for {} must be one byte",
                self.field
            ))),
            RuleKind::Flags if self.width == Width::Four => Err(TelemetryError::InvalidProtocolMap(format!(
                "flag rule for {} cannot be wider than 16 bits",
                self.field
            ))),
            _ => Ok(()),
        }
    }

    fn checked(rule: FieldRule) -> Result<Self> {
        rule.validate()?;
        Ok(rule)
    }

    fn overlaps(&self, other: &FieldRule) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// A field computed from another field of the same frame
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedRule {
    pub target: Field,
    pub source: Field,
    pub scale: f64,
    pub offset: f64,
}

impl DerivedRule {
    pub fn validate(&self) -> Result<()> {
        check_linear(self.target, self.scale, self.offset)
    }
}

fn check_linear(field: Field, scale: f64, offset: f64) -> Result<()> {
    if scale == 0.0 || !scale.is_finite() || !offset.is_finite() {
        return Err(TelemetryError::InvalidProtocolMap(format!(
            "rule for {} has unusable scale {} / offset {}",
            field, scale, offset
        )));
    }
    Ok(())
}

/// All rules for one base-relative frame offset
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameLayout {
    pub rules: Vec<FieldRule>,
    pub derived: Vec<DerivedRule>,
}

impl FrameLayout {
    /// Minimum payload length every rule of this frame needs
    pub fn required_len(&self) -> usize {
        self.rules.iter().map(FieldRule::end).max().unwrap_or(0)
    }
}

/// Mapping from base-relative identifier offset to frame layout
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMap {
    frames: BTreeMap<u32, FrameLayout>,
}

impl ProtocolMap {
    /// Start building a custom map
    pub fn builder() -> ProtocolMapBuilder {
        ProtocolMapBuilder::default()
    }

    /// The EMU Black CAN stream layout (8 little-endian frames)
    pub fn emu_black() -> Self {
        ProtocolMap {
            frames: emu_black_layouts(),
        }
    }

    /// Layout for a base-relative offset
    pub fn layout(&self, offset: u32) -> Option<&FrameLayout> {
        self.frames.get(&offset)
    }

    /// Iterate over (offset, layout) pairs in offset order
    pub fn frames(&self) -> impl Iterator<Item = (u32, &FrameLayout)> {
        self.frames.iter().map(|(offset, layout)| (*offset, layout))
    }

    /// Highest offset present in the map
    pub fn max_offset(&self) -> u32 {
        self.frames.keys().next_back().copied().unwrap_or(0)
    }

    /// Number of frame offsets
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Find the offset and rule that decode a field
    pub fn rule_for(&self, field: Field) -> Option<(u32, &FieldRule)> {
        self.frames.iter().find_map(|(offset, layout)| {
            layout
                .rules
                .iter()
                .find(|rule| rule.field == field)
                .map(|rule| (*offset, rule))
        })
    }
}

impl Default for ProtocolMap {
    fn default() -> Self {
        Self::emu_black()
    }
}

fn le(field: Field, offset: usize, width: Width, value_type: ValueType, kind: RuleKind) -> FieldRule {
    FieldRule {
        field,
        offset,
        width,
        byte_order: ByteOrder::LittleEndian,
        value_type,
        kind,
    }
}

fn scaled(scale: f64, offset: f64) -> RuleKind {
    RuleKind::Linear { scale, offset }
}

fn derived(target: Field, source: Field, scale: f64, offset: f64) -> DerivedRule {
    DerivedRule {
        target,
        source,
        scale,
        offset,
    }
}

/// Frame layouts of the EMU Black stream, checked by `test_emu_black_map_is_valid`
fn emu_black_layouts() -> BTreeMap<u32, FrameLayout> {
    use Field::*;
    use ValueType::{Signed, Unsigned};
    use Width::{One, Two};

    let mut frames = BTreeMap::new();

    // Frame 0: RPM, TPS, IAT, MAP
    frames.insert(
        0,
        FrameLayout {
            rules: vec![
                le(Rpm, 0, Two, Unsigned, scaled(1.0, 0.0)),
                le(ThrottlePosition, 2, One, Unsigned, scaled(0.5, 0.0)),
                le(IntakeTemp, 3, One, Signed, scaled(1.0, 0.0)),
                le(ManifoldPressure, 4, Two, Unsigned, scaled(0.1, 0.0)),
            ],
            derived: vec![derived(Boost, ManifoldPressure, 0.01, -ATMOSPHERE_BAR)],
        },
    );

    // Frame 1: injector PW, lambda target, lambda, fuel pressure
    frames.insert(
        1,
        FrameLayout {
            rules: vec![
                le(InjectorPulseWidth, 0, Two, Unsigned, scaled(0.01, 0.0)),
                le(LambdaTarget, 2, One, Unsigned, scaled(0.01, 0.5)),
                le(Lambda, 4, Two, Unsigned, scaled(0.0001, 0.0)),
                le(FuelPressure, 6, Two, Unsigned, scaled(0.01, 0.0)),
            ],
            derived: vec![derived(Afr, Lambda, AFR_STOICH, 0.0)],
        },
    );

    // Frame 2: speed, gear, ignition angle, battery
    frames.insert(
        2,
        FrameLayout {
            rules: vec![
                le(VehicleSpeed, 0, Two, Unsigned, scaled(0.1, 0.0)),
                le(Gear, 2, One, Unsigned, RuleKind::Gear),
                le(IgnitionAngle, 3, One, Signed, scaled(1.0, 0.0)),
                le(BatteryVoltage, 4, One, Unsigned, scaled(0.1, 0.0)),
            ],
            derived: Vec::new(),
        },
    );

    // Frame 3: temperatures
    frames.insert(
        3,
        FrameLayout {
            rules: vec![
                le(CoolantTemp, 0, Two, Signed, scaled(0.1, 0.0)),
                le(OilTemp, 2, Two, Signed, scaled(0.1, 0.0)),
            ],
            derived: Vec::new(),
        },
    );

    // Frame 4: oil pressure, EGTs
    frames.insert(
        4,
        FrameLayout {
            rules: vec![
                le(OilPressure, 0, Two, Unsigned, scaled(0.01, 0.0)),
                le(Egt1, 2, Two, Unsigned, scaled(1.0, 0.0)),
                le(Egt2, 4, Two, Unsigned, scaled(1.0, 0.0)),
            ],
            derived: Vec::new(),
        },
    );

    // Frame 5: status bitfields
    frames.insert(
        5,
        FrameLayout {
            rules: vec![
                le(EngineFlags, 0, One, Unsigned, RuleKind::Flags),
                le(WarningFlags, 1, Two, Unsigned, RuleKind::Flags),
            ],
            derived: Vec::new(),
        },
    );

    // Frame 6: drive-by-wire position
    frames.insert(
        6,
        FrameLayout {
            rules: vec![le(DbwPosition, 0, One, Unsigned, scaled(0.5, 0.0))],
            derived: Vec::new(),
        },
    );

    // Frame 7: user-defined in the ECU software, nothing to decode
    frames.insert(7, FrameLayout::default());

    frames
}

/// Builder that validates map invariants on [`ProtocolMapBuilder::build`]
#[derive(Debug, Default)]
pub struct ProtocolMapBuilder {
    frames: BTreeMap<u32, FrameLayout>,
}

impl ProtocolMapBuilder {
    /// Add rules for a frame offset (appends when called twice)
    pub fn frame(mut self, offset: u32, rules: Vec<FieldRule>) -> Self {
        self.frames.entry(offset).or_default().rules.extend(rules);
        self
    }

    /// Add a derived field to a frame offset
    pub fn derive(mut self, offset: u32, target: Field, source: Field, scale: f64, value_offset: f64) -> Self {
        self.frames.entry(offset).or_default().derived.push(DerivedRule {
            target,
            source,
            scale,
            offset: value_offset,
        });
        self
    }

    /// Validate and produce the map
    pub fn build(self) -> Result<ProtocolMap> {
        let mut targeted: BTreeMap<Field, u32> = BTreeMap::new();

        for (offset, layout) in &self.frames {
            for (i, rule) in layout.rules.iter().enumerate() {
                rule.validate()?;
                if rule.field.is_computed() {
                    return Err(TelemetryError::InvalidProtocolMap(format!(
                        "{} is computed from other fields and cannot be decoded",
                        rule.field
                    )));
                }
                if let Some(other) = layout.rules[i + 1..].iter().find(|r| r.overlaps(rule)) {
                    return Err(TelemetryError::InvalidProtocolMap(format!(
                        "frame +{}: {} (bytes {}..{}) overlaps {} (bytes {}..{})",
                        offset,
                        rule.field,
                        rule.offset,
                        rule.end(),
                        other.field,
                        other.offset,
                        other.end()
                    )));
                }
                if let Some(previous) = targeted.insert(rule.field, *offset) {
                    return Err(TelemetryError::InvalidProtocolMap(format!(
                        "{} is decoded by both frame +{} and frame +{}",
                        rule.field, previous, offset
                    )));
                }
            }

            for derived in &layout.derived {
                derived.validate()?;
                if derived.target.is_computed() {
                    return Err(TelemetryError::InvalidProtocolMap(format!(
                        "{} is computed from other fields and cannot be derived per frame",
                        derived.target
                    )));
                }
                let source_rule = layout.rules.iter().find(|r| r.field == derived.source);
                match source_rule {
                    Some(rule) if matches!(rule.kind, RuleKind::Linear { .. }) => {}
                    _ => {
                        return Err(TelemetryError::InvalidProtocolMap(format!(
                            "derived {} needs numeric {} decoded in frame +{}",
                            derived.target, derived.source, offset
                        )))
                    }
                }
                if let Some(previous) = targeted.insert(derived.target, *offset) {
                    return Err(TelemetryError::InvalidProtocolMap(format!(
                        "{} is produced by both frame +{} and frame +{}",
                        derived.target, previous, offset
                    )));
                }
            }
        }

        log::debug!(
            "Protocol map built: {} frames, {} fields",
            self.frames.len(),
            targeted.len()
        );

        Ok(ProtocolMap {
            frames: self.frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emu_black_map_is_valid() {
        let builder = ProtocolMapBuilder {
            frames: emu_black_layouts(),
        };
        let map = builder.build().unwrap();
        assert_eq!(map, ProtocolMap::emu_black());
        for (_, layout) in map.frames() {
            assert!(layout.required_len() <= MAX_PAYLOAD);
        }
    }

    #[test]
    fn test_emu_black_map_layout() {
        let map = ProtocolMap::emu_black();
        assert_eq!(map.frame_count(), EMU_FRAME_COUNT as usize);
        assert_eq!(map.max_offset(), 7);
        assert!(map.layout(7).unwrap().rules.is_empty());

        let (offset, rule) = map.rule_for(Field::CoolantTemp).unwrap();
        assert_eq!(offset, 3);
        assert_eq!(rule.value_type, ValueType::Signed);
        assert_eq!(rule.width, Width::Two);
    }

    #[test]
    fn test_every_field_is_produced_once() {
        let map = ProtocolMap::emu_black();
        for field in Field::ALL.into_iter().filter(|f| !f.is_computed()) {
            let decoded = map.rule_for(field).is_some();
            let derived = map
                .frames()
                .any(|(_, layout)| layout.derived.iter().any(|d| d.target == field));
            assert!(decoded ^ derived, "{} must be produced exactly once", field);
        }
    }

    #[test]
    fn test_rule_beyond_payload_is_rejected() {
        let result = FieldRule::linear(Field::Rpm, 7, Width::Two, ValueType::Unsigned, 1.0, 0.0);
        assert!(matches!(result, Err(TelemetryError::InvalidProtocolMap(_))));
    }

    #[test]
    fn test_overlapping_rules_are_rejected() {
        let result = ProtocolMap::builder()
            .frame(
                0,
                vec![
                    FieldRule::linear(Field::Rpm, 0, Width::Two, ValueType::Unsigned, 1.0, 0.0).unwrap(),
                    FieldRule::linear(Field::ThrottlePosition, 1, Width::One, ValueType::Unsigned, 0.5, 0.0)
                        .unwrap(),
                ],
            )
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_field_is_rejected() {
        let result = ProtocolMap::builder()
            .frame(0, vec![FieldRule::gear(Field::Gear, 0).unwrap()])
            .frame(1, vec![FieldRule::gear(Field::Gear, 0).unwrap()])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_derived_field_needs_source_in_same_frame() {
        let result = ProtocolMap::builder()
            .frame(
                0,
                vec![FieldRule::linear(Field::Lambda, 0, Width::Two, ValueType::Unsigned, 0.0001, 0.0).unwrap()],
            )
            .derive(1, Field::Afr, Field::Lambda, AFR_STOICH, 0.0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rechecks_hand_built_rules() {
        let past_end = FieldRule {
            field: Field::Rpm,
            offset: 7,
            width: Width::Two,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            kind: RuleKind::Linear { scale: 1.0, offset: 0.0 },
        };
        let result = ProtocolMap::builder().frame(0, vec![past_end]).build();
        assert!(matches!(result, Err(TelemetryError::InvalidProtocolMap(_))));

        let wide_gear = FieldRule {
            width: Width::Two,
            ..FieldRule::gear(Field::Gear, 0).unwrap()
        };
        assert!(ProtocolMap::builder().frame(2, vec![wide_gear]).build().is_err());
    }

    #[test]
    fn test_computed_field_cannot_be_decoded() {
        let rule = FieldRule::linear(Field::InjectorDuty, 0, Width::One, ValueType::Unsigned, 0.5, 0.0).unwrap();
        assert!(ProtocolMap::builder().frame(1, vec![rule]).build().is_err());
    }

    #[test]
    fn test_derived_rule_needs_usable_scale() {
        let lambda = FieldRule::linear(Field::Lambda, 0, Width::Two, ValueType::Unsigned, 0.0001, 0.0).unwrap();
        for (scale, offset) in [(0.0, 0.0), (f64::NAN, 0.0), (AFR_STOICH, f64::INFINITY)] {
            let result = ProtocolMap::builder()
                .frame(1, vec![lambda.clone()])
                .derive(1, Field::Afr, Field::Lambda, scale, offset)
                .build();
            assert!(matches!(result, Err(TelemetryError::InvalidProtocolMap(_))), "{} / {}", scale, offset);
        }
    }

    #[test]
    fn test_zero_scale_is_rejected() {
        assert!(FieldRule::linear(Field::Rpm, 0, Width::Two, ValueType::Unsigned, 0.0, 0.0).is_err());
    }
}
