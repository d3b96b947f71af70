//! EMU Black wire protocol
//!
//! - `map`: decode rules per base-relative frame offset
//! - `extract`: raw integer reads/writes with byteorder
//! - `encode`: field values back to frames

pub mod encode;
pub mod extract;
pub mod map;

pub use encode::FrameEncoder;
pub use map::{
    ByteOrder, DerivedRule, FieldRule, FrameLayout, ProtocolMap, ProtocolMapBuilder, RuleKind,
    ValueType, Width, AFR_STOICH, ATMOSPHERE_BAR, EMU_DEFAULT_BASE_ID, EMU_FRAME_COUNT,
};
