use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PaintError;

/// Identifier of a blend operation. Which ops a color space actually
/// implements is decided by that space's op table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompositeOp {
    #[default]
    Over,
    Multiply,
    Screen,
    Divide,
    Overlay,
    Dodge,
    Burn,
    Darken,
    Lighten,
    Hue,
    Saturation,
    Value,
    Color,
    Erase,
    Copy,
}

impl CompositeOp {
    /// All ops, in menu order.
    pub fn all() -> &'static [CompositeOp] {
        &[
            CompositeOp::Over,
            CompositeOp::Multiply,
            CompositeOp::Screen,
            CompositeOp::Divide,
            CompositeOp::Overlay,
            CompositeOp::Dodge,
            CompositeOp::Burn,
            CompositeOp::Darken,
            CompositeOp::Lighten,
            CompositeOp::Hue,
            CompositeOp::Saturation,
            CompositeOp::Value,
            CompositeOp::Color,
            CompositeOp::Erase,
            CompositeOp::Copy,
        ]
    }

    /// Stable lowercase identifier used in settings, CLI flags and records.
    pub fn id(&self) -> &'static str {
        match self {
            CompositeOp::Over => "over",
            CompositeOp::Multiply => "multiply",
            CompositeOp::Screen => "screen",
            CompositeOp::Divide => "divide",
            CompositeOp::Overlay => "overlay",
            CompositeOp::Dodge => "dodge",
            CompositeOp::Burn => "burn",
            CompositeOp::Darken => "darken",
            CompositeOp::Lighten => "lighten",
            CompositeOp::Hue => "hue",
            CompositeOp::Saturation => "saturation",
            CompositeOp::Value => "value",
            CompositeOp::Color => "color",
            CompositeOp::Erase => "erase",
            CompositeOp::Copy => "copy",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CompositeOp::Over => "Normal",
            CompositeOp::Multiply => "Multiply",
            CompositeOp::Screen => "Screen",
            CompositeOp::Divide => "Divide",
            CompositeOp::Overlay => "Overlay",
            CompositeOp::Dodge => "Color Dodge",
            CompositeOp::Burn => "Color Burn",
            CompositeOp::Darken => "Darken",
            CompositeOp::Lighten => "Lighten",
            CompositeOp::Hue => "Hue",
            CompositeOp::Saturation => "Saturation",
            CompositeOp::Value => "Value",
            CompositeOp::Color => "Color",
            CompositeOp::Erase => "Erase",
            CompositeOp::Copy => "Copy",
        }
    }

    /// Look up an op by its [`id`](Self::id). Unknown ids are an error,
    /// never a silent fallback to `Over`.
    pub fn from_id(id: &str) -> Result<Self, PaintError> {
        Self::all()
            .iter()
            .copied()
            .find(|op| op.id().eq_ignore_ascii_case(id))
            .ok_or_else(|| PaintError::UnknownCompositeOp(id.to_string()))
    }

    /// Convert to a stable u8 for binary serialization
    pub fn to_u8(&self) -> u8 {
        match self {
            CompositeOp::Over => 0,
            CompositeOp::Multiply => 1,
            CompositeOp::Screen => 2,
            CompositeOp::Divide => 3,
            CompositeOp::Overlay => 4,
            CompositeOp::Dodge => 5,
            CompositeOp::Burn => 6,
            CompositeOp::Darken => 7,
            CompositeOp::Lighten => 8,
            CompositeOp::Hue => 9,
            CompositeOp::Saturation => 10,
            CompositeOp::Value => 11,
            CompositeOp::Color => 12,
            CompositeOp::Erase => 13,
            CompositeOp::Copy => 14,
        }
    }

    /// Reconstruct from a u8; `None` for values no op was ever assigned.
    pub fn from_u8(v: u8) -> Option<Self> {
        Self::all().iter().copied().find(|op| op.to_u8() == v)
    }
}

impl fmt::Display for CompositeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for CompositeOp {
    type Err = PaintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_id(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_resolve_case_insensitively() {
        assert_eq!(CompositeOp::from_id("multiply").unwrap(), CompositeOp::Multiply);
        assert_eq!("OVER".parse::<CompositeOp>().unwrap(), CompositeOp::Over);
    }

    #[test]
    fn unknown_id_is_an_error() {
        let err = CompositeOp::from_id("hard-light").unwrap_err();
        assert!(matches!(err, PaintError::UnknownCompositeOp(ref s) if s == "hard-light"));
    }

    #[test]
    fn u8_codes_are_unique() {
        for op in CompositeOp::all() {
            assert_eq!(CompositeOp::from_u8(op.to_u8()), Some(*op));
        }
        assert_eq!(CompositeOp::from_u8(200), None);
    }
}
