//! Channel depth abstraction. Every pixel operation is written once over
//! [`Channel`] and monomorphized for `u8`, `u16` and `f32`.

use bytemuck::Pod;

/// A single channel value as stored in pixel bytes (native endian).
pub trait Channel: Pod + PartialOrd + Send + Sync + 'static {
    const SIZE: usize = std::mem::size_of::<Self>();

    /// Smallest meaningful step in unit range; keeps divisions finite.
    const EPSILON: f32;

    /// Value in `0.0..=1.0` (floats may exceed the range).
    fn to_unit(self) -> f32;

    /// Inverse of [`Channel::to_unit`]. Integer depths round and clamp.
    fn from_unit(v: f32) -> Self;

    fn is_transparent(self) -> bool;

    fn is_opaque(self) -> bool;

    #[inline]
    fn read(bytes: &[u8], offset: usize) -> Self {
        bytemuck::pod_read_unaligned(&bytes[offset..offset + Self::SIZE])
    }

    #[inline]
    fn write(self, bytes: &mut [u8], offset: usize) {
        bytes[offset..offset + Self::SIZE].copy_from_slice(bytemuck::bytes_of(&self));
    }
}

impl Channel for u8 {
    const EPSILON: f32 = 1.0 / 255.0;

    #[inline]
    fn to_unit(self) -> f32 {
        self as f32 / 255.0
    }

    #[inline]
    fn from_unit(v: f32) -> Self {
        (v * 255.0).round().clamp(0.0, 255.0) as u8
    }

    #[inline]
    fn is_transparent(self) -> bool {
        self == 0
    }

    #[inline]
    fn is_opaque(self) -> bool {
        self == u8::MAX
    }
}

impl Channel for u16 {
    const EPSILON: f32 = 1.0 / 65535.0;

    #[inline]
    fn to_unit(self) -> f32 {
        self as f32 / 65535.0
    }

    #[inline]
    fn from_unit(v: f32) -> Self {
        (v * 65535.0).round().clamp(0.0, 65535.0) as u16
    }

    #[inline]
    fn is_transparent(self) -> bool {
        self == 0
    }

    #[inline]
    fn is_opaque(self) -> bool {
        self == u16::MAX
    }
}

/// Thresholds for float alpha: anything within this of 0 or 1 snaps.
pub const F32_ALPHA_EPSILON: f32 = 1e-6;

impl Channel for f32 {
    const EPSILON: f32 = F32_ALPHA_EPSILON;

    #[inline]
    fn to_unit(self) -> f32 {
        self
    }

    #[inline]
    fn from_unit(v: f32) -> Self {
        v
    }

    #[inline]
    fn is_transparent(self) -> bool {
        self < F32_ALPHA_EPSILON
    }

    #[inline]
    fn is_opaque(self) -> bool {
        self > 1.0 - F32_ALPHA_EPSILON
    }
}

/// 8-bit mask or opacity value as a unit factor.
#[inline]
pub fn unit8(v: u8) -> f32 {
    v as f32 / 255.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_depths_round_and_clamp() {
        assert_eq!(u8::from_unit(0.5), 128);
        assert_eq!(u8::from_unit(1.7), 255);
        assert_eq!(u8::from_unit(-0.2), 0);
        assert_eq!(u16::from_unit(1.0), u16::MAX);
        assert_eq!(u16::from_unit(128.0 / 255.0), 32896);
    }

    #[test]
    fn read_write_unaligned() {
        let mut bytes = [0u8; 7];
        0.25f32.write(&mut bytes, 3);
        assert_eq!(f32::read(&bytes, 3), 0.25);
        513u16.write(&mut bytes, 1);
        assert_eq!(u16::read(&bytes, 1), 513);
    }

    #[test]
    fn float_alpha_thresholds() {
        assert!(1e-7f32.is_transparent());
        assert!(!0.001f32.is_transparent());
        assert!((1.0f32 - 1e-7).is_opaque());
    }
}
