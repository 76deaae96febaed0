//! Color-management seam. Profile parsing lives in an external CMS; this
//! module only carries profile handles and the transform interface the
//! display conversion calls into.

use std::fmt;
use std::sync::Arc;

use super::ColorSpace;

/// Opaque ICC profile handle.
#[derive(Clone, PartialEq, Eq)]
pub struct Profile {
    name: String,
    data: Arc<[u8]>,
}

impl Profile {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("name", &self.name)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Transform applied to display-ready 8-bit RGBA pixels.
pub trait DisplayTransform: Send + Sync {
    fn transform_rgba8(&self, pixels: &mut [u8]);
}

/// Provider of profile-to-profile transforms (an external CMS).
pub trait ColorManagement: Send + Sync {
    /// Transform taking `space` (tagged with `src`, if any) to `dst` for
    /// display. `None` when no conversion is needed or possible.
    fn display_transform(
        &self,
        space: &ColorSpace,
        src: Option<&Profile>,
        dst: &Profile,
    ) -> Option<Box<dyn DisplayTransform>>;
}

/// Simple display gamma correction via a 256-entry lookup table.
pub struct GammaTransform {
    lut: [u8; 256],
}

impl GammaTransform {
    pub fn new(gamma: f32) -> Self {
        let gamma = if gamma.is_finite() && gamma > 0.0 { gamma } else { 1.0 };
        let mut lut = [0u8; 256];
        for (i, slot) in lut.iter_mut().enumerate() {
            let v = (i as f32 / 255.0).powf(1.0 / gamma);
            *slot = (v * 255.0).round().clamp(0.0, 255.0) as u8;
        }
        Self { lut }
    }
}

impl DisplayTransform for GammaTransform {
    fn transform_rgba8(&self, pixels: &mut [u8]) {
        for px in pixels.chunks_exact_mut(4) {
            px[0] = self.lut[px[0] as usize];
            px[1] = self.lut[px[1] as usize];
            px[2] = self.lut[px[2] as usize];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_gamma_is_identity() {
        let t = GammaTransform::new(1.0);
        let mut px = [0u8, 64, 200, 77];
        t.transform_rgba8(&mut px);
        assert_eq!(px, [0, 64, 200, 77]);
    }

    #[test]
    fn gamma_leaves_alpha_alone() {
        let t = GammaTransform::new(2.2);
        let mut px = [64u8, 64, 64, 10];
        t.transform_rgba8(&mut px);
        assert!(px[0] > 64);
        assert_eq!(px[3], 10);
    }
}
