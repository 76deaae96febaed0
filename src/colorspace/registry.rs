use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ChannelDepth, ColorModel, ColorSpace};
use crate::error::{PaintError, PaintResult};

/// Explicit registry of color spaces, constructed once and passed by
/// reference to whatever needs to resolve a space by id.
#[derive(Clone, Debug, Default)]
pub struct ColorSpaceRegistry {
    spaces: BTreeMap<String, Arc<ColorSpace>>,
}

impl ColorSpaceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in model × depth plus the `ALPHA8`
    /// mask space.
    pub fn with_builtin() -> Self {
        let mut reg = Self::new();
        for model in [ColorModel::Gray, ColorModel::Rgb, ColorModel::Cmyk] {
            for depth in [ChannelDepth::U8, ChannelDepth::U16, ChannelDepth::F32] {
                reg.register(ColorSpace::new(model, depth));
            }
        }
        reg.register(ColorSpace::new(ColorModel::Alpha, ChannelDepth::U8));
        reg
    }

    /// Add (or replace) a space, returning the shared handle.
    pub fn register(&mut self, space: ColorSpace) -> Arc<ColorSpace> {
        let space = Arc::new(space);
        self.spaces.insert(space.id().to_string(), Arc::clone(&space));
        space
    }

    pub fn get(&self, id: &str) -> PaintResult<Arc<ColorSpace>> {
        self.spaces
            .get(id)
            .or_else(|| {
                self.spaces
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(id))
                    .map(|(_, v)| v)
            })
            .cloned()
            .ok_or_else(|| PaintError::UnknownColorSpace(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_ok()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.spaces.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    pub fn rgba8(&self) -> PaintResult<Arc<ColorSpace>> {
        self.get("RGBA8")
    }

    pub fn alpha8(&self) -> PaintResult<Arc<ColorSpace>> {
        self.get("ALPHA8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colorspace::Profile;

    #[test]
    fn builtin_registry_has_ten_spaces() {
        let reg = ColorSpaceRegistry::with_builtin();
        assert_eq!(reg.len(), 10);
        assert!(reg.contains("RGBAF32"));
        assert!(reg.contains("graya16"));
        assert_eq!(reg.rgba8().unwrap().pixel_size(), 4);
    }

    #[test]
    fn unknown_id_errors() {
        let reg = ColorSpaceRegistry::new();
        assert!(matches!(reg.get("LABA8"), Err(PaintError::UnknownColorSpace(_))));
    }

    #[test]
    fn register_replaces_with_profiled_variant() {
        let mut reg = ColorSpaceRegistry::with_builtin();
        let tagged = ColorSpace::new(ColorModel::Rgb, ChannelDepth::U8)
            .with_profile(Profile::new("sRGB", vec![0u8; 8]));
        reg.register(tagged);
        let cs = reg.rgba8().unwrap();
        assert_eq!(cs.profile().map(|p| p.name()), Some("sRGB"));
        assert_eq!(reg.len(), 10);
    }
}
