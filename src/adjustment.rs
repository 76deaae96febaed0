// ============================================================================
// ADJUSTMENTS: per-pixel colour filters (adjustment layers + device filters)
// ============================================================================
//
// Filters run on the canonical RGBA form scaled to 0..255 so one formula
// serves every depth. Alpha is always preserved.
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::color_conv::{hsl_to_rgb, rgb_to_hsl};
use crate::colorspace::{ColorModel, ColorSpace};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Invert all colour channels.
    Invert,
    /// Replace colour with its luma.
    Desaturate,
    /// `brightness`: -255..255, `contrast`: -255..255.
    BrightnessContrast { brightness: f32, contrast: f32 },
    /// `hue_shift`: -180..180 degrees, `saturation` and `lightness`: -100..100.
    HueSaturation {
        hue_shift: f32,
        saturation: f32,
        lightness: f32,
    },
    /// Black or white by luminance against `level` (0..255).
    Threshold { level: f32 },
    /// `levels`: 2..=16
    Posterize { levels: u32 },
}

impl Filter {
    pub fn name(&self) -> &'static str {
        match self {
            Filter::Invert => "Invert",
            Filter::Desaturate => "Desaturate",
            Filter::BrightnessContrast { .. } => "Brightness/Contrast",
            Filter::HueSaturation { .. } => "Hue/Saturation",
            Filter::Threshold { .. } => "Threshold",
            Filter::Posterize { .. } => "Posterize",
        }
    }

    /// Transform one pixel given as (r, g, b, a) in 0..255.
    pub fn transform(&self, r: f32, g: f32, b: f32, a: f32) -> (f32, f32, f32, f32) {
        match *self {
            Filter::Invert => (255.0 - r, 255.0 - g, 255.0 - b, a),
            Filter::Desaturate => {
                let l = 0.299 * r + 0.587 * g + 0.114 * b;
                (l, l, l, a)
            }
            Filter::BrightnessContrast { brightness, contrast } => {
                let contrast = contrast.clamp(-255.0, 255.0);
                let factor = (259.0 * (contrast + 255.0)) / (255.0 * (259.0 - contrast));
                let f = |v: f32| factor * (v + brightness - 128.0) + 128.0;
                (f(r), f(g), f(b), a)
            }
            Filter::HueSaturation { hue_shift, saturation, lightness } => {
                let sat_factor = 1.0 + saturation / 100.0;
                let light_offset = lightness * 255.0 / 100.0;
                let (h, s, l) = rgb_to_hsl(r / 255.0, g / 255.0, b / 255.0);
                let nh = (h + hue_shift / 360.0).rem_euclid(1.0);
                let ns = (s * sat_factor).clamp(0.0, 1.0);
                let (nr, ng, nb) = hsl_to_rgb(nh, ns, l);
                (
                    nr * 255.0 + light_offset,
                    ng * 255.0 + light_offset,
                    nb * 255.0 + light_offset,
                    a,
                )
            }
            Filter::Threshold { level } => {
                let lum = 0.2126 * r + 0.7152 * g + 0.0722 * b;
                let v = if lum >= level { 255.0 } else { 0.0 };
                (v, v, v, a)
            }
            Filter::Posterize { levels } => {
                let factor = levels.clamp(2, 16) as f32;
                let p = |v: f32| (v / 255.0 * (factor - 1.0)).round() / (factor - 1.0) * 255.0;
                (p(r), p(g), p(b), a)
            }
        }
    }

    /// Apply in place to `count` pixels encoded in `cs`. Mask spaces carry
    /// no colour and are left alone.
    pub fn apply_pixels(&self, cs: &ColorSpace, pixels: &mut [u8], count: usize) {
        if cs.model() == ColorModel::Alpha || count == 0 {
            return;
        }
        let mut rgba = vec![0.0f32; count * 4];
        cs.to_rgba_f32(pixels, &mut rgba, count);
        for px in rgba.chunks_exact_mut(4) {
            let (r, g, b, a) =
                self.transform(px[0] * 255.0, px[1] * 255.0, px[2] * 255.0, px[3] * 255.0);
            px[0] = (r / 255.0).clamp(0.0, 1.0);
            px[1] = (g / 255.0).clamp(0.0, 1.0);
            px[2] = (b / 255.0).clamp(0.0, 1.0);
            px[3] = (a / 255.0).clamp(0.0, 1.0);
        }
        cs.from_rgba_f32(&rgba, pixels, count);
    }
}
