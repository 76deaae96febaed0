// ============================================================================
// COLOR SPACES: pixel encodings and their composite-op tables
// ============================================================================
//
// A color space fixes channel order (colour channels first, alpha last),
// channel depth and the set of blend kernels that understand that layout.
// Conversions go through a canonical unit-float RGBA form.
// ============================================================================

pub mod channel;
pub mod ops;
pub mod profile;
pub mod registry;

use std::collections::HashMap;
use std::fmt;

use channel::Channel;
pub use ops::{BlendFn, CompositeArgs};
pub use profile::{ColorManagement, DisplayTransform, GammaTransform, Profile};
pub use registry::ColorSpaceRegistry;

use crate::color_conv::{cmyk_to_rgb, luminance, rgb_to_cmyk};
use crate::composite_op::CompositeOp;
use crate::error::{PaintError, PaintResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColorModel {
    Gray,
    Rgb,
    Cmyk,
    /// Single alpha channel; used for masks.
    Alpha,
}

impl ColorModel {
    fn color_channel_names(&self) -> &'static [&'static str] {
        match self {
            ColorModel::Gray => &["Gray"],
            ColorModel::Rgb => &["Red", "Green", "Blue"],
            ColorModel::Cmyk => &["Cyan", "Magenta", "Yellow", "Black"],
            ColorModel::Alpha => &[],
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            ColorModel::Gray => "GRAYA",
            ColorModel::Rgb => "RGBA",
            ColorModel::Cmyk => "CMYKA",
            ColorModel::Alpha => "ALPHA",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelDepth {
    U8,
    U16,
    F32,
}

impl ChannelDepth {
    pub fn size(&self) -> usize {
        match self {
            ChannelDepth::U8 => 1,
            ChannelDepth::U16 => 2,
            ChannelDepth::F32 => 4,
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            ChannelDepth::U8 => "8",
            ChannelDepth::U16 => "16",
            ChannelDepth::F32 => "F32",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Color,
    Alpha,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: &'static str,
    pub offset: usize,
    pub size: usize,
    pub kind: ChannelKind,
}

/// Byte layout handed to blend kernels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelLayout {
    pub model: ColorModel,
    pub pixel_size: usize,
    pub channel_size: usize,
    pub color_channels: usize,
    pub alpha_offset: Option<usize>,
}

/// Run `$body` with `$T` bound to the channel type of `$depth`.
macro_rules! with_channel {
    ($depth:expr, $T:ident => $body:expr) => {
        match $depth {
            ChannelDepth::U8 => {
                type $T = u8;
                $body
            }
            ChannelDepth::U16 => {
                type $T = u16;
                $body
            }
            ChannelDepth::F32 => {
                type $T = f32;
                $body
            }
        }
    };
}

/// A blend kernel bound to the layout it was registered for.
#[derive(Clone, Copy)]
pub struct BlendOp<'a> {
    op: CompositeOp,
    layout: &'a PixelLayout,
    func: BlendFn,
}

impl BlendOp<'_> {
    pub fn op(&self) -> CompositeOp {
        self.op
    }

    /// Blend `args.src` into `args.dst`.
    pub fn apply(&self, args: &mut CompositeArgs<'_>) -> PaintResult<()> {
        args.validate(self.layout.pixel_size)?;
        if args.rows == 0 || args.cols == 0 {
            return Ok(());
        }
        (self.func)(self.layout, args);
        Ok(())
    }
}

#[derive(Clone)]
pub struct ColorSpace {
    id: String,
    model: ColorModel,
    depth: ChannelDepth,
    channels: Vec<ChannelInfo>,
    layout: PixelLayout,
    ops: HashMap<CompositeOp, BlendFn>,
    profile: Option<Profile>,
}

impl fmt::Debug for ColorSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColorSpace")
            .field("id", &self.id)
            .field("pixel_size", &self.layout.pixel_size)
            .field("profile", &self.profile)
            .finish()
    }
}

impl ColorSpace {
    /// Build a space from its model and depth. Ids follow the
    /// `RGBA8` / `GRAYA16` / `CMYKAF32` / `ALPHA8` scheme.
    pub fn new(model: ColorModel, depth: ChannelDepth) -> Self {
        let size = depth.size();
        let mut channels: Vec<ChannelInfo> = model
            .color_channel_names()
            .iter()
            .enumerate()
            .map(|(i, &name)| ChannelInfo {
                name,
                offset: i * size,
                size,
                kind: ChannelKind::Color,
            })
            .collect();
        let color_channels = channels.len();
        channels.push(ChannelInfo {
            name: "Alpha",
            offset: color_channels * size,
            size,
            kind: ChannelKind::Alpha,
        });

        let layout = PixelLayout {
            model,
            pixel_size: channels.iter().map(|c| c.size).sum(),
            channel_size: size,
            color_channels,
            alpha_offset: Some(color_channels * size),
        };
        let ops = with_channel!(depth, T => ops::op_table::<T>(model));

        Self {
            id: format!("{}{}", model.prefix(), depth.suffix()),
            model,
            depth,
            channels,
            layout,
            ops,
            profile: None,
        }
    }

    /// Same encoding, tagged with `profile`.
    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> ColorModel {
        self.model
    }

    pub fn depth(&self) -> ChannelDepth {
        self.depth
    }

    pub fn channels(&self) -> &[ChannelInfo] {
        &self.channels
    }

    pub fn pixel_size(&self) -> usize {
        self.layout.pixel_size
    }

    pub fn layout(&self) -> &PixelLayout {
        &self.layout
    }

    pub fn color_channel_count(&self) -> usize {
        self.layout.color_channels
    }

    /// Index of the alpha channel in [`channels`](Self::channels).
    pub fn alpha_index(&self) -> Option<usize> {
        self.channels.iter().position(|c| c.kind == ChannelKind::Alpha)
    }

    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    /// Two spaces are compatible for compositing when their encodings match.
    pub fn same_format(&self, other: &ColorSpace) -> bool {
        self.id == other.id
    }

    pub fn check_pixel(&self, pixel: &[u8]) -> PaintResult<()> {
        if pixel.len() != self.pixel_size() {
            return Err(PaintError::InvalidPixel {
                space: self.id.clone(),
                expected: self.pixel_size(),
                got: pixel.len(),
            });
        }
        Ok(())
    }

    // ---- alpha ----------------------------------------------------------------

    /// Alpha of one pixel scaled to `0..=255`. Spaces without alpha are opaque.
    pub fn alpha(&self, pixel: &[u8]) -> u8 {
        (self.alpha_f32(pixel) * 255.0).round().clamp(0.0, 255.0) as u8
    }

    /// Alpha of one pixel in unit range.
    pub fn alpha_f32(&self, pixel: &[u8]) -> f32 {
        match self.layout.alpha_offset {
            Some(o) => with_channel!(self.depth, T => T::read(pixel, o).to_unit()),
            None => 1.0,
        }
    }

    /// Set the alpha of the first `count` pixels in `pixels` to `value`
    /// (0..=255, scaled to the channel depth).
    pub fn set_alpha(&self, pixels: &mut [u8], value: u8, count: usize) {
        let Some(o) = self.layout.alpha_offset else {
            return;
        };
        let unit = channel::unit8(value);
        with_channel!(self.depth, T => {
            let v = T::from_unit(unit);
            for px in pixels.chunks_exact_mut(self.pixel_size()).take(count) {
                v.write(px, o);
            }
        })
    }

    /// Copy the alpha channel of the first `count` pixels from `from` to `to`.
    pub fn copy_alpha(&self, from: &[u8], to: &mut [u8], count: usize) {
        let Some(o) = self.layout.alpha_offset else {
            return;
        };
        let ps = self.pixel_size();
        let size = self.layout.channel_size;
        for (src, dst) in from.chunks_exact(ps).zip(to.chunks_exact_mut(ps)).take(count) {
            dst[o..o + size].copy_from_slice(&src[o..o + size]);
        }
    }

    // ---- composite ops -------------------------------------------------------

    pub fn supports(&self, op: CompositeOp) -> bool {
        self.ops.contains_key(&op)
    }

    /// Ops this space implements, in menu order.
    pub fn supported_ops(&self) -> Vec<CompositeOp> {
        CompositeOp::all()
            .iter()
            .copied()
            .filter(|op| self.supports(*op))
            .collect()
    }

    pub fn composite_op(&self, op: CompositeOp) -> PaintResult<BlendOp<'_>> {
        let func = self
            .ops
            .get(&op)
            .copied()
            .ok_or_else(|| PaintError::UnsupportedCompositeOp {
                op: op.id(),
                space: self.id.clone(),
            })?;
        Ok(BlendOp {
            op,
            layout: &self.layout,
            func,
        })
    }

    /// Look up `op` and apply it in one step.
    pub fn bit_blt(&self, op: CompositeOp, args: &mut CompositeArgs<'_>) -> PaintResult<()> {
        self.composite_op(op)?.apply(args)
    }

    // ---- conversion -------------------------------------------------------------

    /// Decode `count` pixels into canonical unit RGBA (4 floats per pixel).
    pub fn to_rgba_f32(&self, src: &[u8], dst: &mut [f32], count: usize) {
        let ps = self.pixel_size();
        let n = self.layout.color_channels;
        let model = self.model;
        with_channel!(self.depth, T => {
            for (px, out) in src.chunks_exact(ps).zip(dst.chunks_exact_mut(4)).take(count) {
                let c = |i: usize| T::read(px, i * T::SIZE).to_unit();
                let a = c(n);
                let rgba = match model {
                    ColorModel::Gray => [c(0), c(0), c(0), a],
                    ColorModel::Rgb => [c(0), c(1), c(2), a],
                    ColorModel::Cmyk => {
                        let (r, g, b) = cmyk_to_rgb(c(0), c(1), c(2), c(3));
                        [r, g, b, a]
                    }
                    ColorModel::Alpha => [a, a, a, 1.0],
                };
                out.copy_from_slice(&rgba);
            }
        })
    }

    /// Encode `count` canonical unit RGBA pixels into this space.
    pub fn from_rgba_f32(&self, src: &[f32], dst: &mut [u8], count: usize) {
        let ps = self.pixel_size();
        let n = self.layout.color_channels;
        let model = self.model;
        with_channel!(self.depth, T => {
            for (rgba, px) in src.chunks_exact(4).zip(dst.chunks_exact_mut(ps)).take(count) {
                let (r, g, b, a) = (rgba[0], rgba[1], rgba[2], rgba[3]);
                let mut put = |i: usize, v: f32| T::from_unit(v).write(px, i * T::SIZE);
                match model {
                    ColorModel::Gray => put(0, luminance(r, g, b)),
                    ColorModel::Rgb => {
                        put(0, r);
                        put(1, g);
                        put(2, b);
                    }
                    ColorModel::Cmyk => {
                        let (c, m, y, k) = rgb_to_cmyk(r, g, b);
                        put(0, c);
                        put(1, m);
                        put(2, y);
                        put(3, k);
                    }
                    ColorModel::Alpha => {}
                }
                let alpha = if model == ColorModel::Alpha { luminance(r, g, b) * a } else { a };
                put(n, alpha);
            }
        })
    }

    /// Display form: tight 8-bit RGBA.
    pub fn to_rgba8(&self, src: &[u8], dst: &mut [u8], count: usize) {
        if self.id == "RGBA8" {
            let bytes = count * 4;
            dst[..bytes].copy_from_slice(&src[..bytes]);
            return;
        }
        let mut tmp = vec![0.0f32; count * 4];
        self.to_rgba_f32(src, &mut tmp, count);
        for (o, v) in dst.iter_mut().zip(&tmp) {
            *o = u8::from_unit(*v);
        }
    }

    pub fn from_rgba8(&self, src: &[u8], dst: &mut [u8], count: usize) {
        let tmp: Vec<f32> = src[..count * 4].iter().map(|&v| channel::unit8(v)).collect();
        self.from_rgba_f32(&tmp, dst, count);
    }

    /// Encode a single 8-bit RGBA colour.
    pub fn pixel_from_rgba8(&self, rgba: [u8; 4]) -> Vec<u8> {
        let mut px = vec![0u8; self.pixel_size()];
        self.from_rgba8(&rgba, &mut px, 1);
        px
    }

    /// Convert to display RGBA8, then run the optional CMS transform.
    pub fn to_display(
        &self,
        src: &[u8],
        dst: &mut [u8],
        count: usize,
        transform: Option<&dyn DisplayTransform>,
    ) {
        self.to_rgba8(src, dst, count);
        if let Some(t) = transform {
            t.transform_rgba8(&mut dst[..count * 4]);
        }
    }

    /// Re-encode `count` pixels into `target`.
    pub fn convert_pixels_to(&self, target: &ColorSpace, src: &[u8], dst: &mut [u8], count: usize) {
        if self.same_format(target) {
            let bytes = count * self.pixel_size();
            dst[..bytes].copy_from_slice(&src[..bytes]);
            return;
        }
        let mut tmp = vec![0.0f32; count * 4];
        self.to_rgba_f32(src, &mut tmp, count);
        target.from_rgba_f32(&tmp, dst, count);
    }

    // ---- colour utilities ---------------------------------------------------------

    /// Largest per-channel difference (canonical RGBA) scaled to 0..=255.
    pub fn difference(&self, a: &[u8], b: &[u8]) -> u8 {
        let mut fa = [0.0f32; 4];
        let mut fb = [0.0f32; 4];
        self.to_rgba_f32(a, &mut fa, 1);
        self.to_rgba_f32(b, &mut fb, 1);
        let d = fa
            .iter()
            .zip(&fb)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0f32, f32::max);
        u8::from_unit(d)
    }

    /// Alpha-weighted average of `colors`; `weights` should sum to 255.
    pub fn mix_colors(&self, colors: &[&[u8]], weights: &[u8], dst: &mut [u8]) {
        let ps = self.pixel_size();
        let n = self.layout.color_channels;
        let mut total_alpha = 0.0f32;
        let mut sums = [0.0f32; ops::MAX_COLOR_CHANNELS];
        with_channel!(self.depth, T => {
            for (px, &w) in colors.iter().zip(weights) {
                let a = self.alpha_f32(px) * channel::unit8(w);
                total_alpha += a;
                for (c, sum) in sums.iter_mut().enumerate().take(n) {
                    *sum += T::read(px, c * T::SIZE).to_unit() * a;
                }
            }
            for (c, sum) in sums.iter().enumerate().take(n) {
                let v = if total_alpha > 0.0 { sum / total_alpha } else { 0.0 };
                T::from_unit(v).write(&mut dst[..ps], c * T::SIZE);
            }
            if let Some(o) = self.layout.alpha_offset {
                T::from_unit(total_alpha.min(1.0)).write(&mut dst[..ps], o);
            }
        })
    }
}
