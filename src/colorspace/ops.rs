// ============================================================================
// COMPOSITE OPS: blend kernels over raw pixel rows
// ============================================================================
//
// Storage is straight (non-premultiplied) alpha. Every kernel follows the
// same envelope: derive the effective source alpha from pixel alpha, mask
// and opacity, settle the new destination alpha, then move each colour
// channel towards the blended colour by `t = srcAlpha / newAlpha`.
// ============================================================================

use std::collections::HashMap;

use super::channel::{Channel, unit8};
use super::{ColorModel, PixelLayout};
use crate::color_conv::{hsl_to_rgb, hsv_to_rgb, rgb_to_hsl, rgb_to_hsv};
use crate::composite_op::CompositeOp;
use crate::error::{PaintError, PaintResult};

/// Upper bound on colour channels (CMYK).
pub const MAX_COLOR_CHANNELS: usize = 4;

/// Arguments of one blend call. Strides are in bytes; the mask holds one
/// byte per pixel.
pub struct CompositeArgs<'a> {
    pub dst: &'a mut [u8],
    pub dst_stride: usize,
    pub src: &'a [u8],
    pub src_stride: usize,
    pub mask: Option<(&'a [u8], usize)>,
    pub rows: usize,
    pub cols: usize,
    pub opacity: u8,
}

impl CompositeArgs<'_> {
    /// Check that every row the kernel will touch lies inside the buffers.
    pub fn validate(&self, pixel_size: usize) -> PaintResult<()> {
        if self.rows == 0 || self.cols == 0 {
            return Ok(());
        }
        let row_bytes = self.cols * pixel_size;
        let need = |stride: usize| (self.rows - 1) * stride + row_bytes;
        if self.dst.len() < need(self.dst_stride) || self.dst_stride < row_bytes {
            return Err(PaintError::BufferSize {
                expected: need(self.dst_stride),
                got: self.dst.len(),
            });
        }
        if self.src.len() < need(self.src_stride) || self.src_stride < row_bytes {
            return Err(PaintError::BufferSize {
                expected: need(self.src_stride),
                got: self.src.len(),
            });
        }
        if let Some((mask, stride)) = self.mask {
            let mask_need = (self.rows - 1) * stride + self.cols;
            if mask.len() < mask_need || stride < self.cols {
                return Err(PaintError::BufferSize {
                    expected: mask_need,
                    got: mask.len(),
                });
            }
        }
        Ok(())
    }
}

/// A blend kernel. Mutates `args.dst` in place.
pub type BlendFn = fn(&PixelLayout, &mut CompositeArgs<'_>);

/// Build the op table for one model/depth combination.
pub fn op_table<T: Channel>(model: ColorModel) -> HashMap<CompositeOp, BlendFn> {
    let mut ops: HashMap<CompositeOp, BlendFn> = HashMap::new();
    ops.insert(CompositeOp::Over, composite_over::<T>);
    ops.insert(CompositeOp::Erase, composite_erase::<T>);
    ops.insert(CompositeOp::Copy, composite_copy);

    // Masks only know how to accumulate or punch coverage.
    if model == ColorModel::Alpha {
        return ops;
    }

    ops.insert(CompositeOp::Multiply, composite_multiply::<T>);
    ops.insert(CompositeOp::Screen, composite_screen::<T>);
    ops.insert(CompositeOp::Divide, composite_divide::<T>);
    ops.insert(CompositeOp::Overlay, composite_overlay::<T>);
    ops.insert(CompositeOp::Dodge, composite_dodge::<T>);
    ops.insert(CompositeOp::Burn, composite_burn::<T>);
    ops.insert(CompositeOp::Darken, composite_darken::<T>);
    ops.insert(CompositeOp::Lighten, composite_lighten::<T>);

    if model == ColorModel::Rgb {
        ops.insert(CompositeOp::Hue, composite_hue::<T>);
        ops.insert(CompositeOp::Saturation, composite_saturation::<T>);
        ops.insert(CompositeOp::Value, composite_value::<T>);
        ops.insert(CompositeOp::Color, composite_color::<T>);
    }
    ops
}

// ---- shared plumbing ---------------------------------------------------------

#[inline]
fn for_each_pixel<F>(args: &mut CompositeArgs<'_>, pixel_size: usize, mut f: F)
where
    F: FnMut(&mut [u8], &[u8], u8),
{
    let row_bytes = args.cols * pixel_size;
    for row in 0..args.rows {
        let d0 = row * args.dst_stride;
        let s0 = row * args.src_stride;
        let dst_row = &mut args.dst[d0..d0 + row_bytes];
        let src_row = &args.src[s0..s0 + row_bytes];
        let mask_row = args
            .mask
            .map(|(mask, stride)| &mask[row * stride..row * stride + args.cols]);

        for (col, (dst, src)) in dst_row
            .chunks_exact_mut(pixel_size)
            .zip(src_row.chunks_exact(pixel_size))
            .enumerate()
        {
            let m = mask_row.map_or(u8::MAX, |m| m[col]);
            f(dst, src, m);
        }
    }
}

#[inline]
fn alpha_unit<T: Channel>(layout: &PixelLayout, px: &[u8]) -> f32 {
    layout.alpha_offset.map_or(1.0, |o| T::read(px, o).to_unit())
}

/// Quantize the effective alpha to the channel depth so integer spaces
/// gate on the same values they store.
#[inline]
fn effective_alpha<T: Channel>(alpha: f32, mask: u8, opacity: u8) -> T {
    T::from_unit(alpha * unit8(mask) * unit8(opacity))
}

/// Write the new destination alpha and return the colour blend fraction.
#[inline]
fn settle_alpha<T: Channel>(layout: &PixelLayout, dst: &mut [u8], src_alpha: f32) -> f32 {
    let Some(ao) = layout.alpha_offset else {
        return src_alpha;
    };
    let dst_alpha = T::read(dst, ao);
    if dst_alpha.is_opaque() {
        return src_alpha;
    }
    let da = dst_alpha.to_unit();
    let new_alpha = da + (1.0 - da) * src_alpha;
    T::from_unit(new_alpha).write(dst, ao);
    if new_alpha > 0.0 {
        src_alpha / new_alpha
    } else {
        src_alpha
    }
}

#[inline]
fn read_colors<T: Channel>(px: &[u8], n: usize, out: &mut [f32; MAX_COLOR_CHANNELS]) {
    for (c, slot) in out.iter_mut().take(n).enumerate() {
        *slot = T::read(px, c * T::SIZE).to_unit();
    }
}

// ---- over / erase / copy -----------------------------------------------------

pub fn composite_over<T: Channel>(layout: &PixelLayout, args: &mut CompositeArgs<'_>) {
    let opacity = args.opacity;
    let n = layout.color_channels;
    for_each_pixel(args, layout.pixel_size, |dst, src, mask| {
        let src_alpha: T = effective_alpha(alpha_unit::<T>(layout, src), mask, opacity);
        if src_alpha.is_transparent() {
            return;
        }
        if src_alpha.is_opaque() {
            dst.copy_from_slice(src);
            return;
        }

        let t = settle_alpha::<T>(layout, dst, src_alpha.to_unit());
        for c in 0..n {
            let o = c * T::SIZE;
            let d = T::read(dst, o).to_unit();
            let s = T::read(src, o).to_unit();
            T::from_unit(d + (s - d) * t).write(dst, o);
        }
    });
}

/// Scale destination alpha by `1 - srcAlpha·mask·opacity`; colour untouched.
pub fn composite_erase<T: Channel>(layout: &PixelLayout, args: &mut CompositeArgs<'_>) {
    let Some(ao) = layout.alpha_offset else {
        return;
    };
    let opacity = args.opacity;
    for_each_pixel(args, layout.pixel_size, |dst, src, mask| {
        let sa = alpha_unit::<T>(layout, src) * unit8(mask) * unit8(opacity);
        if sa <= 0.0 {
            return;
        }
        let da = T::read(dst, ao).to_unit();
        T::from_unit(da * (1.0 - sa)).write(dst, ao);
    });
}

/// Raw byte copy of the covered region. Ignores mask and opacity.
pub fn composite_copy(layout: &PixelLayout, args: &mut CompositeArgs<'_>) {
    let row_bytes = args.cols * layout.pixel_size;
    for row in 0..args.rows {
        let d0 = row * args.dst_stride;
        let s0 = row * args.src_stride;
        args.dst[d0..d0 + row_bytes].copy_from_slice(&args.src[s0..s0 + row_bytes]);
    }
}

// ---- colour-blending ops -----------------------------------------------------

/// Envelope shared by every op except over/erase/copy: source alpha is
/// first limited to the destination alpha, then `blend` produces the
/// target colour from `(src, dst)`.
fn composite_blended<T, F>(layout: &PixelLayout, args: &mut CompositeArgs<'_>, blend: F)
where
    T: Channel,
    F: Fn(&[f32], &[f32], &mut [f32]),
{
    let opacity = args.opacity;
    let n = layout.color_channels;
    for_each_pixel(args, layout.pixel_size, |dst, src, mask| {
        let dst_alpha = alpha_unit::<T>(layout, dst);
        let raw = alpha_unit::<T>(layout, src).min(dst_alpha);
        let src_alpha: T = effective_alpha(raw, mask, opacity);
        if src_alpha.is_transparent() {
            return;
        }

        let t = settle_alpha::<T>(layout, dst, src_alpha.to_unit());

        let mut s = [0.0f32; MAX_COLOR_CHANNELS];
        let mut d = [0.0f32; MAX_COLOR_CHANNELS];
        let mut out = [0.0f32; MAX_COLOR_CHANNELS];
        read_colors::<T>(src, n, &mut s);
        read_colors::<T>(dst, n, &mut d);
        blend(&s[..n], &d[..n], &mut out[..n]);

        for c in 0..n {
            T::from_unit(d[c] + (out[c] - d[c]) * t).write(dst, c * T::SIZE);
        }
    });
}

macro_rules! channel_op {
    ($(#[$doc:meta])* $name:ident, |$s:ident, $d:ident, $e:ident| $body:expr) => {
        $(#[$doc])*
        pub fn $name<T: Channel>(layout: &PixelLayout, args: &mut CompositeArgs<'_>) {
            composite_blended::<T, _>(layout, args, |src, dst, out| {
                for ((o, &$s), &$d) in out.iter_mut().zip(src).zip(dst) {
                    let $e = T::EPSILON;
                    *o = $body;
                }
            });
        }
    };
}

channel_op!(composite_multiply, |s, d, _e| s * d);

channel_op!(composite_screen, |s, d, _e| 1.0 - (1.0 - s) * (1.0 - d));

channel_op!(composite_divide, |s, d, e| (d / (s + e)).min(1.0));

channel_op!(composite_overlay, |s, d, _e| d * (d + 2.0 * s * (1.0 - d)));

channel_op!(
    /// Brighten the destination by the inverse of the source.
    composite_dodge,
    |s, d, e| (d / (1.0 - s + e)).min(1.0)
);

channel_op!(
    /// Darken the destination by the source.
    composite_burn,
    |s, d, e| 1.0 - ((1.0 - d) / (s + e)).min(1.0)
);

channel_op!(composite_darken, |s, d, _e| s.min(d));

channel_op!(composite_lighten, |s, d, _e| s.max(d));

// ---- HSV / HSL family (RGB only) ----------------------------------------------

fn composite_hsv<T, F>(layout: &PixelLayout, args: &mut CompositeArgs<'_>, mix: F)
where
    T: Channel,
    F: Fn((f32, f32, f32), (f32, f32, f32)) -> (f32, f32, f32),
{
    debug_assert_eq!(layout.color_channels, 3, "HSV ops need an RGB layout");
    composite_blended::<T, _>(layout, args, |src, dst, out| {
        let (r, g, b) = mix((src[0], src[1], src[2]), (dst[0], dst[1], dst[2]));
        out[0] = r;
        out[1] = g;
        out[2] = b;
    });
}

pub fn composite_hue<T: Channel>(layout: &PixelLayout, args: &mut CompositeArgs<'_>) {
    composite_hsv::<T, _>(layout, args, |s, d| {
        let (sh, _, _) = rgb_to_hsv(s.0, s.1, s.2);
        let (_, ds, dv) = rgb_to_hsv(d.0, d.1, d.2);
        hsv_to_rgb(sh, ds, dv)
    });
}

pub fn composite_saturation<T: Channel>(layout: &PixelLayout, args: &mut CompositeArgs<'_>) {
    composite_hsv::<T, _>(layout, args, |s, d| {
        let (_, ss, _) = rgb_to_hsv(s.0, s.1, s.2);
        let (dh, _, dv) = rgb_to_hsv(d.0, d.1, d.2);
        hsv_to_rgb(dh, ss, dv)
    });
}

pub fn composite_value<T: Channel>(layout: &PixelLayout, args: &mut CompositeArgs<'_>) {
    composite_hsv::<T, _>(layout, args, |s, d| {
        let (_, _, sv) = rgb_to_hsv(s.0, s.1, s.2);
        let (dh, ds, _) = rgb_to_hsv(d.0, d.1, d.2);
        hsv_to_rgb(dh, ds, sv)
    });
}

/// Hue and saturation from the source, lightness from the destination (HSL).
pub fn composite_color<T: Channel>(layout: &PixelLayout, args: &mut CompositeArgs<'_>) {
    composite_hsv::<T, _>(layout, args, |s, d| {
        let (sh, ss, _) = rgb_to_hsl(s.0, s.1, s.2);
        let (_, _, dl) = rgb_to_hsl(d.0, d.1, d.2);
        hsl_to_rgb(sh, ss, dl)
    });
}
