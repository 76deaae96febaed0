// ============================================================================
// TRANSFORM OPERATIONS: mirror, rotate, scale and filter paint devices
// ============================================================================
//
// Every operation builds a new device by inverse mapping: each destination
// pixel looks up the source pixel it comes from. The source is never
// touched, so a cancelled operation leaves nothing to undo.
// ============================================================================

use std::sync::Arc;

use rayon::prelude::*;

use crate::adjustment::Filter;
use crate::compositor::Image;
use crate::error::{PaintError, PaintResult, try_alloc_bytes};
use crate::geometry::Rect;
use crate::paint_device::PaintDevice;
use crate::progress::ProgressReporter;
use crate::tile::{TILE_PIXELS, TILE_SIZE, Tile};

/// Tiles processed between cancellation checks.
const TILE_BATCH: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    /// Mirror left/right.
    Horizontal,
    /// Mirror top/bottom.
    Vertical,
}

/// Clockwise quarter turns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rotation {
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn swaps_axes(&self) -> bool {
        !matches!(self, Rotation::Cw180)
    }

    /// Where pixel `(x, y)` lands when `frame` is turned.
    fn forward(&self, frame: Rect, x: i32, y: i32) -> (i32, i32) {
        let (lx, ly) = (x - frame.x, y - frame.y);
        let (w, h) = (frame.width, frame.height);
        match self {
            Rotation::Cw90 => (frame.x + h - 1 - ly, frame.y + lx),
            Rotation::Cw180 => (frame.x + w - 1 - lx, frame.y + h - 1 - ly),
            Rotation::Cw270 => (frame.x + ly, frame.y + w - 1 - lx),
        }
    }

    /// Source of destination pixel `(x, y)`.
    fn inverse(&self, frame: Rect, x: i32, y: i32) -> (i32, i32) {
        let (u, v) = (x - frame.x, y - frame.y);
        let (w, h) = (frame.width, frame.height);
        match self {
            Rotation::Cw90 => (frame.x + v, frame.y + h - 1 - u),
            Rotation::Cw180 => (frame.x + w - 1 - u, frame.y + h - 1 - v),
            Rotation::Cw270 => (frame.x + w - 1 - v, frame.y + u),
        }
    }
}

/// Build a device covering `dst_extent` where each pixel is read from
/// `inverse(x, y)` in `src`. Tiles left at the default pixel stay
/// unallocated.
fn remap<F>(
    src: &PaintDevice,
    dst_extent: Rect,
    inverse: F,
    progress: &dyn ProgressReporter,
) -> PaintResult<PaintDevice>
where
    F: Fn(i32, i32) -> (i32, i32) + Sync,
{
    let mut out = PaintDevice::with_default_pixel(Arc::clone(src.color_space()), src.default_pixel())?;
    let ps = src.pixel_size();
    let keys = dst_extent.tile_origins();
    let total = keys.len().max(1);
    let mut done = 0;

    for chunk in keys.chunks(TILE_BATCH) {
        if progress.is_cancelled() {
            return Err(PaintError::Cancelled);
        }
        let tiles: Vec<Option<Tile>> = chunk
            .par_iter()
            .map(|&(tx, ty)| {
                let mut data = try_alloc_bytes(ps * TILE_PIXELS)?;
                let mut accessor = src.random_accessor();
                for (i, dst) in data.chunks_exact_mut(ps).enumerate() {
                    let x = tx + (i % TILE_SIZE as usize) as i32;
                    let y = ty + (i / TILE_SIZE as usize) as i32;
                    let (sx, sy) = inverse(x, y);
                    dst.copy_from_slice(accessor.pixel_at(sx, sy));
                }
                let tile = Tile::from_bytes(tx, ty, ps, data)
                    .ok_or_else(|| PaintError::allocation(ps * TILE_PIXELS))?;
                Ok((!tile.is_uniform(src.default_pixel())).then_some(tile))
            })
            .collect::<PaintResult<_>>()?;
        for tile in tiles.into_iter().flatten() {
            out.insert_tile(tile)?;
        }
        done += chunk.len();
        progress.report((done * 100 / total) as u8);
    }
    out.take_changed();
    Ok(out)
}

/// Bounding box of `rect`'s corner pixels after `map`.
fn mapped_extent(rect: Rect, map: impl Fn(i32, i32) -> (i32, i32)) -> Rect {
    if rect.is_empty() {
        return Rect::EMPTY;
    }
    let corners = [
        map(rect.x, rect.y),
        map(rect.right() - 1, rect.y),
        map(rect.x, rect.bottom() - 1),
        map(rect.right() - 1, rect.bottom() - 1),
    ];
    let x0 = corners.iter().map(|c| c.0).min().unwrap_or(0);
    let y0 = corners.iter().map(|c| c.1).min().unwrap_or(0);
    let x1 = corners.iter().map(|c| c.0).max().unwrap_or(-1);
    let y1 = corners.iter().map(|c| c.1).max().unwrap_or(-1);
    Rect::from_coords(x0, y0, x1 + 1, y1 + 1)
}

/// Mirror `src` across the centre line of `frame`.
pub fn mirror(
    src: &PaintDevice,
    axis: Axis,
    frame: Rect,
    progress: &dyn ProgressReporter,
) -> PaintResult<PaintDevice> {
    let flip = move |x: i32, y: i32| match axis {
        Axis::Horizontal => (2 * frame.x + frame.width - 1 - x, y),
        Axis::Vertical => (x, 2 * frame.y + frame.height - 1 - y),
    };
    let extent = mapped_extent(src.extent(), flip);
    remap(src, extent, flip, progress)
}

/// Turn `src` clockwise about `frame`; `frame`'s top-left stays put and
/// its size swaps for quarter turns.
pub fn rotate(
    src: &PaintDevice,
    rotation: Rotation,
    frame: Rect,
    progress: &dyn ProgressReporter,
) -> PaintResult<PaintDevice> {
    let extent = mapped_extent(src.extent(), |x, y| rotation.forward(frame, x, y));
    remap(src, extent, |x, y| rotation.inverse(frame, x, y), progress)
}

/// Nearest-neighbour scale about the origin.
pub fn scale(
    src: &PaintDevice,
    sx: f64,
    sy: f64,
    progress: &dyn ProgressReporter,
) -> PaintResult<PaintDevice> {
    if !(sx.is_finite() && sy.is_finite() && sx > 0.0 && sy > 0.0) {
        return Err(PaintError::invalid_argument(format!("bad scale factors {sx}x{sy}")));
    }
    let e = src.extent();
    if e.is_empty() {
        return remap(src, Rect::EMPTY, |x, y| (x, y), progress);
    }
    let extent = Rect::from_coords(
        (e.x as f64 * sx).floor() as i32,
        (e.y as f64 * sy).floor() as i32,
        (e.right() as f64 * sx).ceil() as i32,
        (e.bottom() as f64 * sy).ceil() as i32,
    );
    let inverse = |x: i32, y: i32| {
        (
            ((x as f64 + 0.5) / sx).floor() as i32,
            ((y as f64 + 0.5) / sy).floor() as i32,
        )
    };
    remap(src, extent, inverse, progress)
}

/// Copy of `src` with `filter` applied inside `rect`. Unallocated areas
/// stay unallocated.
pub fn apply_filter(
    src: &PaintDevice,
    filter: &Filter,
    rect: Rect,
    progress: &dyn ProgressReporter,
) -> PaintResult<PaintDevice> {
    let area = rect.intersect(&src.extent());
    let keys: Vec<(i32, i32)> = area
        .tile_origins()
        .into_iter()
        .filter(|&(tx, ty)| src.has_tile(tx, ty))
        .collect();
    let cs = src.color_space();
    let ps = src.pixel_size();
    let total = keys.len().max(1);
    let mut out = src.clone();
    let mut done = 0;

    for chunk in keys.chunks(TILE_BATCH) {
        if progress.is_cancelled() {
            return Err(PaintError::Cancelled);
        }
        let tiles: Vec<Tile> = chunk
            .par_iter()
            .map(|&(tx, ty)| {
                let mut data = try_alloc_bytes(ps * TILE_PIXELS)?;
                data.copy_from_slice(src.tile_data_or_default(tx, ty));
                let local = area
                    .intersect(&Rect::new(tx, ty, TILE_SIZE, TILE_SIZE))
                    .translated(-tx, -ty);
                let run = local.width as usize;
                for ly in local.y..local.bottom() {
                    let start = (ly as usize * TILE_SIZE as usize + local.x as usize) * ps;
                    filter.apply_pixels(cs, &mut data[start..start + run * ps], run);
                }
                Tile::from_bytes(tx, ty, ps, data).ok_or_else(|| PaintError::allocation(ps * TILE_PIXELS))
            })
            .collect::<PaintResult<_>>()?;
        for tile in tiles {
            out.insert_tile(tile)?;
        }
        done += chunk.len();
        progress.report((done * 100 / total) as u8);
    }
    out.take_changed();
    Ok(out)
}

// ---------------------------------------------------------------------------
//  Whole-image transforms (affect every paint layer)
// ---------------------------------------------------------------------------

/// Run `op` over every paint layer, each in its own coordinate frame (the
/// image bounds shifted by the layer's absolute offset). Nothing is
/// replaced unless every layer succeeds.
fn transform_all_layers<F>(image: &mut Image, op: F) -> PaintResult<()>
where
    F: Fn(&PaintDevice, Rect) -> PaintResult<PaintDevice>,
{
    let bounds = image.bounds();
    let mut results = Vec::new();
    for id in image.tree().paint_layers(image.root())? {
        let (ox, oy) = image.tree().absolute_offset(id)?;
        let device = op(image.paint_device(id)?, bounds.translated(ox.saturating_neg(), oy.saturating_neg()))?;
        results.push((id, device));
    }
    for (id, device) in results {
        image.replace_paint_device(id, device)?;
    }
    Ok(())
}

pub fn mirror_image(image: &mut Image, axis: Axis, progress: &dyn ProgressReporter) -> PaintResult<()> {
    transform_all_layers(image, |dev, frame| mirror(dev, axis, frame, progress))?;
    tracing::debug!(image = %image.id(), ?axis, "image mirrored");
    Ok(())
}

/// Rotate every layer about the image bounds; quarter turns swap the
/// image's width and height.
pub fn rotate_image(image: &mut Image, rotation: Rotation, progress: &dyn ProgressReporter) -> PaintResult<()> {
    transform_all_layers(image, |dev, frame| rotate(dev, rotation, frame, progress))?;
    if rotation.swaps_axes() {
        image.resize_canvas(image.height(), image.width())?;
    }
    tracing::debug!(image = %image.id(), ?rotation, "image rotated");
    Ok(())
}
