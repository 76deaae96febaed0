// ============================================================================
// PAINT DEVICE – sparse tile map with a default pixel
// ============================================================================

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use rayon::prelude::*;

use crate::colorspace::ColorSpace;
use crate::error::{PaintError, PaintResult, try_alloc_bytes};
use crate::geometry::Rect;
use crate::iter::{RandomAccessor, RectIter, RowIter, RowRuns};
use crate::progress::ProgressReporter;
use crate::tile::{TILE_PIXELS, TILE_SIZE, Tile, tile_key};

/// Tiles converted per parallel batch in [`PaintDevice::converted`].
const CONVERT_BATCH: usize = 64;

/// Change reported after the default pixel is replaced: every coordinate.
pub const UNBOUNDED: Rect = Rect {
    x: -(1 << 29),
    y: -(1 << 29),
    width: 1 << 30,
    height: 1 << 30,
};

/// Sparse raster store. Tiles are allocated on first write; reads of
/// unallocated coordinates answer with the default pixel and allocate
/// nothing.
#[derive(Clone, Debug)]
pub struct PaintDevice {
    color_space: Arc<ColorSpace>,
    tiles: HashMap<(i32, i32), Tile>,
    default_pixel: Vec<u8>,
    /// Full tile of `default_pixel`, built on first use.
    default_tile: OnceLock<Vec<u8>>,
    extent: OnceLock<Rect>,
    /// Union of regions touched since the last [`take_changed`](Self::take_changed).
    changed: Rect,
}

impl PaintDevice {
    /// Empty device whose default pixel is all-zero (transparent).
    pub fn new(color_space: Arc<ColorSpace>) -> Self {
        let default_pixel = vec![0u8; color_space.pixel_size()];
        Self {
            color_space,
            tiles: HashMap::new(),
            default_pixel,
            default_tile: OnceLock::new(),
            extent: OnceLock::new(),
            changed: Rect::EMPTY,
        }
    }

    pub fn with_default_pixel(color_space: Arc<ColorSpace>, pixel: &[u8]) -> PaintResult<Self> {
        color_space.check_pixel(pixel)?;
        let mut dev = Self::new(color_space);
        dev.default_pixel = pixel.to_vec();
        Ok(dev)
    }

    // ---- metadata ---------------------------------------------------------------

    pub fn color_space(&self) -> &Arc<ColorSpace> {
        &self.color_space
    }

    pub fn pixel_size(&self) -> usize {
        self.default_pixel.len()
    }

    pub fn default_pixel(&self) -> &[u8] {
        &self.default_pixel
    }

    /// Replace the default pixel. Allocated tiles keep their contents.
    pub fn set_default_pixel(&mut self, pixel: &[u8]) -> PaintResult<()> {
        self.color_space.check_pixel(pixel)?;
        if pixel == self.default_pixel.as_slice() {
            return Ok(());
        }
        self.default_pixel = pixel.to_vec();
        self.default_tile = OnceLock::new();
        self.changed = UNBOUNDED;
        Ok(())
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn memory_size(&self) -> usize {
        self.tiles.values().map(Tile::memory_size).sum()
    }

    pub fn has_tile(&self, tx: i32, ty: i32) -> bool {
        self.tiles.contains_key(&(tx, ty))
    }

    pub fn tile(&self, tx: i32, ty: i32) -> Option<&Tile> {
        self.tiles.get(&(tx, ty))
    }

    /// Allocated tiles in unspecified order.
    pub fn tiles(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.values()
    }

    /// Sorted origins of allocated tiles.
    pub fn tile_keys(&self) -> Vec<(i32, i32)> {
        let mut keys: Vec<_> = self.tiles.keys().copied().collect();
        keys.sort_unstable_by_key(|&(x, y)| (y, x));
        keys
    }

    /// Bytes of the tile at `(tx, ty)`, or a tile of the default pixel
    /// when nothing is allocated there.
    pub fn tile_data_or_default(&self, tx: i32, ty: i32) -> &[u8] {
        match self.tiles.get(&(tx, ty)) {
            Some(tile) => tile.data(),
            None => self.default_tile(),
        }
    }

    fn default_tile(&self) -> &[u8] {
        self.default_tile
            .get_or_init(|| self.default_pixel.repeat(TILE_PIXELS))
    }

    // ---- pixel access -------------------------------------------------------------

    /// Pixel at `(x, y)`. Never fails; unallocated coordinates yield the
    /// default pixel.
    pub fn read(&self, x: i32, y: i32) -> &[u8] {
        let (tx, ty) = tile_key(x, y);
        match self.tiles.get(&(tx, ty)) {
            Some(tile) => tile.pixel((x - tx) as usize, (y - ty) as usize),
            None => &self.default_pixel,
        }
    }

    /// Write one pixel, allocating the owning tile if needed.
    pub fn write(&mut self, x: i32, y: i32, pixel: &[u8]) -> PaintResult<()> {
        self.color_space.check_pixel(pixel)?;
        let (tx, ty) = tile_key(x, y);
        let tile = self.tile_mut_or_create(tx, ty)?;
        tile.pixel_mut((x - tx) as usize, (y - ty) as usize)
            .copy_from_slice(pixel);
        self.note_changed(Rect::new(x, y, 1, 1));
        Ok(())
    }

    /// Mutable tile at `(tx, ty)`, allocated (pre-filled with the default
    /// pixel) when absent.
    pub fn tile_mut_or_create(&mut self, tx: i32, ty: i32) -> PaintResult<&mut Tile> {
        if !self.tiles.contains_key(&(tx, ty)) {
            self.tiles.try_reserve(1).map_err(|_| {
                PaintError::allocation(std::mem::size_of::<Tile>())
            })?;
            let tile = Tile::filled(tx, ty, &self.default_pixel)?;
            self.tiles.insert((tx, ty), tile);
            self.extent = OnceLock::new();
        }
        self.tiles
            .get_mut(&(tx, ty))
            .ok_or_else(|| PaintError::allocation(self.default_pixel.len() * TILE_PIXELS))
    }

    /// Adopt a complete tile (used by the byte-stream reader).
    pub fn insert_tile(&mut self, tile: Tile) -> PaintResult<()> {
        if tile.pixel_size() != self.pixel_size() {
            return Err(PaintError::InvalidPixel {
                space: self.color_space.id().to_string(),
                expected: self.pixel_size(),
                got: tile.pixel_size(),
            });
        }
        self.note_changed(tile.rect());
        self.tiles.insert((tile.x(), tile.y()), tile);
        self.extent = OnceLock::new();
        Ok(())
    }

    // ---- iteration ------------------------------------------------------------------

    /// Lazy pixel sequence along row `y` from `x` for `width` pixels,
    /// crossing tile boundaries transparently.
    pub fn row_iter(&self, x: i32, y: i32, width: i32) -> RowIter<'_> {
        RowIter::new(self.row_runs(x, y, width), self.pixel_size())
    }

    /// Contiguous byte runs along a row, one per tile crossed.
    pub fn row_runs(&self, x: i32, y: i32, width: i32) -> RowRuns<'_> {
        RowRuns::new(self, x, y, width)
    }

    /// Row-major `(x, y, pixel)` sequence over `rect`.
    pub fn rect_iter(&self, rect: Rect) -> RectIter<'_> {
        RectIter::new(self, rect)
    }

    pub fn random_accessor(&self) -> RandomAccessor<'_> {
        RandomAccessor::new(self)
    }

    // ---- bounds -----------------------------------------------------------------------

    /// Smallest rectangle covering every allocated tile. Cached until the
    /// tile set changes.
    pub fn extent(&self) -> Rect {
        *self.extent.get_or_init(|| {
            self.tiles
                .values()
                .fold(Rect::EMPTY, |acc, t| acc.union(&t.rect()))
        })
    }

    /// Smallest rectangle covering every pixel that differs from the
    /// default pixel.
    pub fn exact_bounds(&self) -> Rect {
        let ps = self.pixel_size();
        self.tiles
            .par_iter()
            .map(|(_, tile)| {
                let (mut x0, mut y0, mut x1, mut y1) = (i32::MAX, i32::MAX, i32::MIN, i32::MIN);
                for (i, px) in tile.data().chunks_exact(ps).enumerate() {
                    if px != self.default_pixel.as_slice() {
                        let lx = (i % TILE_SIZE as usize) as i32;
                        let ly = (i / TILE_SIZE as usize) as i32;
                        x0 = x0.min(lx);
                        y0 = y0.min(ly);
                        x1 = x1.max(lx);
                        y1 = y1.max(ly);
                    }
                }
                if x1 < x0 {
                    Rect::EMPTY
                } else {
                    Rect::from_coords(x0, y0, x1 + 1, y1 + 1).translated(tile.x(), tile.y())
                }
            })
            .reduce(|| Rect::EMPTY, |a, b| a.union(&b))
    }

    // ---- region edits ---------------------------------------------------------------

    /// Reset `rect` to the default pixel. Tiles stay allocated.
    pub fn clear(&mut self, rect: Rect) {
        let target = rect.intersect(&self.extent());
        if target.is_empty() {
            return;
        }
        let default = self.default_pixel.clone();
        for (tx, ty) in target.tile_origins() {
            if let Some(tile) = self.tiles.get_mut(&(tx, ty)) {
                tile.fill_local(target.translated(-tx, -ty), &default);
            }
        }
        self.note_changed(target);
    }

    /// Drop every tile.
    pub fn clear_all(&mut self) {
        let old = self.extent();
        self.tiles.clear();
        self.extent = OnceLock::new();
        self.note_changed(old);
    }

    /// Release tiles that hold nothing but the default pixel. Reads are
    /// unaffected.
    pub fn purge_default_tiles(&mut self) -> usize {
        let before = self.tiles.len();
        let default = &self.default_pixel;
        self.tiles.retain(|_, t| !t.is_uniform(default));
        let purged = before - self.tiles.len();
        if purged > 0 {
            self.extent = OnceLock::new();
        }
        purged
    }

    /// Write `pixel` over the whole of `rect`.
    pub fn fill(&mut self, rect: Rect, pixel: &[u8]) -> PaintResult<()> {
        self.color_space.check_pixel(pixel)?;
        if rect.is_empty() {
            return Ok(());
        }
        for (tx, ty) in rect.tile_origins() {
            let local = rect.translated(-tx, -ty);
            self.tile_mut_or_create(tx, ty)?.fill_local(local, pixel);
        }
        self.note_changed(rect);
        Ok(())
    }

    /// Tight-packed copy of `rect` (row-major, no padding).
    pub fn read_bytes(&self, rect: Rect) -> PaintResult<Vec<u8>> {
        if rect.is_empty() {
            return Ok(Vec::new());
        }
        let ps = self.pixel_size();
        let row_bytes = rect.width as usize * ps;
        let mut out = try_alloc_bytes(row_bytes * rect.height as usize)?;
        for (row, y) in (rect.y..rect.bottom()).enumerate() {
            let mut at = row * row_bytes;
            for (_, run) in self.row_runs(rect.x, y, rect.width) {
                out[at..at + run.len()].copy_from_slice(run);
                at += run.len();
            }
        }
        Ok(out)
    }

    /// Inverse of [`read_bytes`](Self::read_bytes).
    pub fn write_bytes(&mut self, rect: Rect, data: &[u8]) -> PaintResult<()> {
        if rect.is_empty() {
            return Ok(());
        }
        let ps = self.pixel_size();
        let row_bytes = rect.width as usize * ps;
        let expected = row_bytes * rect.height as usize;
        if data.len() != expected {
            return Err(PaintError::BufferSize {
                expected,
                got: data.len(),
            });
        }
        for (tx, ty) in rect.tile_origins() {
            let part = rect.intersect(&Rect::new(tx, ty, TILE_SIZE, TILE_SIZE));
            let tile = self.tile_mut_or_create(tx, ty)?;
            let run = part.width as usize * ps;
            for y in part.y..part.bottom() {
                let src = (y - rect.y) as usize * row_bytes + (part.x - rect.x) as usize * ps;
                let dst = tile.row_from_mut((part.x - tx) as usize, (y - ty) as usize);
                dst[..run].copy_from_slice(&data[src..src + run]);
            }
        }
        self.note_changed(rect);
        Ok(())
    }

    // ---- colour conversion -------------------------------------------------------------

    /// Copy of this device re-encoded into `target`. Tiles are converted in
    /// parallel batches with cancellation checked between batches; `self`
    /// is never touched.
    pub fn converted(
        &self,
        target: Arc<ColorSpace>,
        progress: &dyn ProgressReporter,
    ) -> PaintResult<PaintDevice> {
        let mut default = vec![0u8; target.pixel_size()];
        self.color_space
            .convert_pixels_to(&target, &self.default_pixel, &mut default, 1);
        let mut out = PaintDevice::with_default_pixel(Arc::clone(&target), &default)?;
        let ps = target.pixel_size();

        let keys = self.tile_keys();
        let total = keys.len().max(1);
        let mut done = 0;
        for chunk in keys.chunks(CONVERT_BATCH) {
            if progress.is_cancelled() {
                return Err(PaintError::Cancelled);
            }
            let tiles: Vec<Tile> = chunk
                .par_iter()
                .map(|&(tx, ty)| {
                    let mut data = try_alloc_bytes(ps * TILE_PIXELS)?;
                    self.color_space
                        .convert_pixels_to(&target, self.tile_data_or_default(tx, ty), &mut data, TILE_PIXELS);
                    Tile::from_bytes(tx, ty, ps, data).ok_or_else(|| PaintError::allocation(ps * TILE_PIXELS))
                })
                .collect::<PaintResult<_>>()?;
            for tile in tiles {
                out.tiles.insert((tile.x(), tile.y()), tile);
            }
            done += chunk.len();
            progress.report((done * 100 / total) as u8);
        }
        out.changed = Rect::EMPTY;
        Ok(out)
    }

    /// Re-encode in place into `target`.
    pub fn convert_to(&mut self, target: Arc<ColorSpace>) -> PaintResult<()> {
        let mut converted = self.converted(target, &crate::progress::NullProgress)?;
        converted.changed = self.extent().union(&self.changed);
        *self = converted;
        Ok(())
    }

    // ---- change tracking ------------------------------------------------------------------

    fn note_changed(&mut self, rect: Rect) {
        self.changed = self.changed.union(&rect);
    }

    /// Region touched since the last drain, without draining it.
    pub fn changed(&self) -> Rect {
        self.changed
    }

    /// Drain the changed region.
    pub fn take_changed(&mut self) -> Rect {
        std::mem::take(&mut self.changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colorspace::ColorSpaceRegistry;

    fn rgba8_device() -> PaintDevice {
        let reg = ColorSpaceRegistry::with_builtin();
        PaintDevice::new(reg.rgba8().unwrap())
    }

    #[test]
    fn read_after_write() {
        let mut dev = rgba8_device();
        for &(x, y) in &[(0, 0), (63, 63), (64, 0), (-1, -1), (-300, 517)] {
            let px = [x as u8, y as u8, 7, 200];
            dev.write(x, y, &px).unwrap();
            assert_eq!(dev.read(x, y), &px);
        }
    }

    #[test]
    fn untouched_device_is_default_and_unallocated() {
        let dev = rgba8_device();
        assert_eq!(dev.read(12345, -999), &[0, 0, 0, 0]);
        assert!(dev.extent().is_empty());
        assert_eq!(dev.tile_count(), 0);
    }

    #[test]
    fn write_allocates_tile_prefilled_with_default() {
        let reg = ColorSpaceRegistry::with_builtin();
        let mut dev = PaintDevice::with_default_pixel(reg.rgba8().unwrap(), &[1, 2, 3, 4]).unwrap();
        dev.write(5, 5, &[9, 9, 9, 9]).unwrap();
        assert_eq!(dev.tile_count(), 1);
        assert_eq!(dev.read(6, 5), &[1, 2, 3, 4]);
        assert_eq!(dev.extent(), Rect::new(0, 0, 64, 64));
    }

    #[test]
    fn write_rejects_wrong_pixel_size() {
        let mut dev = rgba8_device();
        let err = dev.write(0, 0, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, PaintError::InvalidPixel { expected: 4, got: 3, .. }));
        assert_eq!(dev.tile_count(), 0);
    }

    #[test]
    fn extent_covers_negative_tiles() {
        let mut dev = rgba8_device();
        dev.write(-1, -1, &[1, 1, 1, 1]).unwrap();
        dev.write(70, 3, &[1, 1, 1, 1]).unwrap();
        assert_eq!(dev.extent(), Rect::new(-64, -64, 192, 128));
    }

    #[test]
    fn clear_keeps_tiles() {
        let mut dev = rgba8_device();
        dev.fill(Rect::new(0, 0, 64, 64), &[255, 0, 0, 255]).unwrap();
        dev.clear(Rect::new(0, 0, 32, 64));
        assert_eq!(dev.tile_count(), 1);
        assert_eq!(dev.read(10, 10), &[0, 0, 0, 0]);
        assert_eq!(dev.read(40, 10), &[255, 0, 0, 255]);
        assert_eq!(dev.exact_bounds(), Rect::new(32, 0, 32, 64));
    }

    #[test]
    fn purge_drops_default_tiles() {
        let mut dev = rgba8_device();
        dev.fill(Rect::new(0, 0, 128, 64), &[5, 5, 5, 5]).unwrap();
        dev.clear(Rect::new(64, 0, 64, 64));
        assert_eq!(dev.purge_default_tiles(), 1);
        assert_eq!(dev.extent(), Rect::new(0, 0, 64, 64));
    }

    #[test]
    fn bytes_cross_tile_boundaries() {
        let mut dev = rgba8_device();
        let rect = Rect::new(60, -2, 8, 4);
        let data: Vec<u8> = (0..rect.area() as usize * 4).map(|i| i as u8).collect();
        dev.write_bytes(rect, &data).unwrap();
        assert_eq!(dev.tile_count(), 4);
        assert_eq!(dev.read_bytes(rect).unwrap(), data);
        assert_eq!(dev.read(61, -2), &data[4..8]);
    }

    #[test]
    fn write_bytes_checks_length() {
        let mut dev = rgba8_device();
        assert!(matches!(
            dev.write_bytes(Rect::new(0, 0, 2, 2), &[0; 3]),
            Err(PaintError::BufferSize { expected: 16, got: 3 })
        ));
    }

    #[test]
    fn changed_region_accumulates_and_drains() {
        let mut dev = rgba8_device();
        dev.write(1, 1, &[1, 1, 1, 1]).unwrap();
        dev.fill(Rect::new(10, 10, 5, 5), &[2, 2, 2, 2]).unwrap();
        assert_eq!(dev.take_changed(), Rect::new(1, 1, 14, 14));
        assert!(dev.take_changed().is_empty());
    }

    #[test]
    fn convert_to_gray_keeps_layout() {
        let reg = ColorSpaceRegistry::with_builtin();
        let mut dev = PaintDevice::new(reg.rgba8().unwrap());
        dev.write(3, 3, &[255, 255, 255, 255]).unwrap();
        dev.convert_to(reg.get("GRAYA8").unwrap()).unwrap();
        assert_eq!(dev.pixel_size(), 2);
        assert_eq!(dev.read(3, 3), &[255, 255]);
        assert_eq!(dev.read(4, 3), &[0, 0]);
        assert_eq!(dev.read(500, 500), &[0, 0]);
    }

    #[test]
    fn conversion_runs_in_batches_and_cancels_between_them() {
        let reg = ColorSpaceRegistry::with_builtin();
        let mut dev = rgba8_device();
        for i in 0..(CONVERT_BATCH as i32 + 1) {
            dev.write(i * TILE_SIZE, 5, &[255, 255, 255, 255]).unwrap();
        }
        let gray = reg.get("GRAYA8").unwrap();

        // The first batch passes its check, the second is refused
        let cancelled = dev.converted(Arc::clone(&gray), &crate::progress::CancelAfter::new(1));
        assert!(matches!(cancelled, Err(PaintError::Cancelled)));

        let out = dev.converted(gray, &crate::progress::NullProgress).unwrap();
        assert_eq!(out.tile_count(), CONVERT_BATCH + 1);
        assert_eq!(out.read(CONVERT_BATCH as i32 * TILE_SIZE, 5), &[255, 255]);
        assert!(out.changed().is_empty());
        assert_eq!(dev.pixel_size(), 4);
    }

    #[test]
    fn extent_at_the_coordinate_limit() {
        let mut dev = rgba8_device();
        dev.write(i32::MAX, 0, &[1, 2, 3, 4]).unwrap();
        let extent = dev.extent();
        assert_eq!(extent.x, i32::MAX - 63);
        assert_eq!(extent.right(), i32::MAX);
        assert_eq!(dev.read(i32::MAX, 0), &[1, 2, 3, 4]);
    }
}
