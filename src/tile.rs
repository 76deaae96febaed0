// ============================================================================
// TILE – fixed 64×64 square of raw pixel bytes
// ============================================================================

use crate::error::{PaintResult, try_alloc_bytes};
use crate::geometry::Rect;

pub const TILE_SIZE: i32 = 64;

/// Pixels in one tile.
pub const TILE_PIXELS: usize = (TILE_SIZE * TILE_SIZE) as usize;

/// Origin of the tile that contains coordinate `v` (floor division, so
/// `-1` maps to `-64`).
#[inline]
pub fn tile_origin(v: i32) -> i32 {
    v.div_euclid(TILE_SIZE) * TILE_SIZE
}

/// Tile key for pixel `(x, y)`.
#[inline]
pub fn tile_key(x: i32, y: i32) -> (i32, i32) {
    (tile_origin(x), tile_origin(y))
}

/// One allocated tile. The buffer is always complete: tiles are created
/// pre-filled with the owning device's default pixel.
#[derive(Clone, Debug, PartialEq)]
pub struct Tile {
    x: i32,
    y: i32,
    pixel_size: usize,
    data: Vec<u8>,
}

impl Tile {
    /// Allocate a tile at `(x, y)` filled with `pixel`. `(x, y)` must be
    /// tile-aligned.
    pub fn filled(x: i32, y: i32, pixel: &[u8]) -> PaintResult<Self> {
        debug_assert_eq!((x, y), tile_key(x, y), "unaligned tile origin");
        let pixel_size = pixel.len();
        let mut data = try_alloc_bytes(pixel_size * TILE_PIXELS)?;
        if pixel.iter().any(|&b| b != 0) {
            for px in data.chunks_exact_mut(pixel_size) {
                px.copy_from_slice(pixel);
            }
        }
        Ok(Self { x, y, pixel_size, data })
    }

    /// Wrap an existing buffer. Fails when the length is not a full tile.
    pub fn from_bytes(x: i32, y: i32, pixel_size: usize, data: Vec<u8>) -> Option<Self> {
        if data.len() != pixel_size * TILE_PIXELS || (x, y) != tile_key(x, y) {
            return None;
        }
        Some(Self { x, y, pixel_size, data })
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn y(&self) -> i32 {
        self.y
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, TILE_SIZE, TILE_SIZE)
    }

    pub fn pixel_size(&self) -> usize {
        self.pixel_size
    }

    /// Bytes per tile row.
    pub fn stride(&self) -> usize {
        self.pixel_size * TILE_SIZE as usize
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    #[inline]
    pub fn offset(&self, lx: usize, ly: usize) -> usize {
        (ly * TILE_SIZE as usize + lx) * self.pixel_size
    }

    #[inline]
    pub fn pixel(&self, lx: usize, ly: usize) -> &[u8] {
        let o = self.offset(lx, ly);
        &self.data[o..o + self.pixel_size]
    }

    #[inline]
    pub fn pixel_mut(&mut self, lx: usize, ly: usize) -> &mut [u8] {
        let o = self.offset(lx, ly);
        let ps = self.pixel_size;
        &mut self.data[o..o + ps]
    }

    /// Bytes of row `ly` starting at column `lx`.
    pub fn row_from(&self, lx: usize, ly: usize) -> &[u8] {
        let start = self.offset(lx, ly);
        let end = self.offset(0, ly) + self.stride();
        &self.data[start..end]
    }

    pub fn row_from_mut(&mut self, lx: usize, ly: usize) -> &mut [u8] {
        let start = self.offset(lx, ly);
        let end = self.offset(0, ly) + self.stride();
        &mut self.data[start..end]
    }

    /// Overwrite the tile-local rectangle `local` with `pixel`.
    pub fn fill_local(&mut self, local: Rect, pixel: &[u8]) {
        let local = local.intersect(&Rect::new(0, 0, TILE_SIZE, TILE_SIZE));
        if local.is_empty() {
            return;
        }
        for ly in local.y..local.bottom() {
            let row = self.row_from_mut(local.x as usize, ly as usize);
            for px in row
                .chunks_exact_mut(pixel.len())
                .take(local.width as usize)
            {
                px.copy_from_slice(pixel);
            }
        }
    }

    /// `true` when every pixel equals `pixel`.
    pub fn is_uniform(&self, pixel: &[u8]) -> bool {
        self.data.chunks_exact(self.pixel_size).all(|px| px == pixel)
    }

    pub fn memory_size(&self) -> usize {
        self.data.len()
    }
}
