//! Iterators over a [`PaintDevice`] that hide tile boundaries.
//!
//! All iterators borrow the device, so none can outlive a mutation.

use crate::geometry::Rect;
use crate::paint_device::PaintDevice;
use crate::tile::{TILE_SIZE, Tile, tile_key};

/// Contiguous runs of one row, split at tile boundaries. Each item is the
/// x coordinate of the first pixel and the bytes of the run.
pub struct RowRuns<'a> {
    device: &'a PaintDevice,
    x: i32,
    y: i32,
    end: i32,
}

impl<'a> RowRuns<'a> {
    pub(crate) fn new(device: &'a PaintDevice, x: i32, y: i32, width: i32) -> Self {
        Self {
            device,
            x,
            y,
            end: x.saturating_add(width.max(0)),
        }
    }
}

impl<'a> Iterator for RowRuns<'a> {
    type Item = (i32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.x >= self.end {
            return None;
        }
        let ps = self.device.pixel_size();
        let (tx, ty) = tile_key(self.x, self.y);
        let lx = (self.x - tx) as usize;
        let ly = (self.y - ty) as usize;
        let run = (tx + TILE_SIZE).min(self.end) - self.x;

        let data = self.device.tile_data_or_default(tx, ty);
        let start = (ly * TILE_SIZE as usize + lx) * ps;
        let bytes = &data[start..start + run as usize * ps];

        let at = self.x;
        self.x += run;
        Some((at, bytes))
    }
}

/// Pixel-by-pixel walk along a row.
pub struct RowIter<'a> {
    runs: RowRuns<'a>,
    current: &'a [u8],
    pixel_size: usize,
}

impl<'a> RowIter<'a> {
    pub(crate) fn new(runs: RowRuns<'a>, pixel_size: usize) -> Self {
        Self {
            runs,
            current: &[],
            pixel_size,
        }
    }
}

impl<'a> Iterator for RowIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_empty() {
            self.current = self.runs.next()?.1;
        }
        let (px, rest) = self.current.split_at(self.pixel_size);
        self.current = rest;
        Some(px)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.current.len() / self.pixel_size
            + (self.runs.end - self.runs.x).max(0) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for RowIter<'_> {}

/// Row-major walk over a rectangle, yielding `(x, y, pixel)`.
pub struct RectIter<'a> {
    device: &'a PaintDevice,
    rect: Rect,
    y: i32,
    row: Option<RowIter<'a>>,
    x: i32,
}

impl<'a> RectIter<'a> {
    pub(crate) fn new(device: &'a PaintDevice, rect: Rect) -> Self {
        Self {
            device,
            rect,
            y: rect.y,
            row: None,
            x: rect.x,
        }
    }
}

impl<'a> Iterator for RectIter<'a> {
    type Item = (i32, i32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rect.is_empty() {
            return None;
        }
        loop {
            if self.y >= self.rect.bottom() {
                return None;
            }
            let row = self.row.get_or_insert_with(|| {
                self.device.row_iter(self.rect.x, self.y, self.rect.width)
            });
            if let Some(px) = row.next() {
                let item = (self.x, self.y, px);
                self.x += 1;
                return Some(item);
            }
            self.row = None;
            self.y += 1;
            self.x = self.rect.x;
        }
    }
}

/// Point lookups that remember the last tile touched.
pub struct RandomAccessor<'a> {
    device: &'a PaintDevice,
    cached: Option<((i32, i32), Option<&'a Tile>)>,
    x: i32,
    y: i32,
}

impl<'a> RandomAccessor<'a> {
    pub(crate) fn new(device: &'a PaintDevice) -> Self {
        Self {
            device,
            cached: None,
            x: 0,
            y: 0,
        }
    }

    pub fn move_to(&mut self, x: i32, y: i32) {
        self.x = x;
        self.y = y;
    }

    /// Pixel at the current position.
    pub fn pixel(&mut self) -> &'a [u8] {
        let key = tile_key(self.x, self.y);
        let tile = match self.cached {
            Some((k, t)) if k == key => t,
            _ => {
                let t = self.device.tile(key.0, key.1);
                self.cached = Some((key, t));
                t
            }
        };
        match tile {
            Some(t) => t.pixel((self.x - key.0) as usize, (self.y - key.1) as usize),
            None => self.device.default_pixel(),
        }
    }

    pub fn pixel_at(&mut self, x: i32, y: i32) -> &'a [u8] {
        self.move_to(x, y);
        self.pixel()
    }
}

#[cfg(test)]
mod tests {
    use crate::colorspace::ColorSpaceRegistry;
    use crate::geometry::Rect;
    use crate::paint_device::PaintDevice;

    fn device() -> PaintDevice {
        let reg = ColorSpaceRegistry::with_builtin();
        PaintDevice::new(reg.get("GRAYA8").unwrap())
    }

    #[test]
    fn row_iter_crosses_tiles() {
        let mut dev = device();
        dev.write(63, 0, &[1, 255]).unwrap();
        dev.write(64, 0, &[2, 255]).unwrap();
        let row: Vec<&[u8]> = dev.row_iter(62, 0, 4).collect();
        assert_eq!(row.len(), 4);
        assert_eq!(row.concat(), vec![0, 0, 1, 255, 2, 255, 0, 0]);
    }

    #[test]
    fn row_iter_is_restartable_and_sized() {
        let dev = device();
        let it = dev.row_iter(-10, -10, 200);
        assert_eq!(it.len(), 200);
        assert_eq!(it.count(), 200);
        assert_eq!(dev.row_iter(-10, -10, 200).count(), 200);
    }

    #[test]
    fn zero_area_iterators_are_empty() {
        let dev = device();
        assert_eq!(dev.row_iter(0, 0, 0).count(), 0);
        assert_eq!(dev.row_iter(0, 0, -5).count(), 0);
        assert_eq!(dev.rect_iter(Rect::new(3, 3, 0, 9)).count(), 0);
    }

    #[test]
    fn rect_iter_visits_row_major() {
        let mut dev = device();
        dev.write(1, 1, &[9, 9]).unwrap();
        let coords: Vec<(i32, i32)> = dev
            .rect_iter(Rect::new(0, 0, 2, 2))
            .map(|(x, y, _)| (x, y))
            .collect();
        assert_eq!(coords, vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
        let last = dev.rect_iter(Rect::new(0, 0, 2, 2)).last().unwrap();
        assert_eq!(last.2, &[9, 9]);
    }

    #[test]
    fn random_accessor_matches_read() {
        let mut dev = device();
        dev.write(-70, 5, &[4, 4]).unwrap();
        let mut acc = dev.random_accessor();
        assert_eq!(acc.pixel_at(-70, 5), &[4, 4]);
        assert_eq!(acc.pixel_at(-69, 5), &[0, 0]);
        assert_eq!(acc.pixel_at(1000, 1000), &[0, 0]);
    }
}
