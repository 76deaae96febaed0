// ============================================================================
// DEVICE I/O: tiled byte stream and 8-bit RGBA bridge
// ============================================================================

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use bincode::Options;
use image::RgbaImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::colorspace::{ColorSpace, ColorSpaceRegistry};
use crate::error::{PaintError, PaintResult, try_alloc_bytes};
use crate::geometry::Rect;
use crate::paint_device::PaintDevice;
use crate::tile::{TILE_PIXELS, TILE_SIZE, Tile};

/// Magic of the sparse tiled device stream.
const DEVICE_MAGIC_V1: &str = "TSD1";

/// Upper bound on tiles in one stream; protects against crafted files.
const MAX_TILES: usize = 1 << 20;

/// Upper bound on bytes decoded from one stream, checked before any
/// length-prefixed allocation.
const MAX_STREAM_BYTES: u64 = 1 << 34;

/// Serializable device: header plus one record per allocated tile.
#[derive(Serialize, Deserialize)]
struct DeviceFileV1 {
    magic: String,
    color_space: String,
    default_pixel: Vec<u8>,
    tiles: Vec<TileData>,
}

/// A single serialisable tile (`TILE_SIZE² · pixel_size` bytes).
#[derive(Serialize, Deserialize)]
struct TileData {
    x: i32,
    y: i32,
    pixels: Vec<u8>,
}

/// Write `device` to `writer`. Tiles are emitted in row-major order so the
/// stream is deterministic.
pub fn write_device<W: Write>(writer: W, device: &PaintDevice) -> PaintResult<()> {
    let tiles = device
        .tile_keys()
        .into_iter()
        .filter_map(|(x, y)| device.tile(x, y))
        .map(|t| TileData {
            x: t.x(),
            y: t.y(),
            pixels: t.data().to_vec(),
        })
        .collect();
    let file = DeviceFileV1 {
        magic: DEVICE_MAGIC_V1.to_string(),
        color_space: device.color_space().id().to_string(),
        default_pixel: device.default_pixel().to_vec(),
        tiles,
    };
    bincode::serialize_into(writer, &file)?;
    Ok(())
}

/// Read a device written by [`write_device`]. The colour space is looked up
/// in `registry`; every tile is checked against it.
pub fn read_device<R: Read>(reader: R, registry: &ColorSpaceRegistry) -> PaintResult<PaintDevice> {
    let file: DeviceFileV1 = bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(MAX_STREAM_BYTES)
        .deserialize_from(reader)?;
    if file.magic != DEVICE_MAGIC_V1 {
        return Err(PaintError::invalid_argument(format!(
            "unknown device stream magic '{}'",
            file.magic
        )));
    }
    if file.tiles.len() > MAX_TILES {
        return Err(PaintError::invalid_argument(format!(
            "stream holds {} tiles, more than the maximum of {MAX_TILES}",
            file.tiles.len()
        )));
    }

    let cs = registry.get(&file.color_space)?;
    let ps = cs.pixel_size();
    let mut device = PaintDevice::with_default_pixel(Arc::clone(&cs), &file.default_pixel)?;
    let expected_tile_bytes = ps * TILE_PIXELS;

    for td in file.tiles {
        if td.x.rem_euclid(TILE_SIZE) != 0 || td.y.rem_euclid(TILE_SIZE) != 0 {
            return Err(PaintError::invalid_argument(format!(
                "tile ({},{}) is not on the tile grid",
                td.x, td.y
            )));
        }
        if device.has_tile(td.x, td.y) {
            return Err(PaintError::invalid_argument(format!(
                "tile ({},{}) appears twice",
                td.x, td.y
            )));
        }
        if td.pixels.len() != expected_tile_bytes {
            return Err(PaintError::BufferSize {
                expected: expected_tile_bytes,
                got: td.pixels.len(),
            });
        }
        let tile = Tile::from_bytes(td.x, td.y, ps, td.pixels)
            .ok_or_else(|| PaintError::allocation(expected_tile_bytes))?;
        device.insert_tile(tile)?;
    }
    device.take_changed();
    Ok(device)
}

pub fn save_device(path: &Path, device: &PaintDevice) -> PaintResult<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_device(&mut writer, device)?;
    writer.flush()?;
    Ok(())
}

pub fn load_device(path: &Path, registry: &ColorSpaceRegistry) -> PaintResult<PaintDevice> {
    let file = File::open(path)?;
    read_device(BufReader::new(file), registry)
}

// ============================================================================
// RGBA BRIDGE
// ============================================================================

/// Encode an 8-bit RGBA image into a new device in `cs`, placed at the
/// origin. Fully transparent tiles are not allocated.
pub fn device_from_rgba_image(img: &RgbaImage, cs: Arc<ColorSpace>) -> PaintResult<PaintDevice> {
    let (w, h) = (img.width() as i32, img.height() as i32);
    let mut device = PaintDevice::new(Arc::clone(&cs));
    let ps = cs.pixel_size();
    let raw = img.as_raw();
    let row_len = w as usize * 4;

    let tiles: Vec<Option<Tile>> = Rect::new(0, 0, w, h)
        .tile_origins()
        .par_iter()
        .map(|&(tx, ty)| {
            let part = Rect::new(0, 0, w, h).intersect(&Rect::new(tx, ty, TILE_SIZE, TILE_SIZE));
            let run = part.width as usize;
            // Everything the image does not cover is transparent
            let mut data = try_alloc_bytes(ps * TILE_PIXELS)?;
            let mut any_visible = false;
            for y in part.y..part.bottom() {
                let src = y as usize * row_len + part.x as usize * 4;
                let src = &raw[src..src + run * 4];
                any_visible |= src.chunks_exact(4).any(|px| px[3] != 0);
                let dst = ((y - ty) as usize * TILE_SIZE as usize + (part.x - tx) as usize) * ps;
                cs.from_rgba8(src, &mut data[dst..dst + run * ps], run);
            }
            if !any_visible {
                return Ok(None);
            }
            Tile::from_bytes(tx, ty, ps, data)
                .map(Some)
                .ok_or_else(|| PaintError::allocation(ps * TILE_PIXELS))
        })
        .collect::<PaintResult<_>>()?;

    for tile in tiles.into_iter().flatten() {
        device.insert_tile(tile)?;
    }
    device.take_changed();
    Ok(device)
}

/// Render `rect` of `device` as 8-bit RGBA.
pub fn device_to_rgba_image(device: &PaintDevice, rect: Rect) -> PaintResult<RgbaImage> {
    if rect.is_empty() {
        return Err(PaintError::invalid_argument("cannot render an empty rectangle"));
    }
    let bytes = device.read_bytes(rect)?;
    let count = rect.area() as usize;
    let mut rgba = try_alloc_bytes(count * 4)?;
    device.color_space().to_rgba8(&bytes, &mut rgba, count);
    RgbaImage::from_raw(rect.width as u32, rect.height as u32, rgba)
        .ok_or_else(|| PaintError::allocation(count * 4))
}

/// Decode any raster format the `image` crate understands into a device.
pub fn load_image_as_device(path: &Path, cs: Arc<ColorSpace>) -> PaintResult<PaintDevice> {
    let img = image::open(path)?.to_rgba8();
    tracing::debug!(path = %path.display(), width = img.width(), height = img.height(), "image decoded");
    device_from_rgba_image(&img, cs)
}

/// Save an RGBA bitmap; the format follows the file extension.
pub fn save_rgba(path: &Path, img: &RgbaImage) -> PaintResult<()> {
    img.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_round_trip_keeps_sparse_tiles() {
        let reg = ColorSpaceRegistry::with_builtin();
        let mut dev = PaintDevice::new(reg.get("RGBA16").unwrap());
        let px = reg.get("RGBA16").unwrap().pixel_from_rgba8([1, 2, 3, 4]);
        dev.write(-1, 70, &px).unwrap();
        dev.write(500, 0, &px).unwrap();

        let mut buf = Vec::new();
        write_device(&mut buf, &dev).unwrap();
        let back = read_device(buf.as_slice(), &reg).unwrap();

        assert_eq!(back.color_space().id(), "RGBA16");
        assert_eq!(back.tile_keys(), dev.tile_keys());
        assert_eq!(back.read(-1, 70), px.as_slice());
        assert!(back.changed().is_empty());
    }

    #[test]
    fn unknown_space_is_rejected() {
        let reg = ColorSpaceRegistry::with_builtin();
        let dev = PaintDevice::new(reg.rgba8().unwrap());
        let mut buf = Vec::new();
        write_device(&mut buf, &dev).unwrap();
        let empty = ColorSpaceRegistry::new();
        assert!(matches!(
            read_device(buf.as_slice(), &empty),
            Err(PaintError::UnknownColorSpace(_))
        ));
    }

    #[test]
    fn truncated_stream_fails() {
        let reg = ColorSpaceRegistry::with_builtin();
        let mut dev = PaintDevice::new(reg.rgba8().unwrap());
        dev.write(0, 0, &[1, 1, 1, 1]).unwrap();
        let mut buf = Vec::new();
        write_device(&mut buf, &dev).unwrap();
        buf.truncate(buf.len() / 2);
        assert!(matches!(
            read_device(buf.as_slice(), &reg),
            Err(PaintError::Serialize(_))
        ));
    }

    #[test]
    fn rgba_bridge_skips_transparent_tiles() {
        let reg = ColorSpaceRegistry::with_builtin();
        let mut img = RgbaImage::new(130, 10);
        img.put_pixel(129, 9, image::Rgba([9, 8, 7, 255]));
        let dev = device_from_rgba_image(&img, reg.rgba8().unwrap()).unwrap();
        assert_eq!(dev.tile_keys(), vec![(128, 0)]);
        assert_eq!(dev.read(129, 9), &[9, 8, 7, 255]);

        let out = device_to_rgba_image(&dev, Rect::new(0, 0, 130, 10)).unwrap();
        assert_eq!(out, img);
    }
}
