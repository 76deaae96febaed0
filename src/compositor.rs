// ============================================================================
// IMAGE: layer stack, dirty tracking and the tiled projection
// ============================================================================
//
// The projection is rebuilt tile by tile. Each output tile starts from the
// background and every contributing layer is blended into it bottom to top,
// groups being composed into a scratch tile first. Tiles are composed in
// parallel and committed only once the whole dirty region is done, so a
// cancelled or failed flush never leaves a half-updated projection.
// ============================================================================

use std::sync::Arc;

use image::RgbaImage;
use rayon::prelude::*;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adjustment::Filter;
use crate::colorspace::{
    BlendOp, ColorManagement, ColorModel, ColorSpace, CompositeArgs, DisplayTransform, Profile,
};
use crate::composite_op::CompositeOp;
use crate::config::{Background, EngineSettings};
use crate::error::{PaintError, PaintResult, try_alloc_bytes};
use crate::geometry::Rect;
use crate::history::{History, Mutation, PixelPatch, Replay, SharedHistory, UndoRecorder};
use crate::layer::{Layer, LayerId, LayerKind, LayerTree};
use crate::paint_device::PaintDevice;
use crate::progress::{NullProgress, ProgressReporter};
use crate::tile::{TILE_PIXELS, TILE_SIZE, Tile};

const TILE_STRIDE_PIXELS: usize = TILE_SIZE as usize;

/// A document: fixed bounds, a colour space, a layer tree and the cached
/// projection of that tree.
pub struct Image {
    id: Uuid,
    width: u32,
    height: u32,
    color_space: Arc<ColorSpace>,
    tree: LayerTree,
    projection: PaintDevice,
    /// Region whose projection is stale (image coordinates).
    dirty: Rect,
    settings: EngineSettings,
    recorder: Option<Box<dyn UndoRecorder>>,
}

impl Image {
    pub fn new(width: u32, height: u32, color_space: Arc<ColorSpace>) -> PaintResult<Self> {
        Self::with_settings(width, height, color_space, EngineSettings::default())
    }

    pub fn with_settings(
        width: u32,
        height: u32,
        color_space: Arc<ColorSpace>,
        settings: EngineSettings,
    ) -> PaintResult<Self> {
        if width == 0 || height == 0 || width > i32::MAX as u32 || height > i32::MAX as u32 {
            return Err(PaintError::invalid_argument(format!(
                "image size {width}x{height} is out of range"
            )));
        }
        if color_space.alpha_index().is_none() {
            return Err(PaintError::invalid_argument(format!(
                "image colour space {} has no alpha channel",
                color_space.id()
            )));
        }
        let image = Self {
            id: Uuid::new_v4(),
            width,
            height,
            projection: PaintDevice::new(Arc::clone(&color_space)),
            color_space,
            tree: LayerTree::new(),
            dirty: Rect::new(0, 0, width as i32, height as i32),
            settings,
            recorder: None,
        };
        debug!(image = %image.id, width, height, space = image.color_space.id(), "image created");
        Ok(image)
    }

    // ---- accessors -----------------------------------------------------------------

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width as i32, self.height as i32)
    }

    pub fn color_space(&self) -> &Arc<ColorSpace> {
        &self.color_space
    }

    pub fn tree(&self) -> &LayerTree {
        &self.tree
    }

    pub fn root(&self) -> LayerId {
        self.tree.root()
    }

    pub fn layer(&self, id: LayerId) -> PaintResult<&Layer> {
        self.tree.get(id)
    }

    pub fn paint_device(&self, id: LayerId) -> PaintResult<&PaintDevice> {
        self.tree
            .get(id)?
            .as_paint_device()
            .ok_or(PaintError::NotAPaintLayer(id))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn set_background(&mut self, background: Background) {
        if self.settings.background != background {
            self.settings.background = background;
            self.mark_dirty(None);
        }
    }

    /// Route every recorded mutation to `recorder`.
    pub fn set_recorder(&mut self, recorder: Box<dyn UndoRecorder>) {
        self.recorder = Some(recorder);
    }

    /// Record into a fresh history bounded by the engine settings and hand
    /// back the shared handle for undo and redo.
    pub fn attach_history(&mut self) -> SharedHistory {
        let history = History::from_settings(&self.settings).shared();
        self.recorder = Some(Box::new(Arc::clone(&history)));
        history
    }

    pub fn take_recorder(&mut self) -> Option<Box<dyn UndoRecorder>> {
        self.recorder.take()
    }

    fn record(&mut self, mutation: Mutation) {
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(mutation);
        }
    }

    /// Bytes held by layer devices and the projection.
    pub fn memory_size(&self) -> usize {
        let layers: usize = self
            .tree
            .descendants(self.tree.root())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| self.tree.get(id).ok())
            .map(|l| match &l.kind {
                LayerKind::Paint { device } => device.memory_size(),
                LayerKind::Adjustment { mask: Some(m), .. } => m.memory_size(),
                _ => 0,
            })
            .sum();
        layers + self.projection.memory_size()
    }

    // ---- dirty tracking --------------------------------------------------------------

    /// Mark `rect` (image coordinates) stale; `None` marks everything.
    pub fn mark_dirty(&mut self, rect: Option<Rect>) {
        let rect = rect.unwrap_or_else(|| self.bounds());
        // Merge with the existing region so no pending update is lost
        self.dirty = self.dirty.union(&rect);
    }

    pub fn dirty_rect(&self) -> Rect {
        self.dirty.intersect(&self.bounds())
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty_rect().is_empty()
    }

    fn mark_layer_dirty(&mut self, id: LayerId) -> PaintResult<()> {
        let extent = self.tree.extent(id)?;
        self.mark_dirty(Some(extent));
        Ok(())
    }

    // ---- structure ---------------------------------------------------------------------

    fn validate_layer(&self, layer: &Layer) -> PaintResult<()> {
        self.check_op(layer.composite_op)?;
        match &layer.kind {
            LayerKind::Paint { device } => self.check_device(device),
            LayerKind::Adjustment { mask: Some(mask), .. } => check_mask(mask),
            _ => Ok(()),
        }
    }

    fn check_op(&self, op: CompositeOp) -> PaintResult<()> {
        if self.color_space.supports(op) {
            Ok(())
        } else {
            Err(PaintError::UnsupportedCompositeOp {
                op: op.id(),
                space: self.color_space.id().to_string(),
            })
        }
    }

    fn check_device(&self, device: &PaintDevice) -> PaintResult<()> {
        if device.color_space().same_format(&self.color_space) {
            Ok(())
        } else {
            Err(PaintError::format_mismatch(
                self.color_space.id(),
                device.color_space().id(),
            ))
        }
    }

    /// Insert `layer` into group `parent` at `index` (0 = bottom, `None` =
    /// top). Paint devices must share the image's pixel format.
    pub fn add_layer(&mut self, parent: LayerId, index: Option<usize>, layer: Layer) -> PaintResult<LayerId> {
        self.validate_layer(&layer)?;
        let id = self.tree.insert(parent, index, layer)?;
        self.mark_layer_dirty(id)?;
        debug!(layer = %id, parent = %parent, "layer added");
        Ok(id)
    }

    /// Convenience: empty paint layer on top of the root group.
    pub fn add_paint_layer(&mut self, name: impl Into<String>) -> PaintResult<LayerId> {
        let device = PaintDevice::new(Arc::clone(&self.color_space));
        self.add_layer(self.tree.root(), None, Layer::paint(name, device))
    }

    pub fn remove_layer(&mut self, id: LayerId) -> PaintResult<Layer> {
        let extent = self.tree.extent(id)?;
        let layer = self.tree.remove(id)?;
        self.mark_dirty(Some(extent));
        debug!(layer = %id, "layer removed");
        Ok(layer)
    }

    pub fn move_layer(&mut self, id: LayerId, new_parent: LayerId, index: Option<usize>) -> PaintResult<()> {
        let before = self.tree.extent(id)?;
        self.tree.move_layer(id, new_parent, index)?;
        let after = self.tree.extent(id)?;
        self.mark_dirty(Some(before.union(&after)));
        Ok(())
    }

    // ---- layer properties ----------------------------------------------------------------

    pub fn set_offset(&mut self, id: LayerId, x: i32, y: i32) -> PaintResult<()> {
        let before = self.tree.extent(id)?;
        let layer = self.tree.get_mut(id)?;
        let old = (layer.offset_x, layer.offset_y);
        if old == (x, y) {
            return Ok(());
        }
        layer.offset_x = x;
        layer.offset_y = y;
        let after = self.tree.extent(id)?;
        self.mark_dirty(Some(before.union(&after)));
        self.record(Mutation::Offset { layer: id, old, new: (x, y) });
        Ok(())
    }

    /// Translate `id` and every layer linked with it.
    pub fn move_by(&mut self, id: LayerId, dx: i32, dy: i32) -> PaintResult<()> {
        for linked in self.tree.linked_with(id)? {
            let layer = self.tree.get(linked)?;
            let (x, y) = (layer.offset_x.saturating_add(dx), layer.offset_y.saturating_add(dy));
            self.set_offset(linked, x, y)?;
        }
        Ok(())
    }

    pub fn set_opacity(&mut self, id: LayerId, opacity: u8) -> PaintResult<()> {
        let layer = self.tree.get_mut(id)?;
        let old = layer.opacity;
        if old == opacity {
            return Ok(());
        }
        layer.opacity = opacity;
        self.mark_layer_dirty(id)?;
        self.record(Mutation::Opacity { layer: id, old, new: opacity });
        Ok(())
    }

    pub fn set_composite_op(&mut self, id: LayerId, op: CompositeOp) -> PaintResult<()> {
        self.check_op(op)?;
        let layer = self.tree.get_mut(id)?;
        let old = layer.composite_op;
        if old == op {
            return Ok(());
        }
        layer.composite_op = op;
        self.mark_layer_dirty(id)?;
        self.record(Mutation::CompositeOp { layer: id, old, new: op });
        Ok(())
    }

    pub fn set_visible(&mut self, id: LayerId, visible: bool) -> PaintResult<()> {
        let layer = self.tree.get_mut(id)?;
        let old = layer.visible;
        if old == visible {
            return Ok(());
        }
        layer.visible = visible;
        self.mark_layer_dirty(id)?;
        self.record(Mutation::Visibility { layer: id, old, new: visible });
        Ok(())
    }

    /// Locked layers are kept out of the projection.
    pub fn set_locked(&mut self, id: LayerId, locked: bool) -> PaintResult<()> {
        let layer = self.tree.get_mut(id)?;
        let old = layer.locked;
        if old == locked {
            return Ok(());
        }
        layer.locked = locked;
        self.mark_layer_dirty(id)?;
        self.record(Mutation::Lock { layer: id, old, new: locked });
        Ok(())
    }

    pub fn set_linked(&mut self, id: LayerId, linked: bool) -> PaintResult<()> {
        let layer = self.tree.get_mut(id)?;
        let old = layer.linked;
        if old == linked {
            return Ok(());
        }
        layer.linked = linked;
        self.record(Mutation::Link { layer: id, old, new: linked });
        Ok(())
    }

    pub fn rename(&mut self, id: LayerId, name: impl Into<String>) -> PaintResult<()> {
        let name = name.into();
        let layer = self.tree.get_mut(id)?;
        if layer.name == name {
            return Ok(());
        }
        let old = std::mem::replace(&mut layer.name, name.clone());
        self.record(Mutation::Rename { layer: id, old, new: name });
        Ok(())
    }

    pub fn set_filter(&mut self, id: LayerId, filter: Filter) -> PaintResult<()> {
        let layer = self.tree.get_mut(id)?;
        let LayerKind::Adjustment { filter: current, .. } = &mut layer.kind else {
            return Err(PaintError::invalid_argument(format!("layer {id} is not an adjustment layer")));
        };
        if *current == filter {
            return Ok(());
        }
        let old = std::mem::replace(current, filter.clone());
        self.mark_layer_dirty(id)?;
        self.record(Mutation::Filter { layer: id, old, new: filter });
        Ok(())
    }

    /// Limit an adjustment layer to an `ALPHA8` mask (layer coordinates).
    pub fn set_adjustment_mask(&mut self, id: LayerId, mask: Option<PaintDevice>) -> PaintResult<()> {
        if let Some(m) = &mask {
            check_mask(m)?;
        }
        let layer = self.tree.get_mut(id)?;
        let LayerKind::Adjustment { mask: current, .. } = &mut layer.kind else {
            return Err(PaintError::invalid_argument(format!("layer {id} is not an adjustment layer")));
        };
        *current = mask;
        self.mark_layer_dirty(id)
    }

    // ---- pixel editing ---------------------------------------------------------------------

    /// Run `f` against the device of paint layer `id`. Whatever the device
    /// reports as changed is marked dirty, even when `f` fails. Not recorded.
    pub fn edit_paint_device<R>(
        &mut self,
        id: LayerId,
        f: impl FnOnce(&mut PaintDevice) -> PaintResult<R>,
    ) -> PaintResult<R> {
        let (ox, oy) = self.tree.absolute_offset(id)?;
        let device = self
            .tree
            .get_mut(id)?
            .as_paint_device_mut()
            .ok_or(PaintError::NotAPaintLayer(id))?;
        let result = f(device);
        let changed = device.take_changed();
        let format_kept = device.color_space().same_format(&self.color_space);
        let found = device.color_space().id().to_string();
        if !changed.is_empty() {
            self.mark_dirty(Some(changed.translated(ox, oy)));
        }
        if !format_kept {
            return Err(PaintError::format_mismatch(self.color_space.id(), found));
        }
        result
    }

    /// Like [`edit_paint_device`](Self::edit_paint_device), recording the
    /// before/after bytes of `rect` (layer coordinates) as one undo step.
    pub fn edit_region<R>(
        &mut self,
        id: LayerId,
        rect: Rect,
        f: impl FnOnce(&mut PaintDevice) -> PaintResult<R>,
    ) -> PaintResult<R> {
        let before = self.paint_device(id)?.read_bytes(rect)?;
        let result = self.edit_paint_device(id, f)?;
        let after = self.paint_device(id)?.read_bytes(rect)?;
        if before != after {
            self.record(Mutation::Pixels(PixelPatch { layer: id, rect, before, after }));
        }
        Ok(result)
    }

    /// Swap the whole device of paint layer `id`, returning the old one.
    pub fn replace_paint_device(&mut self, id: LayerId, device: PaintDevice) -> PaintResult<PaintDevice> {
        self.check_device(&device)?;
        let before = self.tree.extent(id)?;
        let slot = self
            .tree
            .get_mut(id)?
            .as_paint_device_mut()
            .ok_or(PaintError::NotAPaintLayer(id))?;
        let old = std::mem::replace(slot, device);
        let after = self.tree.extent(id)?;
        self.mark_dirty(Some(before.union(&after)));
        Ok(old)
    }

    /// Change the image bounds. Layer pixels are kept where they are.
    pub fn resize_canvas(&mut self, width: u32, height: u32) -> PaintResult<()> {
        if width == 0 || height == 0 || width > i32::MAX as u32 || height > i32::MAX as u32 {
            return Err(PaintError::invalid_argument(format!(
                "image size {width}x{height} is out of range"
            )));
        }
        self.width = width;
        self.height = height;
        self.projection = PaintDevice::new(Arc::clone(&self.color_space));
        self.dirty = self.bounds();
        Ok(())
    }

    // ---- replay --------------------------------------------------------------------------

    /// Restore one side of `mutation` without recording anything.
    pub fn apply_mutation(&mut self, mutation: &Mutation, replay: Replay) -> PaintResult<()> {
        let recorder = self.recorder.take();
        let result = self.apply_unrecorded(mutation, replay);
        self.recorder = recorder;
        result
    }

    fn apply_unrecorded(&mut self, mutation: &Mutation, replay: Replay) -> PaintResult<()> {
        fn pick<T: Clone>(replay: Replay, old: &T, new: &T) -> T {
            match replay {
                Replay::Undo => old.clone(),
                Replay::Redo => new.clone(),
            }
        }
        match mutation {
            Mutation::Offset { layer, old, new } => {
                let (x, y) = pick(replay, old, new);
                self.set_offset(*layer, x, y)
            }
            Mutation::Opacity { layer, old, new } => self.set_opacity(*layer, pick(replay, old, new)),
            Mutation::CompositeOp { layer, old, new } => {
                self.set_composite_op(*layer, pick(replay, old, new))
            }
            Mutation::Visibility { layer, old, new } => self.set_visible(*layer, pick(replay, old, new)),
            Mutation::Lock { layer, old, new } => self.set_locked(*layer, pick(replay, old, new)),
            Mutation::Link { layer, old, new } => self.set_linked(*layer, pick(replay, old, new)),
            Mutation::Rename { layer, old, new } => self.rename(*layer, pick(replay, old, new)),
            Mutation::Filter { layer, old, new } => self.set_filter(*layer, pick(replay, old, new)),
            Mutation::Pixels(patch) => {
                let bytes = match replay {
                    Replay::Undo => &patch.before,
                    Replay::Redo => &patch.after,
                };
                self.edit_paint_device(patch.layer, |dev| dev.write_bytes(patch.rect, bytes))
            }
        }
    }

    // ---- colour space ------------------------------------------------------------------------

    /// Re-encode every layer and the projection into `target`. Nothing
    /// changes unless every device converts.
    pub fn convert_to(&mut self, target: Arc<ColorSpace>, progress: &dyn ProgressReporter) -> PaintResult<()> {
        if target.alpha_index().is_none() {
            return Err(PaintError::invalid_argument(format!(
                "image colour space {} has no alpha channel",
                target.id()
            )));
        }
        let ids = self.tree.descendants(self.tree.root())?;
        for &id in &ids {
            let op = self.tree.get(id)?.composite_op;
            if !target.supports(op) {
                return Err(PaintError::UnsupportedCompositeOp {
                    op: op.id(),
                    space: target.id().to_string(),
                });
            }
        }
        let mut converted = Vec::new();
        for id in self.tree.paint_layers(self.tree.root())? {
            let device = self.paint_device(id)?.converted(Arc::clone(&target), progress)?;
            converted.push((id, device));
        }
        for (id, device) in converted {
            if let Some(slot) = self.tree.get_mut(id)?.as_paint_device_mut() {
                *slot = device;
            }
        }
        info!(image = %self.id, from = self.color_space.id(), to = target.id(), "colour space converted");
        self.projection = PaintDevice::new(Arc::clone(&target));
        self.color_space = target;
        self.mark_dirty(None);
        Ok(())
    }

    // ---- projection ------------------------------------------------------------------------------

    /// Last committed projection (may be stale while dirty).
    pub fn projection(&self) -> &PaintDevice {
        &self.projection
    }

    /// Recompose the dirty region and return the projection.
    pub fn flush(&mut self) -> PaintResult<&PaintDevice> {
        self.flush_with_progress(&NullProgress)
    }

    /// [`flush`](Self::flush) with progress reports and cancellation between
    /// tile batches. On `Cancelled` the projection and the dirty region are
    /// left exactly as they were.
    #[tracing::instrument(level = "debug", skip_all, fields(image = %self.id))]
    pub fn flush_with_progress(&mut self, progress: &dyn ProgressReporter) -> PaintResult<&PaintDevice> {
        let region = self.dirty_rect();
        if region.is_empty() {
            self.dirty = Rect::EMPTY;
            return Ok(&self.projection);
        }

        let keys = region.tile_origins();
        let background = BackgroundFill::new(&self.settings.background, &self.color_space);
        let composer = Composer {
            tree: &self.tree,
            cs: &self.color_space,
            background: &background,
        };

        let batch = self.settings.tile_batch.max(1);
        let mut composed = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(batch) {
            if progress.is_cancelled() {
                debug!(done = composed.len(), total = keys.len(), "flush cancelled");
                return Err(PaintError::Cancelled);
            }
            let tiles: Vec<Tile> = if self.settings.parallel {
                chunk
                    .par_iter()
                    .map(|&(tx, ty)| composer.compose_tile(tx, ty))
                    .collect::<PaintResult<_>>()?
            } else {
                chunk
                    .iter()
                    .map(|&(tx, ty)| composer.compose_tile(tx, ty))
                    .collect::<PaintResult<_>>()?
            };
            composed.extend(tiles);
            progress.report((composed.len() * 100 / keys.len()) as u8);
        }

        let count = composed.len();
        for tile in composed {
            self.projection.insert_tile(tile)?;
        }
        self.projection.take_changed();
        self.dirty = Rect::EMPTY;
        debug!(tiles = count, region = %region, "projection updated");
        Ok(&self.projection)
    }

    /// Flush, then render the whole image as 8-bit RGBA through the
    /// optional display transform.
    pub fn flush_to_display_bitmap(
        &mut self,
        transform: Option<&dyn DisplayTransform>,
    ) -> PaintResult<RgbaImage> {
        self.flush()?;
        self.display_bitmap(transform)
    }

    /// Flush, then render for a display tagged with `display`, letting the
    /// colour-management module map from the image's own profile.
    pub fn flush_to_managed_bitmap(
        &mut self,
        cms: &dyn ColorManagement,
        display: &Profile,
    ) -> PaintResult<RgbaImage> {
        self.flush()?;
        let cs = Arc::clone(&self.color_space);
        let transform = cms.display_transform(&cs, cs.profile(), display);
        if transform.is_none() {
            let display_name = display.name();
            debug!(space = cs.id(), display = display_name, "no display transform, rendering untagged");
        }
        self.display_bitmap(transform.as_deref())
    }

    /// Render the current projection without flushing.
    pub fn display_bitmap(&self, transform: Option<&dyn DisplayTransform>) -> PaintResult<RgbaImage> {
        let (w, h) = (self.width as usize, self.height as usize);
        let row_len = w * 4;
        let mut buf = try_alloc_bytes(row_len * h)?;
        let projection = &self.projection;
        let cs = &*self.color_space;
        let ps = cs.pixel_size();

        buf.par_chunks_mut(row_len).enumerate().for_each(|(y, row)| {
            let mut at = 0;
            for (_, run) in projection.row_runs(0, y as i32, w as i32) {
                let n = run.len() / ps;
                cs.to_display(run, &mut row[at..at + n * 4], n, transform);
                at += n * 4;
            }
        });

        RgbaImage::from_raw(self.width, self.height, buf)
            .ok_or_else(|| PaintError::allocation(row_len * h))
    }
}

fn check_mask(mask: &PaintDevice) -> PaintResult<()> {
    let cs = mask.color_space();
    if cs.model() == ColorModel::Alpha && cs.pixel_size() == 1 {
        Ok(())
    } else {
        Err(PaintError::format_mismatch("ALPHA8", cs.id()))
    }
}

// ============================================================================
// TILE COMPOSITION
// ============================================================================

/// Background of the projection, pre-encoded in the image colour space.
enum BackgroundFill {
    Uniform(Vec<u8>),
    Checker { size: i32, light: Vec<u8>, dark: Vec<u8> },
}

impl BackgroundFill {
    fn new(background: &Background, cs: &ColorSpace) -> Self {
        match *background {
            Background::Transparent => BackgroundFill::Uniform(vec![0; cs.pixel_size()]),
            Background::Solid { rgba } => BackgroundFill::Uniform(cs.pixel_from_rgba8(rgba)),
            Background::Checkerboard { size, light, dark } => BackgroundFill::Checker {
                size: size.clamp(1, i32::MAX as u32) as i32,
                light: cs.pixel_from_rgba8(light),
                dark: cs.pixel_from_rgba8(dark),
            },
        }
    }

    /// All-zero background: nothing to lay the layers on.
    fn is_clear(&self) -> bool {
        matches!(self, BackgroundFill::Uniform(px) if px.iter().all(|&b| b == 0))
    }

    fn fill_tile(&self, tx: i32, ty: i32, pixel_size: usize) -> PaintResult<Vec<u8>> {
        let mut data = try_alloc_bytes(pixel_size * TILE_PIXELS)?;
        match self {
            BackgroundFill::Uniform(px) => {
                if px.iter().any(|&b| b != 0) {
                    for dst in data.chunks_exact_mut(pixel_size) {
                        dst.copy_from_slice(px);
                    }
                }
            }
            BackgroundFill::Checker { size, light, dark } => {
                for (i, dst) in data.chunks_exact_mut(pixel_size).enumerate() {
                    let x = tx + (i % TILE_STRIDE_PIXELS) as i32;
                    let y = ty + (i / TILE_STRIDE_PIXELS) as i32;
                    let cell = (x.div_euclid(*size) + y.div_euclid(*size)).rem_euclid(2);
                    dst.copy_from_slice(if cell == 0 { light } else { dark });
                }
            }
        }
        Ok(data)
    }
}

/// Read-only view of everything a tile needs; shared across worker threads.
struct Composer<'a> {
    tree: &'a LayerTree,
    cs: &'a ColorSpace,
    background: &'a BackgroundFill,
}

impl Composer<'_> {
    fn stride(&self) -> usize {
        TILE_STRIDE_PIXELS * self.cs.pixel_size()
    }

    /// Layers are composed over transparency, then laid on the background.
    /// Adjustment layers never see the background.
    fn compose_tile(&self, tx: i32, ty: i32) -> PaintResult<Tile> {
        let ps = self.cs.pixel_size();
        let mut layers = try_alloc_bytes(ps * TILE_PIXELS)?;
        let tile_rect = Rect::new(tx, ty, TILE_SIZE, TILE_SIZE);
        self.compose_group(self.tree.root(), (0, 0), tile_rect, &mut layers)?;

        let out = if self.background.is_clear() {
            layers
        } else {
            let mut out = self.background.fill_tile(tx, ty, ps)?;
            let stride = self.stride();
            self.cs.composite_op(CompositeOp::Over)?.apply(&mut CompositeArgs {
                dst: &mut out,
                dst_stride: stride,
                src: &layers,
                src_stride: stride,
                mask: None,
                rows: TILE_SIZE as usize,
                cols: TILE_SIZE as usize,
                opacity: u8::MAX,
            })?;
            out
        };
        Tile::from_bytes(tx, ty, ps, out).ok_or_else(|| PaintError::allocation(ps * TILE_PIXELS))
    }

    /// Blend the children of `group` into `acc`, bottom first. `origin` is
    /// the accumulated offset of `group`.
    fn compose_group(
        &self,
        group: LayerId,
        origin: (i32, i32),
        tile_rect: Rect,
        acc: &mut [u8],
    ) -> PaintResult<()> {
        for &child in self.tree.children(group)? {
            let layer = self.tree.get(child)?;
            if !layer.contributes() {
                continue;
            }
            let blend = match self.cs.composite_op(layer.composite_op) {
                Ok(b) => b,
                Err(e) => {
                    debug_assert!(false, "unsupported op reached the compositor: {e}");
                    warn!(layer = %layer.name, error = %e, "skipping layer");
                    continue;
                }
            };
            let origin = (
                origin.0.saturating_add(layer.offset_x),
                origin.1.saturating_add(layer.offset_y),
            );
            match &layer.kind {
                LayerKind::Paint { device } => {
                    if !device.color_space().same_format(self.cs) {
                        warn!(layer = %layer.name, space = device.color_space().id(), "skipping layer in foreign format");
                        continue;
                    }
                    self.blend_device(device, origin, tile_rect, acc, &blend, layer.opacity)?;
                }
                LayerKind::Group => {
                    if !self.tree.extent(child)?.intersects(&tile_rect) {
                        continue;
                    }
                    let mut scratch = try_alloc_bytes(acc.len())?;
                    self.compose_group(child, origin, tile_rect, &mut scratch)?;
                    let stride = self.stride();
                    blend.apply(&mut CompositeArgs {
                        dst: acc,
                        dst_stride: stride,
                        src: &scratch,
                        src_stride: stride,
                        mask: None,
                        rows: TILE_SIZE as usize,
                        cols: TILE_SIZE as usize,
                        opacity: layer.opacity,
                    })?;
                }
                LayerKind::Adjustment { filter, mask } => {
                    self.apply_adjustment(filter, mask.as_ref(), origin, tile_rect, acc, &blend, layer.opacity)?;
                }
            }
        }
        Ok(())
    }

    /// Blend the part of `device` (placed at `origin`) that overlaps
    /// `tile_rect`, one source tile at a time.
    fn blend_device(
        &self,
        device: &PaintDevice,
        (ox, oy): (i32, i32),
        tile_rect: Rect,
        acc: &mut [u8],
        blend: &BlendOp<'_>,
        opacity: u8,
    ) -> PaintResult<()> {
        let area = device.extent().translated(ox, oy).intersect(&tile_rect);
        if area.is_empty() {
            return Ok(());
        }
        let ps = self.cs.pixel_size();
        let stride = self.stride();
        let src_area = area.translated(ox.saturating_neg(), oy.saturating_neg());

        for (sx, sy) in src_area.tile_origins() {
            let part = src_area.intersect(&Rect::new(sx, sy, TILE_SIZE, TILE_SIZE));
            if part.is_empty() {
                continue;
            }
            let src = device.tile_data_or_default(sx, sy);
            let src_off = ((part.y - sy) as usize * TILE_STRIDE_PIXELS + (part.x - sx) as usize) * ps;
            let dx = i64::from(part.x) + i64::from(ox) - i64::from(tile_rect.x);
            let dy = i64::from(part.y) + i64::from(oy) - i64::from(tile_rect.y);
            // Only possible when an edge saturated at the coordinate limit
            if dx < 0
                || dy < 0
                || dx + i64::from(part.width) > i64::from(TILE_SIZE)
                || dy + i64::from(part.height) > i64::from(TILE_SIZE)
            {
                continue;
            }
            let (dx, dy) = (dx as usize, dy as usize);
            let dst_off = (dy * TILE_STRIDE_PIXELS + dx) * ps;
            blend.apply(&mut CompositeArgs {
                dst: &mut acc[dst_off..],
                dst_stride: stride,
                src: &src[src_off..],
                src_stride: stride,
                mask: None,
                rows: part.height as usize,
                cols: part.width as usize,
                opacity,
            })?;
        }
        Ok(())
    }

    /// Filter what lies beneath in `acc`, then blend the filtered copy back
    /// with the layer's op, opacity and mask. Alpha is left unchanged.
    #[allow(clippy::too_many_arguments)]
    fn apply_adjustment(
        &self,
        filter: &Filter,
        mask: Option<&PaintDevice>,
        (ox, oy): (i32, i32),
        tile_rect: Rect,
        acc: &mut [u8],
        blend: &BlendOp<'_>,
        opacity: u8,
    ) -> PaintResult<()> {
        let cs = self.cs;
        let stride = self.stride();

        let mut filtered = try_alloc_bytes(acc.len())?;
        filtered.copy_from_slice(acc);
        filter.apply_pixels(cs, &mut filtered, TILE_PIXELS);
        let mut work = try_alloc_bytes(acc.len())?;
        work.copy_from_slice(acc);

        // Blend as if opaque so the op sees colour only
        cs.set_alpha(&mut filtered, u8::MAX, TILE_PIXELS);
        cs.set_alpha(&mut work, u8::MAX, TILE_PIXELS);

        let mask_bytes = match mask {
            Some(m) => Some(m.read_bytes(tile_rect.translated(ox.saturating_neg(), oy.saturating_neg()))?),
            None => None,
        };
        blend.apply(&mut CompositeArgs {
            dst: &mut work,
            dst_stride: stride,
            src: &filtered,
            src_stride: stride,
            mask: mask_bytes.as_deref().map(|m| (m, TILE_STRIDE_PIXELS)),
            rows: TILE_SIZE as usize,
            cols: TILE_SIZE as usize,
            opacity,
        })?;

        cs.copy_alpha(acc, &mut work, TILE_PIXELS);
        acc.copy_from_slice(&work);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colorspace::{ChannelDepth, ColorSpaceRegistry};
    use crate::progress::{CancelAfter, CancelFlag};

    fn rgba8() -> Arc<ColorSpace> {
        ColorSpaceRegistry::with_builtin().rgba8().unwrap()
    }

    fn filled_layer(cs: &Arc<ColorSpace>, rect: Rect, px: [u8; 4]) -> PaintDevice {
        let mut dev = PaintDevice::new(Arc::clone(cs));
        dev.fill(rect, &px).unwrap();
        dev
    }

    fn pixel(image: &Image, x: i32, y: i32) -> Vec<u8> {
        image.projection().read(x, y).to_vec()
    }

    /// Red square under a half-opaque blue square on a 100x100 canvas.
    fn two_squares() -> (Image, LayerId, LayerId) {
        let cs = rgba8();
        let mut image = Image::new(100, 100, Arc::clone(&cs)).unwrap();
        let root = image.root();
        let red = image
            .add_layer(root, None, Layer::paint("red", filled_layer(&cs, Rect::new(0, 0, 64, 64), [255, 0, 0, 255])))
            .unwrap();
        let blue = image
            .add_layer(
                root,
                None,
                Layer::paint("blue", filled_layer(&cs, Rect::new(32, 32, 64, 64), [0, 0, 255, 255]))
                    .with_opacity(128),
            )
            .unwrap();
        (image, red, blue)
    }

    #[test]
    fn half_blue_over_red() {
        let (mut image, _, _) = two_squares();
        image.flush().unwrap();
        assert_eq!(pixel(&image, 48, 48), vec![127, 0, 128, 255]);
        assert_eq!(pixel(&image, 10, 10), vec![255, 0, 0, 255]);
        assert_eq!(pixel(&image, 10, 80), vec![0, 0, 0, 0]);
        assert!(!image.is_dirty());
    }

    #[test]
    fn zero_opacity_layer_changes_nothing() {
        let (mut image, _, blue) = two_squares();
        image.set_visible(blue, false).unwrap();
        let hidden = image.flush_to_display_bitmap(None).unwrap();
        image.set_visible(blue, true).unwrap();
        image.set_opacity(blue, 0).unwrap();
        let transparent = image.flush_to_display_bitmap(None).unwrap();
        assert_eq!(hidden, transparent);
    }

    #[test]
    fn locked_layers_stay_out() {
        let (mut image, red, _) = two_squares();
        image.set_locked(red, true).unwrap();
        image.flush().unwrap();
        assert_eq!(pixel(&image, 10, 10), vec![0, 0, 0, 0]);
    }

    #[test]
    fn opaque_top_layer_hides_everything_below() {
        let (mut image, red, blue) = two_squares();
        image.set_opacity(blue, 255).unwrap();
        image.flush().unwrap();
        assert_eq!(pixel(&image, 40, 40), vec![0, 0, 255, 255]);
        image.set_opacity(red, 10).unwrap();
        image.flush().unwrap();
        assert_eq!(pixel(&image, 40, 40), vec![0, 0, 255, 255]);
    }

    #[test]
    fn stacking_order_matters() {
        let (mut image, red, _) = two_squares();
        image.flush().unwrap();
        let before = pixel(&image, 48, 48);
        image.move_layer(red, image.root(), None).unwrap();
        image.flush().unwrap();
        assert_eq!(pixel(&image, 48, 48), vec![255, 0, 0, 255]);
        assert_ne!(before, pixel(&image, 48, 48));
    }

    #[test]
    fn flush_is_idempotent() {
        let (mut image, _, _) = two_squares();
        let first = image.flush_to_display_bitmap(None).unwrap();
        image.mark_dirty(None);
        let second = image.flush_to_display_bitmap(None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn sequential_and_parallel_agree() {
        let (mut image, _, _) = two_squares();
        let parallel = image.flush_to_display_bitmap(None).unwrap();
        image.settings.parallel = false;
        image.settings.tile_batch = 1;
        image.mark_dirty(None);
        let sequential = image.flush_to_display_bitmap(None).unwrap();
        assert_eq!(parallel, sequential);
    }

    #[test]
    fn group_offsets_accumulate() {
        let cs = rgba8();
        let mut image = Image::new(128, 128, Arc::clone(&cs)).unwrap();
        let group = image
            .add_layer(image.root(), None, Layer::group("g").with_offset(50, 0))
            .unwrap();
        let mut dev = PaintDevice::new(Arc::clone(&cs));
        dev.write(0, 0, &[9, 8, 7, 255]).unwrap();
        image
            .add_layer(group, None, Layer::paint("p", dev).with_offset(20, 30))
            .unwrap();
        image.flush().unwrap();
        assert_eq!(pixel(&image, 70, 30), vec![9, 8, 7, 255]);
        assert_eq!(pixel(&image, 20, 30), vec![0, 0, 0, 0]);
    }

    #[test]
    fn group_opacity_applies_once() {
        let cs = rgba8();
        let mut image = Image::new(64, 64, Arc::clone(&cs)).unwrap();
        let group = image
            .add_layer(image.root(), None, Layer::group("g").with_opacity(128))
            .unwrap();
        // Two stacked opaque layers inside a half-transparent group
        for _ in 0..2 {
            let dev = filled_layer(&cs, Rect::new(0, 0, 8, 8), [0, 255, 0, 255]);
            image.add_layer(group, None, Layer::paint("g", dev)).unwrap();
        }
        image.flush().unwrap();
        assert_eq!(pixel(&image, 1, 1), vec![0, 255, 0, 128]);
    }

    #[test]
    fn adjustment_inverts_layers_below() {
        let cs = rgba8();
        let mut image = Image::new(64, 64, Arc::clone(&cs)).unwrap();
        let root = image.root();
        image
            .add_layer(root, None, Layer::paint("p", filled_layer(&cs, Rect::new(0, 0, 4, 4), [10, 20, 30, 200])))
            .unwrap();
        let adj = image.add_layer(root, None, Layer::adjustment("inv", Filter::Invert)).unwrap();
        image.flush().unwrap();
        assert_eq!(pixel(&image, 0, 0), vec![245, 235, 225, 200]);

        let mut mask = PaintDevice::new(ColorSpaceRegistry::with_builtin().alpha8().unwrap());
        mask.write(1, 1, &[255]).unwrap();
        image.set_adjustment_mask(adj, Some(mask)).unwrap();
        image.flush().unwrap();
        assert_eq!(pixel(&image, 0, 0), vec![10, 20, 30, 200]);
        assert_eq!(pixel(&image, 1, 1), vec![245, 235, 225, 200]);
    }

    #[test]
    fn mask_must_be_alpha8() {
        let cs = rgba8();
        let mut image = Image::new(8, 8, Arc::clone(&cs)).unwrap();
        let adj = image
            .add_layer(image.root(), None, Layer::adjustment("inv", Filter::Invert))
            .unwrap();
        assert!(matches!(
            image.set_adjustment_mask(adj, Some(PaintDevice::new(cs))),
            Err(PaintError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn foreign_device_is_rejected() {
        let reg = ColorSpaceRegistry::with_builtin();
        let mut image = Image::new(8, 8, reg.rgba8().unwrap()).unwrap();
        let dev = PaintDevice::new(reg.get("RGBA16").unwrap());
        assert!(matches!(
            image.add_layer(image.root(), None, Layer::paint("x", dev)),
            Err(PaintError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn unsupported_op_is_rejected_up_front() {
        let reg = ColorSpaceRegistry::with_builtin();
        let mut image = Image::new(8, 8, reg.get("GRAYA8").unwrap()).unwrap();
        let id = image.add_paint_layer("p").unwrap();
        assert!(matches!(
            image.set_composite_op(id, CompositeOp::Hue),
            Err(PaintError::UnsupportedCompositeOp { .. })
        ));
        assert_eq!(image.layer(id).unwrap().composite_op, CompositeOp::Over);
    }

    #[test]
    fn cancelled_flush_keeps_previous_state() {
        let (mut image, _, blue) = two_squares();
        image.flush().unwrap();
        let committed = image.display_bitmap(None).unwrap();
        image.set_opacity(blue, 255).unwrap();
        image.settings.tile_batch = 1;
        let dirty = image.dirty_rect();

        let err = image.flush_with_progress(&CancelAfter::new(1)).unwrap_err();
        assert!(matches!(err, PaintError::Cancelled));
        assert_eq!(image.dirty_rect(), dirty);
        assert_eq!(image.display_bitmap(None).unwrap(), committed);

        let flag = CancelFlag::new();
        image.flush_with_progress(&flag).unwrap();
        assert_eq!(flag.percent(), 100);
        assert_eq!(pixel(&image, 48, 48), vec![0, 0, 255, 255]);
    }

    #[test]
    fn edits_mark_offset_region_dirty() {
        let cs = rgba8();
        let mut image = Image::new(200, 200, cs).unwrap();
        let id = image.add_paint_layer("p").unwrap();
        image.flush().unwrap();
        image.set_offset(id, 100, 100).unwrap();
        image.flush().unwrap();
        image
            .edit_paint_device(id, |dev| dev.write(1, 2, &[1, 2, 3, 255]))
            .unwrap();
        assert_eq!(image.dirty_rect(), Rect::new(101, 102, 1, 1));
        image.flush().unwrap();
        assert_eq!(pixel(&image, 101, 102), vec![1, 2, 3, 255]);
    }

    #[test]
    fn converting_a_layer_behind_the_images_back_is_reported() {
        let reg = ColorSpaceRegistry::with_builtin();
        let mut image = Image::new(8, 8, reg.rgba8().unwrap()).unwrap();
        let id = image.add_paint_layer("p").unwrap();
        let target = reg.get("RGBA16").unwrap();
        assert!(matches!(
            image.edit_paint_device(id, |dev| dev.convert_to(target)),
            Err(PaintError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn linked_layers_move_together() {
        let (mut image, red, blue) = two_squares();
        image.set_linked(red, true).unwrap();
        image.set_linked(blue, true).unwrap();
        image.move_by(red, 5, -3).unwrap();
        assert_eq!(image.layer(blue).unwrap().offset_x, 5);
        assert_eq!(image.layer(blue).unwrap().offset_y, -3);
    }

    #[test]
    fn solid_and_checker_backgrounds() {
        let mut image = Image::new(32, 32, rgba8()).unwrap();
        image.set_background(Background::Solid { rgba: [1, 2, 3, 255] });
        image.flush().unwrap();
        assert_eq!(pixel(&image, 5, 5), vec![1, 2, 3, 255]);

        image.set_background(Background::checkerboard());
        image.flush().unwrap();
        assert_eq!(pixel(&image, 0, 0), vec![204, 204, 204, 255]);
        assert_eq!(pixel(&image, 8, 0), vec![153, 153, 153, 255]);
        assert_eq!(pixel(&image, 8, 8), vec![204, 204, 204, 255]);
    }

    #[test]
    fn undo_and_redo_through_history() {
        let (mut image, _, blue) = two_squares();
        let history = History::new(10).shared();
        image.set_recorder(Box::new(Arc::clone(&history)));

        image.set_opacity(blue, 255).unwrap();
        image
            .edit_region(blue, Rect::new(40, 40, 2, 2), |dev| {
                dev.fill(Rect::new(40, 40, 2, 2), &[0, 255, 0, 255])
            })
            .unwrap();
        image.flush().unwrap();
        assert_eq!(pixel(&image, 40, 40), vec![0, 255, 0, 255]);

        let mut h = history.lock().unwrap();
        assert_eq!(h.undo_count(), 2);
        assert_eq!(h.undo(&mut image).unwrap().as_deref(), Some("Paint"));
        h.undo(&mut image).unwrap();
        // Replaying does not record new steps
        assert_eq!(h.undo_count(), 0);
        assert_eq!(h.redo_count(), 2);
        drop(h);

        image.flush().unwrap();
        assert_eq!(pixel(&image, 40, 40), vec![127, 0, 128, 255]);
        assert_eq!(pixel(&image, 73, 73), vec![0, 0, 255, 128]);
    }

    #[test]
    fn convert_image_is_all_or_nothing() {
        let reg = ColorSpaceRegistry::with_builtin();
        let (mut image, _, _) = two_squares();
        image.flush().unwrap();

        let cancelled = image.convert_to(reg.get("RGBA16").unwrap(), &CancelAfter::new(0));
        assert!(matches!(cancelled, Err(PaintError::Cancelled)));
        assert_eq!(image.color_space().id(), "RGBA8");

        image.convert_to(reg.get("RGBA16").unwrap(), &NullProgress).unwrap();
        let bitmap = image.flush_to_display_bitmap(None).unwrap();
        assert_eq!(bitmap.get_pixel(10, 10).0, [255, 0, 0, 255]);
    }

    /// Incremental flush must agree with a full recomposition.
    fn assert_matches_full_reflush(image: &mut Image, step: &str) {
        let incremental = image.flush_to_display_bitmap(None).unwrap();
        image.mark_dirty(None);
        let full = image.flush_to_display_bitmap(None).unwrap();
        assert!(incremental == full, "stale projection after {step}");
    }

    #[test]
    fn adjustment_leaves_solid_background_alone() {
        let cs = rgba8();
        let mut image = Image::new(128, 128, Arc::clone(&cs)).unwrap();
        image.set_background(Background::Solid { rgba: [255, 255, 255, 255] });
        let root = image.root();
        image
            .add_layer(root, None, Layer::paint("ink", filled_layer(&cs, Rect::new(0, 0, 4, 4), [0, 0, 0, 255])))
            .unwrap();
        image.flush().unwrap();

        image.add_layer(root, None, Layer::adjustment("inv", Filter::Invert)).unwrap();
        image.flush().unwrap();
        assert_eq!(pixel(&image, 1, 1), vec![255, 255, 255, 255]);
        assert_eq!(pixel(&image, 10, 10), vec![255, 255, 255, 255]);
        assert_eq!(pixel(&image, 100, 100), vec![255, 255, 255, 255]);

        image.mark_dirty(None);
        image.flush().unwrap();
        assert_eq!(pixel(&image, 10, 10), vec![255, 255, 255, 255]);
        assert_eq!(pixel(&image, 100, 100), vec![255, 255, 255, 255]);
    }

    #[test]
    fn partial_alpha_stacking_is_order_sensitive() {
        let cs = rgba8();
        let mut image = Image::new(64, 64, Arc::clone(&cs)).unwrap();
        let root = image.root();
        let area = Rect::new(0, 0, 16, 16);
        let red = image
            .add_layer(root, None, Layer::paint("red", filled_layer(&cs, area, [255, 0, 0, 128])))
            .unwrap();
        image
            .add_layer(root, None, Layer::paint("blue", filled_layer(&cs, area, [0, 0, 255, 128])))
            .unwrap();
        image.flush().unwrap();
        let blue_on_top = pixel(&image, 8, 8);

        image.move_layer(red, root, None).unwrap();
        image.flush().unwrap();
        let red_on_top = pixel(&image, 8, 8);

        assert_ne!(blue_on_top, red_on_top);
        assert!(blue_on_top[2] > blue_on_top[0]);
        assert!(red_on_top[0] > red_on_top[2]);
        // Coverage does not depend on order
        assert_eq!(blue_on_top[3], red_on_top[3]);
    }

    #[test]
    fn dirty_tracking_covers_every_mutation() {
        let reg = ColorSpaceRegistry::with_builtin();
        let cs = rgba8();
        let mut image = Image::new(200, 160, Arc::clone(&cs)).unwrap();
        image.set_background(Background::Solid { rgba: [255, 255, 255, 255] });
        let root = image.root();

        let ink = image
            .add_layer(root, None, Layer::paint("ink", filled_layer(&cs, Rect::new(0, 0, 20, 20), [0, 0, 0, 255])))
            .unwrap();
        assert_matches_full_reflush(&mut image, "add paint layer");

        let adj = image.add_layer(root, None, Layer::adjustment("inv", Filter::Invert)).unwrap();
        assert_matches_full_reflush(&mut image, "add adjustment");

        image.set_filter(adj, Filter::Posterize { levels: 2 }).unwrap();
        assert_matches_full_reflush(&mut image, "set filter");

        image.set_offset(ink, 120, 90).unwrap();
        assert_matches_full_reflush(&mut image, "set offset");

        let group = image.add_layer(root, Some(0), Layer::group("g").with_offset(70, 0)).unwrap();
        let red = image
            .add_layer(group, None, Layer::paint("red", filled_layer(&cs, Rect::new(0, 0, 10, 10), [255, 0, 0, 128])))
            .unwrap();
        assert_matches_full_reflush(&mut image, "add grouped layer");

        let inner = image.add_layer(group, None, Layer::adjustment("gray", Filter::Desaturate)).unwrap();
        assert_matches_full_reflush(&mut image, "add grouped adjustment");

        image.set_visible(adj, false).unwrap();
        assert_matches_full_reflush(&mut image, "hide adjustment");
        image.set_visible(adj, true).unwrap();
        assert_matches_full_reflush(&mut image, "show adjustment");

        let mut mask = PaintDevice::new(reg.alpha8().unwrap());
        mask.fill(Rect::new(0, 0, 130, 100), &[200]).unwrap();
        image.set_adjustment_mask(adj, Some(mask)).unwrap();
        assert_matches_full_reflush(&mut image, "set adjustment mask");

        image.move_layer(ink, group, Some(0)).unwrap();
        assert_matches_full_reflush(&mut image, "move into group");

        image.set_opacity(group, 100).unwrap();
        assert_matches_full_reflush(&mut image, "set group opacity");

        image.set_composite_op(red, CompositeOp::Multiply).unwrap();
        assert_matches_full_reflush(&mut image, "set composite op");

        image
            .edit_paint_device(red, |dev| dev.write(30, 30, &[0, 255, 0, 255]))
            .unwrap();
        assert_matches_full_reflush(&mut image, "edit pixels");

        image.remove_layer(inner).unwrap();
        assert_matches_full_reflush(&mut image, "remove grouped adjustment");

        image.remove_layer(adj).unwrap();
        assert_matches_full_reflush(&mut image, "remove adjustment");

        image.set_background(Background::Checkerboard {
            size: 8,
            light: [240, 240, 240, 255],
            dark: [200, 200, 200, 255],
        });
        assert_matches_full_reflush(&mut image, "set background");
    }

    #[test]
    fn offsets_near_the_coordinate_limit_do_not_overflow() {
        let cs = rgba8();
        let mut image = Image::new(64, 64, Arc::clone(&cs)).unwrap();
        let root = image.root();
        let dot = image
            .add_layer(root, None, Layer::paint("dot", filled_layer(&cs, Rect::new(0, 0, 1, 1), [255, 0, 0, 255])))
            .unwrap();
        image.flush().unwrap();
        assert_eq!(pixel(&image, 0, 0), vec![255, 0, 0, 255]);

        image.set_offset(dot, i32::MAX - 10, 0).unwrap();
        image.flush().unwrap();
        assert_eq!(pixel(&image, 0, 0), vec![0, 0, 0, 0]);

        image.move_by(dot, 100, 0).unwrap();
        assert_eq!(image.layer(dot).unwrap().offset_x, i32::MAX);
        image.flush().unwrap();

        image.set_offset(dot, 0, 0).unwrap();
        image.flush().unwrap();
        assert_eq!(pixel(&image, 0, 0), vec![255, 0, 0, 255]);
    }

    /// Records which profiles it was asked to map between and inverts the
    /// colour channels it is handed.
    #[derive(Default)]
    struct RecordingCms {
        requests: std::sync::Mutex<Vec<(Option<String>, String)>>,
    }

    struct InvertDisplay;

    impl DisplayTransform for InvertDisplay {
        fn transform_rgba8(&self, pixels: &mut [u8]) {
            for px in pixels.chunks_exact_mut(4) {
                for c in &mut px[..3] {
                    *c = 255 - *c;
                }
            }
        }
    }

    impl ColorManagement for RecordingCms {
        fn display_transform(
            &self,
            _space: &ColorSpace,
            src: Option<&Profile>,
            dst: &Profile,
        ) -> Option<Box<dyn DisplayTransform>> {
            self.requests
                .lock()
                .unwrap()
                .push((src.map(|p| p.name().to_string()), dst.name().to_string()));
            Some(Box::new(InvertDisplay))
        }
    }

    #[test]
    fn managed_bitmap_maps_from_the_image_profile() {
        let tagged = ColorSpace::new(ColorModel::Rgb, ChannelDepth::U8)
            .with_profile(Profile::new("Wide", vec![1u8, 2, 3]));
        let cs = Arc::new(tagged);
        let mut image = Image::new(8, 8, Arc::clone(&cs)).unwrap();
        let root = image.root();
        image
            .add_layer(root, None, Layer::paint("p", filled_layer(&cs, Rect::new(0, 0, 8, 8), [10, 20, 30, 255])))
            .unwrap();

        let cms = RecordingCms::default();
        let display = Profile::new("sRGB", vec![9u8]);
        let bitmap = image.flush_to_managed_bitmap(&cms, &display).unwrap();
        assert_eq!(bitmap.get_pixel(3, 3).0, [245, 235, 225, 255]);
        assert_eq!(
            *cms.requests.lock().unwrap(),
            vec![(Some("Wide".to_string()), "sRGB".to_string())]
        );

        // Untagged rendering is left alone
        assert_eq!(image.display_bitmap(None).unwrap().get_pixel(3, 3).0, [10, 20, 30, 255]);
    }

    #[test]
    fn attached_history_follows_settings() {
        let settings = EngineSettings {
            max_undo_steps: 2,
            ..EngineSettings::default()
        };
        let cs = rgba8();
        let mut image = Image::with_settings(16, 16, Arc::clone(&cs), settings).unwrap();
        let root = image.root();
        let id = image
            .add_layer(root, None, Layer::paint("p", filled_layer(&cs, Rect::new(0, 0, 4, 4), [1, 2, 3, 255])))
            .unwrap();

        let history = image.attach_history();
        for opacity in [200, 150, 100] {
            image.set_opacity(id, opacity).unwrap();
        }
        assert_eq!(history.lock().unwrap().undo_count(), 2);

        history.lock().unwrap().undo(&mut image).unwrap();
        assert_eq!(image.layer(id).unwrap().opacity, 150);
    }

    #[test]
    fn zero_sized_images_are_rejected() {
        assert!(Image::new(0, 10, rgba8()).is_err());
    }
}
