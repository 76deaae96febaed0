// ============================================================================
// LAYERS: closed layer kinds stored in a generational arena
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::adjustment::Filter;
use crate::composite_op::CompositeOp;
use crate::error::{PaintError, PaintResult};
use crate::geometry::Rect;
use crate::paint_device::PaintDevice;

/// Stable handle to a layer. Handles of removed layers never resolve again,
/// even when the slot is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerId {
    index: u32,
    generation: u32,
}

impl LayerId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// What a layer contributes to the projection.
#[derive(Clone, Debug)]
pub enum LayerKind {
    /// Owns pixels.
    Paint { device: PaintDevice },
    /// Owns no pixels; composites its children first.
    Group,
    /// Filters everything composited beneath it in the same group,
    /// optionally limited by an `ALPHA8` mask in layer coordinates.
    Adjustment {
        filter: Filter,
        mask: Option<PaintDevice>,
    },
}

#[derive(Clone, Debug)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    pub offset_x: i32,
    pub offset_y: i32,
    pub opacity: u8,
    pub composite_op: CompositeOp,
    pub visible: bool,
    pub locked: bool,
    pub linked: bool,
    parent: Option<LayerId>,
    children: Vec<LayerId>,
}

impl Layer {
    fn with_kind(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            offset_x: 0,
            offset_y: 0,
            opacity: u8::MAX,
            composite_op: CompositeOp::Over,
            visible: true,
            locked: false,
            linked: false,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn paint(name: impl Into<String>, device: PaintDevice) -> Self {
        Self::with_kind(name, LayerKind::Paint { device })
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::with_kind(name, LayerKind::Group)
    }

    pub fn adjustment(name: impl Into<String>, filter: Filter) -> Self {
        Self::with_kind(name, LayerKind::Adjustment { filter, mask: None })
    }

    pub fn with_offset(mut self, x: i32, y: i32) -> Self {
        self.offset_x = x;
        self.offset_y = y;
        self
    }

    pub fn with_opacity(mut self, opacity: u8) -> Self {
        self.opacity = opacity;
        self
    }

    pub fn with_composite_op(mut self, op: CompositeOp) -> Self {
        self.composite_op = op;
        self
    }

    pub fn as_paint_device(&self) -> Option<&PaintDevice> {
        match &self.kind {
            LayerKind::Paint { device } => Some(device),
            _ => None,
        }
    }

    pub fn as_paint_device_mut(&mut self) -> Option<&mut PaintDevice> {
        match &mut self.kind {
            LayerKind::Paint { device } => Some(device),
            _ => None,
        }
    }

    /// Children, when this is a group.
    pub fn as_group(&self) -> Option<&[LayerId]> {
        match self.kind {
            LayerKind::Group => Some(&self.children),
            _ => None,
        }
    }

    pub fn as_adjustment(&self) -> Option<(&Filter, Option<&PaintDevice>)> {
        match &self.kind {
            LayerKind::Adjustment { filter, mask } => Some((filter, mask.as_ref())),
            _ => None,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, LayerKind::Group)
    }

    pub fn parent(&self) -> Option<LayerId> {
        self.parent
    }

    pub fn children(&self) -> &[LayerId] {
        &self.children
    }

    /// Whether compositing should consider this layer at all.
    pub fn contributes(&self) -> bool {
        self.visible && !self.locked && self.opacity > 0
    }
}

struct Slot {
    generation: u32,
    layer: Option<Layer>,
}

/// Arena owning every layer. Parent/child links are handle lists; the
/// root is a group that cannot be removed.
pub struct LayerTree {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    root: LayerId,
}

impl Default for LayerTree {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerTree {
    pub fn new() -> Self {
        let mut tree = Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            root: LayerId { index: 0, generation: 0 },
        };
        tree.root = tree.alloc(Layer::group("root"));
        tree
    }

    fn alloc(&mut self, layer: Layer) -> LayerId {
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.layer = Some(layer);
            LayerId { index, generation: slot.generation }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, layer: Some(layer) });
            LayerId { index, generation: 0 }
        }
    }

    pub fn root(&self) -> LayerId {
        self.root
    }

    /// Number of live layers, root included.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    pub fn contains(&self, id: LayerId) -> bool {
        self.get(id).is_ok()
    }

    pub fn get(&self, id: LayerId) -> PaintResult<&Layer> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.layer.as_ref())
            .ok_or(PaintError::InvalidLayer(id))
    }

    pub fn get_mut(&mut self, id: LayerId) -> PaintResult<&mut Layer> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.layer.as_mut())
            .ok_or(PaintError::InvalidLayer(id))
    }

    pub fn children(&self, id: LayerId) -> PaintResult<&[LayerId]> {
        Ok(self.get(id)?.children())
    }

    pub fn parent(&self, id: LayerId) -> PaintResult<Option<LayerId>> {
        Ok(self.get(id)?.parent)
    }

    /// Position of `id` among its siblings (0 = bottom).
    pub fn index_in_parent(&self, id: LayerId) -> PaintResult<Option<usize>> {
        let Some(parent) = self.parent(id)? else {
            return Ok(None);
        };
        Ok(self.children(parent)?.iter().position(|&c| c == id))
    }

    /// Insert `layer` into group `parent` at `index` (bottom = 0; `None`
    /// stacks on top).
    pub fn insert(&mut self, parent: LayerId, index: Option<usize>, mut layer: Layer) -> PaintResult<LayerId> {
        let p = self.get(parent)?;
        if !p.is_group() {
            return Err(PaintError::NotAGroup(parent));
        }
        let at = index.unwrap_or(p.children.len()).min(p.children.len());
        layer.parent = Some(parent);
        layer.children.clear();
        let id = self.alloc(layer);
        self.get_mut(parent)?.children.insert(at, id);
        Ok(id)
    }

    /// Remove `id` and its whole subtree, returning the detached layer
    /// (without children).
    pub fn remove(&mut self, id: LayerId) -> PaintResult<Layer> {
        if id == self.root {
            return Err(PaintError::invalid_argument("the root group cannot be removed"));
        }
        let parent = self.get(id)?.parent;
        if let Some(p) = parent {
            self.get_mut(p)?.children.retain(|&c| c != id);
        }
        let mut stack = vec![id];
        let mut detached = None;
        while let Some(cur) = stack.pop() {
            let slot = &mut self.slots[cur.index as usize];
            if let Some(mut layer) = slot.layer.take() {
                stack.extend(layer.children.drain(..));
                self.free_list.push(cur.index);
                if cur == id {
                    layer.parent = None;
                    detached = Some(layer);
                }
            }
        }
        detached.ok_or(PaintError::InvalidLayer(id))
    }

    /// Re-parent `id` under `new_parent` at `index`.
    pub fn move_layer(&mut self, id: LayerId, new_parent: LayerId, index: Option<usize>) -> PaintResult<()> {
        if id == self.root {
            return Err(PaintError::invalid_argument("the root group cannot be moved"));
        }
        if !self.get(new_parent)?.is_group() {
            return Err(PaintError::NotAGroup(new_parent));
        }
        if self.is_ancestor(id, new_parent)? {
            return Err(PaintError::invalid_argument("a group cannot be moved into itself"));
        }
        let old_parent = self.get(id)?.parent;
        if let Some(p) = old_parent {
            self.get_mut(p)?.children.retain(|&c| c != id);
        }
        let siblings = &mut self.get_mut(new_parent)?.children;
        let at = index.unwrap_or(siblings.len()).min(siblings.len());
        siblings.insert(at, id);
        self.get_mut(id)?.parent = Some(new_parent);
        Ok(())
    }

    /// `true` if `ancestor` is `id` or lies on the path from `id` to the root.
    pub fn is_ancestor(&self, ancestor: LayerId, id: LayerId) -> PaintResult<bool> {
        let mut cur = Some(id);
        while let Some(c) = cur {
            if c == ancestor {
                return Ok(true);
            }
            cur = self.get(c)?.parent;
        }
        Ok(false)
    }

    /// Every layer below `id` in depth-first, bottom-to-top order.
    pub fn descendants(&self, id: LayerId) -> PaintResult<Vec<LayerId>> {
        let mut out = Vec::new();
        let mut stack: Vec<LayerId> = self.children(id)?.iter().rev().copied().collect();
        while let Some(cur) = stack.pop() {
            out.push(cur);
            stack.extend(self.children(cur)?.iter().rev());
        }
        Ok(out)
    }

    /// Offset of `id` in image coordinates (own offset plus every ancestor's).
    pub fn absolute_offset(&self, id: LayerId) -> PaintResult<(i32, i32)> {
        let (mut x, mut y): (i32, i32) = (0, 0);
        let mut cur = Some(id);
        while let Some(c) = cur {
            let layer = self.get(c)?;
            x = x.saturating_add(layer.offset_x);
            y = y.saturating_add(layer.offset_y);
            cur = layer.parent;
        }
        Ok((x, y))
    }

    /// Image-space area `id` can affect. Groups cover their children; an
    /// adjustment layer covers what lies beneath it in its group.
    pub fn extent(&self, id: LayerId) -> PaintResult<Rect> {
        let layer = self.get(id)?;
        match &layer.kind {
            LayerKind::Paint { device } => {
                let (ox, oy) = self.absolute_offset(id)?;
                Ok(device.extent().translated(ox, oy))
            }
            LayerKind::Group => self.children_extent(layer.children()),
            LayerKind::Adjustment { .. } => {
                let Some(parent) = layer.parent else {
                    return Ok(Rect::EMPTY);
                };
                let siblings = self.children(parent)?;
                let below = siblings.iter().position(|&c| c == id).unwrap_or(0);
                self.children_extent(&siblings[..below])
            }
        }
    }

    fn children_extent(&self, children: &[LayerId]) -> PaintResult<Rect> {
        children.iter().try_fold(Rect::EMPTY, |acc, &c| {
            Ok(match self.get(c)?.kind {
                LayerKind::Adjustment { .. } => acc,
                _ => acc.union(&self.extent(c)?),
            })
        })
    }

    /// Layers whose paint device lives in `layer_id`'s subtree (self included).
    pub fn paint_layers(&self, id: LayerId) -> PaintResult<Vec<LayerId>> {
        let mut all = vec![id];
        all.extend(self.descendants(id)?);
        Ok(all
            .into_iter()
            .filter(|&c| self.get(c).is_ok_and(|l| l.as_paint_device().is_some()))
            .collect())
    }

    /// Linked siblings move together; returns every layer linked with `id`
    /// (including `id`) in the same group.
    pub fn linked_with(&self, id: LayerId) -> PaintResult<Vec<LayerId>> {
        let layer = self.get(id)?;
        if !layer.linked {
            return Ok(vec![id]);
        }
        let Some(parent) = layer.parent else {
            return Ok(vec![id]);
        };
        Ok(self
            .children(parent)?
            .iter()
            .copied()
            .filter(|&c| c == id || self.get(c).is_ok_and(|l| l.linked))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colorspace::ColorSpaceRegistry;

    fn device() -> PaintDevice {
        PaintDevice::new(ColorSpaceRegistry::with_builtin().rgba8().unwrap())
    }

    #[test]
    fn insert_orders_bottom_to_top() {
        let mut tree = LayerTree::new();
        let root = tree.root();
        let a = tree.insert(root, None, Layer::paint("a", device())).unwrap();
        let b = tree.insert(root, None, Layer::paint("b", device())).unwrap();
        let c = tree.insert(root, Some(0), Layer::paint("c", device())).unwrap();
        assert_eq!(tree.children(root).unwrap(), &[c, a, b]);
        assert_eq!(tree.index_in_parent(b).unwrap(), Some(2));
    }

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut tree = LayerTree::new();
        let root = tree.root();
        let a = tree.insert(root, None, Layer::paint("a", device())).unwrap();
        tree.remove(a).unwrap();
        let b = tree.insert(root, None, Layer::group("b")).unwrap();
        assert_eq!(a.index(), b.index());
        assert!(matches!(tree.get(a), Err(PaintError::InvalidLayer(_))));
        assert_eq!(tree.get(b).unwrap().name, "b");
    }

    #[test]
    fn remove_frees_subtree() {
        let mut tree = LayerTree::new();
        let root = tree.root();
        let g = tree.insert(root, None, Layer::group("g")).unwrap();
        let inner = tree.insert(g, None, Layer::paint("p", device())).unwrap();
        assert_eq!(tree.len(), 3);
        let removed = tree.remove(g).unwrap();
        assert_eq!(removed.name, "g");
        assert!(!tree.contains(inner));
        assert_eq!(tree.len(), 1);
        assert!(tree.remove(root).is_err());
    }

    #[test]
    fn paint_layers_cannot_have_children() {
        let mut tree = LayerTree::new();
        let p = tree.insert(tree.root(), None, Layer::paint("p", device())).unwrap();
        assert!(matches!(
            tree.insert(p, None, Layer::group("x")),
            Err(PaintError::NotAGroup(_))
        ));
    }

    #[test]
    fn move_rejects_cycles() {
        let mut tree = LayerTree::new();
        let root = tree.root();
        let outer = tree.insert(root, None, Layer::group("outer")).unwrap();
        let inner = tree.insert(outer, None, Layer::group("inner")).unwrap();
        assert!(tree.move_layer(outer, inner, None).is_err());
        tree.move_layer(inner, root, Some(0)).unwrap();
        assert_eq!(tree.children(root).unwrap(), &[inner, outer]);
        assert_eq!(tree.parent(inner).unwrap(), Some(root));
    }

    #[test]
    fn offsets_accumulate_through_groups() {
        let mut tree = LayerTree::new();
        let g = tree
            .insert(tree.root(), None, Layer::group("g").with_offset(10, -5))
            .unwrap();
        let mut dev = device();
        dev.write(0, 0, &[1, 1, 1, 1]).unwrap();
        let p = tree.insert(g, None, Layer::paint("p", dev).with_offset(3, 3)).unwrap();
        assert_eq!(tree.absolute_offset(p).unwrap(), (13, -2));
        assert_eq!(tree.extent(p).unwrap(), Rect::new(13, -2, 64, 64));
        assert_eq!(tree.extent(g).unwrap(), Rect::new(13, -2, 64, 64));
    }

    #[test]
    fn adjustment_extent_covers_layers_below() {
        let mut tree = LayerTree::new();
        let root = tree.root();
        let mut dev = device();
        dev.write(0, 0, &[1, 1, 1, 1]).unwrap();
        tree.insert(root, None, Layer::paint("p", dev)).unwrap();
        let adj = tree.insert(root, None, Layer::adjustment("inv", Filter::Invert)).unwrap();
        assert_eq!(tree.extent(adj).unwrap(), Rect::new(0, 0, 64, 64));
        assert!(tree.get(adj).unwrap().as_adjustment().is_some());
        assert!(tree.get(adj).unwrap().as_paint_device().is_none());
    }

    #[test]
    fn linked_siblings_are_reported_together() {
        let mut tree = LayerTree::new();
        let root = tree.root();
        let a = tree.insert(root, None, Layer::paint("a", device())).unwrap();
        let b = tree.insert(root, None, Layer::paint("b", device())).unwrap();
        let c = tree.insert(root, None, Layer::paint("c", device())).unwrap();
        tree.get_mut(a).unwrap().linked = true;
        tree.get_mut(c).unwrap().linked = true;
        assert_eq!(tree.linked_with(a).unwrap(), vec![a, c]);
        assert_eq!(tree.linked_with(b).unwrap(), vec![b]);
    }
}
