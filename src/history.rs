use std::collections::VecDeque;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::adjustment::Filter;
use crate::composite_op::CompositeOp;
use crate::compositor::Image;
use crate::config::EngineSettings;
use crate::error::PaintResult;
use crate::geometry::Rect;
use crate::layer::LayerId;

// ============================================================================
// MUTATION RECORDS
// ============================================================================

/// Before/after bytes of a rectangle of one layer's device (layer-local
/// coordinates, tight-packed rows).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PixelPatch {
    pub layer: LayerId,
    pub rect: Rect,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

/// Serializable description of one undoable change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Offset { layer: LayerId, old: (i32, i32), new: (i32, i32) },
    Opacity { layer: LayerId, old: u8, new: u8 },
    CompositeOp { layer: LayerId, old: CompositeOp, new: CompositeOp },
    Visibility { layer: LayerId, old: bool, new: bool },
    Lock { layer: LayerId, old: bool, new: bool },
    Link { layer: LayerId, old: bool, new: bool },
    Rename { layer: LayerId, old: String, new: String },
    Filter { layer: LayerId, old: Filter, new: Filter },
    Pixels(PixelPatch),
}

impl Mutation {
    pub fn layer(&self) -> LayerId {
        match self {
            Mutation::Offset { layer, .. }
            | Mutation::Opacity { layer, .. }
            | Mutation::CompositeOp { layer, .. }
            | Mutation::Visibility { layer, .. }
            | Mutation::Lock { layer, .. }
            | Mutation::Link { layer, .. }
            | Mutation::Rename { layer, .. }
            | Mutation::Filter { layer, .. } => *layer,
            Mutation::Pixels(p) => p.layer,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Mutation::Offset { .. } => "Move Layer".to_string(),
            Mutation::Opacity { new, .. } => format!("Layer Opacity {}%", *new as u32 * 100 / 255),
            Mutation::CompositeOp { new, .. } => format!("Composite Op: {}", new.name()),
            Mutation::Visibility { new: true, .. } => "Show Layer".to_string(),
            Mutation::Visibility { new: false, .. } => "Hide Layer".to_string(),
            Mutation::Lock { new: true, .. } => "Lock Layer".to_string(),
            Mutation::Lock { new: false, .. } => "Unlock Layer".to_string(),
            Mutation::Link { .. } => "Link Layer".to_string(),
            Mutation::Rename { new, .. } => format!("Rename Layer to \"{new}\""),
            Mutation::Filter { new, .. } => format!("Adjustment: {}", new.name()),
            Mutation::Pixels(_) => "Paint".to_string(),
        }
    }

    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + match self {
                Mutation::Pixels(p) => p.before.len() + p.after.len(),
                Mutation::Rename { old, new, .. } => old.len() + new.len(),
                _ => 0,
            }
    }

    pub fn to_bytes(&self) -> PaintResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> PaintResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Which side of a mutation to restore.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Replay {
    Undo,
    Redo,
}

// ============================================================================
// RECORDER
// ============================================================================

/// Receives every mutation an [`Image`] performs through its setters.
pub trait UndoRecorder: Send {
    fn record(&mut self, mutation: Mutation);
}

impl UndoRecorder for Sender<Mutation> {
    fn record(&mut self, mutation: Mutation) {
        let _ = self.send(mutation);
    }
}

/// History shared between the image (recording) and the caller (undoing).
pub type SharedHistory = Arc<Mutex<History>>;

impl UndoRecorder for SharedHistory {
    fn record(&mut self, mutation: Mutation) {
        if let Ok(mut history) = self.lock() {
            history.push(mutation);
        }
    }
}

// ============================================================================
// HISTORY - bounded undo/redo stacks
// ============================================================================

/// Undo/redo history with count and memory limits.
pub struct History {
    undo_stack: VecDeque<Mutation>,
    redo_stack: VecDeque<Mutation>,
    max_history_size: usize,
    /// Optional memory cap in bytes.
    max_memory_bytes: Option<usize>,
    /// Running memory total across both stacks.
    total_memory: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(50)
    }
}

impl History {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            max_history_size,
            max_memory_bytes: Some(100 * 1024 * 1024),
            total_memory: 0,
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        let mut h = Self::new(settings.max_undo_steps);
        h.max_memory_bytes = Some(settings.max_undo_memory_mb * 1024 * 1024);
        h
    }

    pub fn shared(self) -> SharedHistory {
        Arc::new(Mutex::new(self))
    }

    pub fn push(&mut self, mutation: Mutation) {
        // A new action invalidates everything that could be redone
        for m in self.redo_stack.drain(..) {
            self.total_memory = self.total_memory.saturating_sub(m.memory_size());
        }

        self.total_memory += mutation.memory_size();
        self.undo_stack.push_back(mutation);
        self.prune();
    }

    /// Revert the most recent mutation on `image`. On failure the mutation
    /// stays on the undo stack.
    pub fn undo(&mut self, image: &mut Image) -> PaintResult<Option<String>> {
        let Some(m) = self.undo_stack.pop_back() else {
            return Ok(None);
        };
        if let Err(e) = image.apply_mutation(&m, Replay::Undo) {
            self.undo_stack.push_back(m);
            return Err(e);
        }
        let description = m.description();
        self.redo_stack.push_back(m);
        Ok(Some(description))
    }

    pub fn redo(&mut self, image: &mut Image) -> PaintResult<Option<String>> {
        let Some(m) = self.redo_stack.pop_back() else {
            return Ok(None);
        };
        if let Err(e) = image.apply_mutation(&m, Replay::Redo) {
            self.redo_stack.push_back(m);
            return Err(e);
        }
        let description = m.description();
        self.undo_stack.push_back(m);
        Ok(Some(description))
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.undo_stack.back().map(Mutation::description)
    }

    pub fn redo_description(&self) -> Option<String> {
        self.redo_stack.back().map(Mutation::description)
    }

    /// All undo descriptions, most recent first.
    pub fn undo_history(&self) -> Vec<String> {
        self.undo_stack.iter().rev().map(Mutation::description).collect()
    }

    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    fn prune(&mut self) {
        while self.undo_stack.len() > self.max_history_size {
            if let Some(removed) = self.undo_stack.pop_front() {
                self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
            }
        }

        if let Some(max_bytes) = self.max_memory_bytes {
            while self.total_memory > max_bytes && self.undo_stack.len() > 1 {
                if let Some(removed) = self.undo_stack.pop_front() {
                    self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.total_memory = 0;
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }
}
