//! Tiled raster compositing engine.
//!
//! Sparse tiled paint devices, colour spaces with per-space composite op
//! tables, a layer tree, and an [`Image`] that keeps a cached projection of
//! that tree up to date one dirty region at a time.

pub mod adjustment;
pub mod cli;
pub mod color_conv;
pub mod colorspace;
pub mod composite_op;
pub mod compositor;
pub mod config;
pub mod error;
pub mod geometry;
pub mod history;
pub mod io;
pub mod iter;
pub mod layer;
pub mod logger;
pub mod paint_device;
pub mod progress;
pub mod tile;
pub mod transform;

pub use adjustment::Filter;
pub use colorspace::{ColorModel, ColorSpace, ColorSpaceRegistry, ChannelDepth};
pub use composite_op::CompositeOp;
pub use compositor::Image;
pub use config::{Background, EngineSettings};
pub use error::{PaintError, PaintResult};
pub use geometry::Rect;
pub use history::{History, Mutation, UndoRecorder};
pub use layer::{Layer, LayerId, LayerKind, LayerTree};
pub use paint_device::PaintDevice;
pub use progress::{CancelFlag, NullProgress, ProgressReporter};
pub use tile::{TILE_SIZE, Tile};
