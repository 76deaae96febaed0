// ============================================================================
// TileStack CLI: headless layer compositing via command-line arguments
// ============================================================================
//
// Usage examples:
//   tilestack --layer base.png --layer logo.png@40,40%80 --output out.png
//   tilestack -l "frames/*.png:screen" -o stack.png --background white
//   tilestack -l photo.jpg -l shade.png:multiply --color-space RGBA16 -o out.tiff
//   tilestack -l a.png -l b.png -o projection.tsd        (raw tiled device dump)
//
// Every input becomes one paint layer, stacked bottom to top in argument
// order. The projection is flushed once and written as a bitmap.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::{error, info};

use crate::colorspace::{ColorSpaceRegistry, DisplayTransform, GammaTransform};
use crate::composite_op::CompositeOp;
use crate::compositor::Image;
use crate::config::{Background, EngineSettings};
use crate::error::{PaintError, PaintResult};
use crate::geometry::Rect;
use crate::io;
use crate::layer::Layer;
use crate::paint_device::PaintDevice;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// TileStack headless compositor.
///
/// Stack images as layers with offsets, composite ops and opacity, then
/// write the flattened result.
#[derive(Parser, Debug)]
#[command(
    name = "tilestack",
    about = "TileStack headless layer compositor",
    long_about = "Composite image files as layers of a tiled document and write the\n\
                  flattened projection. Layers stack bottom to top in argument order.\n\n\
                  Layer syntax: PATH[@X,Y][:OP][%OPACITY]\n  \
                  tilestack -l base.png -l logo.png@40,40:screen%75 -o out.png"
)]
pub struct CliArgs {
    /// Layer input(s): PATH[@X,Y][:OP][%OPACITY]. Glob patterns accepted in
    /// PATH; every match becomes its own layer with the same placement.
    #[arg(short, long, required = true, num_args = 1..)]
    pub layer: Vec<LayerSpec>,

    /// Output file. The extension picks the format; `.tsd` writes the raw
    /// tiled projection instead of a bitmap.
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Document colour space (e.g. RGBA8, RGBA16, GRAYA8, CMYKAF32).
    /// Defaults to the settings file value.
    #[arg(long, value_name = "ID")]
    pub color_space: Option<String>,

    /// Background: transparent, checker, white, black or #rrggbb[aa].
    #[arg(short, long, value_name = "BG")]
    pub background: Option<String>,

    /// Canvas size WxH. Defaults to the smallest size holding every layer.
    #[arg(long, value_name = "WxH")]
    pub size: Option<String>,

    /// Display gamma applied to the output bitmap.
    #[arg(long, value_name = "GAMMA")]
    pub gamma: Option<f32>,

    /// Settings file to use instead of the per-user one.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print per-layer and timing information; log at debug level.
    #[arg(short, long)]
    pub verbose: bool,
}

/// One `--layer` argument.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerSpec {
    pub pattern: String,
    pub offset: (i32, i32),
    pub op: CompositeOp,
    pub opacity: u8,
}

impl FromStr for LayerSpec {
    type Err = PaintError;

    /// Suffixes are peeled from the right: `%opacity`, then `:op`, then
    /// `@x,y`. A `:` whose tail is not an op name stays part of the path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rest = s.trim();

        let mut opacity = u8::MAX;
        if let Some((head, pct)) = rest.rsplit_once('%') {
            let pct: f32 = pct
                .parse()
                .map_err(|_| PaintError::invalid_argument(format!("bad opacity in '{s}'")))?;
            if !(0.0..=100.0).contains(&pct) {
                return Err(PaintError::invalid_argument(format!("opacity out of range in '{s}'")));
            }
            opacity = (pct * 255.0 / 100.0).round() as u8;
            rest = head;
        }

        let mut op = CompositeOp::Over;
        if let Some((head, name)) = rest.rsplit_once(':')
            && let Ok(parsed) = CompositeOp::from_id(name)
        {
            op = parsed;
            rest = head;
        }

        let mut offset = (0, 0);
        if let Some((head, at)) = rest.rsplit_once('@') {
            let (x, y) = at
                .split_once(',')
                .ok_or_else(|| PaintError::invalid_argument(format!("bad offset in '{s}'")))?;
            let parse = |v: &str| {
                v.trim()
                    .parse::<i32>()
                    .map_err(|_| PaintError::invalid_argument(format!("bad offset in '{s}'")))
            };
            offset = (parse(x)?, parse(y)?);
            rest = head;
        }

        if rest.is_empty() {
            return Err(PaintError::invalid_argument(format!("missing path in '{s}'")));
        }
        Ok(Self {
            pattern: rest.to_string(),
            offset,
            op,
            opacity,
        })
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run the compositor and return an OS exit code.
pub fn run(args: CliArgs) -> ExitCode {
    let started = Instant::now();
    match composite(&args) {
        Ok(()) => {
            if args.verbose {
                println!(
                    "  → {} ({:.0}ms)",
                    args.output.display(),
                    started.elapsed().as_secs_f64() * 1000.0
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "composite failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Load, stack, flush and save. Errors are returned rather than printed.
pub fn composite(args: &CliArgs) -> PaintResult<()> {
    let settings = match &args.config {
        Some(path) => EngineSettings::load(path)?,
        None => EngineSettings::load_or_default(),
    };
    let registry = ColorSpaceRegistry::with_builtin();
    let cs = registry.get(args.color_space.as_deref().unwrap_or(&settings.default_color_space))?;

    // -- Step 1: Load every layer ----------------------------------------
    let mut loaded: Vec<(String, &LayerSpec, PaintDevice)> = Vec::new();
    for spec in &args.layer {
        let paths = resolve_inputs(&spec.pattern);
        if paths.is_empty() {
            return Err(PaintError::invalid_argument(format!(
                "no input files matched '{}'",
                spec.pattern
            )));
        }
        for path in paths {
            let device = io::load_image_as_device(&path, Arc::clone(&cs))?;
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            if args.verbose {
                println!("  layer '{}' {} @{},{} {}", name, spec.op, spec.offset.0, spec.offset.1, device.extent());
            }
            loaded.push((name, spec, device));
        }
    }

    // -- Step 2: Build the document -----------------------------------------
    let (width, height) = match &args.size {
        Some(s) => parse_size(s)?,
        None => fit_size(&loaded),
    };
    let background = args.background.as_deref().map(Background::parse).transpose()?;
    let mut image = Image::with_settings(width, height, cs, settings)?;
    if let Some(bg) = background {
        image.set_background(bg);
    }
    let root = image.root();
    for (name, spec, device) in loaded {
        let layer = Layer::paint(name, device)
            .with_offset(spec.offset.0, spec.offset.1)
            .with_opacity(spec.opacity)
            .with_composite_op(spec.op);
        image.add_layer(root, None, layer)?;
    }

    // -- Step 3: Flush and save ------------------------------------------------
    let gamma = args.gamma.map(GammaTransform::new);
    let transform = gamma.as_ref().map(|g| g as &dyn DisplayTransform);
    let bitmap = image.flush_to_display_bitmap(transform)?;
    info!(width, height, layers = image.tree().len() - 1, "projection flushed");

    let is_device_dump = args
        .output
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("tsd"));
    if is_device_dump {
        io::save_device(&args.output, image.projection())?;
    } else {
        io::save_rgba(&args.output, &bitmap)?;
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand a glob pattern or literal path into an ordered list.
fn resolve_inputs(pattern: &str) -> Vec<PathBuf> {
    let as_path = Path::new(pattern);
    if as_path.exists() {
        return vec![as_path.to_path_buf()];
    }

    match glob::glob(pattern) {
        Ok(entries) => {
            let mut result: Vec<PathBuf> = Vec::new();
            for entry in entries.flatten() {
                if !result.contains(&entry) {
                    result.push(entry);
                }
            }
            result
        }
        Err(e) => {
            eprintln!("warning: invalid glob '{}': {}", pattern, e);
            Vec::new()
        }
    }
}

fn parse_size(s: &str) -> PaintResult<(u32, u32)> {
    let bad = || PaintError::invalid_argument(format!("bad size '{s}', expected WxH"));
    let lower = s.to_ascii_lowercase();
    let (w, h) = lower.split_once('x').ok_or_else(bad)?;
    let w: u32 = w.trim().parse().map_err(|_| bad())?;
    let h: u32 = h.trim().parse().map_err(|_| bad())?;
    if w == 0 || h == 0 {
        return Err(bad());
    }
    Ok((w, h))
}

/// Smallest canvas anchored at the origin that shows every painted pixel.
fn fit_size(layers: &[(String, &LayerSpec, PaintDevice)]) -> (u32, u32) {
    let covered = layers.iter().fold(Rect::EMPTY, |acc, (_, spec, dev)| {
        acc.union(&dev.exact_bounds().translated(spec.offset.0, spec.offset.1))
    });
    (covered.right().max(1) as u32, covered.bottom().max(1) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_spec_full_syntax() {
        let spec: LayerSpec = "shots/a.png@-4,12:multiply%50".parse().unwrap();
        assert_eq!(spec.pattern, "shots/a.png");
        assert_eq!(spec.offset, (-4, 12));
        assert_eq!(spec.op, CompositeOp::Multiply);
        assert_eq!(spec.opacity, 128);
    }

    #[test]
    fn layer_spec_defaults_and_drive_letters() {
        let spec: LayerSpec = "C:\\img\\a.png".parse().unwrap();
        assert_eq!(spec.pattern, "C:\\img\\a.png");
        assert_eq!(spec.op, CompositeOp::Over);
        assert_eq!(spec.opacity, 255);
        assert_eq!(spec.offset, (0, 0));
    }

    #[test]
    fn layer_spec_errors() {
        assert!("a.png%150".parse::<LayerSpec>().is_err());
        assert!("a.png@3".parse::<LayerSpec>().is_err());
        assert!(":screen".parse::<LayerSpec>().is_err());
    }

    #[test]
    fn size_parsing() {
        assert_eq!(parse_size("640x480").unwrap(), (640, 480));
        assert_eq!(parse_size("10X2").unwrap(), (10, 2));
        assert!(parse_size("0x4").is_err());
        assert!(parse_size("big").is_err());
    }

    #[test]
    fn args_parse() {
        let args = CliArgs::try_parse_from([
            "tilestack", "-l", "a.png", "-l", "b.png:screen", "-o", "out.png", "-v",
        ])
        .unwrap();
        assert_eq!(args.layer.len(), 2);
        assert_eq!(args.layer[1].op, CompositeOp::Screen);
        assert!(args.verbose);
    }
}
