// ============================================================================
// ENGINE SETTINGS: compositing policy persisted as JSON
// ============================================================================

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PaintError, PaintResult};

const SETTINGS_FILE: &str = "settings.json";

/// What the projection starts from before any layer is blended in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Background {
    #[default]
    Transparent,
    Solid { rgba: [u8; 4] },
    Checkerboard {
        size: u32,
        light: [u8; 4],
        dark: [u8; 4],
    },
}

impl Background {
    /// Parse the CLI spelling: `transparent`, `checker`, `white`, `black`
    /// or `#rrggbb[aa]`.
    pub fn parse(s: &str) -> PaintResult<Self> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "transparent" | "none" => return Ok(Background::Transparent),
            "checker" | "checkerboard" => return Ok(Background::checkerboard()),
            "white" => return Ok(Background::Solid { rgba: [255, 255, 255, 255] }),
            "black" => return Ok(Background::Solid { rgba: [0, 0, 0, 255] }),
            _ => {}
        }
        let hex = s
            .strip_prefix('#')
            .ok_or_else(|| PaintError::invalid_argument(format!("unknown background '{s}'")))?;
        let byte = |i: usize| {
            hex.get(i..i + 2)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| PaintError::invalid_argument(format!("bad colour '{s}'")))
        };
        let rgba = match hex.len() {
            6 => [byte(0)?, byte(2)?, byte(4)?, 255],
            8 => [byte(0)?, byte(2)?, byte(4)?, byte(6)?],
            _ => return Err(PaintError::invalid_argument(format!("bad colour '{s}'"))),
        };
        Ok(Background::Solid { rgba })
    }

    /// The usual light/dark grey 8px checkerboard.
    pub fn checkerboard() -> Self {
        Background::Checkerboard {
            size: 8,
            light: [204, 204, 204, 255],
            dark: [153, 153, 153, 255],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub background: Background,
    /// Fan tile composition out over the rayon pool.
    pub parallel: bool,
    /// Tiles composed between cancellation checks.
    pub tile_batch: usize,
    pub max_undo_steps: usize,
    pub max_undo_memory_mb: usize,
    pub default_color_space: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            background: Background::Transparent,
            parallel: true,
            tile_batch: 64,
            max_undo_steps: 50,
            max_undo_memory_mb: 100,
            default_color_space: "RGBA8".to_string(),
        }
    }
}

impl EngineSettings {
    /// Per-user settings location:
    /// Linux `$XDG_CONFIG_HOME/tilestack/settings.json`,
    /// Windows `%APPDATA%\TileStack\settings.json`,
    /// macOS `~/Library/Application Support/TileStack/settings.json`.
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                    PathBuf::from(home).join(".config")
                })
                .join("tilestack");
            return Some(config_dir.join(SETTINGS_FILE));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA")
                .or_else(|_| std::env::var("USERPROFILE"))
                .ok()?;
            return Some(PathBuf::from(appdata).join("TileStack").join(SETTINGS_FILE));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("TileStack")
                    .join(SETTINGS_FILE),
            );
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|d| d.join(SETTINGS_FILE)))
        }
    }

    /// Read settings from `path`. Missing keys take their defaults.
    pub fn load(path: &Path) -> PaintResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut settings: Self = serde_json::from_str(&text)?;
        settings.tile_batch = settings.tile_batch.max(1);
        Ok(settings)
    }

    /// Settings from the per-user file, or defaults when it is absent or
    /// unreadable.
    pub fn load_or_default() -> Self {
        let Some(path) = Self::settings_path() else {
            return Self::default();
        };
        match Self::load(&path) {
            Ok(s) => s,
            Err(PaintError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable settings");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> PaintResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let s: EngineSettings = serde_json::from_str(r#"{ "parallel": false }"#).unwrap();
        assert!(!s.parallel);
        assert_eq!(s.tile_batch, 64);
        assert_eq!(s.background, Background::Transparent);
    }

    #[test]
    fn background_json_shape() {
        let json = serde_json::to_string(&Background::Solid { rgba: [1, 2, 3, 4] }).unwrap();
        assert_eq!(json, r#"{"kind":"solid","rgba":[1,2,3,4]}"#);
    }

    #[test]
    fn parse_background_spellings() {
        assert_eq!(Background::parse("transparent").unwrap(), Background::Transparent);
        assert_eq!(
            Background::parse("#ff000080").unwrap(),
            Background::Solid { rgba: [255, 0, 0, 128] }
        );
        assert_eq!(
            Background::parse("#00ff00").unwrap(),
            Background::Solid { rgba: [0, 255, 0, 255] }
        );
        assert!(Background::parse("#12").is_err());
        assert!(Background::parse("plaid").is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("tilestack-cfg-{}", std::process::id()));
        let path = dir.join("settings.json");
        let s = EngineSettings {
            background: Background::checkerboard(),
            tile_batch: 8,
            ..EngineSettings::default()
        };
        s.save(&path).unwrap();
        assert_eq!(EngineSettings::load(&path).unwrap(), s);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
