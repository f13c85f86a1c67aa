//! Where photo-tagger finds its loader settings
//!
//! Settings come from a JSON file holding a [`LoaderConfig`]. An explicit
//! `--config` path must exist; otherwise `<config dir>/photo-tagger/config.json`
//! is used when present, and the built-in defaults when it is not. Missing keys
//! take their default values.

use anyhow::{Context, Result};
use exif_codec::ContainerFormat;
use image_loader::LoaderConfig;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const APP_DIR: &str = "photo-tagger";
const CONFIG_FILE: &str = "config.json";

/// Per-user config file location, if the platform has one.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

pub fn load(explicit: Option<&Path>) -> Result<LoaderConfig> {
    match explicit {
        Some(path) => read(path),
        None => match default_config_path() {
            Some(path) if path.is_file() => read(&path),
            _ => {
                debug!("No config file, using defaults");
                Ok(LoaderConfig::default())
            }
        },
    }
}

fn read(path: &Path) -> Result<LoaderConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
    let config =
        serde_json::from_str(&text).with_context(|| format!("Failed to parse config {}", path.display()))?;
    debug!(path = %path.display(), "Loaded config");
    Ok(config)
}

/// Command-line settings that win over the file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub workers: Option<usize>,
    pub commit_format: Option<ContainerFormat>,
    pub eager_full_load: bool,
}

impl Overrides {
    pub fn apply(&self, mut config: LoaderConfig) -> LoaderConfig {
        if let Some(workers) = self.workers {
            config.max_workers = Some(workers);
        }
        if let Some(format) = self.commit_format {
            config.commit_format = Some(format);
        }
        if self.eager_full_load {
            config.eager_full_load = true;
        }
        config
    }
}
