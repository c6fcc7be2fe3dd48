use std::path::Path;

use loopdeck_shared::LoopSettings;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::recorder::TrimConfig;
use crate::scheduler::PlaybackStrategy;

/// Engine settings read from a JSON file. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Frames per device callback requested from the output stream.
    pub block_size: u32,
    pub strategy: PlaybackStrategy,
    pub settings: LoopSettings,
    /// Tracks registered at startup, numbered from 1.
    pub initial_tracks: u32,
    pub trim: TrimConfig,
    /// Capture frames per meter reading.
    pub meter_window: usize,
    /// Capture queue size in samples (not frames).
    pub capture_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 512,
            strategy: PlaybackStrategy::Retrigger,
            settings: LoopSettings::default(),
            initial_tracks: 4,
            trim: TrimConfig::default(),
            meter_window: 1024,
            capture_queue_capacity: 48_000 * 2 * 4,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&text)?;
        config.settings = config.settings.clamped();
        Ok(config)
    }

    /// Load `path` if it exists, otherwise defaults. A file that exists but
    /// fails to parse is logged and ignored.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            log::info!("[Config] {} not found, using defaults", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => {
                log::info!("[Config] Loaded {}", path.display());
                config
            }
            Err(e) => {
                log::warn!("[Config] Ignoring {}: {}", path.display(), e);
                Self::default()
            }
        }
    }
}
