//! Configuration structs with defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// World generation and partitioning.
    pub world: WorldConfig,
    /// Per-chunk storage and unload tuning.
    pub chunk: ChunkConfig,
    /// Headless simulator settings.
    pub sim: SimConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// World configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorldConfig {
    /// World generation seed.
    pub seed: u64,
    /// Salt mixed into every chunk's population seed.
    pub populate_salt: u64,
    /// Chunks per region edge.
    pub region_size: u32,
}

/// Chunk configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkConfig {
    /// Changed cells tracked per tick before the dirty list overflows.
    pub dirty_capacity: usize,
    /// Distinct block states at or below which a store switches to the
    /// narrow palette.
    pub palette_threshold: usize,
    /// Ticks between idle checks of one unload candidate.
    pub unload_period_ticks: u64,
}

/// Simulator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SimConfig {
    /// Ticks to run before shutting down.
    pub ticks: u32,
    /// Snapshot reader threads (0 = one per CPU).
    pub reader_threads: usize,
    /// Observer radius in chunks.
    pub chunks_radius: i32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log filter (e.g. "debug", "info,tessera_world=trace").
    pub log_level: String,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            populate_salt: 42,
            region_size: 16,
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            dirty_capacity: 10,
            palette_threshold: 256,
            unload_period_ticks: 600,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            ticks: 100,
            reader_threads: 0,
            chunks_radius: 2,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Platform config directory for tessera, if the platform has one.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tessera"))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Re-reads the file. Returns `Some(new_config)` if it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let contents =
            std::fs::read_to_string(config_dir.join(CONFIG_FILE)).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
