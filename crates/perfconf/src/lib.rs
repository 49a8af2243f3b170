//! Startup configuration for the Performia listening core.
//!
//! Everything here is static: sample rate, block size, analysis thresholds,
//! bus location, pedal CC numbers. Values are read once at process start and
//! handed to the bus and listener as plain structs.
//!
//! # Usage
//!
//! ```rust,no_run
//! use perfconf::PerfConfig;
//!
//! let config = PerfConfig::load().expect("Failed to load config");
//! println!("sample rate: {}", config.audio.sample_rate);
//! println!("bus: {}/{}", config.bus.shm_dir.display(), config.bus.name);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins, key by key):
//! 1. `/etc/performia/config.toml` (system)
//! 2. `~/.config/performia/config.toml` (user)
//! 3. `./performia.toml` or the `--config` path (local override)
//! 4. Environment variables (`PERFORMIA_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [audio]
//! sample_rate = 48000
//! block_size = 64
//!
//! [listener]
//! initial_mode = "rhythmic_sync"
//! modes = ["chord_follow", "rhythmic_sync"]
//!
//! [bus]
//! name = "PerformiaBuffer"
//! shm_dir = "/dev/shm"
//!
//! [pedals]
//! midi_port = "FCB1010"
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files_with_override, ConfigSources};
pub use sections::{
    AnalysisConfig, AudioConfig, BusConfig, ChordEmit, ChordsConfig, ListenerConfig,
    PedalsConfig, TelemetryConfig, KNOWN_MODES, MAX_BUS_CAPACITY,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete startup configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PerfConfig {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub chords: ChordsConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub pedals: PedalsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl PerfConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load with an explicit file taking the place of `./performia.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report which files and variables contributed.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files_with_override(config_path);
        Self::load_files(&files)
    }

    /// Merge the given files in order, then apply env overrides and validate.
    pub fn load_files(files: &[PathBuf]) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in files {
            let table = loader::load_table(path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path.clone());
        }

        let mut config = loader::table_to_config(merged).map_err(ConfigError::Invalid)?;
        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio.sample_rate == 0 {
            return Err(ConfigError::Invalid("audio.sample_rate must be > 0".into()));
        }
        if self.audio.block_size == 0 {
            return Err(ConfigError::Invalid("audio.block_size must be > 0".into()));
        }
        if self.audio.channels == 0 {
            return Err(ConfigError::Invalid("audio.channels must be > 0".into()));
        }
        if self.audio.ring_capacity < self.analysis.window_size + self.audio.block_size {
            return Err(ConfigError::Invalid(format!(
                "audio.ring_capacity {} must hold analysis.window_size {} plus one block of {}",
                self.audio.ring_capacity, self.analysis.window_size, self.audio.block_size
            )));
        }
        if self.analysis.fft_size < self.analysis.window_size {
            return Err(ConfigError::Invalid(
                "analysis.fft_size must be >= analysis.window_size".into(),
            ));
        }
        if self.analysis.min_hz <= 0.0 || self.analysis.min_hz >= self.analysis.max_hz {
            return Err(ConfigError::Invalid(
                "analysis.min_hz must be positive and below analysis.max_hz".into(),
            ));
        }
        if self.chords.history == 0 {
            return Err(ConfigError::Invalid("chords.history must be > 0".into()));
        }

        let known = |name: &str| KNOWN_MODES.contains(&name);
        if !known(&self.listener.initial_mode) {
            return Err(ConfigError::Invalid(format!(
                "unknown listener.initial_mode {:?}",
                self.listener.initial_mode
            )));
        }
        if self.listener.modes.is_empty() {
            return Err(ConfigError::Invalid("listener.modes must not be empty".into()));
        }
        if let Some(bad) = self.listener.modes.iter().find(|m| !known(m)) {
            return Err(ConfigError::Invalid(format!("unknown mode {:?} in listener.modes", bad)));
        }
        if !(0.0..=1.0).contains(&self.listener.responsiveness) {
            return Err(ConfigError::Invalid(
                "listener.responsiveness must be within 0..=1".into(),
            ));
        }

        if self.bus.capacity < 2 || self.bus.capacity > MAX_BUS_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "bus.capacity must be within 2..={}",
                MAX_BUS_CAPACITY
            )));
        }
        if self.bus.name.is_empty() || self.bus.name.contains('/') {
            return Err(ConfigError::Invalid(
                "bus.name must be a non-empty file name".into(),
            ));
        }

        Ok(())
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let body = toml::to_string_pretty(self).unwrap_or_else(|e| format!("# unrenderable: {e}\n"));
        format!("# Performia Configuration\n\n{body}")
    }
}
