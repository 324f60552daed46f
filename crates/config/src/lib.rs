//! Configuration loading, validation, and management for TokenFold.
//!
//! Loads configuration from `~/.tokenfold/config.toml` with environment
//! variable overrides. Validates the model, the reduction schedule and the
//! cache settings together at load time, so a bad schedule never reaches a
//! forward pass.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokenfold_core::{
    resolve_preset, CacheMode, CachePolicy, CacheSettings, GlobalPool, IfaHeadConfig,
    ReductionSchedule, ReductionSettings,
    VitConfig, PRESET_NAMES,
};

/// The root configuration structure.
///
/// Maps directly to `~/.tokenfold/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Which trunk to build
    #[serde(default)]
    pub model: ModelConfig,

    /// Reduction locations and keep rates
    #[serde(default)]
    pub reduction: ReductionSettings,

    /// Cross-stage cache
    #[serde(default)]
    pub cache: CacheSettings,

    /// Batch size and precision
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Pass tracing and cost estimation
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Model selection: a named preset plus optional overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Preset name, see [`PRESET_NAMES`]
    #[serde(default = "default_preset")]
    pub preset: String,

    /// Safetensors checkpoint; random weights when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_classes: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reg_tokens: Option<usize>,

    /// Carrier tokens; follows `cache.carrier_tokens` when the cache is on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier_tokens: Option<usize>,

    /// Copy the class token into carriers the weights do not provide
    #[serde(default)]
    pub init_carriers_from_cls: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_pool: Option<GlobalPool>,

    /// Classify from the class-token snapshots instead of the pooled output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifa_head: Option<IfaHeadConfig>,
}

fn default_preset() -> String {
    "deit-small".into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            preset: default_preset(),
            weights: None,
            image_size: None,
            depth: None,
            num_classes: None,
            reg_tokens: None,
            carrier_tokens: None,
            init_carriers_from_cls: false,
            global_pool: None,
            ifa_head: None,
        }
    }
}

/// Floating-point precision for weights and activations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    F16,
    Bf16,
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::Bf16 => write!(f, "bf16"),
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Images per forward pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub dtype: Precision,

    /// Concurrent passes for `bench`
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_batch_size() -> usize {
    1
}
fn default_concurrency() -> usize {
    4
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            dtype: Precision::default(),
            concurrency: default_concurrency(),
        }
    }
}

/// Pass tracing and cost estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether pass traces are collected
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum traces kept in memory
    #[serde(default = "default_max_traces")]
    pub max_traces: usize,

    /// Write collected traces here as JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}
fn default_max_traces() -> usize {
    1000
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_traces: default_max_traces(),
            export_path: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.tokenfold/config.toml).
    ///
    /// Environment variables override the file:
    /// - `TOKENFOLD_PRESET`
    /// - `TOKENFOLD_KEEP_RATE` (comma-separated)
    /// - `TOKENFOLD_REDUCTION_LOC` (comma-separated)
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_unvalidated(&config_path)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load_unvalidated(path)?;
        config.validate()?;
        Ok(config)
    }

    fn load_unvalidated(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Apply `TOKENFOLD_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(preset) = std::env::var("TOKENFOLD_PRESET") {
            self.model.preset = preset;
        }
        if let Ok(rates) = std::env::var("TOKENFOLD_KEEP_RATE") {
            self.reduction.keep_rate = parse_list("TOKENFOLD_KEEP_RATE", &rates)?;
        }
        if let Ok(loc) = std::env::var("TOKENFOLD_REDUCTION_LOC") {
            self.reduction.reduction_loc = parse_list("TOKENFOLD_REDUCTION_LOC", &loc)?;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".tokenfold")
    }

    /// Resolve the preset and apply the overrides.
    pub fn vit_config(&self) -> Result<VitConfig, ConfigError> {
        let mut cfg = resolve_preset(&self.model.preset).ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "Unknown model preset '{}'. Available presets: {}",
                self.model.preset,
                PRESET_NAMES.join(", ")
            ))
        })?;

        if let Some(image_size) = self.model.image_size {
            cfg.image_size = image_size;
        }
        if let Some(depth) = self.model.depth {
            cfg.depth = depth;
        }
        if let Some(num_classes) = self.model.num_classes {
            cfg.num_classes = num_classes;
        }
        if let Some(reg_tokens) = self.model.reg_tokens {
            cfg.reg_tokens = reg_tokens;
        }
        cfg.carrier_tokens = match self.model.carrier_tokens {
            Some(carriers) => carriers,
            None if self.cache.enabled => self.cache.carrier_tokens,
            None => cfg.carrier_tokens,
        };
        if self.model.init_carriers_from_cls {
            cfg.init_carriers_from_cls = true;
        }
        if let Some(pool) = self.model.global_pool {
            cfg.global_pool = pool;
        }
        if self.model.ifa_head.is_some() {
            cfg.ifa_head = self.model.ifa_head;
        }
        Ok(cfg)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let vit = self.vit_config()?;
        vit.validate()?;

        let schedule = ReductionSchedule::new(
            vit.depth,
            &self.reduction.reduction_loc,
            &self.reduction.keep_rate,
        )?;
        if !schedule.is_empty() && vit.num_prefix_tokens() == 0 {
            return Err(ConfigError::ValidationError(format!(
                "preset '{}' has no class or register token to score tokens against",
                self.model.preset
            )));
        }

        let mode = CacheMode::resolve(
            self.cache.enabled,
            self.cache.include_global_pool,
            self.cache.carrier_tokens,
        )?;
        let recovery = self.cache.recovery_layers.clone().unwrap_or_else(|| {
            CachePolicy::derive_recovery_layers(
                schedule.reduction_loc(),
                vit.depth,
                self.cache.recover_at_last,
            )
        });
        CachePolicy::new(mode, recovery, vit.depth)?;
        if mode.is_enabled() && mode.carrier_count() != vit.carrier_tokens {
            return Err(ConfigError::ValidationError(format!(
                "cache slices {} carrier tokens but the model has {}",
                mode.carrier_count(),
                vit.carrier_tokens
            )));
        }

        if self.runtime.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.batch_size must be > 0".into(),
            ));
        }
        if self.runtime.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.concurrency must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_list<T: std::str::FromStr>(var: &str, value: &str) -> Result<Vec<T>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse().map_err(|_| {
                ConfigError::ValidationError(format!("{var}: cannot parse '{item}'"))
            })
        })
        .collect()
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<tokenfold_core::Error> for ConfigError {
    fn from(err: tokenfold_core::Error) -> Self {
        Self::ValidationError(err.to_string())
    }
}

impl From<ConfigError> for tokenfold_core::Error {
    fn from(err: ConfigError) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}
