//! Trace collection configuration.
//!
//! Loaded from TOML (every field optional) and then overlaid with
//! `HUGIN_TRACE_*` environment variables.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TraceError};
use crate::hierarchy::HierarchyConfig;

pub const ENV_ENABLED: &str = "HUGIN_TRACE_ENABLED";
pub const ENV_STORAGE: &str = "HUGIN_TRACE_STORAGE";
pub const ENV_DIR: &str = "HUGIN_TRACE_DIR";
pub const ENV_RETENTION_DAYS: &str = "HUGIN_TRACE_RETENTION_DAYS";
pub const ENV_SAMPLING_RATE: &str = "HUGIN_TRACE_SAMPLING_RATE";

/// Which storage backend completed traces go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    #[default]
    Filesystem,
    InMemory,
}

impl FromStr for StorageKind {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "filesystem" | "fs" => Ok(StorageKind::Filesystem),
            "in-memory" | "in_memory" | "memory" => Ok(StorageKind::InMemory),
            other => Err(TraceError::Config(format!("Unknown storage kind '{}'", other))),
        }
    }
}

/// Trace collection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Master switch; when false no trace is recorded.
    pub enabled: bool,
    /// Fraction of traces recorded (0.0 to 1.0).
    pub sampling_rate: f64,
    /// Storage backend.
    pub storage: StorageKind,
    /// Root directory for filesystem storage.
    pub root: PathBuf,
    /// Days a dated trace directory is kept.
    pub retention_days: u32,
    /// Capacity of in-memory storage.
    pub max_traces: usize,
    /// Write an outline next to each stored trace.
    pub render_views: bool,
    /// Interval between retention cleanup passes.
    pub cleanup_interval_secs: u64,
    /// Hierarchy builder settings.
    pub hierarchy: HierarchyConfig,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sampling_rate: 1.0,
            storage: StorageKind::Filesystem,
            root: PathBuf::from(".hugin/traces"),
            retention_days: 30,
            max_traces: 1000,
            render_views: true,
            cleanup_interval_secs: 3600,
            hierarchy: HierarchyConfig::default(),
        }
    }
}

impl TraceConfig {
    /// Parse from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Overlay `HUGIN_TRACE_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay variables resolved by `lookup`. Unparseable values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup(ENV_ENABLED) {
            match v.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.enabled = true,
                "0" | "false" | "no" | "off" => self.enabled = false,
                _ => tracing::warn!("Ignoring invalid {}='{}'", ENV_ENABLED, v),
            }
        }
        if let Some(v) = lookup(ENV_STORAGE) {
            match v.parse() {
                Ok(kind) => self.storage = kind,
                Err(e) => tracing::warn!("Ignoring invalid {}: {}", ENV_STORAGE, e),
            }
        }
        if let Some(v) = lookup(ENV_DIR) {
            self.root = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_RETENTION_DAYS) {
            match v.parse() {
                Ok(days) => self.retention_days = days,
                Err(_) => tracing::warn!("Ignoring invalid {}='{}'", ENV_RETENTION_DAYS, v),
            }
        }
        if let Some(v) = lookup(ENV_SAMPLING_RATE) {
            match v.parse() {
                Ok(rate) => self.sampling_rate = rate,
                Err(_) => tracing::warn!("Ignoring invalid {}='{}'", ENV_SAMPLING_RATE, v),
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Returns a list of validation errors if any are found.
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();

        if !(0.0..=1.0).contains(&self.sampling_rate) {
            errors.push(ConfigValidationError::new(
                "sampling_rate",
                format!("Sampling rate {} is outside 0.0..=1.0.", self.sampling_rate),
            ));
        }

        if self.storage == StorageKind::InMemory && self.max_traces == 0 {
            errors.push(ConfigValidationError::new(
                "max_traces",
                "In-memory storage needs a capacity of at least 1.",
            ));
        }

        if self.storage == StorageKind::Filesystem && self.root.as_os_str().is_empty() {
            errors.push(ConfigValidationError::new(
                "root",
                "Filesystem storage needs a root directory.",
            ));
        }

        if self.cleanup_interval_secs == 0 {
            errors.push(ConfigValidationError::new(
                "cleanup_interval_secs",
                "Cleanup interval must be positive.",
            ));
        }

        errors
    }
}

/// Configuration validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl ConfigValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigValidationError {}
