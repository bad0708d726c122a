//! Configuration file support for the hugin CLI.
//!
//! All hugin data is stored in a `.hugin/` directory:
//! - `.hugin/config.toml` - Configuration file
//! - `.hugin/traces/` - Stored traces, one dated directory per day
//! - `.hugin/logs/` - Log files when file logging is enabled
//!
//! Config discovery searches for `.hugin/config.toml` starting from the current
//! directory and walking up to parent directories.

use std::path::{Path, PathBuf};

/// The hugin data directory name.
pub const HUGIN_DIR: &str = ".hugin";
/// The config file name within the hugin directory.
pub const CONFIG_FILE: &str = "config.toml";

use anyhow::{Context, Result};
use hugin_trace::{ConfigValidationError, TraceConfig};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Template written by `hugin init`.
pub const DEFAULT_CONFIG: &str = r#"# Hugin configuration
# Relative paths are resolved against the directory containing .hugin/

[traces]
enabled = true
sampling_rate = 1.0          # Fraction of requests traced (0.0 - 1.0)
storage = "filesystem"       # Options: "filesystem", "in-memory"
root = ".hugin/traces"
retention_days = 30
render_views = true          # Write an .outline.txt next to each trace
cleanup_interval_secs = 3600

# Stages with exactly these names (ignoring case) are never shown
# [traces.hierarchy]
# infrastructure_agents = ["system", "user"]
# phantom_stages = ["unknown", "phantom"]

# Stage ordering rules (replace the defaults); the first match wins
# [[traces.hierarchy.stage_ranks]]
# pattern = "triage"
# rank = 5

[logging]
level = "info"
to_file = false              # Log to .hugin/logs/ instead of stderr
"#;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Trace collection and storage.
    pub traces: TraceConfig,
    /// Diagnostic logging.
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset.
    pub level: String,
    /// Write to rotating files under `.hugin/logs/`.
    pub to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            to_file: false,
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Find and load configuration from current or parent directories.
    pub fn find_and_load() -> Result<Option<(Self, PathBuf)>> {
        let current = std::env::current_dir()?;
        Self::find_and_load_from(&current)
    }

    /// Find and load configuration starting from a specific directory.
    ///
    /// Looks for `.hugin/config.toml` in the directory and its parents and
    /// returns the config together with its `.hugin` directory.
    pub fn find_and_load_from(start: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start.to_path_buf();

        loop {
            let hugin_dir = dir.join(HUGIN_DIR);
            let config_path = hugin_dir.join(CONFIG_FILE);
            if config_path.exists() {
                let config = Self::from_file(&config_path)?;
                return Ok(Some((config, hugin_dir)));
            }

            if !dir.pop() {
                break;
            }
        }

        Ok(None)
    }

    /// Load from an explicit `.hugin` directory, or by discovery.
    ///
    /// Missing configuration yields defaults.
    pub fn load(hugin_dir: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(dir) = hugin_dir {
            let config_path = dir.join(CONFIG_FILE);
            let config = if config_path.exists() {
                Self::from_file(&config_path)?
            } else {
                Self::default()
            };
            return Ok((config, Some(dir.to_path_buf())));
        }

        match Self::find_and_load()? {
            Some((config, dir)) => Ok((config, Some(dir))),
            None => Ok((Self::default(), None)),
        }
    }

    /// Resolve the trace root against the project directory owning `hugin_dir`.
    pub fn resolve_trace_root(&self, hugin_dir: Option<&Path>) -> PathBuf {
        let root = &self.traces.root;
        if root.is_absolute() {
            return root.clone();
        }
        match hugin_dir.and_then(Path::parent) {
            Some(project) => project.join(root),
            None => root.clone(),
        }
    }

    /// Directory for rotating log files.
    pub fn logs_dir(hugin_dir: Option<&Path>) -> PathBuf {
        hugin_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(HUGIN_DIR))
            .join("logs")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut errors = self.traces.validate();

        if EnvFilter::try_new(&self.logging.level).is_err() {
            errors.push(ConfigValidationError {
                field: "logging.level".to_string(),
                message: format!("Invalid log filter '{}'.", self.logging.level),
            });
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hugin_trace::StorageKind;
    use tempfile::tempdir;

    #[test]
    fn test_default_template_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert!(config.traces.enabled);
        assert_eq!(config.traces.storage, StorageKind::Filesystem);
        assert_eq!(config.traces.retention_days, 30);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[traces]
storage = "in-memory"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.traces.storage, StorageKind::InMemory);
        // Defaults should still apply
        assert_eq!(config.traces.sampling_rate, 1.0);
        assert!(!config.logging.to_file);
    }

    #[test]
    fn test_find_and_load_walks_up() {
        let dir = tempdir().unwrap();
        let hugin_dir = dir.path().join(HUGIN_DIR);
        std::fs::create_dir_all(&hugin_dir).unwrap();
        std::fs::write(hugin_dir.join(CONFIG_FILE), "[traces]\nretention_days = 7\n").unwrap();

        let nested = dir.path().join("src").join("agents");
        std::fs::create_dir_all(&nested).unwrap();

        let (config, found) = Config::find_and_load_from(&nested).unwrap().unwrap();
        assert_eq!(config.traces.retention_days, 7);
        assert_eq!(found, hugin_dir);
    }

    #[test]
    fn test_load_explicit_dir_without_file() {
        let dir = tempdir().unwrap();
        let (config, found) = Config::load(Some(dir.path())).unwrap();
        assert_eq!(config.traces.retention_days, 30);
        assert_eq!(found.as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_resolve_trace_root() {
        let config = Config::default();
        assert_eq!(
            config.resolve_trace_root(Some(Path::new("/work/project/.hugin"))),
            PathBuf::from("/work/project/.hugin/traces")
        );
        assert_eq!(config.resolve_trace_root(None), PathBuf::from(".hugin/traces"));

        let mut absolute = Config::default();
        absolute.traces.root = PathBuf::from("/var/traces");
        assert_eq!(
            absolute.resolve_trace_root(Some(Path::new("/work/.hugin"))),
            PathBuf::from("/var/traces")
        );
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "hugin=loud".to_string();
        assert!(config.validate().iter().any(|e| e.field == "logging.level"));
    }
}
