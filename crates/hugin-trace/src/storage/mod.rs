//! Pluggable persistence for completed traces.
//!
//! Two backends ship with the crate:
//! - [`InMemoryStorage`]: bounded map, evicting the oldest trace at capacity
//! - [`FilesystemStorage`]: one JSON record per trace under dated directories
//!
//! Unknown ids are "not found" (`Ok(None)` / `Ok(false)`), never errors.

mod filesystem;
mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::{StorageKind, TraceConfig};
use crate::error::Result;
use crate::types::{CompleteTrace, TraceListing, TraceSource};

pub use filesystem::{FilesystemStorage, RECORD_EXTENSION};
pub use memory::InMemoryStorage;

/// Trait for trace storage backends.
#[async_trait]
pub trait TraceStorage: Send + Sync {
    /// Persist a completed trace, replacing any previous record with the same id.
    async fn store(&self, trace: &CompleteTrace) -> Result<()>;

    /// Retrieve a trace by id.
    async fn get(&self, trace_id: &str) -> Result<Option<CompleteTrace>>;

    /// List matching traces newest first, as summaries only.
    async fn list(&self, filter: &TraceFilter, limit: usize, offset: usize)
    -> Result<Vec<TraceListing>>;

    /// Delete a trace. Returns whether anything was removed.
    async fn delete(&self, trace_id: &str) -> Result<bool>;
}

/// Thread-safe handle to a storage backend.
pub type SharedTraceStorage = Arc<dyn TraceStorage>;

/// Build the backend selected by `config`.
///
/// Filesystem roots are created eagerly so misconfiguration surfaces at startup.
pub fn from_config(config: &TraceConfig) -> Result<SharedTraceStorage> {
    match config.storage {
        StorageKind::InMemory => Ok(Arc::new(InMemoryStorage::new(config.max_traces))),
        StorageKind::Filesystem => Ok(Arc::new(FilesystemStorage::from_config(config)?)),
    }
}

/// Like [`from_config`], also starting periodic retention cleanup of
/// filesystem storage on the current tokio runtime.
///
/// Abort the returned handle to stop cleanup.
pub fn from_config_with_retention(
    config: &TraceConfig,
) -> Result<(SharedTraceStorage, Option<JoinHandle<()>>)> {
    match config.storage {
        StorageKind::InMemory => Ok((Arc::new(InMemoryStorage::new(config.max_traces)), None)),
        StorageKind::Filesystem => {
            let storage = Arc::new(FilesystemStorage::from_config(config)?);
            let interval = Duration::from_secs(config.cleanup_interval_secs.max(1));
            let cleanup = storage.clone().spawn_cleanup(interval);
            Ok((storage as SharedTraceStorage, Some(cleanup)))
        }
    }
}

/// Equality filters over trace metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceFilter {
    pub source: Option<TraceSource>,
    pub user_id: Option<String>,
    pub test_case_id: Option<String>,
    pub session_id: Option<String>,
}

impl TraceFilter {
    pub fn source(mut self, source: TraceSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn test_case(mut self, test_case_id: impl Into<String>) -> Self {
        self.test_case_id = Some(test_case_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Whether every set field equals the trace's value.
    pub fn matches(&self, trace: &CompleteTrace) -> bool {
        let keys = &trace.correlation;
        self.source.is_none_or(|s| s == trace.source)
            && field_matches(&self.user_id, &keys.user_id)
            && field_matches(&self.test_case_id, &keys.test_case_id)
            && field_matches(&self.session_id, &keys.session_id)
    }
}

fn field_matches(wanted: &Option<String>, actual: &Option<String>) -> bool {
    match wanted {
        Some(w) => actual.as_deref() == Some(w.as_str()),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CorrelationKeys;
    use std::collections::HashMap;

    #[test]
    fn test_filter_matches() {
        let trace = CompleteTrace::new(
            TraceSource::Production,
            "q",
            CorrelationKeys::default().with_user("u1").with_session("s1"),
            HashMap::new(),
        );

        assert!(TraceFilter::default().matches(&trace));
        assert!(TraceFilter::default().user("u1").session("s1").matches(&trace));
        assert!(!TraceFilter::default().user("u2").matches(&trace));
        assert!(!TraceFilter::default().source(TraceSource::Evaluation).matches(&trace));
        assert!(!TraceFilter::default().test_case("tc").matches(&trace));
    }

    #[test]
    fn test_from_config_in_memory() {
        let config = TraceConfig {
            storage: StorageKind::InMemory,
            ..Default::default()
        };
        assert!(from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_retention_task_prunes_expired_days() {
        let dir = tempfile::tempdir().unwrap();
        let expired = dir.path().join("2000-01-01");
        std::fs::create_dir_all(&expired).unwrap();

        let config = TraceConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (_storage, cleanup) = from_config_with_retention(&config).unwrap();
        let cleanup = cleanup.unwrap();

        // The first pass runs immediately.
        for _ in 0..100 {
            if !expired.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cleanup.abort();
        assert!(!expired.exists());
    }
}
