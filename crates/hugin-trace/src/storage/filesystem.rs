//! Filesystem trace storage.
//!
//! Layout: `<root>/<YYYY-MM-DD>/<HHMMSS>_<trace_id>.json`, one pretty-printed
//! record per trace, dated by the trace's start time. Records are written to
//! a `.tmp` sibling and renamed into place, and readers only consider names
//! ending in `.json`, so a half-written record is never observed. Older
//! records named `<trace_id>.json` are still found by `get`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::task::JoinHandle;

use super::{TraceFilter, TraceStorage};
use crate::config::TraceConfig;
use crate::error::Result;
use crate::hierarchy::{HierarchyConfig, TraceHierarchy};
use crate::render;
use crate::types::{CompleteTrace, TraceListing};

/// Extension of trace record files.
pub const RECORD_EXTENSION: &str = "json";

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_PREFIX_FORMAT: &str = "%H%M%S";
const TIME_PREFIX_LEN: usize = 6;
const TEMP_EXTENSION: &str = "json.tmp";
const OUTLINE_EXTENSION: &str = "outline.txt";

/// Stores each trace as a JSON file under a dated directory.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
    retention_days: u32,
    /// When set, an outline of the trace hierarchy is written next to each record.
    rendered_views: Option<HierarchyConfig>,
}

impl FilesystemStorage {
    /// Create a storage rooted at `root`, creating the directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            retention_days: 30,
            rendered_views: None,
        })
    }

    pub fn from_config(config: &TraceConfig) -> Result<Self> {
        let storage = Self::new(&config.root)?.with_retention_days(config.retention_days);
        if config.render_views {
            Ok(storage.with_rendered_views(config.hierarchy.clone()))
        } else {
            Ok(storage)
        }
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    /// Write an outline side-artifact for each stored trace.
    pub fn with_rendered_views(mut self, hierarchy: HierarchyConfig) -> Self {
        self.rendered_views = Some(hierarchy);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Path a trace is (or would be) stored at.
    pub fn record_path(&self, trace: &CompleteTrace) -> PathBuf {
        let date = trace.start_time.format(DATE_FORMAT).to_string();
        let name = format!(
            "{}_{}.{}",
            trace.start_time.format(TIME_PREFIX_FORMAT),
            trace.trace_id,
            RECORD_EXTENSION
        );
        self.root.join(date).join(name)
    }

    /// Remove date directories older than the retention window.
    pub async fn cleanup_expired(&self) -> Result<Vec<PathBuf>> {
        self.cleanup_expired_at(Utc::now().date_naive()).await
    }

    /// Remove date directories dated strictly before `today - retention_days`.
    pub async fn cleanup_expired_at(&self, today: NaiveDate) -> Result<Vec<PathBuf>> {
        let cutoff = today - chrono::Duration::days(i64::from(self.retention_days));
        let mut removed = Vec::new();

        for (date, dir) in self.date_dirs().await? {
            if date < cutoff {
                tokio::fs::remove_dir_all(&dir).await?;
                removed.push(dir);
            }
        }

        if !removed.is_empty() {
            tracing::info!(
                "Removed {} trace directories older than {}",
                removed.len(),
                cutoff
            );
        }
        Ok(removed)
    }

    /// Run retention cleanup every `interval` until the task is aborted.
    pub fn spawn_cleanup(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.cleanup_expired().await {
                    tracing::warn!("Trace retention cleanup failed: {}", e);
                }
            }
        })
    }

    /// Date directories, newest first. Non-date entries are ignored.
    async fn date_dirs(&self) -> Result<Vec<(NaiveDate, PathBuf)>> {
        let mut dirs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(date) = name
                .to_str()
                .and_then(|n| NaiveDate::parse_from_str(n, DATE_FORMAT).ok())
            {
                dirs.push((date, entry.path()));
            }
        }

        dirs.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(dirs)
    }

    /// Complete record files in `dir`, newest first by time prefix. Records
    /// without a time prefix come last.
    async fn record_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if record_trace_id(&path).is_some() {
                files.push(path);
            }
        }

        files.sort_by(|a, b| {
            let (ta, tb) = (record_time_prefix(a), record_time_prefix(b));
            ta.is_none()
                .cmp(&tb.is_none())
                .then_with(|| tb.cmp(&ta))
                .then_with(|| b.cmp(a))
        });
        Ok(files)
    }

    async fn find(&self, trace_id: &str) -> Result<Option<PathBuf>> {
        if !is_safe_id(trace_id) {
            return Ok(None);
        }

        for (_, dir) in self.date_dirs().await? {
            for path in Self::record_files(&dir).await? {
                if record_trace_id(&path) == Some(trace_id) {
                    return Ok(Some(path));
                }
            }
        }
        Ok(None)
    }

    async fn read_record(path: &Path) -> Result<CompleteTrace> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_outline(&self, trace: &CompleteTrace, record: &Path) {
        let Some(config) = &self.rendered_views else {
            return;
        };
        let outline = render::outline(&TraceHierarchy::build(trace, config));
        let path = record.with_extension(OUTLINE_EXTENSION);
        if let Err(e) = tokio::fs::write(&path, outline).await {
            tracing::warn!("Failed to write trace outline {}: {}", path.display(), e);
        }
    }
}

#[async_trait]
impl TraceStorage for FilesystemStorage {
    async fn store(&self, trace: &CompleteTrace) -> Result<()> {
        let path = self.record_path(trace);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let json = serde_json::to_vec_pretty(trace)?;
        let tmp = path.with_extension(TEMP_EXTENSION);
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        self.write_outline(trace, &path).await;
        tracing::debug!("Stored trace {} at {}", trace.trace_id, path.display());
        Ok(())
    }

    async fn get(&self, trace_id: &str) -> Result<Option<CompleteTrace>> {
        match self.find(trace_id).await? {
            Some(path) => Ok(Some(Self::read_record(&path).await?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        filter: &TraceFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TraceListing>> {
        let mut listings = Vec::new();
        let mut skipped = 0;

        for (_, dir) in self.date_dirs().await? {
            for path in Self::record_files(&dir).await? {
                if listings.len() >= limit {
                    return Ok(listings);
                }
                let trace = match Self::read_record(&path).await {
                    Ok(trace) => trace,
                    Err(e) => {
                        tracing::warn!("Skipping unreadable trace {}: {}", path.display(), e);
                        continue;
                    }
                };
                if !filter.matches(&trace) {
                    continue;
                }
                if skipped < offset {
                    skipped += 1;
                    continue;
                }
                listings.push(trace.listing());
            }
        }

        Ok(listings)
    }

    async fn delete(&self, trace_id: &str) -> Result<bool> {
        let Some(path) = self.find(trace_id).await? else {
            return Ok(false);
        };
        tokio::fs::remove_file(&path).await?;

        let outline = path.with_extension(OUTLINE_EXTENSION);
        match tokio::fs::remove_file(&outline).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove outline {}: {}", outline.display(), e),
        }
        Ok(true)
    }
}

fn record_stem(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    name.strip_suffix(&format!(".{}", RECORD_EXTENSION))
}

fn split_time_prefix(stem: &str) -> Option<(&str, &str)> {
    let bytes = stem.as_bytes();
    let has_time_prefix = bytes.len() > TIME_PREFIX_LEN
        && bytes[..TIME_PREFIX_LEN].iter().all(u8::is_ascii_digit)
        && bytes[TIME_PREFIX_LEN] == b'_';
    has_time_prefix.then(|| (&stem[..TIME_PREFIX_LEN], &stem[TIME_PREFIX_LEN + 1..]))
}

/// Trace id encoded in a record file name, for both `<HHMMSS>_<id>.json`
/// and the bare `<id>.json` naming. `None` for anything that is not a record.
fn record_trace_id(path: &Path) -> Option<&str> {
    let stem = record_stem(path)?;
    Some(split_time_prefix(stem).map_or(stem, |(_, id)| id))
}

/// `HHMMSS` prefix of a record file name.
fn record_time_prefix(path: &Path) -> Option<&str> {
    split_time_prefix(record_stem(path)?).map(|(time, _)| time)
}

fn is_safe_id(trace_id: &str) -> bool {
    !trace_id.is_empty()
        && !trace_id.contains(['/', '\\'])
        && !trace_id.contains("..")
}
