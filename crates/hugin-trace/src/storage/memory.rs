//! Bounded in-memory trace storage.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{TraceFilter, TraceStorage};
use crate::error::{Result, TraceError};
use crate::types::{CompleteTrace, TraceListing};

/// Keeps at most `capacity` traces; inserting a new id at capacity evicts
/// the trace with the oldest `start_time`.
#[derive(Debug)]
pub struct InMemoryStorage {
    capacity: usize,
    traces: RwLock<HashMap<String, CompleteTrace>>,
}

impl InMemoryStorage {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            traces: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored traces.
    pub fn len(&self) -> usize {
        self.traces.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TraceStorage for InMemoryStorage {
    async fn store(&self, trace: &CompleteTrace) -> Result<()> {
        let mut traces = self
            .traces
            .write()
            .map_err(|e| TraceError::Storage(format!("Failed to acquire write lock: {}", e)))?;

        if !traces.contains_key(&trace.trace_id) && traces.len() >= self.capacity {
            let oldest = traces
                .values()
                .min_by_key(|t| t.start_time)
                .map(|t| t.trace_id.clone());
            if let Some(id) = oldest {
                tracing::debug!("Evicting trace {} from in-memory storage", id);
                traces.remove(&id);
            }
        }

        traces.insert(trace.trace_id.clone(), trace.clone());
        Ok(())
    }

    async fn get(&self, trace_id: &str) -> Result<Option<CompleteTrace>> {
        let traces = self
            .traces
            .read()
            .map_err(|e| TraceError::Storage(format!("Failed to acquire read lock: {}", e)))?;
        Ok(traces.get(trace_id).cloned())
    }

    async fn list(
        &self,
        filter: &TraceFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TraceListing>> {
        let traces = self
            .traces
            .read()
            .map_err(|e| TraceError::Storage(format!("Failed to acquire read lock: {}", e)))?;

        let mut matching: Vec<&CompleteTrace> = traces.values().filter(|t| filter.matches(t)).collect();
        matching.sort_by(|a, b| b.start_time.cmp(&a.start_time));

        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(CompleteTrace::listing)
            .collect())
    }

    async fn delete(&self, trace_id: &str) -> Result<bool> {
        let mut traces = self
            .traces
            .write()
            .map_err(|e| TraceError::Storage(format!("Failed to acquire write lock: {}", e)))?;
        Ok(traces.remove(trace_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CorrelationKeys, TraceSource};
    use chrono::{Duration, Utc};
    use std::collections::HashMap;

    fn trace_at(id: &str, minutes_ago: i64, source: TraceSource) -> CompleteTrace {
        let mut trace = CompleteTrace::new(source, "input", CorrelationKeys::default(), HashMap::new());
        trace.trace_id = id.to_string();
        trace.start_time = Utc::now() - Duration::minutes(minutes_ago);
        trace
    }

    #[tokio::test]
    async fn test_evicts_oldest_at_capacity() {
        let storage = InMemoryStorage::new(2);
        storage.store(&trace_at("middle", 5, TraceSource::Evaluation)).await.unwrap();
        storage.store(&trace_at("oldest", 10, TraceSource::Evaluation)).await.unwrap();
        storage.store(&trace_at("newest", 1, TraceSource::Evaluation)).await.unwrap();

        assert_eq!(storage.len(), 2);
        assert!(storage.get("oldest").await.unwrap().is_none());
        assert!(storage.get("middle").await.unwrap().is_some());
        assert!(storage.get("newest").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replacing_does_not_evict() {
        let storage = InMemoryStorage::new(2);
        storage.store(&trace_at("a", 5, TraceSource::Evaluation)).await.unwrap();
        storage.store(&trace_at("b", 3, TraceSource::Evaluation)).await.unwrap();
        storage.store(&trace_at("a", 5, TraceSource::Evaluation)).await.unwrap();

        assert_eq!(storage.len(), 2);
        assert!(storage.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_filters_sorts_and_paginates() {
        let storage = InMemoryStorage::new(10);
        storage.store(&trace_at("e1", 30, TraceSource::Evaluation)).await.unwrap();
        storage.store(&trace_at("p1", 20, TraceSource::Production)).await.unwrap();
        storage.store(&trace_at("e2", 10, TraceSource::Evaluation)).await.unwrap();
        storage.store(&trace_at("e3", 1, TraceSource::Evaluation)).await.unwrap();

        let filter = TraceFilter::default().source(TraceSource::Evaluation);
        let all = storage.list(&filter, 10, 0).await.unwrap();
        let ids: Vec<_> = all.iter().map(|l| l.trace_id.as_str()).collect();
        assert_eq!(ids, vec!["e3", "e2", "e1"]);

        let page = storage.list(&filter, 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].trace_id, "e2");
    }

    #[tokio::test]
    async fn test_delete_unknown_is_false() {
        let storage = InMemoryStorage::new(4);
        assert!(!storage.delete("missing").await.unwrap());
        storage.store(&trace_at("x", 1, TraceSource::Production)).await.unwrap();
        assert!(storage.delete("x").await.unwrap());
        assert!(storage.is_empty());
    }
}
