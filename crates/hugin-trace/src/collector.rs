//! Trace collector.
//!
//! Owns the table of open traces. `start_trace` opens a trace and activates
//! its context in the current task-local slot; `add_event` appends to the
//! trace named by the ambient context (silently doing nothing without one);
//! `end_trace` freezes, summarizes, and hands the trace to storage.
//!
//! The table sits behind a single mutex held only for a map lookup and a
//! vector push, so concurrent agents serialize on bookkeeping, never on work.
//!
//! One collector per process, constructed by the entry point and shared as
//! `Arc<TraceCollector>`.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use crate::config::TraceConfig;
use crate::context::{self, ContextUpdate, TraceContext};
use crate::error::{Result, TraceError};
use crate::payload::{self, EventPayload, StageEnd, StageStatus};
use crate::storage::{self, SharedTraceStorage, TraceFilter};
use crate::types::{
    CompleteTrace, CorrelationKeys, EventType, Payload, TraceEvent, TraceListing, TraceSource,
};

/// Agent label of the initial `user_query` event.
pub const USER_AGENT: &str = "user";
/// Stage label of the initial `user_query` event.
pub const INPUT_STAGE: &str = "input";
/// Label used when neither the event nor the context names an agent or stage.
/// Distinct from the phantom stage names so such work stays visible.
pub const UNATTRIBUTED_LABEL: &str = "unattributed";
/// Event metadata key carrying the context's current prompt file.
pub const PROMPT_FILE_KEY: &str = "prompt_file";

/// An event to append; unset agent/stage fall back to the context's pointer.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: EventType,
    pub agent_type: Option<String>,
    pub stage: Option<String>,
    pub data: Payload,
    pub parent_event_id: Option<String>,
    pub duration_ms: Option<u64>,
    pub tokens_used: Option<u64>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NewEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            agent_type: None,
            stage: None,
            data: Payload::new(),
            parent_event_id: None,
            duration_ms: None,
            tokens_used: None,
            metadata: HashMap::new(),
        }
    }

    /// Event typed by its payload.
    pub fn from_payload<P: EventPayload>(payload: &P) -> Self {
        Self::new(P::EVENT_TYPE).data(payload.to_payload())
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_type = Some(agent.into());
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn data(mut self, data: Payload) -> Self {
        self.data = data;
        self
    }

    /// Set one payload field. Values that fail to serialize are skipped.
    pub fn field(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.data.insert(key.into(), v);
        }
        self
    }

    pub fn parent(mut self, event_id: impl Into<String>) -> Self {
        self.parent_event_id = Some(event_id.into());
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }

    fn into_event(self, ctx: Option<&TraceContext>, trace_id: &str) -> TraceEvent {
        let agent = self
            .agent_type
            .or_else(|| ctx.and_then(|c| c.current_agent.clone()))
            .unwrap_or_else(|| UNATTRIBUTED_LABEL.to_string());
        let stage = self
            .stage
            .or_else(|| ctx.and_then(|c| c.current_stage.clone()))
            .unwrap_or_else(|| UNATTRIBUTED_LABEL.to_string());

        let mut event = TraceEvent::new(trace_id, self.event_type, agent, stage, self.data);
        event.parent_event_id = self.parent_event_id;
        event.duration_ms = self.duration_ms;
        event.tokens_used = self.tokens_used;
        event.metadata = self.metadata;

        if let Some(file) = ctx.and_then(|c| c.current_prompt_file.as_ref()) {
            event
                .metadata
                .entry(PROMPT_FILE_KEY.to_string())
                .or_insert_with(|| serde_json::Value::String(file.clone()));
        }
        event
    }
}

/// Coordinates open traces and hands closed ones to storage.
pub struct TraceCollector {
    active: Mutex<HashMap<String, CompleteTrace>>,
    storage: SharedTraceStorage,
    enabled: bool,
    sampling_rate: f64,
}

impl TraceCollector {
    /// Create a collector recording every trace into `storage`.
    pub fn new(storage: SharedTraceStorage) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            storage,
            enabled: true,
            sampling_rate: 1.0,
        }
    }

    /// Create a collector and its storage backend from configuration.
    pub fn from_config(config: &TraceConfig) -> Result<Self> {
        if let Some(err) = config.validate().into_iter().next() {
            return Err(TraceError::Config(err.to_string()));
        }
        let storage = storage::from_config(config)?;
        Ok(Self::new(storage).with_sampling(config.enabled, config.sampling_rate))
    }

    /// Record only when `enabled`, and then only a `rate` fraction of traces.
    pub fn with_sampling(mut self, enabled: bool, rate: f64) -> Self {
        self.enabled = enabled;
        self.sampling_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn storage(&self) -> &SharedTraceStorage {
        &self.storage
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, CompleteTrace>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sampled(&self) -> bool {
        if !self.enabled {
            return false;
        }
        self.sampling_rate >= 1.0 || rand::random::<f64>() < self.sampling_rate
    }

    /// Open a trace, record its `user_query` event, and activate its context.
    ///
    /// Returns `None` when the trace is sampled out; emission then no-ops.
    /// The context is only retrievable inside a [`context::with_context`] or
    /// [`context::fork`] scope; outside one, use [`Self::add_event_to`].
    pub fn start_trace(
        &self,
        source: TraceSource,
        initial_input: impl Into<String>,
        correlation: CorrelationKeys,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Option<String> {
        if !self.sampled() {
            tracing::debug!("Trace sampled out");
            return None;
        }

        let initial_input = initial_input.into();
        let mut trace = CompleteTrace::new(source, initial_input.clone(), correlation.clone(), metadata);
        let trace_id = trace.trace_id.clone();

        let query = payload::UserQuery {
            query: initial_input,
        };
        trace.events.push(TraceEvent::new(
            &trace_id,
            EventType::UserQuery,
            USER_AGENT,
            INPUT_STAGE,
            query.to_payload(),
        ));

        self.active().insert(trace_id.clone(), trace);
        if !context::set_context(TraceContext::new(&trace_id, source, correlation)) {
            tracing::warn!(
                "Trace {} started outside a context scope; it stays open until end_trace is called with its id",
                trace_id
            );
        }

        tracing::debug!("Started {} trace {}", source, trace_id);
        Some(trace_id)
    }

    /// Append an event to the trace of the ambient context.
    ///
    /// Returns the new event id, or `None` when no trace is active.
    pub fn add_event(&self, event: NewEvent) -> Option<String> {
        let ctx = context::get_context()?;
        let event = event.into_event(Some(&ctx), &ctx.trace_id);
        self.append(event)
    }

    /// Append an event to an explicitly named open trace.
    pub fn add_event_to(&self, trace_id: &str, event: NewEvent) -> Option<String> {
        let ctx = context::get_context().filter(|c| c.trace_id == trace_id);
        let event = event.into_event(ctx.as_ref(), trace_id);
        self.append(event)
    }

    fn append(&self, event: TraceEvent) -> Option<String> {
        let event_id = event.event_id.clone();
        let mut active = self.active();
        match active.get_mut(&event.trace_id) {
            Some(trace) => {
                trace.events.push(event);
                Some(event_id)
            }
            None => {
                tracing::debug!("Dropping event for unknown trace {}", event.trace_id);
                None
            }
        }
    }

    /// Close a trace (explicit id, or the ambient context's) and persist it.
    ///
    /// `Ok(None)` when the trace is unknown or already closed. A storage
    /// failure is returned as [`TraceError::Persist`]; the trace has already
    /// left the active table by then.
    pub async fn end_trace(&self, trace_id: Option<&str>) -> Result<Option<CompleteTrace>> {
        let Some(trace_id) = trace_id.map(str::to_string).or_else(context::current_trace_id) else {
            return Ok(None);
        };

        let removed = self.active().remove(&trace_id);
        let Some(mut trace) = removed else {
            tracing::debug!("end_trace for unknown or closed trace {}", trace_id);
            return Ok(None);
        };

        trace.close(Utc::now());
        if context::current_trace_id().as_deref() == Some(trace_id.as_str()) {
            context::clear_context();
        }

        if let Err(e) = self.storage.store(&trace).await {
            tracing::error!("Failed to persist trace {}: {}", trace_id, e);
            return Err(TraceError::Persist {
                trace_id,
                source: Box::new(e),
            });
        }

        tracing::info!(
            "Closed trace {} ({} events, {}ms)",
            trace.trace_id,
            trace.events.len(),
            trace.total_duration_ms.unwrap_or(0)
        );
        Ok(Some(trace))
    }

    /// Run `f` as a complete trace in its own context scope.
    ///
    /// The output is always returned; the second element reports how closing
    /// and persisting the trace went.
    pub async fn traced<F: Future>(
        &self,
        source: TraceSource,
        initial_input: impl Into<String>,
        correlation: CorrelationKeys,
        metadata: HashMap<String, serde_json::Value>,
        f: F,
    ) -> (F::Output, Result<Option<CompleteTrace>>) {
        let initial_input = initial_input.into();
        context::with_context(None, async move {
            let trace_id = self.start_trace(source, initial_input, correlation, metadata);
            let output = f.await;
            let trace = match trace_id {
                Some(id) => self.end_trace(Some(&id)).await,
                None => Ok(None),
            };
            (output, trace)
        })
        .await
    }

    /// Emit `stage_start` now and `stage_end` when the guard drops.
    pub fn stage(&self, agent_type: &str, stage: &str, extra: Payload) -> StageGuard<'_> {
        let trace_id = context::current_trace_id();
        let start = NewEvent::new(EventType::StageStart)
            .agent(agent_type)
            .stage(stage)
            .data(extra);
        let start_event_id = trace_id.as_deref().and_then(|id| self.add_event_to(id, start));

        StageGuard {
            collector: self,
            trace_id: start_event_id.as_ref().and(trace_id),
            agent_type: agent_type.to_string(),
            stage: stage.to_string(),
            start_event_id,
            started: Instant::now(),
            outcome: None,
        }
    }

    /// Run `f` bracketed by balanced `stage_start` / `stage_end` events.
    ///
    /// `f` runs in a forked context whose pointer names this agent and stage.
    /// If the returned future is dropped early, `stage_end` still fires with
    /// status `interrupted`.
    pub async fn trace_operation<F: Future>(
        &self,
        agent_type: &str,
        stage: &str,
        extra: Payload,
        f: F,
    ) -> F::Output {
        let guard = self.stage(agent_type, stage, extra);
        let update = ContextUpdate::default().agent(agent_type).stage(stage);
        let output = context::fork_with(update, f).await;
        guard.complete();
        output
    }

    /// Like [`Self::trace_operation`], marking the stage failed on `Err`.
    pub async fn trace_result<T, E, F>(
        &self,
        agent_type: &str,
        stage: &str,
        extra: Payload,
        f: F,
    ) -> std::result::Result<T, E>
    where
        E: Display,
        F: Future<Output = std::result::Result<T, E>>,
    {
        let guard = self.stage(agent_type, stage, extra);
        let update = ContextUpdate::default().agent(agent_type).stage(stage);
        let output = context::fork_with(update, f).await;
        match &output {
            Ok(_) => guard.complete(),
            Err(e) => guard.fail(e),
        }
        output
    }

    /// Snapshot of an open trace.
    pub fn get_active_trace(&self, trace_id: &str) -> Option<CompleteTrace> {
        self.active().get(trace_id).cloned()
    }

    /// Number of open traces.
    pub fn active_trace_count(&self) -> usize {
        self.active().len()
    }

    pub async fn get_stored_trace(&self, trace_id: &str) -> Result<Option<CompleteTrace>> {
        self.storage.get(trace_id).await
    }

    pub async fn list_traces(
        &self,
        filter: &TraceFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TraceListing>> {
        self.storage.list(filter, limit, offset).await
    }

    pub async fn delete_trace(&self, trace_id: &str) -> Result<bool> {
        self.storage.delete(trace_id).await
    }
}

/// Emits the closing `stage_end` of a stage on drop.
///
/// Dropping without [`complete`](Self::complete) or [`fail`](Self::fail)
/// (panic, cancellation, early return) records status `interrupted`.
#[must_use = "dropping the guard immediately ends the stage"]
pub struct StageGuard<'a> {
    collector: &'a TraceCollector,
    trace_id: Option<String>,
    agent_type: String,
    stage: String,
    start_event_id: Option<String>,
    started: Instant,
    outcome: Option<(StageStatus, Option<String>)>,
}

impl StageGuard<'_> {
    /// Id of the `stage_start` event, if one was recorded.
    pub fn start_event_id(&self) -> Option<&str> {
        self.start_event_id.as_deref()
    }

    pub fn complete(mut self) {
        self.outcome = Some((StageStatus::Completed, None));
    }

    pub fn fail(mut self, error: impl Display) {
        self.outcome = Some((StageStatus::Failed, Some(error.to_string())));
    }
}

impl Drop for StageGuard<'_> {
    fn drop(&mut self) {
        let (Some(trace_id), Some(start_event_id)) = (self.trace_id.take(), self.start_event_id.take())
        else {
            return;
        };

        let (status, error) = match self.outcome.take() {
            Some(outcome) if !std::thread::panicking() => outcome,
            _ => (StageStatus::Interrupted, None),
        };
        let end = StageEnd {
            start_event_id,
            status,
            error,
        };
        let event = NewEvent::from_payload(&end)
            .agent(self.agent_type.as_str())
            .stage(self.stage.as_str())
            .duration_ms(self.started.elapsed().as_millis() as u64);
        self.collector.add_event_to(&trace_id, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{update_context, with_context};
    use crate::hierarchy::{HierarchyConfig, TraceHierarchy};
    use crate::payload::{LlmPrompt, LlmResponse, ToolInvocation, ToolResult};
    use crate::storage::{InMemoryStorage, TraceStorage};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    fn collector() -> (TraceCollector, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new(16));
        (TraceCollector::new(storage.clone()), storage)
    }

    fn start(c: &TraceCollector) -> String {
        c.start_trace(
            TraceSource::Evaluation,
            "plan a trip",
            CorrelationKeys::default().with_test_case("tc-1"),
            HashMap::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_add_event_without_context_is_noop() {
        let (c, _) = collector();
        assert!(c.add_event(NewEvent::new(EventType::IntermediateStep)).is_none());
        assert!(c.end_trace(None).await.unwrap().is_none());
        assert_eq!(c.active_trace_count(), 0);
    }

    #[tokio::test]
    async fn test_tool_call_scenario() {
        let (c, storage) = collector();
        let trace = with_context(None, async {
            let id = start(&c);
            update_context(ContextUpdate::default().agent("planner").stage("planning"));

            let prompt = LlmPrompt {
                prompt: "plan".to_string(),
                model: Some("m".to_string()),
                prompt_file: None,
            };
            c.add_event(NewEvent::from_payload(&prompt)).unwrap();
            let response = LlmResponse {
                response: "calling".to_string(),
                has_tool_calls: true,
                tool_call_count: 1,
                model: None,
            };
            c.add_event(NewEvent::from_payload(&response).tokens(30)).unwrap();
            let invocation = ToolInvocation {
                tool_call_id: "t1".to_string(),
                tool_name: "search".to_string(),
                arguments: json!({}),
            };
            c.add_event(NewEvent::from_payload(&invocation)).unwrap();
            let result = ToolResult {
                tool_call_id: Some("t1".to_string()),
                tool_name: None,
                result: json!("found"),
                success: true,
            };
            c.add_event(NewEvent::from_payload(&result)).unwrap();

            assert_eq!(c.get_active_trace(&id).unwrap().events.len(), 5);
            let trace = c.end_trace(None).await.unwrap().unwrap();
            assert!(!context::is_tracing());
            trace
        })
        .await;

        assert_eq!(trace.events.len(), 5);
        assert_eq!(trace.events[0].event_type, EventType::UserQuery);
        assert_eq!(trace.events[1].agent_type, "planner");
        let summary = trace.summary.as_ref().unwrap();
        assert_eq!(summary.llm_calls, 1);
        assert_eq!(summary.tool_calls, 1);
        assert_eq!(summary.total_tokens, 30);
        assert!(trace.total_duration_ms.is_some());

        assert_eq!(storage.get(&trace.trace_id).await.unwrap().unwrap(), trace);
        assert_eq!(c.active_trace_count(), 0);
    }

    #[tokio::test]
    async fn test_double_close_returns_none() {
        let (c, _) = collector();
        with_context(None, async {
            let id = start(&c);
            assert!(c.end_trace(Some(&id)).await.unwrap().is_some());
            assert!(c.end_trace(Some(&id)).await.unwrap().is_none());
            assert!(c.end_trace(Some("never-existed")).await.unwrap().is_none());
            assert!(c.add_event(NewEvent::new(EventType::Error)).is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn test_sampling_disabled_records_nothing() {
        let (c, storage) = collector();
        let c = c.with_sampling(false, 1.0);
        let (out, trace) = c
            .traced(TraceSource::Production, "q", CorrelationKeys::default(), HashMap::new(), async {
                c.add_event(NewEvent::new(EventType::FinalResult))
            })
            .await;
        assert!(out.is_none());
        assert!(trace.unwrap().is_none());
        assert!(storage.is_empty());

        let zero = collector().0.with_sampling(true, 0.0);
        assert!(with_context(None, async {
            zero.start_trace(TraceSource::Production, "q", CorrelationKeys::default(), HashMap::new())
        })
        .await
        .is_none());
    }

    #[tokio::test]
    async fn test_start_trace_outside_scope_closes_by_id() {
        let (c, storage) = collector();
        let id = start(&c);
        assert_eq!(c.active_trace_count(), 1);

        assert!(c.add_event(NewEvent::new(EventType::IntermediateStep)).is_none());
        let step = NewEvent::new(EventType::IntermediateStep).agent("a").stage("s");
        assert!(c.add_event_to(&id, step).is_some());
        assert!(c.end_trace(None).await.unwrap().is_none());

        let trace = c.end_trace(Some(&id)).await.unwrap().unwrap();
        assert_eq!(trace.events.len(), 2);
        assert_eq!(c.active_trace_count(), 0);
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_unattributed_events_stay_in_hierarchy() {
        let (c, _) = collector();
        let (_, trace) = c
            .traced(TraceSource::Evaluation, "q", CorrelationKeys::default(), HashMap::new(), async {
                c.add_event(NewEvent::from_payload(&LlmPrompt {
                    prompt: "before any pointer".to_string(),
                    model: None,
                    prompt_file: None,
                }));
            })
            .await;
        let trace = trace.unwrap().unwrap();
        assert_eq!(trace.events[1].agent_type, UNATTRIBUTED_LABEL);
        assert_eq!(trace.events[1].stage, UNATTRIBUTED_LABEL);

        let h = TraceHierarchy::build(&trace, &HierarchyConfig::default());
        assert_eq!(h.summary.filtered_events, 0);
        assert_eq!(h.agents.len(), 1);
        assert_eq!(h.agents[0].agent_type, UNATTRIBUTED_LABEL);
        assert_eq!(h.agents[0].llm_calls, 1);
    }

    #[tokio::test]
    async fn test_prompt_file_recorded_in_metadata() {
        let (c, _) = collector();
        let (_, trace) = c
            .traced(TraceSource::Evaluation, "q", CorrelationKeys::default(), HashMap::new(), async {
                update_context(ContextUpdate::default().agent("a").stage("s").prompt_file("plan.md"));
                c.add_event(NewEvent::new(EventType::IntermediateStep).metadata("k", 1));
            })
            .await;
        let trace = trace.unwrap().unwrap();
        let event = &trace.events[1];
        assert_eq!(event.metadata[PROMPT_FILE_KEY], json!("plan.md"));
        assert_eq!(event.metadata["k"], json!(1));
    }

    #[tokio::test]
    async fn test_trace_operation_balances_stage_markers() {
        let (c, _) = collector();
        let (value, trace) = c
            .traced(TraceSource::Evaluation, "q", CorrelationKeys::default(), HashMap::new(), async {
                c.trace_operation("worker", "execution", Payload::new(), async {
                    c.add_event(NewEvent::new(EventType::IntermediateStep));
                    7
                })
                .await
            })
            .await;
        assert_eq!(value, 7);

        let events = trace.unwrap().unwrap().events;
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::UserQuery,
                EventType::StageStart,
                EventType::IntermediateStep,
                EventType::StageEnd
            ]
        );
        // Nested event inherits the operation's agent and stage.
        assert_eq!(events[2].agent_type, "worker");
        assert_eq!(events[2].stage, "execution");

        let end: StageEnd = events[3].payload().unwrap();
        assert_eq!(end.start_event_id, events[1].event_id);
        assert_eq!(end.status, StageStatus::Completed);
        assert!(events[3].duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_trace_result_marks_failure() {
        let (c, _) = collector();
        let (out, trace) = c
            .traced(TraceSource::Evaluation, "q", CorrelationKeys::default(), HashMap::new(), async {
                c.trace_result("worker", "execution", Payload::new(), async {
                    Err::<(), _>("tool crashed")
                })
                .await
            })
            .await;
        assert!(out.is_err());

        let events = trace.unwrap().unwrap().events;
        let end: StageEnd = events.last().unwrap().payload().unwrap();
        assert_eq!(end.status, StageStatus::Failed);
        assert_eq!(end.error.as_deref(), Some("tool crashed"));
    }

    #[tokio::test]
    async fn test_dropped_operation_records_interrupted() {
        let (c, _) = collector();
        let (_, trace) = c
            .traced(TraceSource::Evaluation, "q", CorrelationKeys::default(), HashMap::new(), async {
                let op = c.trace_operation("worker", "execution", Payload::new(), async {
                    std::future::pending::<()>().await
                });
                let _ = tokio::time::timeout(std::time::Duration::from_millis(5), op).await;
            })
            .await;

        let events = trace.unwrap().unwrap().events;
        let end: StageEnd = events.last().unwrap().payload().unwrap();
        assert_eq!(end.status, StageStatus::Interrupted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_workers_lose_no_events() {
        let (c, _) = collector();
        let c = Arc::new(c);

        let inner = c.clone();
        let (_, trace) = c
            .traced(TraceSource::Evaluation, "q", CorrelationKeys::default(), HashMap::new(), async move {
                let mut handles = Vec::new();
                for worker in 0..8 {
                    let c = inner.clone();
                    handles.push(context::spawn(async move {
                        update_context(ContextUpdate::default().agent(format!("worker-{}", worker)));
                        for step in 0..25 {
                            c.add_event(NewEvent::new(EventType::IntermediateStep).stage("execution").field("step", step));
                            tokio::task::yield_now().await;
                        }
                        context::get_context().unwrap().current_agent
                    }));
                }
                for (worker, handle) in handles.into_iter().enumerate() {
                    let agent = handle.await.unwrap();
                    assert_eq!(agent, Some(format!("worker-{}", worker)));
                }
            })
            .await;

        let trace = trace.unwrap().unwrap();
        assert_eq!(trace.events.len(), 1 + 8 * 25);
        assert_eq!(trace.summary.unwrap().agents_involved.len(), 9);
    }

    struct FailingStorage;

    #[async_trait]
    impl TraceStorage for FailingStorage {
        async fn store(&self, _trace: &CompleteTrace) -> Result<()> {
            Err(TraceError::Storage("disk full".to_string()))
        }

        async fn get(&self, _trace_id: &str) -> Result<Option<CompleteTrace>> {
            Ok(None)
        }

        async fn list(&self, _f: &TraceFilter, _l: usize, _o: usize) -> Result<Vec<TraceListing>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _trace_id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_storage_failure_is_reported() {
        let c = TraceCollector::new(Arc::new(FailingStorage));
        let (out, trace) = c
            .traced(TraceSource::Production, "q", CorrelationKeys::default(), HashMap::new(), async { 1 })
            .await;
        assert_eq!(out, 1);
        assert!(matches!(trace, Err(TraceError::Persist { .. })));
        assert_eq!(c.active_trace_count(), 0);
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let config = TraceConfig {
            sampling_rate: -1.0,
            storage: crate::config::StorageKind::InMemory,
            ..Default::default()
        };
        assert!(matches!(
            TraceCollector::from_config(&config),
            Err(TraceError::Config(_))
        ));
    }
}
