//! End-to-end tests: collector -> storage -> hierarchy.

use std::collections::HashMap;
use std::sync::Arc;

use hugin_trace::context::{self, update_context};
use hugin_trace::payload::{LlmPrompt, LlmResponse, StageEnd, ToolInvocation, ToolResult};
use hugin_trace::{
    ContextUpdate, CorrelationKeys, EventType, FilesystemStorage, HierarchyConfig, InMemoryStorage,
    NewEvent, Payload, StageStatus, TraceCollector, TraceFilter, TraceHierarchy, TraceSource,
    TraceStorage,
};
use serde_json::json;
use tempfile::tempdir;

fn prompt(text: &str) -> NewEvent {
    NewEvent::from_payload(&LlmPrompt {
        prompt: text.to_string(),
        model: None,
        prompt_file: None,
    })
}

fn response(tool_calls: usize) -> NewEvent {
    NewEvent::from_payload(&LlmResponse {
        response: "ok".to_string(),
        has_tool_calls: tool_calls > 0,
        tool_call_count: tool_calls,
        model: None,
    })
}

fn invocation(id: &str) -> NewEvent {
    NewEvent::from_payload(&ToolInvocation {
        tool_call_id: id.to_string(),
        tool_name: "search".to_string(),
        arguments: json!({ "q": "oslo" }),
    })
}

fn result(id: &str) -> NewEvent {
    NewEvent::from_payload(&ToolResult {
        tool_call_id: Some(id.to_string()),
        tool_name: None,
        result: json!("3 hits"),
        success: true,
    })
}

#[tokio::test]
async fn test_single_agent_tool_call_round_trip() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(FilesystemStorage::new(dir.path()).unwrap());
    let collector = TraceCollector::new(storage.clone());

    let (_, trace) = collector
        .traced(
            TraceSource::Evaluation,
            "find flights",
            CorrelationKeys::default().with_test_case("tc-42"),
            HashMap::new(),
            async {
                update_context(ContextUpdate::default().agent("planner").stage("planning"));
                collector.add_event(prompt("plan"));
                collector.add_event(response(1));
                collector.add_event(invocation("t1"));
                collector.add_event(result("t1"));
            },
        )
        .await;
    let trace = trace.unwrap().unwrap();

    let summary = trace.summary.as_ref().unwrap();
    assert_eq!(trace.events.len(), 5);
    assert_eq!(summary.llm_calls, 1);
    assert_eq!(summary.tool_calls, 1);

    // Stored copy is identical and listable by correlation key.
    let stored = storage.get(&trace.trace_id).await.unwrap().unwrap();
    assert_eq!(stored, trace);
    let listed = collector
        .list_traces(&TraceFilter::default().test_case("tc-42"), 10, 0)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].event_count, 5);
    assert!(
        collector
            .list_traces(&TraceFilter::default().source(TraceSource::Production), 10, 0)
            .await
            .unwrap()
            .is_empty()
    );

    let h = TraceHierarchy::build(&stored, &HierarchyConfig::default());
    assert_eq!(h.summary.skipped_events, 1);
    let stage = &h.agents[0].stages[0];
    let chain: Vec<_> = stage.events[0].walk().iter().map(|n| (n.event.event_type, n.level)).collect();
    assert_eq!(
        chain,
        vec![
            (EventType::LlmPrompt, 0),
            (EventType::LlmResponse, 1),
            (EventType::ToolInvocation, 2),
            (EventType::ToolResult, 3),
        ]
    );

    assert!(collector.delete_trace(&trace.trace_id).await.unwrap());
    assert!(collector.get_stored_trace(&trace.trace_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_ghost_result_is_kept_at_top_level() {
    let collector = TraceCollector::new(Arc::new(InMemoryStorage::new(4)));
    let (_, trace) = collector
        .traced(TraceSource::Production, "q", CorrelationKeys::default(), HashMap::new(), async {
            update_context(ContextUpdate::default().agent("worker").stage("execution"));
            collector.add_event(result("never-invoked"));
            collector.add_event(prompt("continue"));
        })
        .await;
    let trace = trace.unwrap().unwrap();

    let h = TraceHierarchy::build(&trace, &HierarchyConfig::default());
    let stage = &h.agents[0].stages[0];
    assert_eq!(stage.events[0].event.event_type, EventType::ToolResult);
    assert_eq!(stage.events[0].level, 0);
    assert_eq!(h.node_count() + h.summary.skipped_events, trace.events.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_specialists_keep_their_own_context() {
    let collector = Arc::new(TraceCollector::new(Arc::new(InMemoryStorage::new(4))));
    let inner = collector.clone();

    let (_, trace) = collector
        .traced(TraceSource::Evaluation, "q", CorrelationKeys::default(), HashMap::new(), async move {
            let mut handles = Vec::new();
            for name in ["flights", "hotels", "weather"] {
                let c = inner.clone();
                handles.push(context::spawn(async move {
                    c.trace_operation(name, "research", Payload::new(), async {
                        let call_id = format!("{}-1", name);
                        c.add_event(prompt(name));
                        tokio::task::yield_now().await;
                        c.add_event(response(1));
                        c.add_event(invocation(&call_id));
                        tokio::task::yield_now().await;
                        c.add_event(result(&call_id));
                    })
                    .await
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }
            // The parent's pointer is untouched by its branches.
            assert_eq!(context::get_context().unwrap().current_agent, None);
        })
        .await;
    let trace = trace.unwrap().unwrap();

    // user_query + 3 x (start, 4 events, end)
    assert_eq!(trace.events.len(), 1 + 3 * 6);

    let h = TraceHierarchy::build(&trace, &HierarchyConfig::default());
    assert_eq!(h.agents.len(), 3);
    for agent in &h.agents {
        assert_eq!(agent.stages.len(), 1);
        assert_eq!(agent.tool_calls, 1);
        let prompt_node = agent
            .events()
            .find(|n| n.event.event_type == EventType::LlmPrompt)
            .unwrap();
        // Each result links to its own agent's invocation.
        let result_node = &prompt_node.children[0].children[0].children[0];
        assert_eq!(
            result_node.event.linked_tool_call_id(),
            Some(format!("{}-1", agent.agent_type).as_str())
        );
    }
}

#[tokio::test]
async fn test_stage_guard_balances_on_failure() {
    let collector = TraceCollector::new(Arc::new(InMemoryStorage::new(4)));
    let (_, trace) = collector
        .traced(TraceSource::Production, "q", CorrelationKeys::default(), HashMap::new(), async {
            let guard = collector.stage("worker", "execution", Payload::new());
            collector.add_event(prompt("try").agent("worker").stage("execution"));
            guard.fail("model timeout");

            {
                let _guard = collector.stage("worker", "retry", Payload::new());
            }
        })
        .await;
    let trace = trace.unwrap().unwrap();

    let starts = trace.events.iter().filter(|e| e.event_type == EventType::StageStart).count();
    let ends: Vec<StageEnd> = trace.events.iter().filter_map(|e| e.payload()).collect();
    assert_eq!(starts, 2);
    assert_eq!(ends.len(), 2);
    assert_eq!(ends[0].status, StageStatus::Failed);
    assert_eq!(ends[0].error.as_deref(), Some("model timeout"));
    assert_eq!(ends[1].status, StageStatus::Interrupted);

    // The marker-only retry stage never shows up.
    let h = TraceHierarchy::build(&trace, &HierarchyConfig::default());
    assert_eq!(h.summary.stage_count, 1);
    assert_eq!(h.summary.filtered_events, 2);
}

#[tokio::test]
async fn test_events_after_close_are_dropped() {
    let collector = TraceCollector::new(Arc::new(InMemoryStorage::new(4)));
    context::with_context(None, async {
        let id = collector
            .start_trace(TraceSource::Production, "q", CorrelationKeys::default(), HashMap::new())
            .unwrap();
        let ctx = context::get_context().unwrap();
        let closed = collector.end_trace(Some(&id)).await.unwrap().unwrap();

        // A branch still holding the old context cannot reopen the trace.
        context::with_context(Some(ctx), async {
            assert!(collector.add_event(prompt("late")).is_none());
        })
        .await;
        assert!(collector.add_event_to(&id, prompt("late")).is_none());
        assert!(collector.end_trace(Some(&id)).await.unwrap().is_none());

        let stored = collector.get_stored_trace(&id).await.unwrap().unwrap();
        assert_eq!(stored.events.len(), closed.events.len());
    })
    .await;
}
