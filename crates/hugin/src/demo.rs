//! Scripted multi-agent run used by `hugin demo`.
//!
//! A classifier splits the request, researchers work in parallel (the second
//! one hits a failing tool), and a writer presents the result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use hugin_trace::payload::{
    ErrorEvent, FinalResult, LlmPrompt, LlmResponse, ToolInvocation, ToolResult,
};
use hugin_trace::{
    CompleteTrace, ContextUpdate, CorrelationKeys, NewEvent, Payload, TraceCollector, TraceSource,
    context,
};
use serde_json::json;

const MODEL: &str = "demo-model";

fn llm_turn(collector: &TraceCollector, prompt: &str, answer: &str, tool_calls: usize) {
    collector.add_event(NewEvent::from_payload(&LlmPrompt {
        prompt: prompt.to_string(),
        model: Some(MODEL.to_string()),
        prompt_file: None,
    }));
    collector.add_event(
        NewEvent::from_payload(&LlmResponse {
            response: answer.to_string(),
            has_tool_calls: tool_calls > 0,
            tool_call_count: tool_calls,
            model: Some(MODEL.to_string()),
        })
        .tokens(40 + answer.len() as u64)
        .duration_ms(25),
    );
}

fn tool_call(collector: &TraceCollector, call_id: &str, tool: &str, result: Result<&str, &str>) {
    collector.add_event(NewEvent::from_payload(&ToolInvocation {
        tool_call_id: call_id.to_string(),
        tool_name: tool.to_string(),
        arguments: json!({ "query": tool }),
    }));
    let (value, success) = match result {
        Ok(v) => (json!(v), true),
        Err(e) => (json!({ "error": e }), false),
    };
    collector.add_event(NewEvent::from_payload(&ToolResult {
        tool_call_id: Some(call_id.to_string()),
        tool_name: Some(tool.to_string()),
        result: value,
        success,
    }));
}

async fn researcher(collector: Arc<TraceCollector>, agent: String, tool: String, fail: bool) -> Result<String> {
    let inner = collector.clone();
    collector
        .trace_result(&agent, "research", Payload::new(), async {
            context::update_context(ContextUpdate::default().prompt_file(format!("prompts/{}.md", agent)));

            llm_turn(&inner, &format!("Look up {}", tool), "Calling tool", 1);
            let call_id = format!("{}-1", agent);
            tokio::time::sleep(Duration::from_millis(5)).await;

            if fail {
                tool_call(&inner, &call_id, &tool, Err("upstream timeout"));
                inner.add_event(NewEvent::from_payload(&ErrorEvent {
                    message: format!("{} unavailable", tool),
                    details: Some(json!({ "tool_call_id": call_id })),
                }));
                return Err(anyhow!("{} unavailable", tool));
            }

            tool_call(&inner, &call_id, &tool, Ok("3 matching options"));
            llm_turn(&inner, "Summarize the findings", "Found 3 matching options", 0);
            Ok(format!("{}: 3 options", agent))
        })
        .await
}

const TOOLS: [&str; 4] = ["flight_search", "hotel_search", "weather_lookup", "event_search"];

async fn run_request(collector: Arc<TraceCollector>, workers: usize) -> String {
    collector
        .trace_operation("classifier", "classification", Payload::new(), async {
            llm_turn(&collector, "Classify: plan a weekend in Oslo", "travel: split into subtasks", 0);
        })
        .await;

    let handles: Vec<_> = (0..workers.max(1))
        .map(|i| {
            let agent = format!("researcher_{}", i + 1);
            let tool = TOOLS[i % TOOLS.len()].to_string();
            context::spawn(researcher(collector.clone(), agent, tool, i == 1))
        })
        .collect();

    let mut findings = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Ok(found)) => findings.push(found),
            Ok(Err(e)) => tracing::warn!("Researcher failed: {}", e),
            Err(e) => tracing::warn!("Researcher task panicked: {}", e),
        }
    }

    collector
        .trace_operation("writer", "presentation", Payload::new(), async {
            let answer = format!("Itinerary based on {}", findings.join(", "));
            llm_turn(&collector, "Write the itinerary", &answer, 0);
            collector.add_event(NewEvent::from_payload(&FinalResult {
                output: answer.clone(),
            }));
            answer
        })
        .await
}

/// Run the scripted request with `workers` parallel researchers and return
/// the closed trace.
pub async fn run(collector: Arc<TraceCollector>, workers: usize) -> Result<CompleteTrace> {
    let (answer, trace) = collector
        .traced(
            TraceSource::Evaluation,
            "Plan a weekend in Oslo",
            CorrelationKeys::default()
                .with_test_case("demo-oslo")
                .with_session("demo"),
            HashMap::from([("demo".to_string(), json!(true))]),
            run_request(collector.clone(), workers),
        )
        .await;

    tracing::info!("Demo answer: {}", answer);
    trace?.ok_or_else(|| anyhow!("Demo trace was not recorded"))
}
