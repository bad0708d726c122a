//! Demo of a planner -> parallel specialists -> synthesizer flow.
//!
//! Run with `cargo run -p hugin-trace --example orchestrator_demo`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hugin_trace::hierarchy::TraceHierarchy;
use hugin_trace::payload::{FinalResult, LlmPrompt, LlmResponse, ToolInvocation, ToolResult};
use hugin_trace::{
    ContextUpdate, CorrelationKeys, NewEvent, Payload, TraceCollector, TraceConfig, TraceSource,
    context, render, storage,
};
use serde_json::json;

fn prompt(text: &str) -> NewEvent {
    NewEvent::from_payload(&LlmPrompt {
        prompt: text.to_string(),
        model: Some("gpt-4o-mini".to_string()),
        prompt_file: None,
    })
}

fn response(text: &str, tool_calls: usize, tokens: u64) -> NewEvent {
    NewEvent::from_payload(&LlmResponse {
        response: text.to_string(),
        has_tool_calls: tool_calls > 0,
        tool_call_count: tool_calls,
        model: None,
    })
    .tokens(tokens)
}

async fn specialist(collector: Arc<TraceCollector>, name: &'static str, tool: &'static str) -> String {
    let inner = collector.clone();
    collector
        .trace_operation(name, "research", Payload::new(), async move {
            context::update_context(ContextUpdate::default().prompt_file(format!("{}.md", name)));

            inner.add_event(prompt(&format!("Research options using {}", tool)));
            inner.add_event(response("Calling tool", 1, 120));

            let call_id = format!("{}-call", name);
            inner.add_event(NewEvent::from_payload(&ToolInvocation {
                tool_call_id: call_id.clone(),
                tool_name: tool.to_string(),
                arguments: json!({ "city": "Oslo" }),
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
            inner.add_event(NewEvent::from_payload(&ToolResult {
                tool_call_id: Some(call_id),
                tool_name: Some(tool.to_string()),
                result: json!({ "options": 3 }),
                success: true,
            }));

            inner.add_event(prompt("Summarize the tool output"));
            inner.add_event(response(&format!("{} found 3 options", name), 0, 80));
            format!("{} found 3 options", name)
        })
        .await
}

async fn handle_request(collector: Arc<TraceCollector>) -> String {
    collector
        .trace_operation("planner", "planning", Payload::new(), async {
            collector.add_event(prompt("Split the trip into subtasks"));
            collector.add_event(response("flights, hotels", 0, 60));
        })
        .await;

    let flights = context::spawn(specialist(collector.clone(), "flight_agent", "flight_search"));
    let hotels = context::spawn(specialist(collector.clone(), "hotel_agent", "hotel_search"));

    let mut findings = Vec::new();
    for handle in [flights, hotels] {
        match handle.await {
            Ok(found) => findings.push(found),
            Err(e) => eprintln!("specialist failed: {}", e),
        }
    }

    let answer = collector
        .trace_operation("synthesizer", "synthesis", Payload::new(), async {
            collector.add_event(prompt(&format!("Combine: {}", findings.join("; "))));
            collector.add_event(response("Fly Tuesday, stay downtown", 0, 90));
            "Fly Tuesday, stay downtown".to_string()
        })
        .await;

    collector.add_event(
        NewEvent::from_payload(&FinalResult {
            output: answer.clone(),
        })
        .agent("synthesizer")
        .stage("synthesis"),
    );
    answer
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = TraceConfig::default();
    config.apply_env();

    let (storage, cleanup) = storage::from_config_with_retention(&config)?;
    let collector = Arc::new(TraceCollector::new(storage).with_sampling(config.enabled, config.sampling_rate));

    let (answer, trace) = collector
        .traced(
            TraceSource::Evaluation,
            "Plan a weekend in Oslo",
            CorrelationKeys::default().with_test_case("demo-oslo"),
            HashMap::new(),
            handle_request(collector.clone()),
        )
        .await;

    if let Some(cleanup) = cleanup {
        cleanup.abort();
    }
    let Some(trace) = trace? else {
        println!("Trace was sampled out");
        return Ok(());
    };

    println!("Answer: {}", answer);
    println!("\nTrace ID: {}", trace.trace_id);
    println!("Duration: {}ms", trace.total_duration_ms.unwrap_or(0));
    println!("Events: {}", trace.events.len());

    let hierarchy = TraceHierarchy::build(&trace, &config.hierarchy);
    println!("\n--- Outline ---");
    print!("{}", render::outline(&hierarchy));

    Ok(())
}
