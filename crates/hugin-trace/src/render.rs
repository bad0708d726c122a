//! Plain-text outline of a trace hierarchy.

use std::fmt::Write;

use crate::hierarchy::{HierarchicalEvent, TraceHierarchy};
use crate::types::{EventType, TraceEvent, truncate_chars};

const LABEL_CHARS: usize = 80;

/// Render an indented outline: agents, their stages in presentation order,
/// and each stage's event tree.
pub fn outline(hierarchy: &TraceHierarchy) -> String {
    let mut out = String::new();
    let s = &hierarchy.summary;

    let _ = writeln!(
        out,
        "Trace {}  agents={} stages={} llm_calls={} tool_calls={} tokens={} duration={}",
        hierarchy.trace_id,
        s.agent_count,
        s.stage_count,
        s.total_llm_calls,
        s.total_tool_calls,
        s.total_tokens,
        s.total_duration_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "open".to_string()),
    );

    for agent in &hierarchy.agents {
        let _ = writeln!(
            out,
            "\n== {} (llm {}, tools {}, tokens {}, {}ms)",
            agent.agent_type, agent.llm_calls, agent.tool_calls, agent.tokens_used, agent.duration_ms
        );

        for stage in &agent.stages {
            let _ = writeln!(
                out,
                "  -- {} [order {}] {} events",
                stage.stage,
                stage.execution_order,
                stage.node_count()
            );
            for event in &stage.events {
                write_event(&mut out, event);
            }
        }

        if !agent.key_findings.is_empty() {
            let _ = writeln!(out, "  findings:");
            for finding in &agent.key_findings {
                let _ = writeln!(out, "    - {}", finding);
            }
        }
    }

    out
}

fn write_event(out: &mut String, node: &HierarchicalEvent) {
    let indent = "  ".repeat(2 + usize::from(node.level));
    let label = describe(&node.event);
    if label.is_empty() {
        let _ = writeln!(out, "{}[{}]", indent, node.event.event_type);
    } else {
        let _ = writeln!(out, "{}[{}] {}", indent, node.event.event_type, label);
    }
    for child in &node.children {
        write_event(out, child);
    }
}

/// Short human-readable label for an event.
fn describe(event: &TraceEvent) -> String {
    let text = match event.event_type {
        EventType::LlmPrompt => event.data_str("prompt").map(str::to_string),
        EventType::LlmResponse => event.data_str("response").map(str::to_string),
        EventType::ToolInvocation => event.data_str("tool_name").map(|name| {
            match event.declared_tool_call_id() {
                Some(id) => format!("{} ({})", name, id),
                None => name.to_string(),
            }
        }),
        EventType::ToolResult => event.linked_tool_call_id().map(|id| format!("-> {}", id)),
        EventType::Error => event.data_str("message").map(str::to_string),
        EventType::StageEnd => event.data_str("status").map(str::to_string),
        EventType::FinalResult => event.data_str("output").map(str::to_string),
        _ => None,
    };

    let first_line = text
        .as_deref()
        .and_then(|t| t.lines().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or("");
    truncate_chars(first_line, LABEL_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::HierarchyConfig;
    use crate::payload::{EventPayload, LlmPrompt, ToolInvocation};
    use crate::types::{CompleteTrace, CorrelationKeys, TraceSource};
    use std::collections::HashMap;

    #[test]
    fn test_outline_nests_events() {
        let mut trace = CompleteTrace::new(
            TraceSource::Evaluation,
            "q",
            CorrelationKeys::default(),
            HashMap::new(),
        );
        let prompt = LlmPrompt {
            prompt: "Find flights\nto Oslo".to_string(),
            model: None,
            prompt_file: None,
        };
        let invoke = ToolInvocation {
            tool_call_id: "t1".to_string(),
            tool_name: "flights".to_string(),
            arguments: serde_json::json!({}),
        };
        let id = trace.trace_id.clone();
        trace.events.push(TraceEvent::new(&id, EventType::LlmPrompt, "travel", "research", prompt.to_payload()));
        trace.events.push(TraceEvent::new(&id, EventType::ToolInvocation, "travel", "research", invoke.to_payload()));
        trace.close(trace.start_time);

        let text = outline(&TraceHierarchy::build(&trace, &HierarchyConfig::default()));
        assert!(text.contains("== travel"));
        assert!(text.contains("-- research [order 20] 2 events"));
        assert!(text.contains("    [llm_prompt] Find flights\n"));
        assert!(text.contains("      [tool_invocation] flights (t1)"));
        assert!(text.contains("duration=0ms"));
    }
}
