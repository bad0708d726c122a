//! Typed payloads for each event type.
//!
//! Events store their payload as a [`Payload`] map so that readers decoupled
//! from this crate can parse them. These structs give emitting code and the
//! hierarchy builder a typed view over the well-known keys.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{EventType, Payload, TraceEvent};

/// Key declaring a tool invocation's identifier, and linking a result to it.
pub const TOOL_CALL_ID: &str = "tool_call_id";
/// Alternate linking key accepted on tool results.
pub const INVOCATION_ID: &str = "invocation_id";
/// Flag on an LLM response indicating further tool calls were requested.
pub const HAS_TOOL_CALLS: &str = "has_tool_calls";
/// Array of requested tool calls on an LLM response.
pub const TOOL_CALLS: &str = "tool_calls";

/// A payload bound to one event type.
pub trait EventPayload: Serialize + DeserializeOwned {
    const EVENT_TYPE: EventType;

    /// Encode as an untyped payload map. Non-object encodings yield an empty map.
    fn to_payload(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Payload::new(),
        }
    }
}

impl TraceEvent {
    /// Decode the payload as `P`, if this event is of `P`'s type.
    pub fn payload<P: EventPayload>(&self) -> Option<P> {
        if self.event_type != P::EVENT_TYPE {
            return None;
        }
        serde_json::from_value(serde_json::Value::Object(self.data.clone())).ok()
    }

    /// Whether an `llm_response` asked for further tool calls.
    pub fn requests_tool_calls(&self) -> bool {
        if self.data.get(HAS_TOOL_CALLS).and_then(|v| v.as_bool()) == Some(true) {
            return true;
        }
        self.data
            .get(TOOL_CALLS)
            .and_then(|v| v.as_array())
            .is_some_and(|calls| !calls.is_empty())
    }

    /// Identifier declared by a `tool_invocation`.
    pub fn declared_tool_call_id(&self) -> Option<&str> {
        self.data_str(TOOL_CALL_ID)
    }

    /// Invocation identifier a `tool_result` answers.
    pub fn linked_tool_call_id(&self) -> Option<&str> {
        self.data_str(TOOL_CALL_ID)
            .or_else(|| self.data_str(INVOCATION_ID))
    }
}

/// The request that opened the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserQuery {
    pub query: String,
}

impl EventPayload for UserQuery {
    const EVENT_TYPE: EventType = EventType::UserQuery;
}

/// A prompt sent to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmPrompt {
    pub prompt: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_file: Option<String>,
}

impl EventPayload for LlmPrompt {
    const EVENT_TYPE: EventType = EventType::LlmPrompt;
}

/// A model's reply to the most recent open prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub response: String,

    /// More tool calls follow under the same prompt.
    #[serde(default)]
    pub has_tool_calls: bool,

    #[serde(default)]
    pub tool_call_count: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl EventPayload for LlmResponse {
    const EVENT_TYPE: EventType = EventType::LlmResponse;
}

/// A tool call requested by a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_call_id: String,

    pub tool_name: String,

    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl EventPayload for ToolInvocation {
    const EVENT_TYPE: EventType = EventType::ToolInvocation;
}

/// Output of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Links back to [`ToolInvocation::tool_call_id`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    #[serde(default)]
    pub result: serde_json::Value,

    #[serde(default = "default_true")]
    pub success: bool,
}

impl EventPayload for ToolResult {
    const EVENT_TYPE: EventType = EventType::ToolResult;
}

fn default_true() -> bool {
    true
}

/// The pipeline's final answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub output: String,
}

impl EventPayload for FinalResult {
    const EVENT_TYPE: EventType = EventType::FinalResult;
}

/// A failure observed by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl EventPayload for ErrorEvent {
    const EVENT_TYPE: EventType = EventType::Error;
}

/// How a traced stage exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
    /// Dropped without finishing: panic, cancellation, or early return.
    Interrupted,
}

/// Closing marker of a traced stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEnd {
    /// The matching `stage_start` event.
    pub start_event_id: String,

    pub status: StageStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventPayload for StageEnd {
    const EVENT_TYPE: EventType = EventType::StageEnd;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_accessor_checks_type() {
        let data = ToolInvocation {
            tool_call_id: "t1".to_string(),
            tool_name: "search".to_string(),
            arguments: json!({"q": "rust"}),
        }
        .to_payload();
        let event = TraceEvent::new("tr", EventType::ToolInvocation, "worker", "exec", data);

        let decoded: ToolInvocation = event.payload().unwrap();
        assert_eq!(decoded.tool_name, "search");
        assert_eq!(event.declared_tool_call_id(), Some("t1"));
        assert!(event.payload::<ToolResult>().is_none());
    }

    #[test]
    fn test_requests_tool_calls() {
        let flagged = LlmResponse {
            response: "calling".to_string(),
            has_tool_calls: true,
            tool_call_count: 1,
            model: None,
        }
        .to_payload();
        let event = TraceEvent::new("tr", EventType::LlmResponse, "a", "s", flagged);
        assert!(event.requests_tool_calls());

        let mut listed = Payload::new();
        listed.insert(TOOL_CALLS.to_string(), json!([{"name": "search"}]));
        let event = TraceEvent::new("tr", EventType::LlmResponse, "a", "s", listed);
        assert!(event.requests_tool_calls());

        let event = TraceEvent::new("tr", EventType::LlmResponse, "a", "s", Payload::new());
        assert!(!event.requests_tool_calls());
    }

    #[test]
    fn test_linked_id_accepts_alternate_key() {
        let mut data = Payload::new();
        data.insert(INVOCATION_ID.to_string(), json!("t9"));
        let event = TraceEvent::new("tr", EventType::ToolResult, "a", "s", data);
        assert_eq!(event.linked_tool_call_id(), Some("t9"));

        let result: ToolResult = event.payload().unwrap();
        assert!(result.success);
        assert!(result.tool_call_id.is_none());
    }
}
