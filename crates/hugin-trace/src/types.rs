//! Trace data model.
//!
//! A [`CompleteTrace`] is the aggregate root: an append-only list of
//! [`TraceEvent`]s plus a [`TraceSummary`] computed once when the trace closes.
//! Enum-valued fields serialize as plain strings (`"llm_prompt"`); readers also
//! accept the qualified legacy form (`"EventType.LLM_PROMPT"`).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event-type-specific payload, kept as an untyped map at the storage boundary.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Maximum characters of `initial_input` kept in a [`TraceListing`].
pub const LISTING_INPUT_CHARS: usize = 100;

/// Kind of a single observed occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum EventType {
    UserQuery,
    LlmPrompt,
    LlmResponse,
    ToolInvocation,
    ToolResult,
    IntermediateStep,
    FinalResult,
    EvaluationStep,
    Error,
    StageStart,
    StageEnd,
}

impl EventType {
    /// All event types, in declaration order.
    pub const ALL: [EventType; 11] = [
        EventType::UserQuery,
        EventType::LlmPrompt,
        EventType::LlmResponse,
        EventType::ToolInvocation,
        EventType::ToolResult,
        EventType::IntermediateStep,
        EventType::FinalResult,
        EventType::EvaluationStep,
        EventType::Error,
        EventType::StageStart,
        EventType::StageEnd,
    ];

    /// Plain string encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserQuery => "user_query",
            EventType::LlmPrompt => "llm_prompt",
            EventType::LlmResponse => "llm_response",
            EventType::ToolInvocation => "tool_invocation",
            EventType::ToolResult => "tool_result",
            EventType::IntermediateStep => "intermediate_step",
            EventType::FinalResult => "final_result",
            EventType::EvaluationStep => "evaluation_step",
            EventType::Error => "error",
            EventType::StageStart => "stage_start",
            EventType::StageEnd => "stage_end",
        }
    }

    /// Parse either the plain encoding or the legacy `Type.VALUE` encoding.
    pub fn parse(s: &str) -> Option<Self> {
        s.parse()
            .ok()
            .or_else(|| strip_qualifier(s).and_then(|bare| bare.parse().ok()))
    }

    /// Stage boundary markers carry no work of their own.
    pub fn is_stage_marker(&self) -> bool {
        matches!(self, EventType::StageStart | EventType::StageEnd)
    }
}

impl FromStr for EventType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("event type", s))
    }
}

impl TryFrom<String> for EventType {
    type Error = UnknownVariant;

    fn try_from(s: String) -> Result<Self, UnknownVariant> {
        EventType::parse(&s).ok_or_else(|| UnknownVariant::new("event type", &s))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a trace came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum TraceSource {
    Evaluation,
    Production,
}

impl TraceSource {
    /// Plain string encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceSource::Evaluation => "evaluation",
            TraceSource::Production => "production",
        }
    }

    /// Parse either the plain encoding or the legacy `Type.VALUE` encoding.
    pub fn parse(s: &str) -> Option<Self> {
        s.parse()
            .ok()
            .or_else(|| strip_qualifier(s).and_then(|bare| bare.parse().ok()))
    }
}

impl FromStr for TraceSource {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "evaluation" => Ok(TraceSource::Evaluation),
            "production" => Ok(TraceSource::Production),
            other => Err(UnknownVariant::new("trace source", other)),
        }
    }
}

impl TryFrom<String> for TraceSource {
    type Error = UnknownVariant;

    fn try_from(s: String) -> Result<Self, UnknownVariant> {
        TraceSource::parse(&s).ok_or_else(|| UnknownVariant::new("trace source", &s))
    }
}

impl fmt::Display for TraceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An enum string that matched no variant in either encoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// `"EventType.LLM_PROMPT"` -> `"llm_prompt"`.
fn strip_qualifier(s: &str) -> Option<String> {
    let (_, bare) = s.rsplit_once('.')?;
    Some(bare.to_ascii_lowercase())
}

/// Optional keys correlating a trace with the outside world.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationKeys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl CorrelationKeys {
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_test_case(mut self, test_case_id: impl Into<String>) -> Self {
        self.test_case_id = Some(test_case_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// One observed occurrence within a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Unique identifier for this event.
    pub event_id: String,

    /// Owning trace.
    pub trace_id: String,

    /// Wall-clock time the event was appended.
    pub timestamp: DateTime<Utc>,

    pub event_type: EventType,

    /// Emitting agent or role.
    pub agent_type: String,

    /// Logical phase within the agent.
    pub stage: String,

    #[serde(default)]
    pub data: Payload,

    /// Explicit nesting hint; usually absent and inferred instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TraceEvent {
    /// Create an event stamped with the current time and a fresh id.
    pub fn new(
        trace_id: impl Into<String>,
        event_type: EventType,
        agent_type: impl Into<String>,
        stage: impl Into<String>,
        data: Payload,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            trace_id: trace_id.into(),
            timestamp: Utc::now(),
            event_type,
            agent_type: agent_type.into(),
            stage: stage.into(),
            data,
            parent_event_id: None,
            duration_ms: None,
            tokens_used: None,
            metadata: HashMap::new(),
        }
    }

    /// String field from the payload.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}

/// Aggregate counts computed once when a trace closes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub total_events: usize,

    #[serde(default)]
    pub event_counts: BTreeMap<EventType, usize>,

    /// Number of `llm_prompt` events.
    pub llm_calls: usize,

    /// Number of `tool_invocation` events.
    pub tool_calls: usize,

    pub total_tokens: u64,

    pub error_count: usize,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    /// Distinct agents, in order of first appearance.
    #[serde(default)]
    pub agents_involved: Vec<String>,

    /// Distinct stages, in order of first appearance.
    #[serde(default)]
    pub stages_involved: Vec<String>,
}

impl TraceSummary {
    /// Summarize an event list.
    pub fn from_events(events: &[TraceEvent]) -> Self {
        let mut summary = TraceSummary {
            total_events: events.len(),
            ..Default::default()
        };

        for event in events {
            *summary.event_counts.entry(event.event_type).or_default() += 1;
            summary.total_tokens += event.tokens_used.unwrap_or(0);

            match event.event_type {
                EventType::LlmPrompt => summary.llm_calls += 1,
                EventType::ToolInvocation => summary.tool_calls += 1,
                EventType::Error => {
                    summary.error_count += 1;
                    let message = event
                        .data_str("message")
                        .or_else(|| event.data_str("error"))
                        .map(str::to_string)
                        .unwrap_or_else(|| serde_json::Value::Object(event.data.clone()).to_string());
                    summary.errors.push(message);
                }
                _ => {}
            }

            if !summary.agents_involved.contains(&event.agent_type) {
                summary.agents_involved.push(event.agent_type.clone());
            }
            if !summary.stages_involved.contains(&event.stage) {
                summary.stages_involved.push(event.stage.clone());
            }
        }

        summary
    }
}

/// The complete recorded history of one end-to-end request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteTrace {
    pub trace_id: String,

    pub source: TraceSource,

    pub start_time: DateTime<Utc>,

    /// `None` while the trace is open.
    pub end_time: Option<DateTime<Utc>>,

    /// The triggering request text, stored verbatim.
    pub initial_input: String,

    #[serde(flatten)]
    pub correlation: CorrelationKeys,

    /// Append-only, in emission order.
    #[serde(default)]
    pub events: Vec<TraceEvent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<TraceSummary>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
}

impl CompleteTrace {
    /// Create an open trace with a random UUID.
    pub fn new(
        source: TraceSource,
        initial_input: impl Into<String>,
        correlation: CorrelationKeys,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            source,
            start_time: Utc::now(),
            end_time: None,
            initial_input: initial_input.into(),
            correlation,
            events: Vec::new(),
            summary: None,
            metadata,
            total_duration_ms: None,
        }
    }

    /// Freeze the trace: stamp the end time, duration and summary.
    pub fn close(&mut self, end_time: DateTime<Utc>) {
        self.end_time = Some(end_time);
        self.total_duration_ms = Some((end_time - self.start_time).num_milliseconds().max(0) as u64);
        self.summary = Some(TraceSummary::from_events(&self.events));
    }

    /// Lightweight view for listings.
    pub fn listing(&self) -> TraceListing {
        TraceListing {
            trace_id: self.trace_id.clone(),
            source: self.source,
            start_time: self.start_time,
            end_time: self.end_time,
            total_duration_ms: self.total_duration_ms,
            correlation: self.correlation.clone(),
            event_count: self.events.len(),
            initial_input: truncate_chars(&self.initial_input, LISTING_INPUT_CHARS),
        }
    }
}

/// Summary fields of a stored trace; never carries event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceListing {
    pub trace_id: String,
    pub source: TraceSource,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<u64>,
    #[serde(flatten)]
    pub correlation: CorrelationKeys,
    pub event_count: usize,
    pub initial_input: String,
}

/// Truncate to `max` characters, appending `...` when shortened.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
