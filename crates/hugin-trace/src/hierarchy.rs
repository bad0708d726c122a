//! Reconstruct a navigable hierarchy from a flat event stream.
//!
//! Events are routed into `(agent, stage)` buckets in emission order and
//! nested by stack discipline:
//!
//! ```text
//! llm_prompt                 level 0, pushed on the bucket's open-prompt stack
//! └─ llm_response            level 1, pops the prompt unless it requests tools
//!    └─ tool_invocation      level 2, registers its tool_call_id
//!       └─ tool_result       level 3, found through its linked tool_call_id
//! ```
//!
//! Correlation never drops an event: responses without an open prompt and
//! results without a known invocation surface as top-level (or prompt-level)
//! nodes. Only buckets with no substantive work, or whose stage name is one of
//! the phantom names, are discarded; the summary counts what was discarded so
//! `reachable + filtered_events + skipped_events == event_count` holds.
//!
//! Stage presentation order comes from [`HierarchyConfig::stage_ranks`], a
//! data table rather than logic, since naming conventions differ between
//! agent populations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CompleteTrace, EventType, TraceEvent, truncate_chars};

/// Maximum nesting level (tool results under invocations).
pub const MAX_LEVEL: u8 = 3;

const KEY_FINDING_CHARS: usize = 200;

/// Hierarchy builder settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HierarchyConfig {
    /// Agent labels of raw boundary events, excluded from the hierarchy.
    pub infrastructure_agents: Vec<String>,
    /// Stage names, compared whole and ignoring case, that are never shown.
    pub phantom_stages: Vec<String>,
    /// Ordered rank rules; the first match wins.
    pub stage_ranks: Vec<StageRankRule>,
    /// Rank for stages no rule matches.
    pub default_rank: u32,
    /// Maximum key findings extracted per agent.
    pub max_key_findings: usize,
}

/// Maps stage names (optionally for one agent) to a presentation rank.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StageRankRule {
    /// Case-insensitive substring of the agent label; any agent when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Case-insensitive substring of the stage name.
    pub pattern: String,
    pub rank: u32,
}

impl StageRankRule {
    pub fn new(pattern: impl Into<String>, rank: u32) -> Self {
        Self {
            agent: None,
            pattern: pattern.into(),
            rank,
        }
    }

    pub fn for_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    fn matches(&self, agent: &str, stage: &str) -> bool {
        let agent_ok = self
            .agent
            .as_ref()
            .is_none_or(|a| agent.contains(&a.to_lowercase()));
        agent_ok && stage.contains(&self.pattern.to_lowercase())
    }
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            infrastructure_agents: vec!["system".to_string(), "user".to_string()],
            phantom_stages: vec!["unknown".to_string(), "phantom".to_string()],
            stage_ranks: vec![
                StageRankRule::new("planning", 0),
                StageRankRule::new("classification", 0),
                StageRankRule::new("task_creation", 0),
                StageRankRule::new("routing", 0),
                StageRankRule::new("delegation", 10),
                StageRankRule::new("execution", 20),
                StageRankRule::new("specialist", 20),
                StageRankRule::new("research", 20),
                StageRankRule::new("synthesis", 30),
                StageRankRule::new("aggregation", 30),
                StageRankRule::new("presentation", 40),
                StageRankRule::new("formatting", 40),
                StageRankRule::new("report", 40),
            ],
            default_rank: 25,
            max_key_findings: 5,
        }
    }
}

impl HierarchyConfig {
    /// Presentation rank of a stage.
    pub fn rank_for(&self, agent: &str, stage: &str) -> u32 {
        let agent = agent.to_lowercase();
        let stage = stage.to_lowercase();
        self.stage_ranks
            .iter()
            .find(|rule| rule.matches(&agent, &stage))
            .map(|rule| rule.rank)
            .unwrap_or(self.default_rank)
    }

    pub fn is_infrastructure(&self, agent: &str) -> bool {
        self.infrastructure_agents
            .iter()
            .any(|a| a.eq_ignore_ascii_case(agent))
    }

    /// Phantom names match the whole stage label, ignoring case.
    pub fn is_phantom(&self, stage: &str) -> bool {
        self.phantom_stages
            .iter()
            .any(|p| p.eq_ignore_ascii_case(stage))
    }
}

/// An event with its inferred children.
#[derive(Debug, Clone, Serialize)]
pub struct HierarchicalEvent {
    pub event: TraceEvent,
    pub children: Vec<HierarchicalEvent>,
    /// Nesting depth, 0 to [`MAX_LEVEL`].
    pub level: u8,
    /// Position in the trace's flat event list.
    pub index: usize,
}

impl HierarchicalEvent {
    /// This node plus all of its descendants.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(HierarchicalEvent::node_count).sum::<usize>()
    }

    /// Depth-first iteration over this node and its descendants.
    pub fn walk(&self) -> Vec<&HierarchicalEvent> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }
}

/// All events of one `(agent, stage)` pair.
#[derive(Debug, Clone, Serialize)]
pub struct StageInfo {
    pub agent_type: String,
    pub stage: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Timestamp of the first non-marker event.
    pub first_event_time: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub llm_calls: usize,
    pub tool_calls: usize,
    pub tokens_used: u64,
    pub execution_order: u32,
    pub events: Vec<HierarchicalEvent>,
}

impl StageInfo {
    /// Events reachable from this stage at any depth.
    pub fn node_count(&self) -> usize {
        self.events.iter().map(HierarchicalEvent::node_count).sum()
    }
}

/// All stages of one agent, in presentation order.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSection {
    pub agent_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub stages: Vec<StageInfo>,
    pub llm_calls: usize,
    pub tool_calls: usize,
    pub tokens_used: u64,
    pub duration_ms: u64,
    pub key_findings: Vec<String>,
}

impl AgentSection {
    /// Top-level events of every stage, flattened in stage order.
    pub fn events(&self) -> impl Iterator<Item = &HierarchicalEvent> {
        self.stages.iter().flat_map(|s| s.events.iter())
    }
}

/// Cross-cutting totals for a built hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HierarchySummary {
    pub agent_count: usize,
    pub stage_count: usize,
    pub total_llm_calls: usize,
    pub total_tool_calls: usize,
    pub total_tokens: u64,
    /// Taken from the trace, not recomputed.
    pub total_duration_ms: Option<u64>,
    /// Events in the source trace.
    pub event_count: usize,
    /// Events dropped together with discarded stage buckets.
    pub filtered_events: usize,
    /// Events from infrastructure agents.
    pub skipped_events: usize,
}

/// The hierarchy of one trace.
#[derive(Debug, Clone, Serialize)]
pub struct TraceHierarchy {
    pub trace_id: String,
    pub agents: Vec<AgentSection>,
    pub summary: HierarchySummary,
}

impl TraceHierarchy {
    /// Build the hierarchy. Pure and deterministic for a given trace.
    pub fn build(trace: &CompleteTrace, config: &HierarchyConfig) -> Self {
        let mut builder = Builder::new(trace, config);
        for (index, event) in trace.events.iter().enumerate() {
            builder.place(index, event);
        }
        builder.finish()
    }

    /// Events reachable at any depth across all agents.
    pub fn node_count(&self) -> usize {
        self.agents
            .iter()
            .flat_map(|a| a.stages.iter())
            .map(StageInfo::node_count)
            .sum()
    }
}

struct Node {
    index: usize,
    level: u8,
    children: Vec<usize>,
}

struct Bucket {
    agent_type: String,
    stage: String,
    roots: Vec<usize>,
    open_prompts: Vec<usize>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    first_event_time: Option<DateTime<Utc>>,
    event_duration_ms: u64,
    marker_duration_ms: u64,
    llm_calls: usize,
    tool_calls: usize,
    tokens_used: u64,
    substantive: usize,
}

impl Bucket {
    fn new(event: &TraceEvent) -> Self {
        Self {
            agent_type: event.agent_type.clone(),
            stage: event.stage.clone(),
            roots: Vec::new(),
            open_prompts: Vec::new(),
            start_time: event.timestamp,
            end_time: None,
            first_event_time: None,
            event_duration_ms: 0,
            marker_duration_ms: 0,
            llm_calls: 0,
            tool_calls: 0,
            tokens_used: 0,
            substantive: 0,
        }
    }

    fn record(&mut self, event: &TraceEvent) {
        self.start_time = self.start_time.min(event.timestamp);

        if event.event_type == EventType::StageEnd {
            self.end_time = Some(self.end_time.map_or(event.timestamp, |t| t.max(event.timestamp)));
            self.marker_duration_ms += event.duration_ms.unwrap_or(0);
        }
        if event.event_type.is_stage_marker() {
            return;
        }

        self.substantive += 1;
        self.first_event_time.get_or_insert(event.timestamp);
        self.event_duration_ms += event.duration_ms.unwrap_or(0);
        self.tokens_used += event.tokens_used.unwrap_or(0);
        match event.event_type {
            EventType::LlmPrompt => self.llm_calls += 1,
            EventType::ToolInvocation => self.tool_calls += 1,
            _ => {}
        }
    }

    /// Stage-level timing wins over the sum of event timings.
    fn duration_ms(&self) -> u64 {
        if self.marker_duration_ms > 0 {
            self.marker_duration_ms
        } else {
            self.event_duration_ms
        }
    }
}

struct Builder<'a> {
    trace: &'a CompleteTrace,
    config: &'a HierarchyConfig,
    nodes: Vec<Node>,
    buckets: Vec<Bucket>,
    bucket_index: HashMap<(&'a str, &'a str), usize>,
    /// Invocation nodes awaiting their result, by tool_call_id.
    pending_results: HashMap<&'a str, usize>,
    by_event_id: HashMap<&'a str, usize>,
    skipped: usize,
}

impl<'a> Builder<'a> {
    fn new(trace: &'a CompleteTrace, config: &'a HierarchyConfig) -> Self {
        Self {
            trace,
            config,
            nodes: Vec::new(),
            buckets: Vec::new(),
            bucket_index: HashMap::new(),
            pending_results: HashMap::new(),
            by_event_id: HashMap::new(),
            skipped: 0,
        }
    }

    fn place(&mut self, index: usize, event: &'a TraceEvent) {
        if self.config.is_infrastructure(&event.agent_type) {
            self.skipped += 1;
            return;
        }

        let key = (event.agent_type.as_str(), event.stage.as_str());
        let bucket_id = match self.bucket_index.get(&key) {
            Some(&id) => id,
            None => {
                self.buckets.push(Bucket::new(event));
                self.bucket_index.insert(key, self.buckets.len() - 1);
                self.buckets.len() - 1
            }
        };
        self.buckets[bucket_id].record(event);

        let explicit = event
            .parent_event_id
            .as_deref()
            .and_then(|id| self.by_event_id.get(id).copied());
        let open_prompt = self.buckets[bucket_id].open_prompts.last().copied();

        let parent = match event.event_type {
            EventType::LlmPrompt => explicit,
            EventType::LlmResponse => explicit.or(open_prompt),
            EventType::ToolInvocation => {
                explicit.or_else(|| open_prompt.map(|p| self.latest_response(p).unwrap_or(p)))
            }
            EventType::ToolResult => {
                let linked = event
                    .linked_tool_call_id()
                    .and_then(|id| self.pending_results.remove(id));
                explicit.or(linked).or(open_prompt)
            }
            _ => explicit,
        };

        let level = parent
            .map(|p| (self.nodes[p].level + 1).min(MAX_LEVEL))
            .unwrap_or(0);
        let node = self.nodes.len();
        self.nodes.push(Node {
            index,
            level,
            children: Vec::new(),
        });
        match parent {
            Some(p) => self.nodes[p].children.push(node),
            None => self.buckets[bucket_id].roots.push(node),
        }
        self.by_event_id.insert(event.event_id.as_str(), node);

        let bucket = &mut self.buckets[bucket_id];
        match event.event_type {
            EventType::LlmPrompt => bucket.open_prompts.push(node),
            EventType::LlmResponse => {
                if parent.is_some() && parent == open_prompt && !event.requests_tool_calls() {
                    bucket.open_prompts.pop();
                }
            }
            EventType::ToolInvocation => {
                if let Some(id) = event.declared_tool_call_id() {
                    self.pending_results.insert(id, node);
                }
            }
            _ => {}
        }
    }

    /// Most recent `llm_response` child of a prompt node.
    fn latest_response(&self, prompt: usize) -> Option<usize> {
        self.nodes[prompt]
            .children
            .iter()
            .rev()
            .copied()
            .find(|&c| self.event(c).event_type == EventType::LlmResponse)
    }

    fn event(&self, node: usize) -> &'a TraceEvent {
        &self.trace.events[self.nodes[node].index]
    }

    fn materialize(&self, node: usize) -> HierarchicalEvent {
        let n = &self.nodes[node];
        HierarchicalEvent {
            event: self.event(node).clone(),
            children: n.children.iter().map(|&c| self.materialize(c)).collect(),
            level: n.level,
            index: n.index,
        }
    }

    fn finish(self) -> TraceHierarchy {
        let mut filtered = 0;
        let mut agent_order: Vec<&str> = Vec::new();
        let mut stages_by_agent: HashMap<&str, Vec<StageInfo>> = HashMap::new();

        for bucket in &self.buckets {
            let events: Vec<HierarchicalEvent> =
                bucket.roots.iter().map(|&r| self.materialize(r)).collect();

            if bucket.substantive == 0 || events.is_empty() || self.config.is_phantom(&bucket.stage) {
                filtered += events.iter().map(HierarchicalEvent::node_count).sum::<usize>();
                continue;
            }

            let stage = StageInfo {
                agent_type: bucket.agent_type.clone(),
                stage: bucket.stage.clone(),
                start_time: bucket.start_time,
                end_time: bucket.end_time,
                first_event_time: bucket.first_event_time,
                duration_ms: bucket.duration_ms(),
                llm_calls: bucket.llm_calls,
                tool_calls: bucket.tool_calls,
                tokens_used: bucket.tokens_used,
                execution_order: self.config.rank_for(&bucket.agent_type, &bucket.stage),
                events,
            };

            let agent = bucket.agent_type.as_str();
            if !stages_by_agent.contains_key(agent) {
                agent_order.push(agent);
            }
            stages_by_agent.entry(agent).or_default().push(stage);
        }

        let mut agents: Vec<AgentSection> = agent_order
            .into_iter()
            .filter_map(|agent| {
                let stages = stages_by_agent.remove(agent)?;
                Some(self.agent_section(agent, stages))
            })
            .collect();
        agents.sort_by_key(|a| a.start_time);

        let summary = HierarchySummary {
            agent_count: agents.len(),
            stage_count: agents.iter().map(|a| a.stages.len()).sum(),
            total_llm_calls: agents.iter().map(|a| a.llm_calls).sum(),
            total_tool_calls: agents.iter().map(|a| a.tool_calls).sum(),
            total_tokens: agents.iter().map(|a| a.tokens_used).sum(),
            total_duration_ms: self.trace.total_duration_ms,
            event_count: self.trace.events.len(),
            filtered_events: filtered,
            skipped_events: self.skipped,
        };

        TraceHierarchy {
            trace_id: self.trace.trace_id.clone(),
            agents,
            summary,
        }
    }

    fn agent_section(&self, agent: &str, mut stages: Vec<StageInfo>) -> AgentSection {
        stages.sort_by_key(|s| (s.execution_order, s.first_event_time.unwrap_or(s.start_time)));

        let key_findings = stages
            .iter()
            .flat_map(|s| s.events.iter())
            .flat_map(HierarchicalEvent::walk)
            .filter(|n| n.event.event_type == EventType::LlmResponse && !n.event.requests_tool_calls())
            .filter_map(|n| key_finding(&n.event))
            .take(self.config.max_key_findings)
            .collect();

        AgentSection {
            agent_type: agent.to_string(),
            start_time: stages
                .iter()
                .map(|s| s.start_time)
                .min()
                .unwrap_or(self.trace.start_time),
            end_time: stages.iter().filter_map(|s| s.end_time).max(),
            llm_calls: stages.iter().map(|s| s.llm_calls).sum(),
            tool_calls: stages.iter().map(|s| s.tool_calls).sum(),
            tokens_used: stages.iter().map(|s| s.tokens_used).sum(),
            duration_ms: stages.iter().map(|s| s.duration_ms).sum(),
            key_findings,
            stages,
        }
    }
}

/// First non-empty line of a final response.
fn key_finding(event: &TraceEvent) -> Option<String> {
    let text = event.data_str("response")?;
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    Some(truncate_chars(line, KEY_FINDING_CHARS))
}
