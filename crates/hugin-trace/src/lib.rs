//! Execution tracing for multi-agent LLM systems.
//!
//! This crate records one end-to-end request as a single trace of typed
//! events emitted by many cooperating agents:
//!
//! - **Context**: Task-local trace identity, copied on branch via `fork()` / `spawn()`
//! - **Collector**: Open traces, event emission, stage guards
//! - **Hierarchy**: Agent, stage and causal event tree rebuilt from the flat log
//! - **Storage**: In-memory and dated-directory filesystem backends
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use hugin_trace::{
//!     CorrelationKeys, InMemoryStorage, NewEvent, Payload, TraceCollector, TraceSource,
//!     payload::LlmPrompt,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let collector = TraceCollector::new(Arc::new(InMemoryStorage::new(100)));
//!
//!     let (answer, trace) = collector
//!         .traced(TraceSource::Production, "book a flight", CorrelationKeys::default(), HashMap::new(), async {
//!             collector
//!                 .trace_operation("planner", "planning", Payload::new(), async {
//!                     let prompt = LlmPrompt { prompt: "plan".into(), model: None, prompt_file: None };
//!                     collector.add_event(NewEvent::from_payload(&prompt));
//!                     "done"
//!                 })
//!                 .await
//!         })
//!         .await;
//!
//!     println!("{} -> {:?}", answer, trace.map(|t| t.map(|t| t.events.len())));
//! }
//! ```
//!
//! # Emission never fails
//!
//! Emitting without an active trace, or into a closed one, is a silent no-op.
//! Only storage and configuration surface errors.

pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod hierarchy;
pub mod payload;
pub mod render;
pub mod storage;
pub mod types;

// Re-export main types
pub use collector::{NewEvent, StageGuard, TraceCollector};
pub use config::{ConfigValidationError, StorageKind, TraceConfig};
pub use context::{ContextUpdate, TraceContext};
pub use error::{Result, TraceError};
pub use hierarchy::{
    AgentSection, HierarchicalEvent, HierarchyConfig, HierarchySummary, StageInfo, TraceHierarchy,
};
pub use payload::{EventPayload, StageStatus};
pub use storage::{
    FilesystemStorage, InMemoryStorage, SharedTraceStorage, TraceFilter, TraceStorage,
};
pub use types::{
    CompleteTrace, CorrelationKeys, EventType, Payload, TraceEvent, TraceListing, TraceSource,
    TraceSummary,
};
