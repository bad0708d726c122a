//! Task-local trace context.
//!
//! The active [`TraceContext`] lives in a tokio task-local slot so that any
//! code running inside the slot's scope can reach it without threading it
//! through function signatures. Task-locals do not follow `tokio::spawn`, so
//! branching goes through [`fork`] / [`spawn`], which snapshot-copy the
//! current context into a fresh slot: a branch sees every mutation made
//! before it forked and none made after, and its own mutations never reach
//! its siblings or its parent.

use std::cell::RefCell;
use std::future::Future;

use tokio::task::JoinHandle;

use crate::types::{CorrelationKeys, TraceSource};

tokio::task_local! {
    static CURRENT_CONTEXT: RefCell<Option<TraceContext>>;
}

/// Identity of the active trace plus a small mutable execution pointer.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceContext {
    pub trace_id: String,
    pub source: TraceSource,
    pub correlation: CorrelationKeys,

    /// Agent that subsequently emitted events are tagged with by default.
    pub current_agent: Option<String>,

    /// Stage that subsequently emitted events are tagged with by default.
    pub current_stage: Option<String>,

    /// Prompt template in use, recorded in event metadata.
    pub current_prompt_file: Option<String>,
}

impl TraceContext {
    pub fn new(trace_id: impl Into<String>, source: TraceSource, correlation: CorrelationKeys) -> Self {
        Self {
            trace_id: trace_id.into(),
            source,
            correlation,
            current_agent: None,
            current_stage: None,
            current_prompt_file: None,
        }
    }

    /// Apply a partial update to the execution pointer.
    pub fn apply(&mut self, update: &ContextUpdate) {
        if let Some(agent) = &update.agent {
            self.current_agent = Some(agent.clone());
        }
        if let Some(stage) = &update.stage {
            self.current_stage = Some(stage.clone());
        }
        if let Some(file) = &update.prompt_file {
            self.current_prompt_file = Some(file.clone());
        }
    }
}

/// Partial update of the execution pointer; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextUpdate {
    pub agent: Option<String>,
    pub stage: Option<String>,
    pub prompt_file: Option<String>,
}

impl ContextUpdate {
    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn prompt_file(mut self, file: impl Into<String>) -> Self {
        self.prompt_file = Some(file.into());
        self
    }
}

/// Run `f` with its own context slot holding `ctx`.
pub fn with_context<F: Future>(ctx: Option<TraceContext>, f: F) -> impl Future<Output = F::Output> {
    CURRENT_CONTEXT.scope(RefCell::new(ctx), f)
}

/// Run `f` in a new slot holding a copy of the current context.
///
/// The copy is taken when `fork` is called, not when the future is first polled.
pub fn fork<F: Future>(f: F) -> impl Future<Output = F::Output> {
    with_context(get_context(), f)
}

/// Like [`fork`], with `update` applied to the copy only.
pub fn fork_with<F: Future>(update: ContextUpdate, f: F) -> impl Future<Output = F::Output> {
    let ctx = get_context().map(|mut ctx| {
        ctx.apply(&update);
        ctx
    });
    with_context(ctx, f)
}

/// Spawn a tokio task that inherits a copy of the current context.
pub fn spawn<F>(f: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(fork(f))
}

/// Activate `ctx` in the current slot.
///
/// Returns `false` when no slot is installed (the caller is outside any
/// [`with_context`] / [`fork`] scope); the context is then not retrievable.
pub fn set_context(ctx: TraceContext) -> bool {
    let installed = CURRENT_CONTEXT
        .try_with(|slot| *slot.borrow_mut() = Some(ctx))
        .is_ok();
    if !installed {
        tracing::debug!("No context scope installed; trace context not activated");
    }
    installed
}

/// Remove the active context from the current slot.
pub fn clear_context() {
    let _ = CURRENT_CONTEXT.try_with(|slot| slot.borrow_mut().take());
}

/// Update the execution pointer of the active context (no-op without one).
pub fn update_context(update: ContextUpdate) {
    let _ = CURRENT_CONTEXT.try_with(|slot| {
        if let Some(ctx) = slot.borrow_mut().as_mut() {
            ctx.apply(&update);
        }
    });
}

/// Snapshot of the active context, if any.
pub fn get_context() -> Option<TraceContext> {
    CURRENT_CONTEXT
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten()
}

/// Whether a trace context is active in the current task.
pub fn is_tracing() -> bool {
    CURRENT_CONTEXT
        .try_with(|slot| slot.borrow().is_some())
        .unwrap_or(false)
}

/// Trace id of the active context.
pub fn current_trace_id() -> Option<String> {
    CURRENT_CONTEXT
        .try_with(|slot| slot.borrow().as_ref().map(|ctx| ctx.trace_id.clone()))
        .ok()
        .flatten()
}
