//! Dispatch strategies: how an event maps to one or more handler
//! invocations.
//!
//! All five variants implement the same [`Orchestrator`] contract and share
//! a [`CallbackRegistry`] passed in at construction:
//!
//! - [`RouteOrchestrator`](route::RouteOrchestrator) — direct dispatch to the
//!   handler named by the event's route metadata or target.
//! - [`CollaborativeOrchestrator`](collaborative::CollaborativeOrchestrator)
//!   — parallel fan-out over every registered handler with deterministic
//!   result merging.
//! - [`SequentialOrchestrator`](sequential::SequentialOrchestrator) — an
//!   ordered pipeline threading state stage to stage, with retries and
//!   optional checkpointing.
//! - [`LoopOrchestrator`](looping::LoopOrchestrator) — bounded iterative
//!   refinement of a single agent under a termination predicate.
//! - [`CompositeOrchestrator`](composite::CompositeOrchestrator) — an
//!   ordered mix of the other four, one pattern per stage.
//!
//! Every handler invocation passes through [`run_agent`], which fires the
//! `BeforeAgentRun` / `AfterAgentRun` / `AgentError` hooks, enforces the
//! per-invocation deadline, and honours cooperative cancellation.

pub mod collaborative;
pub mod composite;
pub mod looping;
pub mod route;
pub mod sequential;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::flowllm::agent::{AgentHandler, AgentResult};
use crate::flowllm::callbacks::{CallbackArgs, CallbackRegistry, HookPoint};
use crate::flowllm::context::RunContext;
use crate::flowllm::errors::FlowError;
use crate::flowllm::event::Event;
use crate::flowllm::state::State;

pub use collaborative::{CollaborativeOrchestrator, ConcatReducer, MergeReducer};
pub use composite::{CompositeOrchestrator, StagePattern, WorkflowStage};
pub use looping::{LoopCondition, LoopOrchestrator};
pub use route::RouteOrchestrator;
pub use sequential::{SequentialOrchestrator, StagePolicy};

/// A strategy for mapping one event onto handler invocations.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Dispatch one event, producing the final result or the first error per
    /// the variant's failure semantics.
    async fn dispatch(&self, ctx: &RunContext, event: Event) -> Result<AgentResult, FlowError>;

    /// Register a handler under a name. Duplicate names are refused.
    async fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), FlowError>;

    /// Stop accepting dispatches. Subsequent `dispatch` calls return
    /// [`FlowError::OrchestratorStopped`].
    async fn stop(&self);
}

/// Read-optimised name → handler map shared by every variant. Registrations
/// take the write lock briefly; the dispatch path clones `Arc`s out under the
/// read lock and never holds it across an await on handler work.
#[derive(Default)]
pub(crate) struct HandlerMap {
    inner: RwLock<HashMap<String, Arc<dyn AgentHandler>>>,
}

impl HandlerMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn insert(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), FlowError> {
        let mut map = self.inner.write().await;
        if map.contains_key(name) {
            return Err(FlowError::ExecutionFailed(format!(
                "agent '{}' is already registered",
                name
            )));
        }
        map.insert(name.to_string(), handler);
        Ok(())
    }

    pub(crate) async fn get(&self, name: &str) -> Option<Arc<dyn AgentHandler>> {
        self.inner.read().await.get(name).cloned()
    }

    pub(crate) async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// All handlers, sorted by name for deterministic iteration.
    pub(crate) async fn snapshot_sorted(&self) -> Vec<(String, Arc<dyn AgentHandler>)> {
        let map = self.inner.read().await;
        let mut entries: Vec<(String, Arc<dyn AgentHandler>)> = map
            .iter()
            .map(|(name, handler)| (name.clone(), Arc::clone(handler)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// Stop flag shared by the variants.
pub(crate) struct StopFlag(AtomicBool);

impl StopFlag {
    pub(crate) fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub(crate) fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn ensure_running(&self) -> Result<(), FlowError> {
        if self.0.load(Ordering::SeqCst) {
            Err(FlowError::OrchestratorStopped)
        } else {
            Ok(())
        }
    }
}

/// Invoke one handler with full lifecycle instrumentation.
///
/// Fires `BeforeAgentRun` (hooks may replace the state handed to the
/// handler), runs the handler under the optional deadline and the context's
/// cancellation token, then fires `AfterAgentRun` on success (hooks may
/// replace the output state) or `AgentError` on failure. Handler errors are
/// wrapped as [`FlowError::AgentFailed`] carrying the agent name; timeouts
/// and cancellation keep their own kinds.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_agent(
    registry: &CallbackRegistry,
    ctx: &RunContext,
    agent: &str,
    handler: &Arc<dyn AgentHandler>,
    event: &Event,
    state: State,
    iteration: Option<usize>,
    stage: Option<usize>,
    timeout: Option<Duration>,
) -> Result<AgentResult, FlowError> {
    let mut before_args = CallbackArgs::for_agent(agent, event.clone(), state);
    before_args.iteration = iteration;
    before_args.stage = stage;
    let (state, hook_err) = registry.execute(HookPoint::BeforeAgentRun, before_args).await;
    if let Some(err) = hook_err {
        return Err(err);
    }

    // Kept for the error hook; the handler owns the working copy.
    let input_snapshot = state.clone();

    let start_wall = Utc::now();
    let started = Instant::now();
    log::debug!("running agent '{}' for event {}", agent, event.id());

    let work = handler.run(ctx, event, state);
    let outcome = match timeout {
        Some(limit) => tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(FlowError::Cancelled),
            result = tokio::time::timeout(limit, work) => match result {
                Ok(inner) => inner,
                Err(_) => Err(FlowError::Timeout { scope: agent.to_string() }),
            },
        },
        None => tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(FlowError::Cancelled),
            result = work => result,
        },
    };
    let elapsed = started.elapsed();

    match outcome {
        Ok(mut result) => {
            let mut after_args =
                CallbackArgs::for_agent(agent, event.clone(), result.output_state.clone())
                    .with_result(result.clone())
                    .with_timing(start_wall, elapsed);
            after_args.iteration = iteration;
            after_args.stage = stage;
            let (threaded, hook_err) = registry.execute(HookPoint::AfterAgentRun, after_args).await;
            if let Some(err) = hook_err {
                return Err(err);
            }
            result.output_state = threaded;
            Ok(result)
        }
        Err(err) => {
            let attributed = match err {
                FlowError::Cancelled => FlowError::Cancelled,
                FlowError::Timeout { scope } => FlowError::Timeout { scope },
                FlowError::AgentFailed { agent: name, cause } if name == agent => {
                    FlowError::AgentFailed { agent: name, cause }
                }
                other => FlowError::AgentFailed {
                    agent: agent.to_string(),
                    cause: other.to_string(),
                },
            };
            log::warn!(
                "agent '{}' failed for event {}: {}",
                agent,
                event.id(),
                attributed
            );
            let mut error_args = CallbackArgs::for_agent(agent, event.clone(), input_snapshot)
                .with_error(attributed.clone())
                .with_timing(start_wall, elapsed);
            error_args.iteration = iteration;
            error_args.stage = stage;
            let (_state, hook_err) = registry.execute(HookPoint::AgentError, error_args).await;
            if let Some(hook_override) = hook_err {
                return Err(hook_override);
            }
            Err(attributed)
        }
    }
}
