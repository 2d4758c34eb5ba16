//! Named lifecycle callbacks fired around every stage of dispatch.
//!
//! Observability and intervention layer for the engine. Implementors
//! register async callbacks under a stable name at one of the
//! [`HookPoint`]s; the engine invokes them in registration order, threading
//! the working [`State`] through each one — a callback returns the state
//! handed to the next, so hooks can annotate or replace it.
//!
//! Registering the same name at the same point replaces the function in its
//! original slot, which makes register/unregister idempotent and lets a
//! supervisor swap a hook without disturbing ordering.
//!
//! A panic inside a callback never unwinds through the engine: the registry
//! catches it and converts it into [`FlowError::CallbackPanicked`] carrying
//! the callback's name.
//!
//! # Example
//!
//! ```rust,no_run
//! use flowllm::callbacks::{CallbackRegistry, HookPoint};
//!
//! # async fn demo() {
//! let registry = CallbackRegistry::new();
//! registry
//!     .register(HookPoint::AfterAgentRun, "audit-log", |args| async move {
//!         log::info!("agent {} finished in {:?}", args.agent_id, args.duration);
//!         Ok(args.state)
//!     })
//!     .await;
//! # }
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::RwLock;

use crate::flowllm::agent::AgentResult;
use crate::flowllm::errors::FlowError;
use crate::flowllm::event::Event;
use crate::flowllm::state::State;

/// The lifecycle instants at which callbacks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Before the runner hands the event to the orchestrator.
    BeforeEventHandling,
    /// Before each individual handler invocation.
    BeforeAgentRun,
    /// After a handler invocation succeeds.
    AfterAgentRun,
    /// After a handler invocation fails; `args.error` carries the failure.
    AgentError,
    /// After the orchestrator returns, success or error.
    AfterEventHandling,
    /// After a collaborative fan-out has joined all handlers.
    AllAgentsComplete,
}

impl HookPoint {
    /// Stable snake_case name, used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::BeforeEventHandling => "before_event_handling",
            HookPoint::BeforeAgentRun => "before_agent_run",
            HookPoint::AfterAgentRun => "after_agent_run",
            HookPoint::AgentError => "agent_error",
            HookPoint::AfterEventHandling => "after_event_handling",
            HookPoint::AllAgentsComplete => "all_agents_complete",
        }
    }
}

impl std::fmt::Display for HookPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The record handed to every callback.
#[derive(Debug, Clone)]
pub struct CallbackArgs {
    /// Name of the agent involved, or empty at event-level hook points.
    pub agent_id: String,
    /// The event being dispatched.
    pub event: Event,
    /// The handler result, present at `AfterAgentRun` and on successful
    /// `AfterEventHandling`.
    pub result: Option<AgentResult>,
    /// The working state. Callbacks return the state to hand onwards.
    pub state: State,
    /// The failure, present at `AgentError` and on failed
    /// `AfterEventHandling`.
    pub error: Option<FlowError>,
    /// 1-based loop iteration, when dispatched by a loop orchestrator.
    pub iteration: Option<usize>,
    /// 0-based stage index, when dispatched by a sequential or composite
    /// orchestrator.
    pub stage: Option<usize>,
    /// When the surrounded work started.
    pub start_time: DateTime<Utc>,
    /// Elapsed time of the surrounded work.
    pub duration: Duration,
}

impl CallbackArgs {
    /// Create args for an event-level hook point.
    pub fn for_event(event: Event, state: State) -> Self {
        Self {
            agent_id: String::new(),
            event,
            result: None,
            state,
            error: None,
            iteration: None,
            stage: None,
            start_time: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    /// Create args attributed to an agent.
    pub fn for_agent(agent_id: impl Into<String>, event: Event, state: State) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Self::for_event(event, state)
        }
    }

    /// Attach a handler result.
    pub fn with_result(mut self, result: AgentResult) -> Self {
        self.result = Some(result);
        self
    }

    /// Attach an error.
    pub fn with_error(mut self, error: FlowError) -> Self {
        self.error = Some(error);
        self
    }

    /// Attach a loop iteration index.
    pub fn with_iteration(mut self, iteration: usize) -> Self {
        self.iteration = Some(iteration);
        self
    }

    /// Attach a stage index.
    pub fn with_stage(mut self, stage: usize) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Attach timing of the surrounded work.
    pub fn with_timing(mut self, start_time: DateTime<Utc>, duration: Duration) -> Self {
        self.start_time = start_time;
        self.duration = duration;
        self
    }
}

type CallbackFuture = Pin<Box<dyn Future<Output = Result<State, FlowError>> + Send>>;
type CallbackFn = Arc<dyn Fn(CallbackArgs) -> CallbackFuture + Send + Sync>;

struct NamedCallback {
    name: String,
    func: CallbackFn,
}

/// Ordered, named callback registration per hook point.
///
/// Registration takes a write lock; execution takes a read lock, snapshots
/// the list, and runs without holding it, so concurrent dispatches never
/// block each other and never observe a half-applied registration.
#[derive(Default)]
pub struct CallbackRegistry {
    hooks: RwLock<std::collections::HashMap<HookPoint, Vec<NamedCallback>>>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback under a stable name. A duplicate name at the same
    /// point replaces the function in its original slot.
    pub async fn register<F, Fut>(&self, point: HookPoint, name: impl Into<String>, func: F)
    where
        F: Fn(CallbackArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<State, FlowError>> + Send + 'static,
    {
        let name = name.into();
        let wrapped: CallbackFn = Arc::new(move |args| Box::pin(func(args)));
        let mut hooks = self.hooks.write().await;
        let list = hooks.entry(point).or_default();
        match list.iter_mut().find(|cb| cb.name == name) {
            Some(existing) => existing.func = wrapped,
            None => list.push(NamedCallback { name, func: wrapped }),
        }
    }

    /// Remove a callback by name. Returns whether one was registered.
    pub async fn unregister(&self, point: HookPoint, name: &str) -> bool {
        let mut hooks = self.hooks.write().await;
        match hooks.get_mut(&point) {
            Some(list) => {
                let before = list.len();
                list.retain(|cb| cb.name != name);
                before != list.len()
            }
            None => false,
        }
    }

    /// Number of callbacks registered at a point.
    pub async fn count(&self, point: HookPoint) -> usize {
        self.hooks
            .read()
            .await
            .get(&point)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Invoke the callbacks registered at `point` in registration order,
    /// threading `args.state` through each one.
    ///
    /// The first error aborts the remaining callbacks at the point and is
    /// returned alongside the state accumulated so far; the caller surfaces
    /// it as the event's error. A panicking callback is converted into
    /// [`FlowError::CallbackPanicked`].
    pub async fn execute(&self, point: HookPoint, args: CallbackArgs) -> (State, Option<FlowError>) {
        let snapshot: Vec<(String, CallbackFn)> = {
            let hooks = self.hooks.read().await;
            match hooks.get(&point) {
                Some(list) => list
                    .iter()
                    .map(|cb| (cb.name.clone(), Arc::clone(&cb.func)))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut state = args.state.clone();
        for (name, func) in snapshot {
            let mut call_args = args.clone();
            call_args.state = state.clone();
            match AssertUnwindSafe(func(call_args)).catch_unwind().await {
                Ok(Ok(next_state)) => state = next_state,
                Ok(Err(err)) => {
                    log::warn!("callback '{}' at {} returned error: {}", name, point, err);
                    return (state, Some(err));
                }
                Err(_) => {
                    log::error!("callback '{}' at {} panicked", name, point);
                    return (state, Some(FlowError::CallbackPanicked { name }));
                }
            }
        }
        (state, None)
    }
}
