//! The dispatch contract for units of work, and the higher-level `Agent`
//! construct adapted into it.
//!
//! Orchestration only requires the minimal [`AgentHandler`] shape — run with
//! a context, an event, and an owned [`State`], produce an [`AgentResult`] or
//! an error. [`Agent`] layers identity (name, role, description, capability
//! tags), an optional per-invocation timeout, an enabled flag, and lifecycle
//! hooks on top, and is adapted into a handler at registration time.
//!
//! # Example: a closure handler
//!
//! ```rust
//! use flowllm::agent::FnHandler;
//!
//! let echo = FnHandler::from_sync(|_event, state| {
//!     let msg = state.get_str("msg").unwrap_or_default().to_string();
//!     state.set("reply", serde_json::json!(format!("{}!", msg)));
//!     Ok(())
//! });
//! # let _ = echo;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::flowllm::context::RunContext;
use crate::flowllm::errors::FlowError;
use crate::flowllm::event::Event;
use crate::flowllm::state::State;

/// The outcome of one successful handler invocation.
///
/// The error side of the contract is the `Err` arm of the surrounding
/// `Result`; a constructed `AgentResult` always carries an output state.
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// The state produced by the handler — a mutated input or a fresh clone.
    pub output_state: State,
    /// Wall-clock time the invocation started.
    pub start_time: DateTime<Utc>,
    /// Wall-clock time the invocation finished.
    pub end_time: DateTime<Utc>,
    /// Elapsed invocation time.
    pub duration: Duration,
}

impl AgentResult {
    /// Wrap a state with both timestamps taken now (zero duration). Use
    /// [`AgentResult::timed`] when the invocation's start time is known.
    pub fn from_state(output_state: State) -> Self {
        let now = Utc::now();
        Self {
            output_state,
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
        }
    }

    /// Wrap a state with an explicit start time; the end time is taken now
    /// and the duration derived from the difference.
    pub fn timed(output_state: State, start_time: DateTime<Utc>) -> Self {
        let end_time = Utc::now();
        let duration = (end_time - start_time).to_std().unwrap_or(Duration::ZERO);
        Self {
            output_state,
            start_time,
            end_time,
            duration,
        }
    }
}

/// The minimal dispatch target: anything that can run against an event and
/// an owned state.
///
/// A `State` handed to `run` is owned by the handler for the duration of the
/// invocation; parallel dispatch paths pass independent clones. Handlers must
/// honour cancellation on the context and return promptly when signalled.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Process one event. Returns the result state, or an error that the
    /// orchestrator will attribute to this handler.
    async fn run(
        &self,
        ctx: &RunContext,
        event: &Event,
        state: State,
    ) -> Result<AgentResult, FlowError>;
}

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = Result<AgentResult, FlowError>> + Send>>;
type BoxedHandlerFn =
    dyn Fn(RunContext, Event, State) -> BoxedHandlerFuture + Send + Sync + 'static;

/// Adapts a closure into an [`AgentHandler`].
pub struct FnHandler {
    func: Arc<BoxedHandlerFn>,
}

impl FnHandler {
    /// Wrap an async closure. The closure receives owned clones of the
    /// context and event so its future has no borrowed lifetime.
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(RunContext, Event, State) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AgentResult, FlowError>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |ctx, event, state| Box::pin(func(ctx, event, state))),
        }
    }

    /// Wrap a synchronous closure that mutates the state in place. Timing is
    /// recorded around the call. This is the shape most test handlers and
    /// simple post-processing agents take.
    pub fn from_sync<F>(func: F) -> Self
    where
        F: Fn(&Event, &mut State) -> Result<(), FlowError> + Send + Sync + 'static,
    {
        Self::new(move |_ctx, event, mut state| {
            let started = Utc::now();
            let outcome = func(&event, &mut state);
            let result = outcome.map(|_| AgentResult::timed(state, started));
            async move { result }
        })
    }
}

#[async_trait]
impl AgentHandler for FnHandler {
    async fn run(
        &self,
        ctx: &RunContext,
        event: &Event,
        state: State,
    ) -> Result<AgentResult, FlowError> {
        (self.func)(ctx.clone(), event.clone(), state).await
    }
}

/// Optional initialize/shutdown hooks for an [`Agent`].
///
/// The engine never calls these on its own; applications invoke
/// [`Agent::initialize`] before registration and [`Agent::shutdown`] during
/// teardown.
#[async_trait]
pub trait AgentLifecycle: Send + Sync {
    /// Called once before the agent starts receiving events.
    async fn initialize(&self) -> Result<(), FlowError> {
        Ok(())
    }

    /// Called once when the agent is being retired.
    async fn shutdown(&self) -> Result<(), FlowError> {
        Ok(())
    }
}

/// A named unit of work: identity and dispatch policy wrapped around an
/// inner handler.
///
/// Build with the `with_*` methods, then adapt into a registrable handler
/// with [`Agent::into_handler`]. The adapter enforces the enabled flag and
/// the per-invocation timeout, so orchestrators see a plain handler.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use flowllm::agent::{Agent, FnHandler};
///
/// let agent = Agent::new("summarizer", FnHandler::from_sync(|_e, state| {
///         state.set("summary", serde_json::json!("..."));
///         Ok(())
///     }))
///     .with_role("writer")
///     .with_description("Condenses long inputs")
///     .with_capability("summarization")
///     .with_timeout(Duration::from_secs(30));
///
/// assert_eq!(agent.name(), "summarizer");
/// assert!(agent.enabled());
/// ```
pub struct Agent {
    name: String,
    role: Option<String>,
    description: Option<String>,
    capabilities: Vec<String>,
    timeout: Option<Duration>,
    enabled: bool,
    lifecycle: Option<Arc<dyn AgentLifecycle>>,
    handler: Arc<dyn AgentHandler>,
}

impl Agent {
    /// Create an agent wrapping the given handler.
    pub fn new(name: impl Into<String>, handler: impl AgentHandler + 'static) -> Self {
        Self {
            name: name.into(),
            role: None,
            description: None,
            capabilities: Vec::new(),
            timeout: None,
            enabled: true,
            lifecycle: None,
            handler: Arc::new(handler),
        }
    }

    /// Set the agent's role label.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the agent's human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append one capability tag.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Set the per-invocation deadline applied by the handler adapter.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable or disable the agent. A disabled agent fails dispatch with an
    /// attributed error rather than silently succeeding.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Attach initialize/shutdown hooks.
    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn AgentLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// The agent's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The agent's role label.
    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    /// The agent's description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Capability tags in declaration order.
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// The configured per-invocation deadline.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether the agent accepts dispatches.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Run the initialize hook, if any.
    pub async fn initialize(&self) -> Result<(), FlowError> {
        match &self.lifecycle {
            Some(hooks) => hooks.initialize().await,
            None => Ok(()),
        }
    }

    /// Run the shutdown hook, if any.
    pub async fn shutdown(&self) -> Result<(), FlowError> {
        match &self.lifecycle {
            Some(hooks) => hooks.shutdown().await,
            None => Ok(()),
        }
    }

    /// Adapt this agent into a registrable handler that enforces the enabled
    /// flag and the timeout.
    pub fn into_handler(self) -> Arc<dyn AgentHandler> {
        Arc::new(self)
    }
}

#[async_trait]
impl AgentHandler for Agent {
    async fn run(
        &self,
        ctx: &RunContext,
        event: &Event,
        state: State,
    ) -> Result<AgentResult, FlowError> {
        if !self.enabled {
            return Err(FlowError::AgentFailed {
                agent: self.name.clone(),
                cause: "agent is disabled".to_string(),
            });
        }
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.handler.run(ctx, event, state))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(FlowError::Timeout {
                    scope: self.name.clone(),
                }),
            },
            None => self.handler.run(ctx, event, state).await,
        }
    }
}
