//! Error taxonomy for the orchestration core.
//!
//! Every fallible operation in the engine returns [`FlowError`]. The enum is
//! deliberately flat: one variant per failure kind, each carrying the
//! identifiers (agent name, stage index, per-agent error map) a caller needs
//! to react programmatically. Use [`FlowError::kind`] when you only care
//! about the category and not the payload.
//!
//! # Example
//!
//! ```rust
//! use flowllm::errors::{FlowError, FlowErrorKind};
//!
//! let err = FlowError::NoRoute { target: "summarizer".into() };
//! assert_eq!(err.kind(), FlowErrorKind::NoRoute);
//! assert_eq!(err.to_string(), "no handler registered for route 'summarizer'");
//! ```

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// Category of a [`FlowError`], without the per-variant payload.
///
/// Useful for matching in tests and retry policies where destructuring the
/// full variant would be noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowErrorKind {
    /// Routing failed to find a handler.
    NoRoute,
    /// The event exceeded the maximum hop count.
    RoutingLoop,
    /// A handler returned an error.
    AgentFailed,
    /// A pipeline stage ultimately failed after retries.
    StageFailed,
    /// A workflow stage's required state keys were missing.
    StagePrereq,
    /// A workflow stage's success predicate returned false.
    StageUnsuccessful,
    /// A collaborative dispatch fell below its success-ratio floor.
    CollaborationFailed,
    /// A deadline expired.
    Timeout,
    /// Cooperative cancellation was observed.
    Cancelled,
    /// The event queue was at capacity.
    QueueFull,
    /// A lifecycle callback panicked.
    CallbackPanicked,
    /// A state merge with the `Error` policy hit a conflicting key.
    StateConflict,
    /// Dispatch was attempted after `stop()`.
    OrchestratorStopped,
    /// Dispatch was attempted with no agents registered.
    NoAgents,
    /// A runtime failure outside the other categories (task join errors,
    /// malformed configuration, misuse of the streaming API).
    ExecutionFailed,
}

/// Errors produced by orchestrators, the runner, the callback registry, and
/// the stream sink.
///
/// Variants are `Clone` so an error can be reported through callbacks and
/// still be delivered on a result channel; causes are therefore carried as
/// rendered strings rather than boxed source errors.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowError {
    /// No handler matched the event's route metadata or target.
    NoRoute {
        /// The route or target name that failed to resolve. Empty when the
        /// event carried neither.
        target: String,
    },

    /// The event's `hops` metadata exceeded the configured maximum,
    /// indicating a re-emission cycle between agents.
    RoutingLoop {
        /// Hop count observed on the event.
        hops: u32,
        /// The configured ceiling.
        max_hops: u32,
    },

    /// A handler returned an error. Wraps the rendered cause and the agent
    /// name so callers can attribute the failure.
    AgentFailed {
        /// Name the handler was registered under.
        agent: String,
        /// Rendered underlying error.
        cause: String,
    },

    /// A sequential stage failed after exhausting its retries.
    StageFailed {
        /// 0-based index of the failing stage.
        stage_index: usize,
        /// Agent name of the failing stage.
        stage_name: String,
        /// Rendered underlying error.
        cause: String,
    },

    /// A workflow stage declared prerequisites that the incoming state does
    /// not satisfy.
    StagePrereq {
        /// Name of the stage whose prerequisites failed.
        stage: String,
        /// The missing state keys, in declaration order.
        missing: Vec<String>,
    },

    /// A workflow stage ran but its success predicate rejected the result.
    StageUnsuccessful {
        /// Name of the rejected stage.
        stage: String,
    },

    /// A collaborative dispatch's success ratio fell below the configured
    /// failure threshold.
    CollaborationFailed {
        /// Per-agent rendered errors for every handler that failed.
        errors: HashMap<String, String>,
        /// Number of handlers that succeeded.
        succeeded: usize,
        /// Total number of handlers invoked.
        total: usize,
    },

    /// A deadline expired. `scope` names the element the deadline was
    /// attached to (an agent, a stage, or an orchestrator).
    Timeout {
        /// What timed out.
        scope: String,
    },

    /// The dispatch context was cancelled. Always terminal for the event.
    Cancelled,

    /// `Runner::emit` found the bounded queue at capacity.
    QueueFull,

    /// A callback panicked; the registry converted the panic into this error
    /// instead of unwinding through the engine.
    CallbackPanicked {
        /// Registered name of the panicking callback.
        name: String,
    },

    /// `State::merge` with [`MergePolicy::Error`](crate::state::MergePolicy)
    /// found the same key with different values on both sides.
    StateConflict {
        /// The conflicting key.
        key: String,
    },

    /// The orchestrator (or runner) was stopped before this call.
    OrchestratorStopped,

    /// No agents are registered, so there is nothing to dispatch to.
    NoAgents,

    /// A runtime failure outside the other categories.
    ExecutionFailed(String),
}

impl FlowError {
    /// The category of this error, without its payload.
    pub fn kind(&self) -> FlowErrorKind {
        match self {
            FlowError::NoRoute { .. } => FlowErrorKind::NoRoute,
            FlowError::RoutingLoop { .. } => FlowErrorKind::RoutingLoop,
            FlowError::AgentFailed { .. } => FlowErrorKind::AgentFailed,
            FlowError::StageFailed { .. } => FlowErrorKind::StageFailed,
            FlowError::StagePrereq { .. } => FlowErrorKind::StagePrereq,
            FlowError::StageUnsuccessful { .. } => FlowErrorKind::StageUnsuccessful,
            FlowError::CollaborationFailed { .. } => FlowErrorKind::CollaborationFailed,
            FlowError::Timeout { .. } => FlowErrorKind::Timeout,
            FlowError::Cancelled => FlowErrorKind::Cancelled,
            FlowError::QueueFull => FlowErrorKind::QueueFull,
            FlowError::CallbackPanicked { .. } => FlowErrorKind::CallbackPanicked,
            FlowError::StateConflict { .. } => FlowErrorKind::StateConflict,
            FlowError::OrchestratorStopped => FlowErrorKind::OrchestratorStopped,
            FlowError::NoAgents => FlowErrorKind::NoAgents,
            FlowError::ExecutionFailed(_) => FlowErrorKind::ExecutionFailed,
        }
    }

    /// True when the error is a terminal control-flow signal (cancellation or
    /// a deadline) rather than a handler-level failure. Sequential retry
    /// loops never retry these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowError::Cancelled | FlowError::Timeout { .. })
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::NoRoute { target } => {
                if target.is_empty() {
                    write!(f, "no handler registered and event carries no route or target")
                } else {
                    write!(f, "no handler registered for route '{}'", target)
                }
            }
            FlowError::RoutingLoop { hops, max_hops } => write!(
                f,
                "routing loop detected: event hop count {} exceeds maximum {}",
                hops, max_hops
            ),
            FlowError::AgentFailed { agent, cause } => {
                write!(f, "agent '{}' failed: {}", agent, cause)
            }
            FlowError::StageFailed {
                stage_index,
                stage_name,
                cause,
            } => write!(
                f,
                "stage {} ('{}') failed: {}",
                stage_index, stage_name, cause
            ),
            FlowError::StagePrereq { stage, missing } => write!(
                f,
                "stage '{}' missing prerequisite state keys: {}",
                stage,
                missing.join(", ")
            ),
            FlowError::StageUnsuccessful { stage } => {
                write!(f, "stage '{}' did not meet its success predicate", stage)
            }
            FlowError::CollaborationFailed {
                errors,
                succeeded,
                total,
            } => {
                let mut agents: Vec<&String> = errors.keys().collect();
                agents.sort();
                let names: Vec<&str> = agents.iter().map(|s| s.as_str()).collect();
                write!(
                    f,
                    "collaboration failed: {}/{} agents succeeded (failing: {})",
                    succeeded,
                    total,
                    names.join(", ")
                )
            }
            FlowError::Timeout { scope } => write!(f, "deadline expired for '{}'", scope),
            FlowError::Cancelled => write!(f, "dispatch cancelled"),
            FlowError::QueueFull => write!(f, "event queue is full"),
            FlowError::CallbackPanicked { name } => {
                write!(f, "callback '{}' panicked", name)
            }
            FlowError::StateConflict { key } => {
                write!(f, "state merge conflict on key '{}'", key)
            }
            FlowError::OrchestratorStopped => write!(f, "orchestrator is stopped"),
            FlowError::NoAgents => write!(f, "no agents registered"),
            FlowError::ExecutionFailed(msg) => write!(f, "execution failed: {}", msg),
        }
    }
}

impl Error for FlowError {}
