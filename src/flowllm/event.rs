//! The immutable message that enters the runner.
//!
//! An [`Event`] carries a unique id, an optional target agent name, a payload
//! of JSON values, and string metadata. Events are created by producers via
//! [`EventBuilder`], consumed by exactly one orchestration invocation, and
//! never mutated after emission — [`Event::with_meta`] returns a derived
//! copy, which is how agents re-emit an event with an incremented hop count
//! and how orchestrators inject per-stage annotations.
//!
//! # Example
//!
//! ```rust
//! use flowllm::event::{meta_keys, EventBuilder};
//!
//! let event = EventBuilder::new()
//!     .target("echo")
//!     .payload_entry("msg", serde_json::json!("hi"))
//!     .session("s1")
//!     .build();
//!
//! assert_eq!(event.target(), Some("echo"));
//! assert_eq!(event.session_id(), "s1");
//! assert_eq!(event.meta(meta_keys::HOPS), None);
//! assert!(!event.id().is_empty());
//! ```

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

/// Well-known metadata keys recognised by the engine.
pub mod meta_keys {
    /// Session grouping identifier. Always present; defaults to
    /// [`DEFAULT_SESSION`](super::DEFAULT_SESSION).
    pub const SESSION_ID: &str = "session_id";
    /// Explicit route override; takes precedence over the event target.
    pub const ROUTE: &str = "route";
    /// Re-emission hop counter, incremented by the caller on each re-emit.
    pub const HOPS: &str = "hops";
    /// 1-based loop iteration, injected by the loop orchestrator.
    pub const LOOP_ITERATION: &str = "loop_iteration";
    /// Configured iteration ceiling, injected by the loop orchestrator.
    pub const MAX_ITERATIONS: &str = "max_iterations";
    /// Stage name, injected by the sequential and composite orchestrators.
    pub const STAGE_NAME: &str = "stage_name";
    /// 0-based stage index, injected by the sequential orchestrator.
    pub const STAGE_INDEX: &str = "stage_index";
    /// Total stage count, injected by the sequential orchestrator.
    pub const TOTAL_STAGES: &str = "total_stages";
    /// Pipeline identity used for checkpoint resume; defaults to the event id.
    pub const PIPELINE_ID: &str = "pipeline_id";
}

/// Session id applied when a producer does not set one.
pub const DEFAULT_SESSION: &str = "default";

/// An immutable message: identity, optional target, payload, metadata.
#[derive(Debug, Clone)]
pub struct Event {
    id: String,
    target: Option<String>,
    payload: HashMap<String, Value>,
    metadata: HashMap<String, String>,
}

impl Event {
    /// The event's unique id (UUID v4 unless the builder supplied one).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The target agent name, or `None` for broadcast events.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// The payload map.
    pub fn payload(&self) -> &HashMap<String, Value> {
        &self.payload
    }

    /// The metadata map.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Read a single metadata entry.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|s| s.as_str())
    }

    /// The session this event belongs to.
    pub fn session_id(&self) -> &str {
        self.meta(meta_keys::SESSION_ID).unwrap_or(DEFAULT_SESSION)
    }

    /// The hop count, or 0 when the `hops` metadata is absent or malformed.
    pub fn hops(&self) -> u32 {
        self.meta(meta_keys::HOPS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Derive a copy with one metadata entry added or replaced. The original
    /// event is untouched.
    pub fn with_meta(&self, key: impl Into<String>, value: impl Into<String>) -> Event {
        let mut derived = self.clone();
        derived.metadata.insert(key.into(), value.into());
        derived
    }

    /// Derive a copy with the payload replaced wholesale. Used by the
    /// composite orchestrator to carry accumulated state into a sub-stage.
    pub(crate) fn with_payload(&self, payload: HashMap<String, Value>) -> Event {
        let mut derived = self.clone();
        derived.payload = payload;
        derived
    }
}

/// Builder for [`Event`]. Generates a UUID v4 id and a default session when
/// not supplied.
///
/// # Example
///
/// ```rust
/// use flowllm::event::EventBuilder;
///
/// let event = EventBuilder::new()
///     .id("evt-1")
///     .route("classify")
///     .payload_entry("text", serde_json::json!("..."))
///     .build();
/// assert_eq!(event.id(), "evt-1");
/// assert_eq!(event.meta("route"), Some("classify"));
/// ```
#[derive(Debug, Default)]
pub struct EventBuilder {
    id: Option<String>,
    target: Option<String>,
    payload: HashMap<String, Value>,
    metadata: HashMap<String, String>,
}

impl EventBuilder {
    /// Start an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an explicit event id instead of a generated UUID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the target agent name.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the `route` metadata entry (takes precedence over the target
    /// during routed dispatch).
    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.metadata.insert(meta_keys::ROUTE.to_string(), route.into());
        self
    }

    /// Set the session id.
    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.metadata
            .insert(meta_keys::SESSION_ID.to_string(), session.into());
        self
    }

    /// Add one payload entry.
    pub fn payload_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Replace the payload map wholesale.
    pub fn payload(mut self, payload: HashMap<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Add one metadata entry.
    pub fn metadata_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Finalize the event. Fills in a UUID v4 id and the default session id
    /// when absent.
    pub fn build(mut self) -> Event {
        self.metadata
            .entry(meta_keys::SESSION_ID.to_string())
            .or_insert_with(|| DEFAULT_SESSION.to_string());
        Event {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            target: self.target,
            payload: self.payload,
            metadata: self.metadata,
        }
    }
}
