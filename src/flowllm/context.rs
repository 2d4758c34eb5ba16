//! Run-scoped context handed to every handler invocation.
//!
//! [`RunContext`] bundles the session identity, a cooperative cancellation
//! token, and an optional handle to the stream sink. Orchestrators derive
//! child contexts per stage and per handler so an inner deadline or a stop
//! request cancels exactly the enclosed work.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::flowllm::errors::FlowError;
use crate::flowllm::stream::StreamSink;

/// Context for one dispatch: session id, cancellation, streaming.
///
/// Cheap to clone; clones share the same cancellation token. Use
/// [`RunContext::child`] when the new scope must be cancellable without
/// cancelling the parent.
#[derive(Clone)]
pub struct RunContext {
    session_id: String,
    cancel: CancellationToken,
    sink: Option<Arc<StreamSink>>,
}

impl RunContext {
    /// Create a root context for a session.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cancel: CancellationToken::new(),
            sink: None,
        }
    }

    /// Create a root context whose cancellation chains off an existing token
    /// (the runner's base token).
    pub fn with_parent_token(session_id: impl Into<String>, parent: &CancellationToken) -> Self {
        Self {
            session_id: session_id.into(),
            cancel: parent.child_token(),
            sink: None,
        }
    }

    /// Attach a stream sink handle for progressive output.
    pub fn with_sink(mut self, sink: Arc<StreamSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The session this dispatch belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The cancellation token for this scope.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once this scope (or an ancestor) has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Return `FlowError::Cancelled` when this scope has been cancelled.
    /// Handlers call this at their own suspension points.
    pub fn ensure_active(&self) -> Result<(), FlowError> {
        if self.cancel.is_cancelled() {
            Err(FlowError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Derive a child scope: same session and sink, independently
    /// cancellable, cancelled when this scope is.
    pub fn child(&self) -> RunContext {
        Self {
            session_id: self.session_id.clone(),
            cancel: self.cancel.child_token(),
            sink: self.sink.clone(),
        }
    }

    /// The stream sink, when one is attached.
    pub fn sink(&self) -> Option<&Arc<StreamSink>> {
        self.sink.as_ref()
    }

    /// Push a progressive-output chunk for `agent` on this context's session.
    /// No-op returning `Ok(None)` when no sink is attached, so handlers can
    /// stream unconditionally.
    pub async fn emit_chunk(&self, agent: &str, content: &str) -> Result<Option<u64>, FlowError> {
        match &self.sink {
            Some(sink) => sink.push(&self.session_id, agent, content).await.map(Some),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("session_id", &self.session_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
