//! The memory boundary agent handlers consume.
//!
//! Key/value recall, similarity query, and per-session conversation history
//! behind one trait. Backends (vector stores, SQL, files) live outside the
//! core; the orchestrator itself never touches memory. [`NoopMemory`] is the
//! default collaborator for handlers that do not need one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::flowllm::errors::FlowError;

/// One conversation entry in a session's history.
#[derive(Debug, Clone)]
pub struct MemoryMessage {
    /// Speaker role (`user`, `assistant`, a tool name).
    pub role: String,
    /// The message body.
    pub content: String,
    /// When the message was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Storage boundary for agent memory: content store + similarity query,
/// key/value recall, and session-scoped chat history.
#[async_trait]
pub trait Memory: Send + Sync {
    /// Store a piece of content with tags for later querying.
    async fn store(&self, content: &str, tags: &[String]) -> Result<(), FlowError>;

    /// Query stored content by similarity, best matches first.
    async fn query(&self, query: &str, limit: usize) -> Result<Vec<String>, FlowError>;

    /// Remember a value under a key in the current session.
    async fn remember(&self, key: &str, value: Value) -> Result<(), FlowError>;

    /// Recall a remembered value, or `None` when absent.
    async fn recall(&self, key: &str) -> Result<Option<Value>, FlowError>;

    /// Append a message to the current session's history.
    async fn add_message(&self, role: &str, content: &str) -> Result<(), FlowError>;

    /// Read the current session's most recent messages, oldest first.
    async fn get_history(&self, limit: usize) -> Result<Vec<MemoryMessage>, FlowError>;

    /// Create a new session and switch to it, returning its id.
    async fn new_session(&self) -> Result<String, FlowError>;

    /// Switch to an existing session.
    async fn set_session(&self, session_id: &str) -> Result<(), FlowError>;

    /// Clear the current session's history and remembered values.
    async fn clear_session(&self) -> Result<(), FlowError>;

    /// Release backend resources.
    async fn close(&self) -> Result<(), FlowError>;
}

/// Memory that remembers nothing. Every read returns empty, every write
/// succeeds.
pub struct NoopMemory;

#[async_trait]
impl Memory for NoopMemory {
    async fn store(&self, _content: &str, _tags: &[String]) -> Result<(), FlowError> {
        Ok(())
    }

    async fn query(&self, _query: &str, _limit: usize) -> Result<Vec<String>, FlowError> {
        Ok(Vec::new())
    }

    async fn remember(&self, _key: &str, _value: Value) -> Result<(), FlowError> {
        Ok(())
    }

    async fn recall(&self, _key: &str) -> Result<Option<Value>, FlowError> {
        Ok(None)
    }

    async fn add_message(&self, _role: &str, _content: &str) -> Result<(), FlowError> {
        Ok(())
    }

    async fn get_history(&self, _limit: usize) -> Result<Vec<MemoryMessage>, FlowError> {
        Ok(Vec::new())
    }

    async fn new_session(&self) -> Result<String, FlowError> {
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn set_session(&self, _session_id: &str) -> Result<(), FlowError> {
        Ok(())
    }

    async fn clear_session(&self) -> Result<(), FlowError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), FlowError> {
        Ok(())
    }
}
