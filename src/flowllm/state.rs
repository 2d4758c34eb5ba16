//! The mutable key/value workspace threaded through orchestration.
//!
//! A [`State`] has two partitions: *data* (string keys to arbitrary JSON
//! values — the working material agents read and write) and *meta* (string
//! keys to string values — bookkeeping the engine and handlers annotate:
//! iteration counters, stage markers, partial-failure flags).
//!
//! `State` is thread-unsafe by design. Safety comes from the handoff
//! discipline, not from interior locking: at any instant a `State` is owned
//! by at most one handler. Parallel dispatch paths hand each handler an
//! independent [`State::clone`] and reconcile the clones afterwards with
//! [`State::merge`].
//!
//! Both partitions use `BTreeMap`, so [`State::keys`], serialization, and
//! merge iteration are deterministic — a requirement for reproducible merged
//! results and for checkpoint encodings that are stable across runs.
//!
//! # Example
//!
//! ```rust
//! use flowllm::state::{MergePolicy, State};
//!
//! let mut state = State::new();
//! state.set("draft", serde_json::json!("first pass"));
//! state.set_meta("loop_iteration", "1");
//!
//! let mut other = State::new();
//! other.set("score", serde_json::json!(0.8));
//!
//! state.merge(&other, MergePolicy::Overwrite).unwrap();
//! assert!(state.has("draft"));
//! assert_eq!(state.get_f64("score"), Some(0.8));
//! ```

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flowllm::event::Event;

/// How [`State::merge`] resolves a key present on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// The other side's value replaces the local one.
    Overwrite,
    /// The local value is kept when present.
    Skip,
    /// Fail with [`StateError::Conflict`] when both sides hold the key with
    /// values that differ by deep equality.
    Error,
}

/// Error produced by [`State::merge`].
#[derive(Debug, Clone, PartialEq)]
pub enum StateError {
    /// Merge with [`MergePolicy::Error`] found the same key on both sides
    /// with differing values.
    Conflict {
        /// The conflicting key.
        key: String,
    },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::Conflict { key } => write!(f, "merge conflict on key '{}'", key),
        }
    }
}

impl Error for StateError {}

impl From<StateError> for crate::flowllm::errors::FlowError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Conflict { key } => crate::flowllm::errors::FlowError::StateConflict { key },
        }
    }
}

/// The per-event workspace: a data partition of JSON values plus a meta
/// partition of string annotations.
///
/// A fresh `State` is created for every event, optionally seeded from the
/// event's payload and metadata with [`State::from_event`], and discarded
/// once orchestration completes unless an external memory collaborator
/// persists it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    data: BTreeMap<String, Value>,
    meta: BTreeMap<String, String>,
}

impl State {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a state from an event: the payload becomes the data partition,
    /// the metadata becomes the meta partition.
    pub fn from_event(event: &Event) -> Self {
        let mut state = State::new();
        for (key, value) in event.payload() {
            state.data.insert(key.clone(), value.clone());
        }
        for (key, value) in event.metadata() {
            state.meta.insert(key.clone(), value.clone());
        }
        state
    }

    /// Read a data value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Write a data value. Creates or overwrites.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// True when the data partition holds the key.
    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Remove and return a data value.
    pub fn delete(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Data keys in sorted order.
    pub fn keys(&self) -> Vec<&str> {
        self.data.keys().map(|k| k.as_str()).collect()
    }

    /// Number of data entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the data partition is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    // ── Typed accessors ──────────────────────────────────────────────────

    /// Read a data value as a string slice, or `None` when absent or not a
    /// JSON string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Read a data value as an `i64`, or `None` when absent or not an
    /// integral number.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(|v| v.as_i64())
    }

    /// Read a data value as an `f64`, or `None` when absent or not numeric.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(|v| v.as_f64())
    }

    /// Read a data value as a `bool`, or `None` when absent or not boolean.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(|v| v.as_bool())
    }

    // ── Meta partition ───────────────────────────────────────────────────

    /// Read a meta annotation by key.
    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(|s| s.as_str())
    }

    /// Write a meta annotation. Creates or overwrites.
    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.meta.insert(key.into(), value.into());
    }

    /// Meta keys in sorted order.
    pub fn meta_keys(&self) -> Vec<&str> {
        self.meta.keys().map(|k| k.as_str()).collect()
    }

    /// Iterate the data partition in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }

    /// Iterate the meta partition in key order.
    pub fn iter_meta(&self) -> impl Iterator<Item = (&String, &String)> {
        self.meta.iter()
    }

    /// Merge `other` into `self` under the given policy.
    ///
    /// For each key in `other`'s data partition: `Overwrite` replaces the
    /// local value, `Skip` keeps the local value when present, and `Error`
    /// fails on the first key held by both sides with values that differ by
    /// deep equality (identical values merge silently). The meta partition
    /// follows the same policy. On `Error`, `self` is left with every merge
    /// applied up to the conflicting key.
    pub fn merge(&mut self, other: &State, policy: MergePolicy) -> Result<(), StateError> {
        for (key, value) in &other.data {
            match policy {
                MergePolicy::Overwrite => {
                    self.data.insert(key.clone(), value.clone());
                }
                MergePolicy::Skip => {
                    self.data.entry(key.clone()).or_insert_with(|| value.clone());
                }
                MergePolicy::Error => match self.data.get(key) {
                    Some(existing) if existing != value => {
                        return Err(StateError::Conflict { key: key.clone() });
                    }
                    Some(_) => {}
                    None => {
                        self.data.insert(key.clone(), value.clone());
                    }
                },
            }
        }
        for (key, value) in &other.meta {
            match policy {
                MergePolicy::Overwrite => {
                    self.meta.insert(key.clone(), value.clone());
                }
                MergePolicy::Skip => {
                    self.meta.entry(key.clone()).or_insert_with(|| value.clone());
                }
                MergePolicy::Error => match self.meta.get(key) {
                    Some(existing) if existing != value => {
                        return Err(StateError::Conflict { key: key.clone() });
                    }
                    Some(_) => {}
                    None => {
                        self.meta.insert(key.clone(), value.clone());
                    }
                },
            }
        }
        Ok(())
    }
}
