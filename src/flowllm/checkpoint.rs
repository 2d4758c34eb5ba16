//! Pipeline checkpointing for resumable sequential dispatch.
//!
//! A [`Checkpoint`] records how far a pipeline got — the stage index to
//! resume from and a snapshot of the threaded [`State`] — keyed by the
//! event's `pipeline_id`. The sequential orchestrator saves one every `k`
//! stages when a [`CheckpointStore`] is injected, resumes from it on the
//! next dispatch of the same pipeline, and deletes it on success.
//!
//! Two reference stores ship with the core: [`InMemoryCheckpointStore`] for
//! tests and single-process use, and [`FileCheckpointStore`] which writes
//! one JSON document per pipeline. State partitions are ordered maps, so the
//! encoding is deterministic for identical inputs.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::flowllm::errors::FlowError;
use crate::flowllm::state::State;

/// A saved pipeline position: resume stage plus state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The pipeline this checkpoint belongs to.
    pub pipeline_id: String,
    /// 0-based index of the next stage to run on resume.
    pub stage_index: usize,
    /// Snapshot of the threaded state after the last completed stage.
    pub state: State,
    /// When the checkpoint was taken.
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Snapshot a pipeline position, stamped now.
    pub fn new(pipeline_id: impl Into<String>, stage_index: usize, state: State) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            stage_index,
            state,
            timestamp: Utc::now(),
        }
    }
}

/// Storage boundary for pipeline checkpoints. Implementations outside the
/// core can back this with a database or object store.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint, replacing any prior one for the pipeline.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), FlowError>;

    /// Load the checkpoint for a pipeline, or `None` when absent.
    async fn load(&self, pipeline_id: &str) -> Result<Option<Checkpoint>, FlowError>;

    /// Remove the checkpoint for a pipeline. No-op when absent.
    async fn delete(&self, pipeline_id: &str) -> Result<(), FlowError>;
}

/// Map-backed store for tests and single-process pipelines.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), FlowError> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.pipeline_id.clone(), checkpoint);
        Ok(())
    }

    async fn load(&self, pipeline_id: &str) -> Result<Option<Checkpoint>, FlowError> {
        Ok(self.checkpoints.read().await.get(pipeline_id).cloned())
    }

    async fn delete(&self, pipeline_id: &str) -> Result<(), FlowError> {
        self.checkpoints.write().await.remove(pipeline_id);
        Ok(())
    }
}

/// File-backed store: one pretty-printed JSON document per pipeline under a
/// base directory. Pipeline ids are sanitized into file names, so arbitrary
/// ids cannot escape the directory.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store rooted at `dir`. The directory is created on first
    /// save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, pipeline_id: &str) -> PathBuf {
        let safe: String = pipeline_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), FlowError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| FlowError::ExecutionFailed(format!("checkpoint dir: {}", e)))?;
        let encoded = serde_json::to_string_pretty(&checkpoint)
            .map_err(|e| FlowError::ExecutionFailed(format!("checkpoint encode: {}", e)))?;
        tokio::fs::write(self.path_for(&checkpoint.pipeline_id), encoded)
            .await
            .map_err(|e| FlowError::ExecutionFailed(format!("checkpoint write: {}", e)))
    }

    async fn load(&self, pipeline_id: &str) -> Result<Option<Checkpoint>, FlowError> {
        let path = self.path_for(pipeline_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| FlowError::ExecutionFailed(format!("checkpoint decode: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FlowError::ExecutionFailed(format!(
                "checkpoint read: {}",
                e
            ))),
        }
    }

    async fn delete(&self, pipeline_id: &str) -> Result<(), FlowError> {
        match tokio::fs::remove_file(self.path_for(pipeline_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FlowError::ExecutionFailed(format!(
                "checkpoint delete: {}",
                e
            ))),
        }
    }
}
