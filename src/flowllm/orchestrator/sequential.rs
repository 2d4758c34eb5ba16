//! Ordered pipeline: each stage's output state is the next stage's input.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::flowllm::agent::{AgentHandler, AgentResult};
use crate::flowllm::callbacks::CallbackRegistry;
use crate::flowllm::checkpoint::{Checkpoint, CheckpointStore};
use crate::flowllm::context::RunContext;
use crate::flowllm::errors::FlowError;
use crate::flowllm::event::{meta_keys, Event};
use crate::flowllm::orchestrator::{run_agent, HandlerMap, Orchestrator, StopFlag};
use crate::flowllm::state::State;

/// Retry and deadline policy for one stage.
#[derive(Debug, Clone)]
pub struct StagePolicy {
    /// Retries after the first failed attempt. 0 disables retrying.
    pub max_retries: u32,
    /// Base delay before the first retry; doubles per attempt.
    pub retry_delay: Duration,
    /// Per-attempt deadline.
    pub timeout: Option<Duration>,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay: Duration::from_millis(100),
            timeout: None,
        }
    }
}

/// Runs an ordered list of agents, threading state stage to stage.
///
/// The original event payload seeds only the first stage's state; every
/// later stage sees the accumulated state returned by its predecessor. Each
/// stage observes `stage_name`, `stage_index`, and `total_stages` in both
/// the event metadata and the state meta partition.
///
/// The first stage error aborts the pipeline — after the stage's retries,
/// when configured — and surfaces as [`FlowError::StageFailed`] wrapping the
/// stage index and name. No rollback is performed. Cancellation and deadline
/// expiry are terminal and never retried.
///
/// With a checkpoint store attached, the threaded state is saved every `k`
/// stages under the event's `pipeline_id` (the event id when absent), a
/// later dispatch of the same pipeline resumes from the recorded stage, and
/// the checkpoint is deleted on success. A checkpoint whose recorded stage
/// index no longer fits the configured stage list is invalidated and the
/// pipeline restarts from the beginning.
pub struct SequentialOrchestrator {
    agents: HandlerMap,
    registry: Arc<CallbackRegistry>,
    stages: Vec<String>,
    policies: HashMap<String, StagePolicy>,
    default_policy: StagePolicy,
    overall_timeout: Option<Duration>,
    checkpointing: Option<(Arc<dyn CheckpointStore>, usize)>,
    stopped: StopFlag,
}

impl SequentialOrchestrator {
    /// Create a pipeline over the given agent names, in order.
    pub fn new(registry: Arc<CallbackRegistry>, stages: Vec<String>) -> Self {
        Self {
            agents: HandlerMap::new(),
            registry,
            stages,
            policies: HashMap::new(),
            default_policy: StagePolicy::default(),
            overall_timeout: None,
            checkpointing: None,
            stopped: StopFlag::new(),
        }
    }

    /// Override the policy for one stage.
    pub fn with_stage_policy(mut self, agent: impl Into<String>, policy: StagePolicy) -> Self {
        self.policies.insert(agent.into(), policy);
        self
    }

    /// Set the policy applied to stages without an override.
    pub fn with_default_policy(mut self, policy: StagePolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Set the whole-pipeline deadline.
    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = Some(timeout);
        self
    }

    /// Save a checkpoint every `every` stages to the given store and resume
    /// from it on re-dispatch.
    pub fn with_checkpointing(mut self, store: Arc<dyn CheckpointStore>, every: usize) -> Self {
        self.checkpointing = Some((store, every.max(1)));
        self
    }

    async fn run_pipeline(
        &self,
        ctx: &RunContext,
        event: &Event,
    ) -> Result<AgentResult, FlowError> {
        let start_wall = Utc::now();
        let total = self.stages.len();
        let pipeline_id = event
            .meta(meta_keys::PIPELINE_ID)
            .unwrap_or_else(|| event.id())
            .to_string();

        let (mut state, first_stage) = self.restore_or_seed(event, &pipeline_id, total).await?;

        for (index, stage_name) in self.stages.iter().enumerate().skip(first_stage) {
            ctx.ensure_active()?;
            let handler = self.agents.get(stage_name).await.ok_or_else(|| {
                FlowError::NoRoute {
                    target: stage_name.clone(),
                }
            })?;

            let staged_event = event
                .with_meta(meta_keys::STAGE_NAME, stage_name.clone())
                .with_meta(meta_keys::STAGE_INDEX, index.to_string())
                .with_meta(meta_keys::TOTAL_STAGES, total.to_string());
            state.set_meta(meta_keys::STAGE_NAME, stage_name.clone());
            state.set_meta(meta_keys::STAGE_INDEX, index.to_string());

            let policy = self.policies.get(stage_name).unwrap_or(&self.default_policy);
            let result = self
                .run_stage(ctx, index, stage_name, &handler, &staged_event, &state, policy)
                .await?;
            state = result.output_state;

            if let Some((store, every)) = &self.checkpointing {
                let completed = index + 1;
                if completed < total && completed % every == 0 {
                    let checkpoint = Checkpoint::new(&pipeline_id, completed, state.clone());
                    if let Err(err) = store.save(checkpoint).await {
                        log::warn!(
                            "checkpoint save failed for pipeline '{}' after stage {}: {}",
                            pipeline_id,
                            index,
                            err
                        );
                    }
                }
            }
        }

        if let Some((store, _)) = &self.checkpointing {
            if let Err(err) = store.delete(&pipeline_id).await {
                log::warn!(
                    "checkpoint delete failed for pipeline '{}': {}",
                    pipeline_id,
                    err
                );
            }
        }

        Ok(AgentResult::timed(state, start_wall))
    }

    /// Load a resume point when checkpointing is on, otherwise seed a fresh
    /// state from the event. Returns the state and the first stage to run.
    async fn restore_or_seed(
        &self,
        event: &Event,
        pipeline_id: &str,
        total: usize,
    ) -> Result<(State, usize), FlowError> {
        if let Some((store, _)) = &self.checkpointing {
            if let Some(checkpoint) = store.load(pipeline_id).await? {
                if checkpoint.stage_index < total {
                    log::info!(
                        "resuming pipeline '{}' from stage {}",
                        pipeline_id,
                        checkpoint.stage_index
                    );
                    return Ok((checkpoint.state, checkpoint.stage_index));
                }
                // Stale: the stage list shrank since the checkpoint was taken.
                log::warn!(
                    "invalidating checkpoint for pipeline '{}': recorded stage {} out of range",
                    pipeline_id,
                    checkpoint.stage_index
                );
                store.delete(pipeline_id).await?;
            }
        }
        let mut state = State::from_event(event);
        state.set_meta(meta_keys::TOTAL_STAGES, total.to_string());
        Ok((state, 0))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        ctx: &RunContext,
        index: usize,
        stage_name: &str,
        handler: &Arc<dyn AgentHandler>,
        staged_event: &Event,
        state: &State,
        policy: &StagePolicy,
    ) -> Result<AgentResult, FlowError> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = run_agent(
                &self.registry,
                ctx,
                stage_name,
                handler,
                staged_event,
                state.clone(),
                None,
                Some(index),
                policy.timeout,
            )
            .await;
            match outcome {
                Ok(result) => return Ok(result),
                Err(err) if err.is_terminal() => return Err(err),
                Err(err) => {
                    if attempt < policy.max_retries {
                        let backoff = policy
                            .retry_delay
                            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
                        log::warn!(
                            "stage {} ('{}') attempt {} failed ({}), retrying in {:?}",
                            index,
                            stage_name,
                            attempt + 1,
                            err,
                            backoff
                        );
                        attempt += 1;
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Err(FlowError::StageFailed {
                        stage_index: index,
                        stage_name: stage_name.to_string(),
                        cause: err.to_string(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl Orchestrator for SequentialOrchestrator {
    async fn dispatch(&self, ctx: &RunContext, event: Event) -> Result<AgentResult, FlowError> {
        self.stopped.ensure_running()?;
        ctx.ensure_active()?;
        if self.stages.is_empty() {
            return Err(FlowError::NoAgents);
        }

        match self.overall_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.run_pipeline(ctx, &event)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(FlowError::Timeout {
                        scope: "sequential pipeline".to_string(),
                    }),
                }
            }
            None => self.run_pipeline(ctx, &event).await,
        }
    }

    async fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), FlowError> {
        self.agents.insert(name, handler).await
    }

    async fn stop(&self) {
        self.stopped.stop();
    }
}
