//! Mixed multi-stage workflows: an ordered list of stages, each running one
//! of the other dispatch patterns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::flowllm::agent::{AgentHandler, AgentResult};
use crate::flowllm::callbacks::CallbackRegistry;
use crate::flowllm::context::RunContext;
use crate::flowllm::errors::FlowError;
use crate::flowllm::event::{meta_keys, Event};
use crate::flowllm::orchestrator::{
    CollaborativeOrchestrator, HandlerMap, LoopCondition, LoopOrchestrator, Orchestrator,
    RouteOrchestrator, SequentialOrchestrator, StopFlag,
};
use crate::flowllm::state::State;

/// Which dispatch pattern a workflow stage runs. Stages nest exactly one
/// level: a stage cannot itself be a mixed workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePattern {
    /// Direct dispatch to the stage's (single) agent.
    Route,
    /// Parallel fan-out over the stage's agents with merged results.
    Collaborative,
    /// Pipeline over the stage's agents in declaration order.
    Sequential,
    /// Bounded iteration of the stage's (single) agent.
    Loop,
}

/// One stage of a [`CompositeOrchestrator`]: a pattern, the agents it runs,
/// and the gates around it.
pub struct WorkflowStage {
    name: String,
    pattern: StagePattern,
    agents: Vec<String>,
    timeout: Option<Duration>,
    prerequisites: Vec<String>,
    success: Option<Arc<dyn Fn(&State) -> bool + Send + Sync>>,
    loop_condition: Option<LoopCondition>,
    max_iterations: usize,
}

impl WorkflowStage {
    /// Declare a stage running `pattern` over `agents`. Route and Loop
    /// patterns use the first agent.
    pub fn new(
        name: impl Into<String>,
        pattern: StagePattern,
        agents: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            pattern,
            agents,
            timeout: None,
            prerequisites: Vec::new(),
            success: None,
            loop_condition: None,
            max_iterations: 1,
        }
    }

    /// Set the stage deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Require these state keys to be present before the stage runs.
    pub fn with_prerequisites(mut self, keys: Vec<String>) -> Self {
        self.prerequisites = keys;
        self
    }

    /// Gate the stage's result on a predicate over the resulting state.
    pub fn with_success<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&State) -> bool + Send + Sync + 'static,
    {
        self.success = Some(Arc::new(predicate));
        self
    }

    /// Configure the termination predicate and iteration ceiling for a
    /// [`StagePattern::Loop`] stage.
    pub fn with_loop(mut self, condition: LoopCondition, max_iterations: usize) -> Self {
        self.loop_condition = Some(condition);
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// The stage's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Runs an ordered list of [`WorkflowStage`]s, constructing a sub-orchestrator
/// of the declared pattern per stage and flowing the accumulated state from
/// one stage into the next.
///
/// Before each stage, declared prerequisite keys are checked against the
/// accumulated state ([`FlowError::StagePrereq`] lists the missing ones).
/// After each stage, the optional success predicate gates continuation
/// ([`FlowError::StageUnsuccessful`]). Sub-orchestrators share this
/// orchestrator's callback registry and agent handlers. On success the final
/// state carries `stage_k_complete` / `stage_k_name` markers per stage and
/// `workflow_complete=true`.
pub struct CompositeOrchestrator {
    agents: HandlerMap,
    registry: Arc<CallbackRegistry>,
    stages: Vec<WorkflowStage>,
    stopped: StopFlag,
}

impl CompositeOrchestrator {
    /// Create a workflow over the given stages, sharing the registry.
    pub fn new(registry: Arc<CallbackRegistry>, stages: Vec<WorkflowStage>) -> Self {
        Self {
            agents: HandlerMap::new(),
            registry,
            stages,
            stopped: StopFlag::new(),
        }
    }

    /// Build the sub-orchestrator for one stage and register the stage's
    /// agents into it from this orchestrator's handler map.
    async fn build_stage_orchestrator(
        &self,
        stage: &WorkflowStage,
    ) -> Result<Arc<dyn Orchestrator>, FlowError> {
        if stage.agents.is_empty() {
            return Err(FlowError::ExecutionFailed(format!(
                "stage '{}' declares no agents",
                stage.name
            )));
        }

        let sub: Arc<dyn Orchestrator> = match stage.pattern {
            StagePattern::Route => {
                Arc::new(RouteOrchestrator::new(Arc::clone(&self.registry)))
            }
            StagePattern::Collaborative => {
                Arc::new(CollaborativeOrchestrator::new(Arc::clone(&self.registry)))
            }
            StagePattern::Sequential => Arc::new(SequentialOrchestrator::new(
                Arc::clone(&self.registry),
                stage.agents.clone(),
            )),
            StagePattern::Loop => {
                let condition = stage.loop_condition.clone().ok_or_else(|| {
                    FlowError::ExecutionFailed(format!(
                        "loop stage '{}' has no termination condition",
                        stage.name
                    ))
                })?;
                Arc::new(LoopOrchestrator::new(
                    Arc::clone(&self.registry),
                    stage.agents[0].clone(),
                    condition,
                    stage.max_iterations,
                ))
            }
        };

        let mut seen: Vec<&str> = Vec::new();
        for name in &stage.agents {
            if seen.contains(&name.as_str()) {
                continue;
            }
            seen.push(name);
            let handler = self
                .agents
                .get(name)
                .await
                .ok_or_else(|| FlowError::NoRoute {
                    target: name.clone(),
                })?;
            sub.register_agent(name, handler).await?;
        }
        Ok(sub)
    }

    /// Derive the event handed to a stage: the accumulated state rides in as
    /// the payload (and its meta as metadata) so the sub-orchestrator's
    /// seeded state is the workflow's threaded state.
    fn stage_event(&self, event: &Event, stage: &WorkflowStage, state: &State) -> Event {
        let payload: HashMap<String, Value> = state
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let mut derived = event.with_payload(payload);
        for (key, value) in state.iter_meta() {
            derived = derived.with_meta(key.clone(), value.clone());
        }
        derived = derived.with_meta(meta_keys::STAGE_NAME, stage.name.clone());
        if stage.pattern == StagePattern::Route {
            derived = derived.with_meta(meta_keys::ROUTE, stage.agents[0].clone());
        }
        derived
    }
}

#[async_trait]
impl Orchestrator for CompositeOrchestrator {
    async fn dispatch(&self, ctx: &RunContext, event: Event) -> Result<AgentResult, FlowError> {
        self.stopped.ensure_running()?;
        ctx.ensure_active()?;
        if self.stages.is_empty() {
            return Err(FlowError::ExecutionFailed(
                "workflow declares no stages".to_string(),
            ));
        }

        let start_wall = Utc::now();
        let mut state = State::from_event(&event);

        for (index, stage) in self.stages.iter().enumerate() {
            ctx.ensure_active()?;

            let missing: Vec<String> = stage
                .prerequisites
                .iter()
                .filter(|key| !state.has(key))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(FlowError::StagePrereq {
                    stage: stage.name.clone(),
                    missing,
                });
            }

            let sub = self.build_stage_orchestrator(stage).await?;
            let stage_event = self.stage_event(&event, stage, &state);
            let sub_ctx = ctx.child();
            log::debug!(
                "workflow stage {} ('{}') dispatching via {:?}",
                index,
                stage.name,
                stage.pattern
            );

            let result = match stage.timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, sub.dispatch(&sub_ctx, stage_event)).await {
                        Ok(outcome) => outcome?,
                        Err(_) => {
                            sub_ctx.cancellation().cancel();
                            return Err(FlowError::Timeout {
                                scope: stage.name.clone(),
                            });
                        }
                    }
                }
                None => sub.dispatch(&sub_ctx, stage_event).await?,
            };

            if let Some(predicate) = &stage.success {
                if !predicate(&result.output_state) {
                    return Err(FlowError::StageUnsuccessful {
                        stage: stage.name.clone(),
                    });
                }
            }

            state = result.output_state;
            state.set_meta(format!("stage_{}_complete", index), "true");
            state.set_meta(format!("stage_{}_name", index), stage.name.clone());
        }

        state.set_meta("workflow_complete", "true");
        Ok(AgentResult::timed(state, start_wall))
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
