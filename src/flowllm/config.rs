//! Declarative orchestration configuration.
//!
//! [`OrchestrationConfig`] mirrors the recognised configuration keys as
//! serde types, so any format with a serde deserializer can drive it; the
//! core takes `serde_json::from_str`/`from_value` as its entry point and
//! leaves file loading to outer layers. [`build_orchestrator`] constructs
//! the matching variant from a parsed config.
//!
//! # Example
//!
//! ```rust
//! use flowllm::config::OrchestrationConfig;
//!
//! let config: OrchestrationConfig = serde_json::from_str(r#"{
//!     "mode": "loop",
//!     "loop": {
//!         "agent": "refiner",
//!         "max_iterations": 5,
//!         "condition": "score >= 0.9"
//!     }
//! }"#).unwrap();
//! assert_eq!(config.mode, flowllm::config::OrchestrationMode::Loop);
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::flowllm::callbacks::CallbackRegistry;
use crate::flowllm::checkpoint::CheckpointStore;
use crate::flowllm::errors::FlowError;
use crate::flowllm::orchestrator::{
    CollaborativeOrchestrator, CompositeOrchestrator, LoopCondition, LoopOrchestrator,
    Orchestrator, RouteOrchestrator, SequentialOrchestrator, StagePattern, WorkflowStage,
};
use crate::flowllm::orchestrator::sequential::StagePolicy;

/// The five orchestration modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationMode {
    /// Direct dispatch by route metadata or target.
    Route,
    /// Parallel fan-out with merged results.
    Collaborative,
    /// Ordered pipeline.
    Sequential,
    /// Bounded iterative refinement.
    Loop,
    /// Mixed multi-stage workflow.
    Mixed,
}

/// Patterns a mixed-workflow stage may declare. Mixed itself is absent:
/// nesting stops at a single level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagePatternConfig {
    /// Direct dispatch to the stage's single agent.
    Route,
    /// Parallel fan-out over the stage's agents.
    Collaborative,
    /// Pipeline over the stage's agents.
    Sequential,
    /// Bounded iteration of the stage's single agent.
    Loop,
}

/// Options for a sequential pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SequentialSection {
    /// Ordered agent names, one per stage.
    pub agents: Vec<String>,
    /// Retries per stage after the first failed attempt.
    #[serde(default)]
    pub max_retries: u32,
    /// Base retry delay in milliseconds (doubles per attempt).
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    /// Checkpoint every `k` stages, when a store is supplied at build time.
    #[serde(default)]
    pub checkpoint_every: Option<usize>,
}

/// Options for a collaborative fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollaborativeSection {
    /// The agent set expected to participate. Dispatch invokes all
    /// registered agents; this list documents the intended membership and
    /// drives registration in outer layers.
    pub agents: Vec<String>,
}

/// Options for a refinement loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopSection {
    /// The agent to iterate.
    pub agent: String,
    /// Iteration ceiling (≥ 1).
    pub max_iterations: usize,
    /// Optional wall-clock bound in milliseconds.
    #[serde(default)]
    pub max_duration_ms: Option<u64>,
    /// Termination predicate as an `evalexpr` expression over state data.
    /// Absent means the loop always runs to its ceiling.
    #[serde(default)]
    pub condition: Option<String>,
}

/// Options for a mixed workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MixedSection {
    /// Ordered stage descriptors.
    pub stages: Vec<StageSection>,
}

/// One stage descriptor of a mixed workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageSection {
    /// Stage name; defaults to `stage_{index}`.
    #[serde(default)]
    pub name: Option<String>,
    /// The dispatch pattern for this stage.
    pub pattern: StagePatternConfig,
    /// The stage's agents.
    pub agents: Vec<String>,
    /// Per-stage deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// State keys that must be present before the stage runs.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Termination expression for `loop` stages.
    #[serde(default)]
    pub condition: Option<String>,
    /// Iteration ceiling for `loop` stages.
    #[serde(default)]
    pub max_iterations: Option<usize>,
}

/// The recognised orchestration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestrationConfig {
    /// Which dispatch strategy to build.
    pub mode: OrchestrationMode,
    /// Overall dispatch deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Concurrency cap for collaborative fan-out.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Success-ratio floor (0.0–1.0) for collaborative fan-out.
    #[serde(default)]
    pub failure_threshold: Option<f64>,
    /// Hop ceiling for routed dispatch.
    #[serde(default)]
    pub max_hops: Option<u32>,
    /// Sequential options; required when `mode` is `sequential`.
    #[serde(default)]
    pub sequential: Option<SequentialSection>,
    /// Collaborative options.
    #[serde(default)]
    pub collaborative: Option<CollaborativeSection>,
    /// Loop options; required when `mode` is `loop`.
    #[serde(default, rename = "loop")]
    pub loop_section: Option<LoopSection>,
    /// Mixed-workflow options; required when `mode` is `mixed`.
    #[serde(default)]
    pub mixed: Option<MixedSection>,
}

impl OrchestrationConfig {
    fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

fn condition_from(expr: &Option<String>) -> LoopCondition {
    match expr {
        Some(expression) => LoopCondition::expression(expression.clone()),
        // Never met: the loop runs to its iteration ceiling.
        None => LoopCondition::from_fn(|_| false),
    }
}

/// Construct the orchestrator a config describes, sharing the given
/// callback registry. Sequential checkpointing is only wired up by
/// [`build_orchestrator_with_store`], since a store cannot be expressed
/// declaratively.
pub fn build_orchestrator(
    config: &OrchestrationConfig,
    registry: Arc<CallbackRegistry>,
) -> Result<Arc<dyn Orchestrator>, FlowError> {
    build_orchestrator_with_store(config, registry, None)
}

/// [`build_orchestrator`] with an injected checkpoint store for sequential
/// pipelines that declare `checkpoint_every`.
pub fn build_orchestrator_with_store(
    config: &OrchestrationConfig,
    registry: Arc<CallbackRegistry>,
    store: Option<Arc<dyn CheckpointStore>>,
) -> Result<Arc<dyn Orchestrator>, FlowError> {
    match config.mode {
        OrchestrationMode::Route => {
            let mut orchestrator = RouteOrchestrator::new(registry);
            if let Some(max_hops) = config.max_hops {
                orchestrator = orchestrator.with_max_hops(max_hops);
            }
            Ok(Arc::new(orchestrator))
        }
        OrchestrationMode::Collaborative => {
            let mut orchestrator = CollaborativeOrchestrator::new(registry);
            if let Some(cap) = config.max_concurrency {
                orchestrator = orchestrator.with_max_concurrency(cap);
            }
            if let Some(threshold) = config.failure_threshold {
                orchestrator = orchestrator.with_failure_threshold(threshold);
            }
            if let Some(timeout) = config.timeout() {
                orchestrator = orchestrator.with_overall_timeout(timeout);
            }
            Ok(Arc::new(orchestrator))
        }
        OrchestrationMode::Sequential => {
            let section = config.sequential.as_ref().ok_or_else(|| {
                FlowError::ExecutionFailed("sequential mode needs a 'sequential' section".into())
            })?;
            let mut orchestrator =
                SequentialOrchestrator::new(registry, section.agents.clone());
            if section.max_retries > 0 {
                let mut policy = StagePolicy {
                    max_retries: section.max_retries,
                    ..StagePolicy::default()
                };
                if let Some(delay) = section.retry_delay_ms {
                    policy.retry_delay = Duration::from_millis(delay);
                }
                orchestrator = orchestrator.with_default_policy(policy);
            }
            if let Some(timeout) = config.timeout() {
                orchestrator = orchestrator.with_overall_timeout(timeout);
            }
            if let (Some(every), Some(store)) = (section.checkpoint_every, store) {
                orchestrator = orchestrator.with_checkpointing(store, every);
            }
            Ok(Arc::new(orchestrator))
        }
        OrchestrationMode::Loop => {
            let section = config.loop_section.as_ref().ok_or_else(|| {
                FlowError::ExecutionFailed("loop mode needs a 'loop' section".into())
            })?;
            if section.max_iterations == 0 {
                return Err(FlowError::ExecutionFailed(
                    "loop.max_iterations must be at least 1".into(),
                ));
            }
            let mut orchestrator = LoopOrchestrator::new(
                registry,
                section.agent.clone(),
                condition_from(&section.condition),
                section.max_iterations,
            );
            if let Some(limit) = section.max_duration_ms {
                orchestrator = orchestrator.with_max_duration(Duration::from_millis(limit));
            }
            Ok(Arc::new(orchestrator))
        }
        OrchestrationMode::Mixed => {
            let section = config.mixed.as_ref().ok_or_else(|| {
                FlowError::ExecutionFailed("mixed mode needs a 'mixed' section".into())
            })?;
            let mut stages = Vec::with_capacity(section.stages.len());
            for (index, descriptor) in section.stages.iter().enumerate() {
                let name = descriptor
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("stage_{}", index));
                let pattern = match descriptor.pattern {
                    StagePatternConfig::Route => StagePattern::Route,
                    StagePatternConfig::Collaborative => StagePattern::Collaborative,
                    StagePatternConfig::Sequential => StagePattern::Sequential,
                    StagePatternConfig::Loop => StagePattern::Loop,
                };
                let mut stage = WorkflowStage::new(name, pattern, descriptor.agents.clone())
                    .with_prerequisites(descriptor.prerequisites.clone());
                if let Some(timeout) = descriptor.timeout_ms {
                    stage = stage.with_timeout(Duration::from_millis(timeout));
                }
                if pattern == StagePattern::Loop {
                    stage = stage.with_loop(
                        condition_from(&descriptor.condition),
                        descriptor.max_iterations.unwrap_or(1),
                    );
                }
                stages.push(stage);
            }
            Ok(Arc::new(CompositeOrchestrator::new(registry, stages)))
        }
    }
}
