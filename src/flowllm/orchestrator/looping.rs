//! Bounded iterative refinement: one agent, run until a predicate holds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use evalexpr::ContextWithMutableVariables;
use serde_json::Value;

use crate::flowllm::agent::{AgentHandler, AgentResult};
use crate::flowllm::callbacks::CallbackRegistry;
use crate::flowllm::context::RunContext;
use crate::flowllm::errors::FlowError;
use crate::flowllm::event::{meta_keys, Event};
use crate::flowllm::orchestrator::{run_agent, HandlerMap, Orchestrator, StopFlag};
use crate::flowllm::state::State;

/// Termination predicate for a [`LoopOrchestrator`].
///
/// Either a closure over the working state, or an `evalexpr` expression
/// evaluated against a context populated from the state's scalar data values
/// — the form declarative configuration uses. An expression that fails to
/// evaluate (unknown variable, type error) counts as *not met*, so the loop
/// proceeds to its iteration ceiling rather than terminating spuriously.
///
/// # Example
///
/// ```rust
/// use flowllm::orchestrator::LoopCondition;
/// use flowllm::state::State;
///
/// let mut state = State::new();
/// state.set("n", serde_json::json!(3));
///
/// assert!(LoopCondition::expression("n >= 3").evaluate(&state));
/// assert!(!LoopCondition::expression("n >= 100").evaluate(&state));
/// assert!(LoopCondition::from_fn(|s: &State| s.get_i64("n") == Some(3)).evaluate(&state));
/// ```
#[derive(Clone)]
pub struct LoopCondition {
    kind: ConditionKind,
}

#[derive(Clone)]
enum ConditionKind {
    Closure(Arc<dyn Fn(&State) -> bool + Send + Sync>),
    Expression(String),
}

impl LoopCondition {
    /// Wrap a closure predicate. Stateful convergence checks (retaining
    /// prior scores) can capture interior-mutable storage.
    pub fn from_fn<F>(predicate: F) -> Self
    where
        F: Fn(&State) -> bool + Send + Sync + 'static,
    {
        Self {
            kind: ConditionKind::Closure(Arc::new(predicate)),
        }
    }

    /// Wrap an `evalexpr` boolean expression over the state's scalar data
    /// values, e.g. `"n >= 3"` or `"score > 0.9 && done"`.
    pub fn expression(expr: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Expression(expr.into()),
        }
    }

    /// Evaluate the predicate against a state.
    pub fn evaluate(&self, state: &State) -> bool {
        match &self.kind {
            ConditionKind::Closure(predicate) => predicate(state),
            ConditionKind::Expression(expr) => {
                let mut context: evalexpr::HashMapContext = evalexpr::HashMapContext::new();
                for (key, value) in state.iter() {
                    let mapped = match value {
                        Value::Bool(b) => evalexpr::Value::Boolean(*b),
                        Value::String(s) => evalexpr::Value::String(s.clone()),
                        Value::Number(n) => {
                            if let Some(i) = n.as_i64() {
                                evalexpr::Value::Int(i)
                            } else if let Some(f) = n.as_f64() {
                                evalexpr::Value::Float(f)
                            } else {
                                continue;
                            }
                        }
                        _ => continue,
                    };
                    let _ = context.set_value(key.clone(), mapped);
                }
                match evalexpr::eval_with_context(expr, &context) {
                    Ok(evalexpr::Value::Boolean(met)) => met,
                    Ok(other) => {
                        log::warn!(
                            "loop condition '{}' evaluated to non-boolean {:?}",
                            expr,
                            other
                        );
                        false
                    }
                    Err(err) => {
                        log::warn!("loop condition '{}' failed to evaluate: {}", expr, err);
                        false
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for LoopCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConditionKind::Closure(_) => f.write_str("LoopCondition::Closure"),
            ConditionKind::Expression(expr) => write!(f, "LoopCondition::Expression({})", expr),
        }
    }
}

/// Invokes a single agent repeatedly, threading the state between
/// iterations, until the condition holds or a bound is hit.
///
/// The predicate guards iterations 2..N: it is evaluated after each
/// iteration completes, never before the first, so the agent always runs at
/// least once. Each iteration sees `loop_iteration` (1-based) and
/// `max_iterations` metadata. The final state records how the loop ended:
/// `loop_completed=true`, `condition_met`, `max_iterations_reached`,
/// `total_iterations`, and — when a wall-clock bound is set —
/// `time_limit_reached`.
pub struct LoopOrchestrator {
    agents: HandlerMap,
    registry: Arc<CallbackRegistry>,
    agent: String,
    condition: LoopCondition,
    max_iterations: usize,
    max_duration: Option<Duration>,
    stopped: StopFlag,
}

impl LoopOrchestrator {
    /// Create a loop over `agent` with the given termination predicate and
    /// iteration ceiling (clamped to at least 1).
    pub fn new(
        registry: Arc<CallbackRegistry>,
        agent: impl Into<String>,
        condition: LoopCondition,
        max_iterations: usize,
    ) -> Self {
        Self {
            agents: HandlerMap::new(),
            registry,
            agent: agent.into(),
            condition,
            max_iterations: max_iterations.max(1),
            max_duration: None,
            stopped: StopFlag::new(),
        }
    }

    /// Also terminate once elapsed time since dispatch exceeds `limit`.
    pub fn with_max_duration(mut self, limit: Duration) -> Self {
        self.max_duration = Some(limit);
        self
    }
}

#[async_trait]
impl Orchestrator for LoopOrchestrator {
    async fn dispatch(&self, ctx: &RunContext, event: Event) -> Result<AgentResult, FlowError> {
        self.stopped.ensure_running()?;
        ctx.ensure_active()?;
        let handler = self
            .agents
            .get(&self.agent)
            .await
            .ok_or_else(|| FlowError::NoRoute {
                target: self.agent.clone(),
            })?;

        let start_wall = Utc::now();
        let started = Instant::now();
        let mut state = State::from_event(&event);
        state.set_meta(meta_keys::MAX_ITERATIONS, self.max_iterations.to_string());

        let mut iterations = 0usize;
        let mut condition_met = false;
        let mut time_limited = false;
        loop {
            ctx.ensure_active()?;
            iterations += 1;
            let iter_event = event
                .with_meta(meta_keys::LOOP_ITERATION, iterations.to_string())
                .with_meta(meta_keys::MAX_ITERATIONS, self.max_iterations.to_string());
            state.set_meta(meta_keys::LOOP_ITERATION, iterations.to_string());

            let result = run_agent(
                &self.registry,
                ctx,
                &self.agent,
                &handler,
                &iter_event,
                state,
                Some(iterations),
                None,
                None,
            )
            .await?;
            state = result.output_state;

            if self.condition.evaluate(&state) {
                condition_met = true;
                break;
            }
            if iterations >= self.max_iterations {
                break;
            }
            if let Some(limit) = self.max_duration {
                if started.elapsed() >= limit {
                    time_limited = true;
                    break;
                }
            }
        }

        log::debug!(
            "loop over '{}' finished after {} iterations (condition_met={})",
            self.agent,
            iterations,
            condition_met
        );
        state.set_meta("loop_completed", "true");
        state.set_meta("condition_met", condition_met.to_string());
        state.set_meta(
            "max_iterations_reached",
            (!condition_met && !time_limited && iterations >= self.max_iterations).to_string(),
        );
        state.set_meta("total_iterations", iterations.to_string());
        if self.max_duration.is_some() {
            state.set_meta("time_limit_reached", time_limited.to_string());
        }

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
