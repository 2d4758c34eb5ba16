//! Parallel fan-out: every registered handler runs on an independent state
//! clone, and the results merge deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::flowllm::agent::{AgentHandler, AgentResult};
use crate::flowllm::callbacks::{CallbackArgs, CallbackRegistry, HookPoint};
use crate::flowllm::context::RunContext;
use crate::flowllm::errors::FlowError;
use crate::flowllm::event::Event;
use crate::flowllm::orchestrator::{run_agent, HandlerMap, Orchestrator, StopFlag};
use crate::flowllm::state::State;

/// Synthesises a combined response from the successful handlers' states,
/// placed under the merged result's `response` key.
pub trait MergeReducer: Send + Sync {
    /// `ordered` holds each successful agent's output state in agent-name
    /// sort order. Return `None` to omit the `response` key.
    fn reduce(&self, ordered: &[(String, State)]) -> Option<Value>;
}

/// Default reducer: concatenates each agent's `response` string in
/// agent-name sort order, newline-separated.
pub struct ConcatReducer;

impl MergeReducer for ConcatReducer {
    fn reduce(&self, ordered: &[(String, State)]) -> Option<Value> {
        let parts: Vec<String> = ordered
            .iter()
            .filter_map(|(_, state)| state.get_str("response").map(str::to_string))
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(Value::String(parts.join("\n")))
        }
    }
}

/// Invokes every registered handler in parallel on clones of the seed state
/// and merges the results.
///
/// The merged output state contains, for each successful handler, its data
/// under namespaced keys `{agent}.{key}`, a `responses` list of per-agent
/// data objects, and `errors.{agent}` records for the handlers that failed.
/// Merging sorts by agent name first, so the output is deterministic given
/// the same set of successful handler outputs.
///
/// Partial failure does not fail the dispatch unless the success ratio falls
/// below the configured failure threshold (default 1.0 — any error fails).
/// Below the threshold the dispatch returns
/// [`FlowError::CollaborationFailed`] carrying every per-agent error; at or
/// above it the merged result carries `partial_failure=true` meta and a
/// per-agent `success_map`.
///
/// When the overall deadline fires, in-flight handlers are cancelled,
/// already-returned results are still merged, and the result carries
/// `timed_out=true`.
pub struct CollaborativeOrchestrator {
    agents: HandlerMap,
    registry: Arc<CallbackRegistry>,
    max_concurrency: Option<usize>,
    agent_timeout: Option<Duration>,
    overall_timeout: Option<Duration>,
    failure_threshold: f64,
    reducer: Arc<dyn MergeReducer>,
    stopped: StopFlag,
}

impl CollaborativeOrchestrator {
    /// Create a collaborative orchestrator sharing the given registry.
    pub fn new(registry: Arc<CallbackRegistry>) -> Self {
        Self {
            agents: HandlerMap::new(),
            registry,
            max_concurrency: None,
            agent_timeout: None,
            overall_timeout: None,
            failure_threshold: 1.0,
            reducer: Arc::new(ConcatReducer),
            stopped: StopFlag::new(),
        }
    }

    /// Cap the number of concurrently running handlers.
    pub fn with_max_concurrency(mut self, cap: usize) -> Self {
        self.max_concurrency = Some(cap.max(1));
        self
    }

    /// Set the per-handler deadline.
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = Some(timeout);
        self
    }

    /// Set the overall fan-out deadline.
    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = Some(timeout);
        self
    }

    /// Set the success-ratio floor in `0.0..=1.0`. Default 1.0.
    pub fn with_failure_threshold(mut self, threshold: f64) -> Self {
        self.failure_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Replace the post-merge synthesis reducer.
    pub fn with_reducer(mut self, reducer: Arc<dyn MergeReducer>) -> Self {
        self.reducer = reducer;
        self
    }
}

#[async_trait]
impl Orchestrator for CollaborativeOrchestrator {
    async fn dispatch(&self, ctx: &RunContext, event: Event) -> Result<AgentResult, FlowError> {
        self.stopped.ensure_running()?;
        ctx.ensure_active()?;

        // All registered agents participate, regardless of the event target.
        let handlers = self.agents.snapshot_sorted().await;
        if handlers.is_empty() {
            return Err(FlowError::NoAgents);
        }
        let total = handlers.len();
        log::debug!(
            "collaborative dispatch of event {} to {} agents",
            event.id(),
            total
        );

        let seed = State::from_event(&event);
        let start_wall = Utc::now();
        let started = Instant::now();
        let child = ctx.child();
        let shared_event = Arc::new(event.clone());
        let semaphore = self
            .max_concurrency
            .map(|cap| Arc::new(Semaphore::new(cap)));

        let mut handles = Vec::with_capacity(total);
        for (name, handler) in handlers {
            let registry = Arc::clone(&self.registry);
            let task_ctx = child.clone();
            let task_event = Arc::clone(&shared_event);
            let task_state = seed.clone();
            let task_timeout = self.agent_timeout;
            let task_sem = semaphore.clone();
            let agent = name.clone();
            let join = tokio::spawn(async move {
                let _permit = match task_sem {
                    Some(sem) => Some(
                        sem.acquire_owned()
                            .await
                            .map_err(|_| FlowError::Cancelled)?,
                    ),
                    None => None,
                };
                run_agent(
                    &registry,
                    &task_ctx,
                    &agent,
                    &handler,
                    &task_event,
                    task_state,
                    None,
                    None,
                    task_timeout,
                )
                .await
            });
            handles.push((name, join));
        }

        let deadline = self
            .overall_timeout
            .map(|limit| tokio::time::Instant::now() + limit);
        let mut timed_out = false;
        let mut outcomes: Vec<(String, Result<AgentResult, FlowError>)> =
            Vec::with_capacity(total);
        for (name, mut handle) in handles {
            let join_result = if timed_out {
                handle.await
            } else if let Some(at) = deadline {
                match tokio::time::timeout_at(at, &mut handle).await {
                    Ok(join) => join,
                    Err(_) => {
                        timed_out = true;
                        child.cancellation().cancel();
                        log::warn!(
                            "collaborative dispatch of event {} hit overall deadline; cancelling in-flight agents",
                            event.id()
                        );
                        handle.await
                    }
                }
            } else {
                handle.await
            };
            let outcome = match join_result {
                Ok(result) => result,
                Err(join_err) => Err(FlowError::ExecutionFailed(format!(
                    "task join error: {}",
                    join_err
                ))),
            };
            outcomes.push((name, outcome));
        }

        // External cancellation is terminal; a self-inflicted timeout is not.
        if ctx.is_cancelled() {
            return Err(FlowError::Cancelled);
        }

        let mut merged = State::new();
        let mut errors: HashMap<String, String> = HashMap::new();
        let mut successes: Vec<(String, State)> = Vec::new();
        let mut responses: Vec<Value> = Vec::new();
        for (name, outcome) in &outcomes {
            match outcome {
                Ok(result) => {
                    let mut data = serde_json::Map::new();
                    for (key, value) in result.output_state.iter() {
                        merged.set(format!("{}.{}", name, key), value.clone());
                        data.insert(key.clone(), value.clone());
                    }
                    responses.push(serde_json::json!({ "agent": name, "data": data }));
                    successes.push((name.clone(), result.output_state.clone()));
                }
                Err(err) => {
                    let rendered = err.to_string();
                    merged.set(format!("errors.{}", name), Value::String(rendered.clone()));
                    errors.insert(name.clone(), rendered);
                }
            }
        }

        let succeeded = successes.len();
        let ratio = succeeded as f64 / total as f64;
        if ratio < self.failure_threshold {
            return Err(FlowError::CollaborationFailed {
                errors,
                succeeded,
                total,
            });
        }

        merged.set("responses", Value::Array(responses));
        merged.set_meta("success_ratio", format!("{}/{}", succeeded, total));
        if !errors.is_empty() {
            log::warn!(
                "collaborative dispatch of event {} tolerated {} agent failures",
                event.id(),
                errors.len()
            );
            merged.set_meta("partial_failure", "true");
            let success_map: serde_json::Map<String, Value> = outcomes
                .iter()
                .map(|(name, outcome)| (name.clone(), Value::Bool(outcome.is_ok())))
                .collect();
            merged.set("success_map", Value::Object(success_map));
        }
        if timed_out {
            merged.set_meta("timed_out", "true");
        }
        if let Some(synthesis) = self.reducer.reduce(&successes) {
            merged.set("response", synthesis);
        }

        let complete_args = CallbackArgs::for_event(event.clone(), merged)
            .with_timing(start_wall, started.elapsed());
        let (merged, hook_err) = self
            .registry
            .execute(HookPoint::AllAgentsComplete, complete_args)
            .await;
        if let Some(err) = hook_err {
            return Err(err);
        }

        Ok(AgentResult::timed(merged, start_wall))
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
