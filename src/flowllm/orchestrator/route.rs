//! Direct dispatch: one event, one handler.

use std::sync::Arc;

use async_trait::async_trait;

use crate::flowllm::agent::{AgentHandler, AgentResult};
use crate::flowllm::callbacks::CallbackRegistry;
use crate::flowllm::context::RunContext;
use crate::flowllm::errors::FlowError;
use crate::flowllm::event::{meta_keys, Event};
use crate::flowllm::orchestrator::{run_agent, HandlerMap, Orchestrator, StopFlag};
use crate::flowllm::state::State;

/// Default ceiling on the event hop counter before a routing loop is
/// declared.
pub const DEFAULT_MAX_HOPS: u32 = 8;

/// Looks up the handler named by the event's `route` metadata (or, absent
/// that, its target) and invokes it with a fresh state seeded from the
/// event.
///
/// Re-emission cycles are broken by the `hops` metadata: callers increment
/// it when an agent re-emits an event, and a count past the configured
/// maximum fails with [`FlowError::RoutingLoop`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use flowllm::agent::FnHandler;
/// use flowllm::callbacks::CallbackRegistry;
/// use flowllm::context::RunContext;
/// use flowllm::event::EventBuilder;
/// use flowllm::orchestrator::{Orchestrator, RouteOrchestrator};
///
/// # async fn demo() -> Result<(), flowllm::errors::FlowError> {
/// let orchestrator = RouteOrchestrator::new(Arc::new(CallbackRegistry::new()));
/// orchestrator
///     .register_agent("echo", Arc::new(FnHandler::from_sync(|_e, state| {
///         let msg = state.get_str("msg").unwrap_or_default().to_string();
///         state.set("reply", serde_json::json!(format!("{}!", msg)));
///         Ok(())
///     })))
///     .await?;
///
/// let event = EventBuilder::new()
///     .route("echo")
///     .payload_entry("msg", serde_json::json!("hi"))
///     .session("s1")
///     .build();
/// let result = orchestrator.dispatch(&RunContext::new("s1"), event).await?;
/// assert_eq!(result.output_state.get_str("reply"), Some("hi!"));
/// # Ok(())
/// # }
/// ```
pub struct RouteOrchestrator {
    agents: HandlerMap,
    registry: Arc<CallbackRegistry>,
    max_hops: u32,
    stopped: StopFlag,
}

impl RouteOrchestrator {
    /// Create a router sharing the given callback registry.
    pub fn new(registry: Arc<CallbackRegistry>) -> Self {
        Self {
            agents: HandlerMap::new(),
            registry,
            max_hops: DEFAULT_MAX_HOPS,
            stopped: StopFlag::new(),
        }
    }

    /// Override the hop ceiling.
    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }
}

#[async_trait]
impl Orchestrator for RouteOrchestrator {
    async fn dispatch(&self, ctx: &RunContext, event: Event) -> Result<AgentResult, FlowError> {
        self.stopped.ensure_running()?;
        ctx.ensure_active()?;

        let hops = event.hops();
        if hops > self.max_hops {
            return Err(FlowError::RoutingLoop {
                hops,
                max_hops: self.max_hops,
            });
        }

        // Route metadata wins over the event target.
        let route = event
            .meta(meta_keys::ROUTE)
            .or_else(|| event.target())
            .unwrap_or_default()
            .to_string();
        let handler = match self.agents.get(&route).await {
            Some(handler) if !route.is_empty() => handler,
            _ => return Err(FlowError::NoRoute { target: route }),
        };

        let state = State::from_event(&event);
        run_agent(
            &self.registry,
            ctx,
            &route,
            &handler,
            &event,
            state,
            None,
            None,
            None,
        )
        .await
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
