//! The bounded event loop: accept emits, dequeue, dispatch, deliver.
//!
//! A [`Runner`] owns the orchestrator and the callback registry, queues
//! incoming events with bounded capacity, and spawns workers that dispatch
//! them. Around every dispatch it fires the event-level hooks —
//! `BeforeEventHandling` and `AfterEventHandling` fire exactly once per
//! emitted event — and delivers the outcome on the session's result channel
//! when one is attached.
//!
//! Events dequeue in FIFO order; with one worker (the default) they are also
//! handled in FIFO order. With multiple workers, relative ordering of events
//! with distinct session ids is unspecified.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowllm::agent::FnHandler;
//! use flowllm::callbacks::CallbackRegistry;
//! use flowllm::event::EventBuilder;
//! use flowllm::orchestrator::{Orchestrator, RouteOrchestrator};
//! use flowllm::runner::Runner;
//!
//! # async fn demo() -> Result<(), flowllm::errors::FlowError> {
//! let registry = Arc::new(CallbackRegistry::new());
//! let orchestrator = RouteOrchestrator::new(Arc::clone(&registry));
//! orchestrator
//!     .register_agent("echo", Arc::new(FnHandler::from_sync(|_e, state| {
//!         state.set("reply", serde_json::json!("hi!"));
//!         Ok(())
//!     })))
//!     .await?;
//!
//! let runner = Runner::with_registry(16, registry);
//! runner.set_orchestrator(Arc::new(orchestrator)).await;
//! let mut results = runner.subscribe_results("s1").await;
//!
//! runner.start().await?;
//! runner
//!     .emit(EventBuilder::new().route("echo").session("s1").build())
//!     .await?;
//!
//! let outcome = results.recv().await.expect("result delivered");
//! assert!(outcome.result.is_ok());
//! runner.stop().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::flowllm::agent::{AgentHandler, AgentResult};
use crate::flowllm::callbacks::{CallbackArgs, CallbackRegistry, HookPoint};
use crate::flowllm::context::RunContext;
use crate::flowllm::errors::FlowError;
use crate::flowllm::event::Event;
use crate::flowllm::orchestrator::Orchestrator;
use crate::flowllm::state::State;
use crate::flowllm::stream::StreamSink;

/// Default grace period [`Runner::stop`] waits for in-flight dispatches.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// What a result-channel subscriber receives per dispatched event.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Id of the dispatched event.
    pub event_id: String,
    /// Session the event belonged to.
    pub session_id: String,
    /// The orchestrator's result, or the event's error.
    pub result: Result<AgentResult, FlowError>,
}

struct RunnerShared {
    orchestrator: RwLock<Option<Arc<dyn Orchestrator>>>,
    registry: Arc<CallbackRegistry>,
    sink: RwLock<Option<Arc<StreamSink>>>,
    result_channels: RwLock<HashMap<String, mpsc::UnboundedSender<DispatchOutcome>>>,
}

/// The event loop.
pub struct Runner {
    shared: Arc<RunnerShared>,
    queue_tx: mpsc::Sender<Event>,
    queue_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    num_workers: usize,
    grace_period: Duration,
    blocking_emit: bool,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Runner {
    /// Create a runner with a fresh callback registry and a queue of the
    /// given capacity.
    pub fn new(queue_capacity: usize) -> Self {
        Self::with_registry(queue_capacity, Arc::new(CallbackRegistry::new()))
    }

    /// Create a runner sharing an existing callback registry — the usual
    /// shape, since orchestrators take the same registry at construction.
    pub fn with_registry(queue_capacity: usize, registry: Arc<CallbackRegistry>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            shared: Arc::new(RunnerShared {
                orchestrator: RwLock::new(None),
                registry,
                sink: RwLock::new(None),
                result_channels: RwLock::new(HashMap::new()),
            }),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            workers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            num_workers: 1,
            grace_period: DEFAULT_GRACE_PERIOD,
            blocking_emit: false,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Set the number of dispatch workers spawned by [`Runner::start`].
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    /// Override how long [`Runner::stop`] waits for in-flight dispatches.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Make [`Runner::emit`] wait for queue space instead of returning
    /// [`FlowError::QueueFull`].
    pub fn with_blocking_emit(mut self, blocking: bool) -> Self {
        self.blocking_emit = blocking;
        self
    }

    /// The callback registry this runner fires hooks through.
    pub fn callback_registry(&self) -> Arc<CallbackRegistry> {
        Arc::clone(&self.shared.registry)
    }

    /// Attach or replace the orchestrator that dispatches events.
    pub async fn set_orchestrator(&self, orchestrator: Arc<dyn Orchestrator>) {
        *self.shared.orchestrator.write().await = Some(orchestrator);
    }

    /// Attach a stream sink; dispatch contexts carry it to handlers, and the
    /// runner finishes each session's stream after its event completes.
    pub async fn set_stream_sink(&self, sink: Arc<StreamSink>) {
        *self.shared.sink.write().await = Some(sink);
    }

    /// Register a handler on the attached orchestrator.
    pub async fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), FlowError> {
        let orchestrator = self.shared.orchestrator.read().await.clone();
        match orchestrator {
            Some(orch) => orch.register_agent(name, handler).await,
            None => Err(FlowError::ExecutionFailed(
                "no orchestrator attached".to_string(),
            )),
        }
    }

    /// Register a lifecycle callback on the shared registry.
    pub async fn register_callback<F, Fut>(&self, point: HookPoint, name: &str, func: F)
    where
        F: Fn(CallbackArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<State, FlowError>> + Send + 'static,
    {
        self.shared.registry.register(point, name, func).await;
    }

    /// Attach a result channel for a session. Each dispatched event whose
    /// session matches delivers one [`DispatchOutcome`]. Re-subscribing a
    /// session replaces the previous channel.
    pub async fn subscribe_results(&self, session_id: &str) -> mpsc::UnboundedReceiver<DispatchOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .result_channels
            .write()
            .await
            .insert(session_id.to_string(), tx);
        rx
    }

    /// Enqueue an event. Non-blocking by default: a full queue fails with
    /// [`FlowError::QueueFull`]. With [`Runner::with_blocking_emit`] the call
    /// waits for space instead.
    pub async fn emit(&self, event: Event) -> Result<(), FlowError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(FlowError::OrchestratorStopped);
        }
        if self.blocking_emit {
            self.queue_tx
                .send(event)
                .await
                .map_err(|_| FlowError::OrchestratorStopped)
        } else {
            self.queue_tx.try_send(event).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => FlowError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => FlowError::OrchestratorStopped,
            })
        }
    }

    /// Spawn the dispatch workers. Idempotent errors: starting twice or
    /// starting after stop fail.
    pub async fn start(&self) -> Result<(), FlowError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(FlowError::OrchestratorStopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(FlowError::ExecutionFailed(
                "runner already started".to_string(),
            ));
        }
        let receiver = self
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| FlowError::ExecutionFailed("queue already consumed".to_string()))?;
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = self.workers.lock().await;
        for worker_id in 0..self.num_workers {
            let shared = Arc::clone(&self.shared);
            let queue = Arc::clone(&receiver);
            let cancel = self.cancel.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let next = {
                        let mut guard = queue.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            event = guard.recv() => event,
                        }
                    };
                    let Some(event) = next else { break };
                    process_event(&shared, &cancel, event).await;
                }
                log::debug!("runner worker {} exiting", worker_id);
            }));
        }
        log::info!("runner started with {} worker(s)", self.num_workers);
        Ok(())
    }

    /// Stop the runner: cancel the base context, wait up to the grace period
    /// for workers to finish their in-flight (now cancelled) dispatches, and
    /// abort any that remain. Queued events that never dispatched are
    /// dropped. Subsequent emits fail with
    /// [`FlowError::OrchestratorStopped`].
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Some(orchestrator) = self.shared.orchestrator.read().await.clone() {
            orchestrator.stop().await;
        }

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        let deadline = tokio::time::Instant::now() + self.grace_period;
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    log::warn!("runner stop exceeded grace period; aborting worker");
                    handle.abort();
                }
            }
        }
        log::info!("runner stopped");
    }
}

/// One trip through the per-event pipeline: before-hooks, dispatch,
/// after-hooks, stream finish, result delivery.
async fn process_event(shared: &Arc<RunnerShared>, cancel: &CancellationToken, event: Event) {
    let session_id = event.session_id().to_string();
    let event_id = event.id().to_string();
    let start_wall = Utc::now();
    let started = Instant::now();

    let seed = State::from_event(&event);
    let before_args = CallbackArgs::for_event(event.clone(), seed);
    let (_seed, before_err) = shared
        .registry
        .execute(HookPoint::BeforeEventHandling, before_args)
        .await;

    let result: Result<AgentResult, FlowError> = if let Some(err) = before_err {
        Err(err)
    } else {
        let orchestrator = shared.orchestrator.read().await.clone();
        match orchestrator {
            Some(orch) => {
                let mut ctx = RunContext::with_parent_token(&session_id, cancel);
                if let Some(sink) = shared.sink.read().await.clone() {
                    ctx = ctx.with_sink(sink);
                }
                orch.dispatch(&ctx, event.clone()).await
            }
            None => Err(FlowError::ExecutionFailed(
                "no orchestrator attached".to_string(),
            )),
        }
    };

    let after_state = match &result {
        Ok(agent_result) => agent_result.output_state.clone(),
        Err(_) => State::from_event(&event),
    };
    let mut after_args = CallbackArgs::for_event(event.clone(), after_state)
        .with_timing(start_wall, started.elapsed());
    match &result {
        Ok(agent_result) => after_args = after_args.with_result(agent_result.clone()),
        Err(err) => after_args = after_args.with_error(err.clone()),
    }
    let (final_state, after_err) = shared
        .registry
        .execute(HookPoint::AfterEventHandling, after_args)
        .await;

    let outcome = match (result, after_err) {
        (_, Some(hook_err)) => Err(hook_err),
        (Ok(mut agent_result), None) => {
            agent_result.output_state = final_state;
            Ok(agent_result)
        }
        (Err(err), None) => Err(err),
    };

    if let Err(err) = &outcome {
        log::error!("event {} failed: {}", event_id, err);
    }

    if let Some(sink) = shared.sink.read().await.clone() {
        sink.finish(&session_id).await;
    }

    let channels = shared.result_channels.read().await;
    if let Some(tx) = channels.get(&session_id) {
        let delivered = tx.send(DispatchOutcome {
            event_id,
            session_id: session_id.clone(),
            result: outcome,
        });
        if delivered.is_err() {
            log::debug!("result subscriber for session '{}' is gone", session_id);
        }
    }
}
