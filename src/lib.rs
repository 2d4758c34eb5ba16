// src/lib.rs

// Import the top-level `flowllm` module.
pub mod flowllm;

// Re-exporting key items for easier external access, so callers can write
// flowllm::Runner and flowllm::EventBuilder without walking the hierarchy.
pub use crate::flowllm::agent::{Agent, AgentHandler, AgentLifecycle, AgentResult, FnHandler};
pub use crate::flowllm::callbacks::{CallbackArgs, CallbackRegistry, HookPoint};
pub use crate::flowllm::checkpoint::{
    Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
};
pub use crate::flowllm::config::{
    build_orchestrator, build_orchestrator_with_store, OrchestrationConfig,
};
pub use crate::flowllm::context::RunContext;
pub use crate::flowllm::errors::{FlowError, FlowErrorKind};
pub use crate::flowllm::event::{Event, EventBuilder};
pub use crate::flowllm::memory::{Memory, MemoryMessage, NoopMemory};
pub use crate::flowllm::orchestrator::{
    CollaborativeOrchestrator, CompositeOrchestrator, LoopCondition, LoopOrchestrator,
    Orchestrator, RouteOrchestrator, SequentialOrchestrator, StagePattern, StagePolicy,
    WorkflowStage,
};
pub use crate::flowllm::provider::{LLMProvider, ProviderResponse};
pub use crate::flowllm::runner::{DispatchOutcome, Runner};
pub use crate::flowllm::state::{MergePolicy, State, StateError};
pub use crate::flowllm::stream::{
    BackpressurePolicy, StreamChunk, StreamCompletion, StreamItem, StreamSink, UsageTotals,
};

// Keep the module paths used in documentation examples stable.
pub use crate::flowllm::{
    agent, callbacks, checkpoint, config, context, errors, event, memory, orchestrator, provider,
    runner, state, stream,
};
