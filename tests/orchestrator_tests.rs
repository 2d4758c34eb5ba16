use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex as TokioMutex;

use flowllm::agent::{Agent, AgentResult, FnHandler};
use flowllm::callbacks::{CallbackRegistry, HookPoint};
use flowllm::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use flowllm::context::RunContext;
use flowllm::errors::{FlowError, FlowErrorKind};
use flowllm::event::{meta_keys, EventBuilder};
use flowllm::orchestrator::{
    CollaborativeOrchestrator, CompositeOrchestrator, LoopCondition, LoopOrchestrator,
    Orchestrator, RouteOrchestrator, SequentialOrchestrator, StagePattern, StagePolicy,
    WorkflowStage,
};
use flowllm::state::State;

fn registry() -> Arc<CallbackRegistry> {
    Arc::new(CallbackRegistry::new())
}

fn ctx() -> RunContext {
    RunContext::new("s1")
}

#[tokio::test]
async fn route_dispatches_to_named_handler() {
    let orchestrator = RouteOrchestrator::new(registry());
    orchestrator
        .register_agent(
            "echo",
            Arc::new(FnHandler::from_sync(|_event, state| {
                let msg = state.get_str("msg").unwrap_or_default().to_string();
                state.set("reply", json!(format!("{}!", msg)));
                Ok(())
            })),
        )
        .await
        .unwrap();

    let event = EventBuilder::new()
        .payload_entry("msg", json!("hi"))
        .route("echo")
        .session("s1")
        .build();
    let result = orchestrator.dispatch(&ctx(), event).await.unwrap();
    assert_eq!(result.output_state.get_str("reply"), Some("hi!"));
}

#[tokio::test]
async fn route_metadata_takes_precedence_over_target() {
    let orchestrator = RouteOrchestrator::new(registry());
    orchestrator
        .register_agent(
            "preferred",
            Arc::new(FnHandler::from_sync(|_e, state| {
                state.set("who", json!("preferred"));
                Ok(())
            })),
        )
        .await
        .unwrap();
    orchestrator
        .register_agent(
            "fallback",
            Arc::new(FnHandler::from_sync(|_e, state| {
                state.set("who", json!("fallback"));
                Ok(())
            })),
        )
        .await
        .unwrap();

    let event = EventBuilder::new()
        .target("fallback")
        .route("preferred")
        .build();
    let result = orchestrator.dispatch(&ctx(), event).await.unwrap();
    assert_eq!(result.output_state.get_str("who"), Some("preferred"));
}

#[tokio::test]
async fn route_without_handler_is_no_route() {
    let orchestrator = RouteOrchestrator::new(registry());
    let event = EventBuilder::new().target("missing").build();
    let err = orchestrator.dispatch(&ctx(), event).await.unwrap_err();
    assert_eq!(err.kind(), FlowErrorKind::NoRoute);
}

#[tokio::test]
async fn route_detects_routing_loops() {
    let orchestrator = RouteOrchestrator::new(registry());
    orchestrator
        .register_agent("echo", Arc::new(FnHandler::from_sync(|_e, _s| Ok(()))))
        .await
        .unwrap();

    let event = EventBuilder::new()
        .route("echo")
        .metadata_entry(meta_keys::HOPS, "9")
        .build();
    let err = orchestrator.dispatch(&ctx(), event).await.unwrap_err();
    assert_eq!(
        err,
        FlowError::RoutingLoop {
            hops: 9,
            max_hops: 8
        }
    );
}

#[tokio::test]
async fn route_rejects_dispatch_after_stop() {
    let orchestrator = RouteOrchestrator::new(registry());
    orchestrator.stop().await;
    let event = EventBuilder::new().target("echo").build();
    let err = orchestrator.dispatch(&ctx(), event).await.unwrap_err();
    assert_eq!(err, FlowError::OrchestratorStopped);
}

#[tokio::test]
async fn route_agent_failure_fires_agent_error_hook() {
    let hooks = registry();
    let seen = Arc::new(TokioMutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    hooks
        .register(HookPoint::AgentError, "collect", move |args| {
            let seen = Arc::clone(&seen_clone);
            async move {
                if let Some(err) = &args.error {
                    seen.lock().await.push(err.clone());
                }
                Ok(args.state)
            }
        })
        .await;

    let orchestrator = RouteOrchestrator::new(hooks);
    orchestrator
        .register_agent(
            "broken",
            Arc::new(FnHandler::from_sync(|_e, _s| {
                Err(FlowError::ExecutionFailed("boom".into()))
            })),
        )
        .await
        .unwrap();

    let event = EventBuilder::new().target("broken").build();
    let err = orchestrator.dispatch(&ctx(), event).await.unwrap_err();
    assert_eq!(err.kind(), FlowErrorKind::AgentFailed);

    let observed = seen.lock().await;
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0], err);
}

// ── Sequential ───────────────────────────────────────────────────────────

#[tokio::test]
async fn sequential_threads_state_through_stages_in_order() {
    let hooks = registry();
    let order = Arc::new(TokioMutex::new(Vec::new()));
    let order_clone = Arc::clone(&order);
    hooks
        .register(HookPoint::BeforeAgentRun, "order-log", move |args| {
            let order = Arc::clone(&order_clone);
            async move {
                order.lock().await.push(args.agent_id.clone());
                Ok(args.state)
            }
        })
        .await;

    let orchestrator = SequentialOrchestrator::new(
        hooks,
        vec!["a".to_string(), "b".to_string(), "c".to_string()],
    );
    orchestrator
        .register_agent(
            "a",
            Arc::new(FnHandler::from_sync(|_e, state| {
                state.set("x", json!(1));
                Ok(())
            })),
        )
        .await
        .unwrap();
    orchestrator
        .register_agent(
            "b",
            Arc::new(FnHandler::from_sync(|_e, state| {
                let x = state.get_i64("x").unwrap_or(0);
                state.set("y", json!(x * 2));
                Ok(())
            })),
        )
        .await
        .unwrap();
    orchestrator
        .register_agent(
            "c",
            Arc::new(FnHandler::from_sync(|_e, state| {
                let y = state.get_i64("y").unwrap_or(0);
                state.set("z", json!(y + 3));
                Ok(())
            })),
        )
        .await
        .unwrap();

    let event = EventBuilder::new().session("s1").build();
    let result = orchestrator.dispatch(&ctx(), event).await.unwrap();
    let state = &result.output_state;
    assert_eq!(state.get_i64("x"), Some(1));
    assert_eq!(state.get_i64("y"), Some(2));
    assert_eq!(state.get_i64("z"), Some(5));
    assert_eq!(state.get_meta(meta_keys::TOTAL_STAGES), Some("3"));
    assert_eq!(*order.lock().await, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn sequential_stage_sees_stage_metadata_on_event() {
    let orchestrator = SequentialOrchestrator::new(registry(), vec!["only".to_string()]);
    orchestrator
        .register_agent(
            "only",
            Arc::new(FnHandler::from_sync(|event, state| {
                state.set(
                    "observed",
                    json!({
                        "stage_name": event.meta(meta_keys::STAGE_NAME),
                        "stage_index": event.meta(meta_keys::STAGE_INDEX),
                        "total_stages": event.meta(meta_keys::TOTAL_STAGES),
                    }),
                );
                Ok(())
            })),
        )
        .await
        .unwrap();

    let result = orchestrator
        .dispatch(&ctx(), EventBuilder::new().build())
        .await
        .unwrap();
    let observed = result.output_state.get("observed").unwrap();
    assert_eq!(observed["stage_name"], "only");
    assert_eq!(observed["stage_index"], "0");
    assert_eq!(observed["total_stages"], "1");
}

#[tokio::test]
async fn sequential_first_error_aborts_pipeline() {
    let orchestrator = SequentialOrchestrator::new(
        registry(),
        vec!["ok".to_string(), "bad".to_string(), "never".to_string()],
    );
    let reached = Arc::new(AtomicBool::new(false));
    let reached_clone = Arc::clone(&reached);
    orchestrator
        .register_agent("ok", Arc::new(FnHandler::from_sync(|_e, _s| Ok(()))))
        .await
        .unwrap();
    orchestrator
        .register_agent(
            "bad",
            Arc::new(FnHandler::from_sync(|_e, _s| {
                Err(FlowError::ExecutionFailed("stage blew up".into()))
            })),
        )
        .await
        .unwrap();
    orchestrator
        .register_agent(
            "never",
            Arc::new(FnHandler::from_sync(move |_e, _s| {
                reached_clone.store(true, Ordering::SeqCst);
                Ok(())
            })),
        )
        .await
        .unwrap();

    let err = orchestrator
        .dispatch(&ctx(), EventBuilder::new().build())
        .await
        .unwrap_err();
    match err {
        FlowError::StageFailed {
            stage_index,
            stage_name,
            cause,
        } => {
            assert_eq!(stage_index, 1);
            assert_eq!(stage_name, "bad");
            assert!(cause.contains("stage blew up"));
        }
        other => panic!("expected StageFailed, got {:?}", other),
    }
    assert!(!reached.load(Ordering::SeqCst));
}

#[tokio::test]
async fn sequential_retries_flaky_stage() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = Arc::clone(&attempts);

    let orchestrator = SequentialOrchestrator::new(registry(), vec!["flaky".to_string()])
        .with_stage_policy(
            "flaky",
            StagePolicy {
                max_retries: 3,
                retry_delay: Duration::from_millis(1),
                timeout: None,
            },
        );
    orchestrator
        .register_agent(
            "flaky",
            Arc::new(FnHandler::from_sync(move |_e, state| {
                let attempt = attempts_clone.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(FlowError::ExecutionFailed("transient".into()))
                } else {
                    state.set("done", json!(true));
                    Ok(())
                }
            })),
        )
        .await
        .unwrap();

    let result = orchestrator
        .dispatch(&ctx(), EventBuilder::new().build())
        .await
        .unwrap();
    assert_eq!(result.output_state.get_bool("done"), Some(true));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn sequential_checkpoint_resume_skips_completed_stages() {
    let store: Arc<InMemoryCheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let a_runs = Arc::new(AtomicUsize::new(0));
    let b_should_fail = Arc::new(AtomicBool::new(true));

    let build = |store: Arc<InMemoryCheckpointStore>,
                 a_runs: Arc<AtomicUsize>,
                 b_should_fail: Arc<AtomicBool>| async move {
        let orchestrator = SequentialOrchestrator::new(
            registry(),
            vec!["a".to_string(), "b".to_string()],
        )
        .with_checkpointing(store, 1);
        orchestrator
            .register_agent(
                "a",
                Arc::new(FnHandler::from_sync(move |_e, state| {
                    a_runs.fetch_add(1, Ordering::SeqCst);
                    state.set("a_done", json!(true));
                    Ok(())
                })),
            )
            .await
            .unwrap();
        orchestrator
            .register_agent(
                "b",
                Arc::new(FnHandler::from_sync(move |_e, state| {
                    if b_should_fail.load(Ordering::SeqCst) {
                        Err(FlowError::ExecutionFailed("not yet".into()))
                    } else {
                        state.set("b_done", json!(true));
                        Ok(())
                    }
                })),
            )
            .await
            .unwrap();
        orchestrator
    };

    let event = EventBuilder::new()
        .metadata_entry(meta_keys::PIPELINE_ID, "p1")
        .build();

    let orchestrator = build(
        Arc::clone(&store),
        Arc::clone(&a_runs),
        Arc::clone(&b_should_fail),
    )
    .await;
    let err = orchestrator.dispatch(&ctx(), event.clone()).await.unwrap_err();
    assert_eq!(err.kind(), FlowErrorKind::StageFailed);

    // Stage "a" completed, so a checkpoint at stage index 1 exists.
    let saved = store.load("p1").await.unwrap().unwrap();
    assert_eq!(saved.stage_index, 1);
    assert_eq!(saved.state.get_bool("a_done"), Some(true));

    // Second dispatch resumes past "a" and succeeds.
    b_should_fail.store(false, Ordering::SeqCst);
    let orchestrator = build(
        Arc::clone(&store),
        Arc::clone(&a_runs),
        Arc::clone(&b_should_fail),
    )
    .await;
    let result = orchestrator.dispatch(&ctx(), event).await.unwrap();
    assert_eq!(result.output_state.get_bool("a_done"), Some(true));
    assert_eq!(result.output_state.get_bool("b_done"), Some(true));
    assert_eq!(a_runs.load(Ordering::SeqCst), 1);

    // Success deletes the checkpoint.
    assert!(store.load("p1").await.unwrap().is_none());
}

// ── Collaborative ────────────────────────────────────────────────────────

#[tokio::test]
async fn collaborative_merges_partial_failure_above_threshold() {
    let orchestrator = CollaborativeOrchestrator::new(registry()).with_failure_threshold(0.5);
    orchestrator
        .register_agent(
            "p",
            Arc::new(FnHandler::from_sync(|_e, state| {
                state.set("p_out", json!("P"));
                Ok(())
            })),
        )
        .await
        .unwrap();
    orchestrator
        .register_agent(
            "q",
            Arc::new(FnHandler::from_sync(|_e, _s| {
                Err(FlowError::ExecutionFailed("boom".into()))
            })),
        )
        .await
        .unwrap();
    orchestrator
        .register_agent(
            "r",
            Arc::new(FnHandler::from_sync(|_e, state| {
                state.set("r_out", json!("R"));
                Ok(())
            })),
        )
        .await
        .unwrap();

    let event = EventBuilder::new().session("s1").build();
    let result = orchestrator.dispatch(&ctx(), event).await.unwrap();
    let state = &result.output_state;

    assert_eq!(state.get("p.p_out"), Some(&json!("P")));
    assert_eq!(state.get("r.r_out"), Some(&json!("R")));
    assert!(state
        .get_str("errors.q")
        .map(|e| e.contains("boom"))
        .unwrap_or(false));
    assert_eq!(state.get_meta("partial_failure"), Some("true"));
    assert_eq!(state.get_meta("success_ratio"), Some("2/3"));
    let success_map = state.get("success_map").unwrap();
    assert_eq!(success_map["p"], json!(true));
    assert_eq!(success_map["q"], json!(false));
    assert_eq!(success_map["r"], json!(true));
}

#[tokio::test]
async fn collaborative_all_failures_carry_every_error() {
    let orchestrator = CollaborativeOrchestrator::new(registry());
    for name in ["one", "two"] {
        orchestrator
            .register_agent(
                name,
                Arc::new(FnHandler::from_sync(move |_e, _s| {
                    Err(FlowError::ExecutionFailed(format!("{} failed", name)))
                })),
            )
            .await
            .unwrap();
    }

    let err = orchestrator
        .dispatch(&ctx(), EventBuilder::new().build())
        .await
        .unwrap_err();
    match err {
        FlowError::CollaborationFailed {
            errors,
            succeeded,
            total,
        } => {
            assert_eq!(succeeded, 0);
            assert_eq!(total, 2);
            assert!(errors["one"].contains("one failed"));
            assert!(errors["two"].contains("two failed"));
        }
        other => panic!("expected CollaborationFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn collaborative_single_failure_fails_at_default_threshold() {
    let orchestrator = CollaborativeOrchestrator::new(registry());
    orchestrator
        .register_agent(
            "good",
            Arc::new(FnHandler::from_sync(|_e, state| {
                state.set("ok", json!(true));
                Ok(())
            })),
        )
        .await
        .unwrap();
    orchestrator
        .register_agent(
            "bad",
            Arc::new(FnHandler::from_sync(|_e, _s| {
                Err(FlowError::ExecutionFailed("nope".into()))
            })),
        )
        .await
        .unwrap();

    let err = orchestrator
        .dispatch(&ctx(), EventBuilder::new().build())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FlowErrorKind::CollaborationFailed);
}

#[tokio::test]
async fn collaborative_clones_are_isolated() {
    // Each handler writes its own key and must not see its sibling's write.
    let orchestrator = CollaborativeOrchestrator::new(registry());
    orchestrator
        .register_agent(
            "left",
            Arc::new(FnHandler::from_sync(|_e, state| {
                assert!(!state.has("right_key"));
                state.set("left_key", json!("L"));
                Ok(())
            })),
        )
        .await
        .unwrap();
    orchestrator
        .register_agent(
            "right",
            Arc::new(FnHandler::from_sync(|_e, state| {
                assert!(!state.has("left_key"));
                state.set("right_key", json!("R"));
                Ok(())
            })),
        )
        .await
        .unwrap();

    let result = orchestrator
        .dispatch(&ctx(), EventBuilder::new().build())
        .await
        .unwrap();
    let state = &result.output_state;
    assert_eq!(state.get("left.left_key"), Some(&json!("L")));
    assert_eq!(state.get("right.right_key"), Some(&json!("R")));
    // No un-namespaced leakage between clones.
    assert!(!state.has("left_key"));
    assert!(!state.has("right_key"));
}

#[tokio::test]
async fn collaborative_responses_list_is_sorted_by_agent_name() {
    let orchestrator = CollaborativeOrchestrator::new(registry());
    for name in ["zeta", "alpha", "midway"] {
        orchestrator
            .register_agent(
                name,
                Arc::new(FnHandler::from_sync(move |_e, state| {
                    state.set("response", json!(name));
                    Ok(())
                })),
            )
            .await
            .unwrap();
    }

    let result = orchestrator
        .dispatch(&ctx(), EventBuilder::new().build())
        .await
        .unwrap();
    let responses = result.output_state.get("responses").unwrap();
    let order: Vec<&str> = responses
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["agent"].as_str().unwrap())
        .collect();
    assert_eq!(order, vec!["alpha", "midway", "zeta"]);

    // Default reducer concatenates in the same order.
    assert_eq!(
        result.output_state.get_str("response"),
        Some("alpha\nmidway\nzeta")
    );
}

#[tokio::test]
async fn collaborative_overall_timeout_merges_finished_results() {
    let orchestrator = CollaborativeOrchestrator::new(registry())
        .with_overall_timeout(Duration::from_millis(100))
        .with_failure_threshold(0.5);
    orchestrator
        .register_agent(
            "fast",
            Arc::new(FnHandler::from_sync(|_e, state| {
                state.set("fast_done", json!(true));
                Ok(())
            })),
        )
        .await
        .unwrap();
    orchestrator
        .register_agent(
            "slow",
            Arc::new(FnHandler::new(|ctx: RunContext, _event, state| async move {
                tokio::select! {
                    _ = ctx.cancellation().cancelled() => Err(FlowError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {
                        Ok(AgentResult::from_state(state))
                    }
                }
            })),
        )
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let result = orchestrator
        .dispatch(&ctx(), EventBuilder::new().build())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let state = &result.output_state;
    assert_eq!(state.get("fast.fast_done"), Some(&json!(true)));
    assert_eq!(state.get_meta("timed_out"), Some("true"));
    assert!(state.has("errors.slow"));
}

#[tokio::test]
async fn collaborative_agent_timeout_is_attributed() {
    let orchestrator = CollaborativeOrchestrator::new(registry())
        .with_agent_timeout(Duration::from_millis(50));
    orchestrator
        .register_agent(
            "stuck",
            Arc::new(FnHandler::new(|_ctx, _event, state| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(AgentResult::from_state(state))
            })),
        )
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let err = orchestrator
        .dispatch(&ctx(), EventBuilder::new().build())
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    match err {
        FlowError::CollaborationFailed { errors, .. } => {
            assert!(errors["stuck"].contains("deadline"));
        }
        other => panic!("expected CollaborationFailed, got {:?}", other),
    }
}

// ── Loop ─────────────────────────────────────────────────────────────────

fn incr_handler(invocations: Arc<AtomicUsize>) -> Arc<FnHandler> {
    Arc::new(FnHandler::from_sync(move |_e, state| {
        invocations.fetch_add(1, Ordering::SeqCst);
        let n = state.get_i64("n").unwrap_or(0);
        state.set("n", json!(n + 1));
        Ok(())
    }))
}

#[tokio::test]
async fn loop_stops_when_condition_met() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let orchestrator = LoopOrchestrator::new(
        registry(),
        "incr",
        LoopCondition::expression("n >= 3"),
        10,
    );
    orchestrator
        .register_agent("incr", incr_handler(Arc::clone(&invocations)))
        .await
        .unwrap();

    let event = EventBuilder::new().payload_entry("n", json!(0)).build();
    let result = orchestrator.dispatch(&ctx(), event).await.unwrap();
    let state = &result.output_state;

    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(state.get_i64("n"), Some(3));
    assert_eq!(state.get_meta("loop_completed"), Some("true"));
    assert_eq!(state.get_meta("condition_met"), Some("true"));
    assert_eq!(state.get_meta("total_iterations"), Some("3"));
    assert_eq!(state.get_meta("max_iterations_reached"), Some("false"));
}

#[tokio::test]
async fn loop_hits_iteration_ceiling() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let orchestrator = LoopOrchestrator::new(
        registry(),
        "incr",
        LoopCondition::expression("n >= 100"),
        5,
    );
    orchestrator
        .register_agent("incr", incr_handler(Arc::clone(&invocations)))
        .await
        .unwrap();

    let event = EventBuilder::new().payload_entry("n", json!(0)).build();
    let result = orchestrator.dispatch(&ctx(), event).await.unwrap();
    let state = &result.output_state;

    assert_eq!(invocations.load(Ordering::SeqCst), 5);
    assert_eq!(state.get_i64("n"), Some(5));
    assert_eq!(state.get_meta("condition_met"), Some("false"));
    assert_eq!(state.get_meta("max_iterations_reached"), Some("true"));
    assert_eq!(state.get_meta("total_iterations"), Some("5"));
}

#[tokio::test]
async fn loop_runs_at_least_once_even_when_condition_already_holds() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let orchestrator =
        LoopOrchestrator::new(registry(), "incr", LoopCondition::expression("n >= 0"), 10);
    orchestrator
        .register_agent("incr", incr_handler(Arc::clone(&invocations)))
        .await
        .unwrap();

    let event = EventBuilder::new().payload_entry("n", json!(0)).build();
    let result = orchestrator.dispatch(&ctx(), event).await.unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(result.output_state.get_i64("n"), Some(1));
}

#[tokio::test]
async fn loop_iterations_see_iteration_metadata() {
    let orchestrator = LoopOrchestrator::new(
        registry(),
        "collector",
        LoopCondition::from_fn(|state: &State| state.get_i64("count") == Some(3)),
        10,
    );
    orchestrator
        .register_agent(
            "collector",
            Arc::new(FnHandler::from_sync(|event, state| {
                let count = state.get_i64("count").unwrap_or(0) + 1;
                state.set("count", json!(count));
                let seen = event.meta(meta_keys::LOOP_ITERATION).unwrap().to_string();
                let mut log = state
                    .get("iteration_log")
                    .and_then(|v| v.as_array().cloned())
                    .unwrap_or_default();
                log.push(json!(seen));
                state.set("iteration_log", json!(log));
                assert_eq!(event.meta(meta_keys::MAX_ITERATIONS), Some("10"));
                Ok(())
            })),
        )
        .await
        .unwrap();

    let result = orchestrator
        .dispatch(&ctx(), EventBuilder::new().build())
        .await
        .unwrap();
    assert_eq!(
        result.output_state.get("iteration_log"),
        Some(&json!(["1", "2", "3"]))
    );
}

#[tokio::test]
async fn loop_time_bound_terminates_early() {
    let orchestrator = LoopOrchestrator::new(
        registry(),
        "slow",
        LoopCondition::from_fn(|_| false),
        1_000,
    )
    .with_max_duration(Duration::from_millis(50));
    orchestrator
        .register_agent(
            "slow",
            Arc::new(FnHandler::new(|_ctx, _event, state| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(AgentResult::from_state(state))
            })),
        )
        .await
        .unwrap();

    let result = orchestrator
        .dispatch(&ctx(), EventBuilder::new().build())
        .await
        .unwrap();
    let state = &result.output_state;
    assert_eq!(state.get_meta("time_limit_reached"), Some("true"));
    assert_eq!(state.get_meta("condition_met"), Some("false"));
    assert_eq!(state.get_meta("max_iterations_reached"), Some("false"));
    let total: usize = state.get_meta("total_iterations").unwrap().parse().unwrap();
    assert!(total >= 1 && total < 1_000);
}

#[tokio::test]
async fn loop_agent_error_aborts() {
    let orchestrator = LoopOrchestrator::new(
        registry(),
        "fragile",
        LoopCondition::from_fn(|_| false),
        10,
    );
    orchestrator
        .register_agent(
            "fragile",
            Arc::new(FnHandler::from_sync(|_e, _s| {
                Err(FlowError::ExecutionFailed("iteration died".into()))
            })),
        )
        .await
        .unwrap();

    let err = orchestrator
        .dispatch(&ctx(), EventBuilder::new().build())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FlowErrorKind::AgentFailed);
}

// ── Composite ────────────────────────────────────────────────────────────

fn append_handler(name: &'static str) -> Arc<FnHandler> {
    Arc::new(FnHandler::from_sync(move |_e, state| {
        let mut list = state
            .get("list")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        list.push(json!(name));
        state.set("list", json!(list));
        Ok(())
    }))
}

#[tokio::test]
async fn composite_flows_state_across_mixed_stages() {
    let stages = vec![
        WorkflowStage::new("classify", StagePattern::Route, vec!["classify".into()]),
        WorkflowStage::new(
            "enrich",
            StagePattern::Sequential,
            vec!["first".into(), "second".into()],
        )
        .with_prerequisites(vec!["kind".into()]),
    ];
    let orchestrator = CompositeOrchestrator::new(registry(), stages);
    orchestrator
        .register_agent(
            "classify",
            Arc::new(FnHandler::from_sync(|_e, state| {
                state.set("kind", json!("a"));
                Ok(())
            })),
        )
        .await
        .unwrap();
    orchestrator
        .register_agent("first", append_handler("first"))
        .await
        .unwrap();
    orchestrator
        .register_agent("second", append_handler("second"))
        .await
        .unwrap();

    let event = EventBuilder::new()
        .payload_entry("text", json!("..."))
        .build();
    let result = orchestrator.dispatch(&ctx(), event).await.unwrap();
    let state = &result.output_state;

    assert_eq!(state.get_str("kind"), Some("a"));
    assert_eq!(state.get("list"), Some(&json!(["first", "second"])));
    assert_eq!(state.get_meta("stage_0_complete"), Some("true"));
    assert_eq!(state.get_meta("stage_0_name"), Some("classify"));
    assert_eq!(state.get_meta("stage_1_complete"), Some("true"));
    assert_eq!(state.get_meta("workflow_complete"), Some("true"));
}

#[tokio::test]
async fn composite_missing_prerequisites_name_the_keys() {
    let stages = vec![WorkflowStage::new(
        "needs-input",
        StagePattern::Route,
        vec!["agent".into()],
    )
    .with_prerequisites(vec!["kind".into(), "score".into()])];
    let orchestrator = CompositeOrchestrator::new(registry(), stages);
    orchestrator
        .register_agent("agent", Arc::new(FnHandler::from_sync(|_e, _s| Ok(()))))
        .await
        .unwrap();

    let err = orchestrator
        .dispatch(&ctx(), EventBuilder::new().build())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        FlowError::StagePrereq {
            stage: "needs-input".into(),
            missing: vec!["kind".into(), "score".into()],
        }
    );
}

#[tokio::test]
async fn composite_success_predicate_gates_continuation() {
    let stages = vec![WorkflowStage::new(
        "scored",
        StagePattern::Route,
        vec!["scorer".into()],
    )
    .with_success(|state: &State| state.get_f64("score").unwrap_or(0.0) > 0.9)];
    let orchestrator = CompositeOrchestrator::new(registry(), stages);
    orchestrator
        .register_agent(
            "scorer",
            Arc::new(FnHandler::from_sync(|_e, state| {
                state.set("score", json!(0.4));
                Ok(())
            })),
        )
        .await
        .unwrap();

    let err = orchestrator
        .dispatch(&ctx(), EventBuilder::new().build())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        FlowError::StageUnsuccessful {
            stage: "scored".into()
        }
    );
}

#[tokio::test]
async fn composite_runs_loop_and_collaborative_stages() {
    let stages = vec![
        WorkflowStage::new("refine", StagePattern::Loop, vec!["incr".into()])
            .with_loop(LoopCondition::expression("n >= 2"), 10),
        WorkflowStage::new(
            "fan-out",
            StagePattern::Collaborative,
            vec!["left".into(), "right".into()],
        )
        .with_prerequisites(vec!["n".into()]),
    ];
    let orchestrator = CompositeOrchestrator::new(registry(), stages);
    let invocations = Arc::new(AtomicUsize::new(0));
    orchestrator
        .register_agent("incr", incr_handler(Arc::clone(&invocations)))
        .await
        .unwrap();
    orchestrator
        .register_agent(
            "left",
            Arc::new(FnHandler::from_sync(|_e, state| {
                // The fan-out seed carries the loop's result.
                assert_eq!(state.get_i64("n"), Some(2));
                state.set("saw", json!("left"));
                Ok(())
            })),
        )
        .await
        .unwrap();
    orchestrator
        .register_agent(
            "right",
            Arc::new(FnHandler::from_sync(|_e, state| {
                state.set("saw", json!("right"));
                Ok(())
            })),
        )
        .await
        .unwrap();

    let event = EventBuilder::new().payload_entry("n", json!(0)).build();
    let result = orchestrator.dispatch(&ctx(), event).await.unwrap();
    let state = &result.output_state;
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(state.get("left.saw"), Some(&json!("left")));
    assert_eq!(state.get("right.saw"), Some(&json!("right")));
    assert_eq!(state.get_meta("workflow_complete"), Some("true"));
}

#[tokio::test]
async fn composite_stage_timeout_surfaces_with_stage_name() {
    let stages = vec![WorkflowStage::new(
        "slow-stage",
        StagePattern::Route,
        vec!["sleeper".into()],
    )
    .with_timeout(Duration::from_millis(50))];
    let orchestrator = CompositeOrchestrator::new(registry(), stages);
    orchestrator
        .register_agent(
            "sleeper",
            Arc::new(FnHandler::new(|_ctx, _event, state| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(AgentResult::from_state(state))
            })),
        )
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let err = orchestrator
        .dispatch(&ctx(), EventBuilder::new().build())
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        err,
        FlowError::Timeout {
            scope: "slow-stage".into()
        }
    );
}

// ── Cancellation and agent-level deadlines ───────────────────────────────

#[tokio::test]
async fn cancelled_context_is_terminal() {
    let orchestrator = RouteOrchestrator::new(registry());
    orchestrator
        .register_agent("echo", Arc::new(FnHandler::from_sync(|_e, _s| Ok(()))))
        .await
        .unwrap();

    let context = ctx();
    context.cancellation().cancel();
    let err = orchestrator
        .dispatch(&context, EventBuilder::new().route("echo").build())
        .await
        .unwrap_err();
    assert_eq!(err, FlowError::Cancelled);
}

#[tokio::test]
async fn in_flight_handler_is_cancelled() {
    let orchestrator = Arc::new(RouteOrchestrator::new(registry()));
    orchestrator
        .register_agent(
            "sleeper",
            Arc::new(FnHandler::new(|_ctx, _event, state| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(AgentResult::from_state(state))
            })),
        )
        .await
        .unwrap();

    let context = ctx();
    let dispatch_ctx = context.clone();
    let dispatch_orch = Arc::clone(&orchestrator);
    let task = tokio::spawn(async move {
        dispatch_orch
            .dispatch(&dispatch_ctx, EventBuilder::new().route("sleeper").build())
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    context.cancellation().cancel();
    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err, FlowError::Cancelled);
}

#[tokio::test]
async fn agent_deadline_produces_timeout_promptly() {
    let orchestrator = RouteOrchestrator::new(registry());
    let agent = Agent::new(
        "never-returns",
        FnHandler::new(|_ctx, _event, state| async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(AgentResult::from_state(state))
        }),
    )
    .with_timeout(Duration::from_millis(50));
    orchestrator
        .register_agent("never-returns", agent.into_handler())
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let err = orchestrator
        .dispatch(&ctx(), EventBuilder::new().route("never-returns").build())
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(err.kind(), FlowErrorKind::Timeout);
}
