//! End-to-end turn streaming: ordering, terminal frames, cancellation,
//! timeouts, admission control, model switching, echo stripping.

use std::sync::Arc;
use std::time::Duration;

use colloquy_core::backend::{BackendRegistry, ScriptedBackend};
use colloquy_core::context::{HistoryStore, InMemoryHistory, MemoryFusion};
use colloquy_core::event::error_kind;
use colloquy_core::session::{SessionManager, TurnInput, TurnStatus};
use colloquy_core::telemetry::EngineMetrics;
use colloquy_core::{EngineConfig, EngineError, StreamEvent};

fn test_config() -> EngineConfig {
    EngineConfig {
        default_model: "scripted".to_string(),
        adapter_timeout_ms: 2_000,
        ..EngineConfig::default()
    }
}

fn build_manager(
    config: EngineConfig,
    registry: Arc<BackendRegistry>,
    history: Arc<InMemoryHistory>,
) -> Arc<SessionManager> {
    let fusion = Arc::new(MemoryFusion::new(
        history.clone() as Arc<dyn HistoryStore>,
        None,
        None,
        config.fusion.clone(),
    ));
    SessionManager::new(
        config,
        registry,
        fusion,
        history as Arc<dyn HistoryStore>,
        Arc::new(EngineMetrics::new()),
    )
}

fn registry_with(backend: Arc<ScriptedBackend>) -> Arc<BackendRegistry> {
    let registry = BackendRegistry::new();
    registry.register(backend);
    registry
}

async fn wait_until_idle(manager: &SessionManager) {
    for _ in 0..100 {
        if manager.in_flight() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("engine never became idle");
}

#[tokio::test]
async fn test_hello_turn_streams_and_records_history() {
    // Session with empty history, no memory providers: context is empty,
    // output streams in order, the turn completes and lands in history.
    let history = InMemoryHistory::new();
    let registry = registry_with(ScriptedBackend::completing(
        "scripted",
        vec!["Hello", ", world", "!"],
    ));
    let manager = build_manager(test_config(), registry, history.clone());

    let session_id = manager.open_session("alice", None).await.unwrap();
    let mut handle = manager
        .submit_turn(&session_id, TurnInput::text("hello"))
        .await
        .unwrap();

    let events = handle.collect_events().await;
    assert_eq!(
        events,
        vec![
            StreamEvent::Delta("Hello".into()),
            StreamEvent::Delta(", world".into()),
            StreamEvent::Delta("!".into()),
            StreamEvent::Done,
        ]
    );

    // Delivered concatenation equals the history append.
    let delivered: String = events.iter().filter_map(|e| e.payload()).collect();
    let recorded = history.recent(&session_id, 10).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].assistant_text, delivered);
    assert_eq!(recorded[0].user_text, "hello");

    assert_eq!(handle.status().await, TurnStatus::Completed);
    assert!(!manager.snapshot(&session_id).await.unwrap().busy);
}

#[tokio::test]
async fn test_final_text_backend() {
    let history = InMemoryHistory::new();
    let registry = registry_with(
        ScriptedBackend::new("scripted")
            .final_text("complete answer")
            .shared(),
    );
    let manager = build_manager(test_config(), registry, history.clone());

    let session_id = manager.open_session("alice", None).await.unwrap();
    let mut handle = manager
        .submit_turn(&session_id, TurnInput::text("question"))
        .await
        .unwrap();

    let events = handle.collect_events().await;
    assert_eq!(
        events,
        vec![
            StreamEvent::FinalText("complete answer".into()),
            StreamEvent::Done,
        ]
    );
    let recorded = history.recent(&session_id, 10).await.unwrap();
    assert_eq!(recorded[0].assistant_text, "complete answer");
}

#[tokio::test]
async fn test_back_to_back_submit_is_busy() {
    let registry = registry_with(
        ScriptedBackend::new("scripted")
            .pause(Duration::from_millis(300))
            .delta("slow answer")
            .shared(),
    );
    let manager = build_manager(test_config(), registry, InMemoryHistory::new());

    let session_id = manager.open_session("alice", None).await.unwrap();
    let mut first = manager
        .submit_turn(&session_id, TurnInput::text("one"))
        .await
        .unwrap();

    // Second submission before the first resolves: rejected, never queued.
    let err = manager
        .submit_turn(&session_id, TurnInput::text("two"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SessionBusy(_)));

    first.collect_events().await;
    assert_eq!(first.status().await, TurnStatus::Completed);

    // The slot is free again after the first turn finishes.
    manager
        .submit_turn(&session_id, TurnInput::text("three"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancellation_releases_slot_and_skips_history() {
    let history = InMemoryHistory::new();
    let registry = registry_with(
        ScriptedBackend::new("scripted")
            .delta("partial ")
            .pause(Duration::from_millis(500))
            .delta("rest")
            .shared(),
    );
    let manager = build_manager(test_config(), registry, history.clone());

    let session_id = manager.open_session("alice", None).await.unwrap();
    let mut handle = manager
        .submit_turn(&session_id, TurnInput::text("go"))
        .await
        .unwrap();

    // Take the first delta, then cancel mid-stream.
    let first = handle.next_event().await.unwrap();
    assert_eq!(first, StreamEvent::Delta("partial ".into()));
    handle.cancel();

    handle.collect_events().await;
    assert_eq!(handle.status().await, TurnStatus::Cancelled);

    // Default config discards partial transcripts.
    assert_eq!(history.turn_count(&session_id), 0);

    // The session is immediately reusable.
    for _ in 0..100 {
        if !manager.snapshot(&session_id).await.unwrap().busy {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    manager
        .submit_turn(&session_id, TurnInput::text("again"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_keep_partial_transcripts_config() {
    let history = InMemoryHistory::new();
    let config = EngineConfig {
        keep_partial_transcripts: true,
        ..test_config()
    };
    let registry = registry_with(
        ScriptedBackend::new("scripted")
            .delta("kept partial")
            .pause(Duration::from_millis(500))
            .delta("rest")
            .shared(),
    );
    let manager = build_manager(config, registry, history.clone());

    let session_id = manager.open_session("alice", None).await.unwrap();
    let mut handle = manager
        .submit_turn(&session_id, TurnInput::text("go"))
        .await
        .unwrap();

    handle.next_event().await.unwrap();
    handle.cancel();
    handle.collect_events().await;
    assert_eq!(handle.status().await, TurnStatus::Cancelled);

    for _ in 0..100 {
        if history.turn_count(&session_id) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let recorded = history.recent(&session_id, 10).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].assistant_text, "kept partial");
}

#[tokio::test]
async fn test_adapter_timeout_fails_turn() {
    let history = InMemoryHistory::new();
    let config = EngineConfig {
        adapter_timeout_ms: 100,
        ..test_config()
    };
    let registry = registry_with(ScriptedBackend::new("scripted").delta("a").stall().shared());
    let manager = build_manager(config, registry, history.clone());

    let session_id = manager.open_session("alice", None).await.unwrap();
    let mut handle = manager
        .submit_turn(&session_id, TurnInput::text("go"))
        .await
        .unwrap();

    let events = handle.collect_events().await;
    assert_eq!(events[0], StreamEvent::Delta("a".into()));
    match &events[1] {
        StreamEvent::Error { kind, .. } => assert_eq!(kind, error_kind::BACKEND_TIMEOUT),
        other => panic!("expected error event, got {other:?}"),
    }
    assert_eq!(events[2], StreamEvent::Done);
    assert_eq!(events.len(), 3);

    assert_eq!(handle.status().await, TurnStatus::Failed);
    // Failed turn leaves no history entry and no residual lock.
    assert_eq!(history.turn_count(&session_id), 0);
    assert!(!manager.snapshot(&session_id).await.unwrap().busy);
    wait_until_idle(&manager).await;
}

#[tokio::test]
async fn test_backend_error_surfaces_once_then_done() {
    let registry = registry_with(
        ScriptedBackend::new("scripted")
            .delta("so far")
            .error(error_kind::BACKEND_ERROR, "upstream exploded")
            .shared(),
    );
    let manager = build_manager(test_config(), registry, InMemoryHistory::new());

    let session_id = manager.open_session("alice", None).await.unwrap();
    let mut handle = manager
        .submit_turn(&session_id, TurnInput::text("go"))
        .await
        .unwrap();

    let events = handle.collect_events().await;
    let error_count = events.iter().filter(|e| e.is_error()).count();
    assert_eq!(error_count, 1);
    assert_eq!(events.last(), Some(&StreamEvent::Done));
    assert_eq!(handle.status().await, TurnStatus::Failed);
}

#[tokio::test]
async fn test_backend_saturation_fails_fast() {
    let config = EngineConfig {
        max_concurrent_backend_calls: 1,
        ..test_config()
    };
    let registry = registry_with(ScriptedBackend::new("scripted").stall().shared());
    let manager = build_manager(config, registry, InMemoryHistory::new());

    let s1 = manager.open_session("alice", None).await.unwrap();
    let s2 = manager.open_session("bob", None).await.unwrap();

    let handle = manager.submit_turn(&s1, TurnInput::text("one")).await.unwrap();
    let err = manager
        .submit_turn(&s2, TurnInput::text("two"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BackendSaturated(1)));

    // Cancelling the stalled turn frees the global slot.
    handle.cancel();
    wait_until_idle(&manager).await;
    manager.submit_turn(&s2, TurnInput::text("two")).await.unwrap();
}

#[tokio::test]
async fn test_manager_side_cancellation() {
    let registry = registry_with(
        ScriptedBackend::new("scripted")
            .delta("start ")
            .pause(Duration::from_millis(500))
            .delta("end")
            .shared(),
    );
    let manager = build_manager(test_config(), registry, InMemoryHistory::new());

    let session_id = manager.open_session("alice", None).await.unwrap();

    // Nothing to cancel yet.
    assert!(!manager.cancel_turn(&session_id).await.unwrap());

    let mut handle = manager
        .submit_turn(&session_id, TurnInput::text("go"))
        .await
        .unwrap();
    handle.next_event().await.unwrap();

    assert!(manager.cancel_turn(&session_id).await.unwrap());
    handle.collect_events().await;
    assert_eq!(handle.status().await, TurnStatus::Cancelled);
    wait_until_idle(&manager).await;
}

#[tokio::test]
async fn test_model_switch_applies_to_next_turn_only() {
    let registry = BackendRegistry::new();
    registry.register(
        ScriptedBackend::new("alpha")
            .pause(Duration::from_millis(200))
            .delta("from alpha")
            .shared(),
    );
    registry.register(ScriptedBackend::new("beta").delta("from beta").shared());

    let config = EngineConfig {
        default_model: "alpha".to_string(),
        ..test_config()
    };
    let manager = build_manager(config, registry, InMemoryHistory::new());

    let session_id = manager.open_session("alice", None).await.unwrap();
    let mut first = manager
        .submit_turn(&session_id, TurnInput::text("one"))
        .await
        .unwrap();

    // Switch while the first turn is in flight.
    manager.set_model(&session_id, "beta").await.unwrap();

    let events = first.collect_events().await;
    assert!(events.contains(&StreamEvent::Delta("from alpha".into())));

    let mut second = manager
        .submit_turn(&session_id, TurnInput::text("two"))
        .await
        .unwrap();
    let events = second.collect_events().await;
    assert!(events.contains(&StreamEvent::Delta("from beta".into())));
}

#[tokio::test]
async fn test_unknown_model_rejected_at_submission() {
    let config = EngineConfig {
        default_model: "ghost".to_string(),
        ..test_config()
    };
    let manager = build_manager(config, BackendRegistry::new(), InMemoryHistory::new());

    let session_id = manager.open_session("alice", None).await.unwrap();
    let err = manager
        .submit_turn(&session_id, TurnInput::text("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedModel(_)));

    // The rejection happens before any turn is installed.
    assert!(!manager.snapshot(&session_id).await.unwrap().busy);

    let registry_err = manager.set_model(&session_id, "also-ghost").await.unwrap_err();
    assert!(matches!(registry_err, EngineError::UnsupportedModel(_)));
}

#[tokio::test]
async fn test_echo_quirk_stripped_exactly() {
    let history = InMemoryHistory::new();
    let registry = registry_with(
        ScriptedBackend::new("scripted")
            .echo_input()
            .delta("the real answer")
            .shared(),
    );
    let manager = build_manager(test_config(), registry, history.clone());

    let session_id = manager.open_session("alice", None).await.unwrap();
    let mut handle = manager
        .submit_turn(&session_id, TurnInput::text("repeat after me"))
        .await
        .unwrap();

    let events = handle.collect_events().await;
    assert_eq!(
        events,
        vec![
            StreamEvent::Delta("the real answer".into()),
            StreamEvent::Done,
        ]
    );
    let recorded = history.recent(&session_id, 10).await.unwrap();
    assert_eq!(recorded[0].assistant_text, "the real answer");
}

#[tokio::test]
async fn test_answer_resembling_input_is_not_truncated() {
    // The filter must strip only an exact echo; an answer that merely starts
    // like the input must come through whole.
    let registry = registry_with(
        ScriptedBackend::new("scripted")
            .delta("repeat ")
            .delta("this differently")
            .shared(),
    );
    let manager = build_manager(test_config(), registry, InMemoryHistory::new());

    let session_id = manager.open_session("alice", None).await.unwrap();
    let mut handle = manager
        .submit_turn(&session_id, TurnInput::text("repeat after me"))
        .await
        .unwrap();

    let events = handle.collect_events().await;
    let delivered: String = events.iter().filter_map(|e| e.payload()).collect();
    assert_eq!(delivered, "repeat this differently");
}

#[tokio::test]
async fn test_turns_on_different_sessions_run_concurrently() {
    let registry = registry_with(
        ScriptedBackend::new("scripted")
            .pause(Duration::from_millis(150))
            .delta("done")
            .shared(),
    );
    let manager = build_manager(test_config(), registry, InMemoryHistory::new());

    let s1 = manager.open_session("alice", None).await.unwrap();
    let s2 = manager.open_session("bob", None).await.unwrap();

    let started = std::time::Instant::now();
    let mut h1 = manager.submit_turn(&s1, TurnInput::text("a")).await.unwrap();
    let mut h2 = manager.submit_turn(&s2, TurnInput::text("b")).await.unwrap();

    let (e1, e2) = tokio::join!(h1.collect_events(), h2.collect_events());
    assert_eq!(e1.last(), Some(&StreamEvent::Done));
    assert_eq!(e2.last(), Some(&StreamEvent::Done));

    // Two 150ms turns overlapping should finish well under 300ms.
    assert!(started.elapsed() < Duration::from_millis(290));
}
