//! End-to-end tracker behavior against the in-memory transport.

use hydrotrack::connection::{memory_transport, MemoryPeer, MemoryServer};
use hydrotrack::recovery::RecoveryActionKind;
use hydrotrack::{
    CalculationTracker, ConnectionState, EventHandlers, EventKind, OutboundMessage, TaskStatus,
    TrackerConfig, TrackerEvent,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

struct Harness {
    tracker: CalculationTracker,
    events: mpsc::UnboundedReceiver<TrackerEvent>,
    server: MemoryServer,
}

fn config() -> TrackerConfig {
    let mut config = TrackerConfig::new("ws://calc.test/ws");
    config.connection.reconnect_interval_ms = 1000;
    config.connection.max_reconnect_attempts = 2;
    config.connection.resubscribe_stagger_ms = 100;
    config
}

fn harness(config: TrackerConfig) -> Harness {
    let (transport, server) = memory_transport();
    let (tx, events) = mpsc::unbounded_channel();
    let handlers = EventHandlers::new().on_many(&EventKind::ALL, move |event| {
        let _ = tx.send(event.clone());
    });
    let tracker = CalculationTracker::builder(config)
        .transport(Arc::new(transport))
        .handlers(handlers)
        .build();
    Harness {
        tracker,
        events,
        server,
    }
}

impl Harness {
    async fn connect(&mut self) -> MemoryPeer {
        assert_ok!(self.tracker.connect().await);
        self.server.accept().await.expect("server dropped")
    }

    async fn next(&mut self, kind: EventKind) -> TrackerEvent {
        let events = &mut self.events;
        let wait = async {
            loop {
                match events.recv().await {
                    Some(event) if event.kind() == kind => return event,
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(120), wait)
            .await
            .unwrap_or_else(|_| panic!("no {:?} event", kind))
    }
}

async fn subscribed_ids(peer: &mut MemoryPeer, count: usize) -> Vec<String> {
    let mut ids = Vec::new();
    while ids.len() < count {
        let frame = tokio::time::timeout(Duration::from_secs(5), peer.recv())
            .await
            .expect("no frame")
            .expect("socket closed");
        if frame.kind == "subscribe_task" {
            ids.push(frame.data["task_id"].as_str().unwrap().to_string());
        }
    }
    ids.sort();
    ids
}

#[tokio::test(start_paused = true)]
async fn resubscribes_every_task_once_after_unclean_close() {
    let mut h = harness(config());
    let mut peer = h.connect().await;
    for id in ["A", "B", "C"] {
        h.tracker.track(id, None);
    }
    assert_eq!(subscribed_ids(&mut peer, 3).await, vec!["A", "B", "C"]);

    peer.close(false);
    let mut peer = h.server.accept().await.unwrap();
    assert_eq!(subscribed_ids(&mut peer, 3).await, vec!["A", "B", "C"]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let extra: Vec<_> = peer
        .drain()
        .into_iter()
        .filter(|f| f.kind == "subscribe_task")
        .collect();
    assert!(extra.is_empty(), "unexpected resubscribes: {:?}", extra);
    assert_eq!(h.tracker.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts_until_explicit_connect() {
    let mut h = harness(config());
    let peer = h.connect().await;
    h.tracker.track("t1", None);

    h.server.refuse_next(u32::MAX);
    peer.close(false);
    match h.next(EventKind::ConnectionLost).await {
        TrackerEvent::ConnectionLost { attempts } => assert_eq!(attempts, 2),
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(h.tracker.state(), ConnectionState::Disconnected);
    assert_eq!(h.server.open_attempts(), 3);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.server.open_attempts(), 3);
    assert_eq!(h.tracker.state(), ConnectionState::Disconnected);

    // The subscription survived; an explicit connect resubscribes it.
    h.server.refuse_next(0);
    let mut peer = h.connect().await;
    assert_eq!(subscribed_ids(&mut peer, 1).await, vec!["t1"]);
}

#[tokio::test]
async fn send_while_disconnected_is_refused() {
    let h = harness(config());
    h.tracker.track("t1", None);
    let before = h.tracker.connection().subscriptions();

    assert!(!h.tracker.connection().send(&OutboundMessage::Ping));
    assert_eq!(h.tracker.state(), ConnectionState::Disconnected);
    assert_eq!(h.tracker.connection().subscriptions(), before);
}

#[tokio::test]
async fn progress_then_completion_end_to_end() {
    let mut h = harness(config());
    let mut peer = h.connect().await;
    h.tracker.track("t1", Some(120.0));
    subscribed_ids(&mut peer, 1).await;

    peer.send_frame(
        "progress_update",
        json!({ "task_id": "t1", "progress": 40, "message": "solving", "stage": "processing" }),
    );
    // Frames for finished or unknown tasks are ignored.
    peer.send_frame("progress_update", json!({ "task_id": "ghost", "progress": 10 }));
    h.next(EventKind::ProgressUpdate).await;

    let record = h.tracker.task("t1").unwrap();
    assert_eq!(record.status, TaskStatus::Running);
    assert_eq!(record.progress, 40.0);
    assert_eq!(record.stage, "processing");
    let history_before = record.history.len();

    peer.send_frame("calculation_complete", json!({ "task_id": "t1", "result": { "nodes": 12 } }));
    match h.next(EventKind::CalculationComplete).await {
        TrackerEvent::CalculationComplete { task_id, result } => {
            assert_eq!(task_id, "t1");
            assert_eq!(result["nodes"], 12);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    h.next(EventKind::TaskCompleted).await;

    let record = h.tracker.task("t1").unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.progress, 100.0);
    assert_eq!(record.history.len(), history_before + 1);

    // Late progress does not regress the terminal status.
    peer.send_frame("progress_update", json!({ "task_id": "t1", "progress": 50 }));
    peer.send_frame("pong", json!({}));
    h.next(EventKind::Pong).await;
    assert_eq!(h.tracker.task("t1").unwrap().progress, 100.0);
    assert!(h.tracker.connection().subscriptions().is_empty());
}

#[tokio::test]
async fn network_error_recovers_by_resubscribing() {
    let mut h = harness(config());
    let mut peer = h.connect().await;
    h.tracker.track("t1", None);
    subscribed_ids(&mut peer, 1).await;

    peer.send_frame(
        "calculation_error",
        json!({ "task_id": "t1", "error": { "message": "connection reset by upstream" } }),
    );
    h.next(EventKind::CalculationRecovering).await;
    match h.next(EventKind::CalculationRecovered).await {
        TrackerEvent::CalculationRecovered { task_id, action } => {
            assert_eq!(task_id.as_deref(), Some("t1"));
            assert_eq!(action, RecoveryActionKind::Retry);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let status_request = OutboundMessage::GetTaskStatus {
        task_id: "t1".to_string(),
    };
    assert!(peer.recv_kind(&status_request).await.is_some());
    assert!(!h.tracker.task("t1").unwrap().is_terminal());

    // The status reply settles the retried task.
    peer.send_frame(
        "task_status",
        json!({ "task_id": "t1", "status": "error", "error": { "message": "worker lost" } }),
    );
    match h.next(EventKind::TaskFailed).await {
        TrackerEvent::TaskFailed { task_id, error } => {
            assert_eq!(task_id, "t1");
            assert_eq!(error, "worker lost");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    let record = h.tracker.task("t1").unwrap();
    assert_eq!(record.status, TaskStatus::Error);
    assert!(h.tracker.active_tasks().is_empty());
    assert!(!h.tracker.connection().is_subscribed("t1"));
}

#[tokio::test]
async fn backend_validation_error_ends_the_task() {
    let mut h = harness(config());
    let mut peer = h.connect().await;
    h.tracker.track("t1", None);
    subscribed_ids(&mut peer, 1).await;

    peer.send_frame(
        "calculation_error",
        json!({ "task_id": "t1", "error": { "message": "invalid pipe diameter" } }),
    );
    h.next(EventKind::TaskFailed).await;
    assert!(h.tracker.task("t1").unwrap().is_terminal());
    assert!(h.tracker.connection().subscriptions().is_empty());
}

#[tokio::test]
async fn calculation_error_rolls_back_and_fails_task() {
    let mut h = harness(config());
    let mut peer = h.connect().await;
    h.tracker.track("t1", None);
    h.tracker
        .snapshots()
        .save("t1", json!({ "roughness": 0.0015 }));
    subscribed_ids(&mut peer, 1).await;

    peer.send_frame(
        "calculation_error",
        json!({ "task_id": "t1", "error": { "message": "solver did not converge" } }),
    );
    match h.next(EventKind::CalculationRecovered).await {
        TrackerEvent::CalculationRecovered { action, .. } => {
            assert_eq!(action, RecoveryActionKind::Rollback)
        }
        other => panic!("unexpected event: {:?}", other),
    }
    h.next(EventKind::TaskFailed).await;

    let record = h.tracker.task("t1").unwrap();
    assert_eq!(record.status, TaskStatus::Error);
    assert_eq!(record.error_message.as_deref(), Some("solver did not converge"));
    assert_eq!(
        h.tracker.snapshots().take_restored("t1"),
        Some(json!({ "roughness": 0.0015 }))
    );
    assert_eq!(h.tracker.recent_errors(1)[0].code, "CALCULATION_CONVERGENCE");
}

#[tokio::test]
async fn handlers_hot_swap_without_losing_state() {
    let mut h = harness(config());
    let mut peer = h.connect().await;
    h.tracker.track("t1", None);
    subscribed_ids(&mut peer, 1).await;

    let (tx, mut swapped) = mpsc::unbounded_channel();
    h.tracker
        .update_handlers(EventHandlers::new().on_progress_update(move |update| {
            let _ = tx.send(update.progress);
        }));

    peer.send_frame("progress_update", json!({ "task_id": "t1", "progress": 70 }));
    let progress = tokio::time::timeout(Duration::from_secs(5), swapped.recv())
        .await
        .unwrap();
    assert_eq!(progress, Some(70.0));

    // Other kinds still reach the original handler.
    h.next(EventKind::StageChanged).await;
    assert_eq!(h.tracker.state(), ConnectionState::Open);
    assert!(h.tracker.connection().is_subscribed("t1"));
}
