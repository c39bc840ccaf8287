//! Calculation tracker: the context object tying the pieces together.
//!
//! ```text
//!   backend ──frames──▶ Connection ──▶ Router ──▶ TaskRegistry
//!                                         │  └──▶ ErrorClassifier ──▶ RecoveryEngine
//!                                         ▼
//!                               event queue ──▶ EventDispatcher ──▶ handlers
//! ```
//!
//! Every event goes through one queue drained by one task, so handlers run
//! one at a time and in the order events were produced. Handlers may call
//! back into the tracker.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::connection::{
    ConnectError, Connection, ConnectionHandler, ConnectionState, Transport, WebSocketTransport,
};
use crate::events::{EventDispatcher, EventHandlers, TrackerEvent};
use crate::protocol::{InboundFrame, InboundMessage, ProgressPayload};
use crate::recovery::{
    ClassifiedError, ErrorClassifier, ErrorContext, ErrorStatistics, ManualInterventionAction,
    MemorySnapshots, RawError, RecoveryAction, RecoveryEngine, RecoveryState, RecoveryStrategy,
    ResubscribeAction, RollbackAction, Severity, UseCachedDataAction,
};
use crate::registry::{TaskRecord, TaskRegistry, TaskStatistics, TaskStatus, CANCELLED_MESSAGE};

/// Snapshot of everything the tracker knows, computed on demand.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStatistics {
    pub tasks: TaskStatistics,
    pub errors: ErrorStatistics,
    pub connection_state: ConnectionState,
    pub subscriptions: usize,
    pub reconnect_attempts: u32,
}

/// Builder for [`CalculationTracker`].
pub struct TrackerBuilder {
    config: TrackerConfig,
    transport: Option<Arc<dyn Transport>>,
    handlers: EventHandlers,
    actions: Vec<Arc<dyn RecoveryAction>>,
    strategies: Vec<RecoveryStrategy>,
}

impl TrackerBuilder {
    /// Transport used to reach the backend. Defaults to WebSocket.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Register a recovery action, replacing the built-in one of its kind.
    pub fn recovery_action(mut self, action: Arc<dyn RecoveryAction>) -> Self {
        self.actions.push(action);
        self
    }

    /// Override the recovery strategy of one error category.
    pub fn strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Build the tracker. Spawns background tasks, so it must run inside a
    /// Tokio runtime. Does not connect.
    pub fn build(self) -> CalculationTracker {
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(WebSocketTransport) as Arc<dyn Transport>);
        let connection = Connection::new(self.config.connection.clone(), transport);
        let snapshots = Arc::new(MemorySnapshots::new());

        let mut recovery = RecoveryEngine::new(&self.config.recovery);
        recovery.set_snapshot_store(snapshots.clone());
        recovery.register(Arc::new(ResubscribeAction::new(connection.clone())));
        recovery.register(Arc::new(UseCachedDataAction::new(snapshots.clone())));
        recovery.register(Arc::new(RollbackAction::new(snapshots.clone())));
        recovery.register(Arc::new(ManualInterventionAction));
        for action in self.actions {
            recovery.register(action);
        }
        for strategy in self.strategies {
            recovery.set_strategy(strategy);
        }

        let dispatcher = Arc::new(EventDispatcher::new(self.handlers));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<TrackerEvent>();
        {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    dispatcher.dispatch(&event);
                }
            });
        }

        let inner = Arc::new(Inner {
            registry: Mutex::new(TaskRegistry::new(&self.config.registry)),
            classifier: Mutex::new(ErrorClassifier::new(self.config.recovery.error_history_limit)),
            config: self.config,
            connection,
            recovery,
            snapshots,
            dispatcher,
            events: events_tx,
            estimator: Mutex::new(None),
        });

        CalculationTracker { inner }
    }
}

/// Tracks long-running calculations over one persistent connection.
///
/// Cheap to clone. Independent instances share nothing.
#[derive(Clone)]
pub struct CalculationTracker {
    inner: Arc<Inner>,
}

struct Inner {
    config: TrackerConfig,
    connection: Connection,
    registry: Mutex<TaskRegistry>,
    classifier: Mutex<ErrorClassifier>,
    recovery: RecoveryEngine,
    snapshots: Arc<MemorySnapshots>,
    dispatcher: Arc<EventDispatcher>,
    events: mpsc::UnboundedSender<TrackerEvent>,
    estimator: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CalculationTracker {
    pub fn builder(config: TrackerConfig) -> TrackerBuilder {
        TrackerBuilder {
            config,
            transport: None,
            handlers: EventHandlers::new(),
            actions: Vec::new(),
            strategies: Vec::new(),
        }
    }

    /// Tracker over WebSocket with no handlers registered.
    pub fn new(config: TrackerConfig) -> Self {
        Self::builder(config).build()
    }

    /// Connect to the backend and start the duration estimator.
    ///
    /// Subscriptions made before connecting are sent once the channel opens.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.inner.start_estimator();
        let router = Arc::new(Router {
            inner: Arc::downgrade(&self.inner),
        });
        self.inner.connection.connect(router).await
    }

    /// Close the connection, stop the estimator and clear subscriptions.
    /// Task records are kept.
    pub fn disconnect(&self) {
        self.inner.stop_estimator();
        self.inner.connection.disconnect();
    }

    /// Tear everything down. The tracker is unusable afterwards.
    pub fn destroy(&self) {
        self.inner.stop_estimator();
        self.inner.connection.destroy();
        info!("Tracker destroyed");
    }

    /// Start tracking `task_id` and subscribe to its notifications.
    ///
    /// Idempotent. A task already in a terminal status is returned as is and
    /// not resubscribed.
    pub fn track(&self, task_id: &str, estimated_duration_secs: Option<f64>) -> TaskRecord {
        let (record, created) = {
            let mut registry = lock(&self.inner.registry);
            let created = !registry.contains(task_id);
            let record = registry
                .start_tracking(task_id, estimated_duration_secs)
                .clone();
            (record, created)
        };

        if created {
            self.inner.emit(TrackerEvent::TaskTracked {
                task_id: task_id.to_string(),
            });
        }
        if !record.is_terminal() {
            self.inner.connection.subscribe_to_task(task_id);
        }
        record
    }

    /// Stop tracking `task_id` on the client side.
    ///
    /// The task becomes terminal with a "cancelled by user" error and is
    /// unsubscribed. Nothing is sent to cancel the calculation itself.
    pub fn cancel(&self, task_id: &str) -> bool {
        let cancelled = self.inner.fail_task(task_id, CANCELLED_MESSAGE);
        if cancelled {
            info!(task_id = %task_id, "Tracking cancelled");
        }
        cancelled
    }

    /// Ask the backend for the current status of `task_id`. The answer
    /// arrives as a `TaskStatusUpdate` event.
    pub fn request_status(&self, task_id: &str) -> bool {
        self.inner.connection.request_task_status(task_id)
    }

    /// Evict a task record and drop its subscription.
    pub fn remove(&self, task_id: &str) -> Option<TaskRecord> {
        let removed = lock(&self.inner.registry).remove_progress(task_id);
        self.inner.connection.unsubscribe_from_task(task_id);
        self.inner.recovery.reset_attempts(task_id);
        self.inner.snapshots.forget(task_id);
        if removed.is_some() {
            self.inner.emit(TrackerEvent::TaskRemoved {
                task_id: task_id.to_string(),
            });
        }
        removed
    }

    /// Evict every task record and drop every subscription.
    pub fn clear(&self) {
        let ids: Vec<String> = {
            let mut registry = lock(&self.inner.registry);
            let ids = registry.all().into_iter().map(|r| r.id.clone()).collect();
            registry.clear_all();
            ids
        };
        for id in ids {
            self.inner.connection.unsubscribe_from_task(&id);
            self.inner.recovery.reset_attempts(&id);
            self.inner.snapshots.forget(&id);
            self.inner.emit(TrackerEvent::TaskRemoved { task_id: id });
        }
    }

    /// Classify and handle an error raised outside the wire protocol, e.g.
    /// by the host while preparing a calculation.
    ///
    /// Info and warning errors leave the task running.
    pub fn report_error(&self, raw: impl Into<RawError>, context: ErrorContext) -> ClassifiedError {
        self.inner.handle_error(&raw.into(), context, ErrorOrigin::Host)
    }

    /// Hot-swap handlers. Kinds present in `handlers` replace the current
    /// ones; the others are kept.
    pub fn update_handlers(&self, handlers: EventHandlers) {
        self.inner.dispatcher.update_handlers(handlers);
    }

    pub fn replace_handlers(&self, handlers: EventHandlers) {
        self.inner.dispatcher.replace_handlers(handlers);
    }

    pub fn task(&self, task_id: &str) -> Option<TaskRecord> {
        lock(&self.inner.registry).get(task_id).cloned()
    }

    pub fn tasks(&self) -> Vec<TaskRecord> {
        lock(&self.inner.registry).all().into_iter().cloned().collect()
    }

    pub fn active_tasks(&self) -> Vec<TaskRecord> {
        lock(&self.inner.registry).active().into_iter().cloned().collect()
    }

    pub fn recent_errors(&self, limit: usize) -> Vec<ClassifiedError> {
        lock(&self.inner.classifier).recent(limit)
    }

    pub fn clear_error_history(&self) {
        lock(&self.inner.classifier).clear_history();
    }

    pub fn statistics(&self) -> TrackerStatistics {
        TrackerStatistics {
            tasks: lock(&self.inner.registry).statistics(),
            errors: lock(&self.inner.classifier).statistics(),
            connection_state: self.inner.connection.state(),
            subscriptions: self.inner.connection.subscriptions().len(),
            reconnect_attempts: self.inner.connection.reconnect_attempts(),
        }
    }

    /// Known-good state used by rollback recovery. Save form inputs here,
    /// keyed by task id. Also holds the last progress of each task for
    /// cached-data recovery.
    pub fn snapshots(&self) -> &MemorySnapshots {
        &self.inner.snapshots
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for CalculationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculationTracker")
            .field("connection", &self.inner.connection)
            .field("tasks", &lock(&self.inner.registry).len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing
// ─────────────────────────────────────────────────────────────────────────────

/// Where an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorOrigin {
    /// A `calculation_error` frame. The backend has stopped the task.
    Backend,
    /// [`CalculationTracker::report_error`]
    Host,
}

/// Connection callbacks. Holds the tracker weakly so the connection driver
/// does not keep it alive.
struct Router {
    inner: Weak<Inner>,
}

impl ConnectionHandler for Router {
    fn on_frame(&self, frame: InboundFrame) {
        if let Some(inner) = self.inner.upgrade() {
            inner.route(frame);
        }
    }

    fn on_state_change(&self, from: ConnectionState, to: ConnectionState) {
        if let Some(inner) = self.inner.upgrade() {
            inner.emit(TrackerEvent::ConnectionStateChanged { from, to });
        }
    }

    fn on_connection_lost(&self, attempts: u32) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let message = format!("Connection lost after {} reconnect attempts", attempts);
        let error = lock(&inner.classifier).record(
            &RawError::Message(message),
            ErrorContext::operation("reconnect"),
        );
        inner.emit(TrackerEvent::ConnectionLost { attempts });
        inner.emit(TrackerEvent::CalculationError {
            task_id: None,
            error,
        });
    }
}

impl Inner {
    fn emit(&self, event: TrackerEvent) {
        if self.events.send(event).is_err() {
            debug!("Event loop has stopped; event dropped");
        }
    }

    fn route(self: &Arc<Self>, frame: InboundFrame) {
        match frame.message {
            InboundMessage::ProgressUpdate(report) => self.on_progress(report, frame.timestamp),
            InboundMessage::CalculationComplete { task_id, result } => {
                self.on_complete(&task_id, result)
            }
            InboundMessage::CalculationError { task_id, error } => {
                let terminal = lock(&self.registry)
                    .get(&task_id)
                    .is_some_and(|r| r.is_terminal());
                if terminal {
                    debug!(task_id = %task_id, "Error for finished task ignored");
                    return;
                }
                self.handle_error(
                    &RawError::Payload(error),
                    ErrorContext::operation("calculation").with_task(task_id),
                    ErrorOrigin::Backend,
                );
            }
            InboundMessage::TaskStatus { task_id, status } => {
                self.emit(TrackerEvent::TaskStatusUpdate {
                    task_id: task_id.clone(),
                    status: status.clone(),
                });
                if let Some(task_id) = task_id {
                    self.reconcile_status(&task_id, &status);
                }
            }
            InboundMessage::Subscribed { task_id } => {
                debug!(task_id = %task_id, "Subscription confirmed");
                self.emit(TrackerEvent::Subscribed { task_id })
            }
            InboundMessage::Pong => self.emit(TrackerEvent::Pong),
            InboundMessage::SystemStatus(status) => self.emit(TrackerEvent::SystemStatus(status)),
            InboundMessage::Unknown { kind } => self.emit(TrackerEvent::UnknownMessage { kind }),
        }
    }

    fn on_progress(&self, report: ProgressPayload, timestamp: chrono::DateTime<Utc>) {
        let Some(task_id) = report.task_id.clone().or_else(|| self.sole_active_task()) else {
            warn!("Progress update without task_id and no single active task; dropped");
            return;
        };

        let mut events = Vec::new();
        let mut latest = None;
        {
            let mut registry = lock(&self.registry);
            let Some((prev_status, prev_stage)) = registry
                .get(&task_id)
                .map(|r| (r.status, r.stage.clone()))
            else {
                warn!(task_id = %task_id, "Progress for untracked task ignored");
                return;
            };
            let Some(record) = registry.apply_report(&task_id, &report, timestamp) else {
                return;
            };

            if prev_status == TaskStatus::Pending {
                events.push(TrackerEvent::TaskStarted {
                    task_id: task_id.clone(),
                });
            }
            if prev_stage != record.stage {
                events.push(TrackerEvent::StageChanged {
                    task_id: task_id.clone(),
                    from: prev_stage,
                    to: record.stage.clone(),
                });
            }
            if let Some(update) = record.latest_update() {
                latest = Some(update.clone());
                events.push(TrackerEvent::ProgressUpdate(update.clone()));
            }
        }

        if let Some(data) = latest.and_then(|update| serde_json::to_value(update).ok()) {
            self.snapshots.cache(task_id.as_str(), data);
        }
        for event in events {
            self.emit(event);
        }
    }

    /// The one active, subscribed task, if there is exactly one. Progress
    /// frames without a `task_id` belong to it.
    fn sole_active_task(&self) -> Option<String> {
        let active: Vec<String> = lock(&self.registry)
            .active()
            .into_iter()
            .map(|r| r.id.clone())
            .collect();
        let mut subscribed = active
            .into_iter()
            .filter(|id| self.connection.is_subscribed(id));
        match (subscribed.next(), subscribed.next()) {
            (Some(id), None) => Some(id),
            _ => None,
        }
    }

    /// Apply a terminal status from a `task_status` reply to the registry.
    fn reconcile_status(&self, task_id: &str, status: &Value) {
        let Some(state) = status.get("status").and_then(Value::as_str) else {
            return;
        };
        let active = lock(&self.registry)
            .get(task_id)
            .is_some_and(|r| !r.is_terminal());
        if !active {
            return;
        }

        match state {
            "completed" => {
                let result = status.get("result").cloned().unwrap_or(Value::Null);
                self.on_complete(task_id, result);
            }
            "error" | "failed" => {
                let message = status
                    .get("error")
                    .filter(|e| !e.is_null())
                    .map(|e| RawError::Payload(e.clone()).message())
                    .unwrap_or_else(|| "Calculation failed".to_string());
                info!(task_id = %task_id, "Backend reports task failed");
                self.fail_task(task_id, &message);
            }
            _ => {}
        }
    }

    fn on_complete(&self, task_id: &str, result: serde_json::Value) {
        let finished = {
            let mut registry = lock(&self.registry);
            let tracked = registry.contains(task_id);
            let finished = registry
                .complete_tracking(task_id, true, Some(result.clone()), None)
                .map(|r| (r.latest_update().cloned(), r.duration_secs().unwrap_or(0.0)));
            if tracked && finished.is_none() {
                debug!(task_id = %task_id, "Completion for finished task ignored");
                return;
            }
            finished
        };

        self.connection.unsubscribe_from_task(task_id);
        self.recovery.reset_attempts(task_id);

        if let Some((Some(update), _)) = &finished {
            self.emit(TrackerEvent::ProgressUpdate(update.clone()));
        }
        self.emit(TrackerEvent::CalculationComplete {
            task_id: task_id.to_string(),
            result: result.clone(),
        });
        if let Some((_, duration_secs)) = finished {
            self.emit(TrackerEvent::TaskCompleted {
                task_id: task_id.to_string(),
                result: Some(result),
                duration_secs,
            });
        }
    }

    /// Move a task to terminal `Error`. Returns whether it was active.
    fn fail_task(&self, task_id: &str, message: &str) -> bool {
        let update = {
            let mut registry = lock(&self.registry);
            match registry.complete_tracking(task_id, false, None, Some(message.to_string())) {
                Some(record) => record.latest_update().cloned(),
                None => return false,
            }
        };

        self.connection.unsubscribe_from_task(task_id);
        self.recovery.reset_attempts(task_id);

        if let Some(update) = update {
            self.emit(TrackerEvent::ProgressUpdate(update));
        }
        self.emit(TrackerEvent::TaskFailed {
            task_id: task_id.to_string(),
            error: message.to_string(),
        });
        true
    }

    /// Classify `raw` and apply the severity policy:
    /// - info, warning: recorded and surfaced; the task carries on unless the
    ///   backend reported it, in which case the task has already ended
    /// - critical or non-recoverable: surfaced, the task fails, no recovery
    /// - error: recovery runs first; only exhaustion is surfaced
    fn handle_error(
        self: &Arc<Self>,
        raw: &RawError,
        context: ErrorContext,
        origin: ErrorOrigin,
    ) -> ClassifiedError {
        let classified = lock(&self.classifier).record(raw, context);
        let task_id = classified.task_id().map(str::to_string);

        if !classified.severity.is_blocking() {
            self.emit(TrackerEvent::CalculationError {
                task_id: task_id.clone(),
                error: classified.clone(),
            });
            if let (ErrorOrigin::Backend, Some(task_id)) = (origin, task_id.as_deref()) {
                self.fail_task(task_id, &classified.message);
            }
            return classified;
        }

        if classified.severity == Severity::Critical || !classified.recoverable {
            warn!(code = %classified.code, "Unrecoverable error: {}", classified.message);
            self.surface_failure(&classified);
            return classified;
        }

        self.emit(TrackerEvent::CalculationRecovering {
            task_id,
            error: classified.clone(),
            strategy: self.recovery.strategy_for(&classified),
        });

        let inner = Arc::clone(self);
        let error = classified.clone();
        tokio::spawn(async move {
            let state = inner.recovery.attempt_recovery(&error).await;
            inner.finish_recovery(state);
        });

        classified
    }

    fn finish_recovery(&self, state: RecoveryState) {
        let task_id = state.error.task_id().map(str::to_string);

        match state.recovered_by.filter(|_| state.success) {
            Some(action) => {
                self.emit(TrackerEvent::CalculationRecovered {
                    task_id: task_id.clone(),
                    action,
                });
                if !action.resumes_task() {
                    if let Some(task_id) = task_id {
                        self.fail_task(&task_id, &state.error.message);
                    }
                }
            }
            None => self.surface_failure(&state.error),
        }
    }

    fn surface_failure(&self, error: &ClassifiedError) {
        let task_id = error.task_id().map(str::to_string);
        self.emit(TrackerEvent::CalculationError {
            task_id: task_id.clone(),
            error: error.clone(),
        });
        self.emit(TrackerEvent::CalculationFailed {
            task_id: task_id.clone(),
            error: error.clone(),
        });
        if let Some(task_id) = task_id {
            self.fail_task(&task_id, &error.message);
        }
    }

    fn start_estimator(self: &Arc<Self>) {
        let mut slot = lock(&self.estimator);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let period = self.config.registry.estimator_interval();
        if period.is_zero() {
            debug!("Duration estimator disabled");
            return;
        }

        let Some(start) = Instant::now().checked_add(period) else {
            warn!(?period, "Estimator interval out of range; estimator disabled");
            return;
        };

        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let updates = lock(&inner.registry).tick_estimates(Utc::now());
                for update in updates {
                    inner.emit(TrackerEvent::ProgressEstimated(update));
                }
            }
        }));
    }

    fn stop_estimator(&self) {
        if let Some(handle) = lock(&self.estimator).take() {
            handle.abort();
        }
    }
}
