//! Tracker events and their dispatch to registered handlers.
//!
//! [`TrackerEvent`] is closed: every variant has an [`EventKind`], and
//! [`EventDispatcher::dispatch`] looks the kind up in the handler map. Kinds
//! without a handler are skipped.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::trace;

use crate::connection::ConnectionState;
use crate::recovery::{ClassifiedError, RecoveryActionKind, RecoveryStrategy};
use crate::registry::ProgressUpdate;

/// Everything the tracker reports to the presentation layer.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    // Connection
    ConnectionStateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },

    // Task lifecycle
    TaskTracked { task_id: String },
    /// First real progress frame for the task
    TaskStarted { task_id: String },
    TaskCompleted {
        task_id: String,
        result: Option<Value>,
        duration_secs: f64,
    },
    TaskFailed { task_id: String, error: String },
    TaskRemoved { task_id: String },

    // Task status
    TaskStatusUpdate {
        task_id: Option<String>,
        status: Value,
    },

    // Progress
    ProgressUpdate(ProgressUpdate),
    /// Synthetic progress from the duration estimator
    ProgressEstimated(ProgressUpdate),
    StageChanged {
        task_id: String,
        from: String,
        to: String,
    },

    // Calculation outcome
    CalculationComplete { task_id: String, result: Value },
    /// A classified error surfaced to the user
    CalculationError {
        task_id: Option<String>,
        error: ClassifiedError,
    },
    CalculationRecovering {
        task_id: Option<String>,
        error: ClassifiedError,
        strategy: RecoveryStrategy,
    },
    CalculationRecovered {
        task_id: Option<String>,
        action: RecoveryActionKind,
    },
    /// Unrecoverable: critical, or recovery exhausted
    CalculationFailed {
        task_id: Option<String>,
        error: ClassifiedError,
    },

    // System
    SystemStatus(Value),
    /// Reconnection gave up
    ConnectionLost { attempts: u32 },

    // Messages
    Subscribed { task_id: String },
    Pong,
    UnknownMessage { kind: String },
}

/// Discriminant of [`TrackerEvent`], used as the handler key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConnectionStateChanged,
    TaskTracked,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRemoved,
    TaskStatusUpdate,
    ProgressUpdate,
    ProgressEstimated,
    StageChanged,
    CalculationComplete,
    CalculationError,
    CalculationRecovering,
    CalculationRecovered,
    CalculationFailed,
    SystemStatus,
    ConnectionLost,
    Subscribed,
    Pong,
    UnknownMessage,
}

impl EventKind {
    pub const ALL: [EventKind; 20] = [
        EventKind::ConnectionStateChanged,
        EventKind::TaskTracked,
        EventKind::TaskStarted,
        EventKind::TaskCompleted,
        EventKind::TaskFailed,
        EventKind::TaskRemoved,
        EventKind::TaskStatusUpdate,
        EventKind::ProgressUpdate,
        EventKind::ProgressEstimated,
        EventKind::StageChanged,
        EventKind::CalculationComplete,
        EventKind::CalculationError,
        EventKind::CalculationRecovering,
        EventKind::CalculationRecovered,
        EventKind::CalculationFailed,
        EventKind::SystemStatus,
        EventKind::ConnectionLost,
        EventKind::Subscribed,
        EventKind::Pong,
        EventKind::UnknownMessage,
    ];
}

impl TrackerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConnectionStateChanged { .. } => EventKind::ConnectionStateChanged,
            Self::TaskTracked { .. } => EventKind::TaskTracked,
            Self::TaskStarted { .. } => EventKind::TaskStarted,
            Self::TaskCompleted { .. } => EventKind::TaskCompleted,
            Self::TaskFailed { .. } => EventKind::TaskFailed,
            Self::TaskRemoved { .. } => EventKind::TaskRemoved,
            Self::TaskStatusUpdate { .. } => EventKind::TaskStatusUpdate,
            Self::ProgressUpdate(_) => EventKind::ProgressUpdate,
            Self::ProgressEstimated(_) => EventKind::ProgressEstimated,
            Self::StageChanged { .. } => EventKind::StageChanged,
            Self::CalculationComplete { .. } => EventKind::CalculationComplete,
            Self::CalculationError { .. } => EventKind::CalculationError,
            Self::CalculationRecovering { .. } => EventKind::CalculationRecovering,
            Self::CalculationRecovered { .. } => EventKind::CalculationRecovered,
            Self::CalculationFailed { .. } => EventKind::CalculationFailed,
            Self::SystemStatus(_) => EventKind::SystemStatus,
            Self::ConnectionLost { .. } => EventKind::ConnectionLost,
            Self::Subscribed { .. } => EventKind::Subscribed,
            Self::Pong => EventKind::Pong,
            Self::UnknownMessage { .. } => EventKind::UnknownMessage,
        }
    }

    /// Task the event concerns, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskTracked { task_id }
            | Self::TaskStarted { task_id }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskRemoved { task_id }
            | Self::StageChanged { task_id, .. }
            | Self::CalculationComplete { task_id, .. }
            | Self::Subscribed { task_id } => Some(task_id.as_str()),
            Self::ProgressUpdate(update) | Self::ProgressEstimated(update) => {
                Some(update.task_id.as_str())
            }
            Self::TaskStatusUpdate { task_id, .. }
            | Self::CalculationError { task_id, .. }
            | Self::CalculationRecovering { task_id, .. }
            | Self::CalculationRecovered { task_id, .. }
            | Self::CalculationFailed { task_id, .. } => task_id.as_deref(),
            Self::ConnectionStateChanged { .. }
            | Self::SystemStatus(_)
            | Self::ConnectionLost { .. }
            | Self::Pong
            | Self::UnknownMessage { .. } => None,
        }
    }
}

/// A registered callback. Must not block.
pub type EventHandler = Arc<dyn Fn(&TrackerEvent) + Send + Sync>;

/// Handlers keyed by event kind. At most one handler per kind.
#[derive(Clone, Default)]
pub struct EventHandlers {
    handlers: HashMap<EventKind, EventHandler>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn on<F>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(&TrackerEvent) + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Register one handler for several kinds.
    pub fn on_many<F>(mut self, kinds: &[EventKind], handler: F) -> Self
    where
        F: Fn(&TrackerEvent) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        for kind in kinds {
            self.handlers.insert(*kind, handler.clone());
        }
        self
    }

    /// Real progress from the backend, plus the final update written when a
    /// task turns terminal. Duration estimates go to
    /// [`on_progress_estimated`](Self::on_progress_estimated) instead.
    pub fn on_progress_update<F>(self, handler: F) -> Self
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.on(EventKind::ProgressUpdate, move |event| {
            if let TrackerEvent::ProgressUpdate(update) = event {
                handler(update);
            }
        })
    }

    /// Synthetic progress from the duration estimator (`estimated` is set).
    pub fn on_progress_estimated<F>(self, handler: F) -> Self
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.on(EventKind::ProgressEstimated, move |event| {
            if let TrackerEvent::ProgressEstimated(update) = event {
                handler(update);
            }
        })
    }

    pub fn on_calculation_complete<F>(self, handler: F) -> Self
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.on(EventKind::CalculationComplete, move |event| {
            if let TrackerEvent::CalculationComplete { task_id, result } = event {
                handler(task_id, result);
            }
        })
    }

    pub fn on_calculation_error<F>(self, handler: F) -> Self
    where
        F: Fn(&ClassifiedError) + Send + Sync + 'static,
    {
        self.on(EventKind::CalculationError, move |event| {
            if let TrackerEvent::CalculationError { error, .. } = event {
                handler(error);
            }
        })
    }

    pub fn on_connection_state_change<F>(self, handler: F) -> Self
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.on(EventKind::ConnectionStateChanged, move |event| {
            if let TrackerEvent::ConnectionStateChanged { from, to } = event {
                handler(*from, *to);
            }
        })
    }

    pub fn on_task_status_update<F>(self, handler: F) -> Self
    where
        F: Fn(Option<&str>, &Value) + Send + Sync + 'static,
    {
        self.on(EventKind::TaskStatusUpdate, move |event| {
            if let TrackerEvent::TaskStatusUpdate { task_id, status } = event {
                handler(task_id.as_deref(), status);
            }
        })
    }

    pub fn get(&self, kind: EventKind) -> Option<&EventHandler> {
        self.handlers.get(&kind)
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn remove(&mut self, kind: EventKind) -> Option<EventHandler> {
        self.handlers.remove(&kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Overlay `other`: its handlers replace ours kind by kind.
    pub fn merge(&mut self, other: EventHandlers) {
        self.handlers.extend(other.handlers);
    }
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Routes events to the handler registered for their kind.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    handlers: RwLock<EventHandlers>,
}

impl EventDispatcher {
    pub fn new(handlers: EventHandlers) -> Self {
        Self {
            handlers: RwLock::new(handlers),
        }
    }

    /// Invoke the handler for `event`'s kind. Returns whether one ran.
    ///
    /// The handler is called without the dispatcher lock held, so it may
    /// call [`update_handlers`](Self::update_handlers) itself.
    pub fn dispatch(&self, event: &TrackerEvent) -> bool {
        let kind = event.kind();
        let handler = {
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            handlers.get(kind).cloned()
        };
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => {
                trace!(kind = ?kind, "No handler registered");
                false
            }
        }
    }

    /// Hot-swap: handlers in `update` replace existing ones, others stay.
    pub fn update_handlers(&self, update: EventHandlers) {
        self.write().merge(update);
    }

    /// Replace the whole handler set.
    pub fn replace_handlers(&self, handlers: EventHandlers) {
        *self.write() = handlers;
    }

    pub fn remove_handler(&self, kind: EventKind) -> bool {
        self.write().remove(kind).is_some()
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(kind)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, EventHandlers> {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    fn progress(task_id: &str, progress: f64) -> ProgressUpdate {
        ProgressUpdate {
            task_id: task_id.to_string(),
            progress,
            message: String::new(),
            stage: "processing".to_string(),
            timestamp: Utc::now(),
            eta_secs: None,
            estimated: false,
        }
    }

    #[test]
    fn test_kind_list_is_complete_and_distinct() {
        let unique: std::collections::HashSet<_> = EventKind::ALL.iter().collect();
        assert_eq!(unique.len(), EventKind::ALL.len());
    }

    #[test]
    fn test_unregistered_kind_is_skipped() {
        let dispatcher = EventDispatcher::default();
        assert!(!dispatcher.dispatch(&TrackerEvent::Pong));
    }

    #[test]
    fn test_presentation_setters_receive_payloads() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handlers = {
            let progress_seen = seen.clone();
            let complete_seen = seen.clone();
            let state_seen = seen.clone();
            EventHandlers::new()
                .on_progress_update(move |u| {
                    progress_seen.lock().unwrap().push(format!("progress {}", u.progress))
                })
                .on_calculation_complete(move |id, result| {
                    complete_seen.lock().unwrap().push(format!("complete {} {}", id, result))
                })
                .on_connection_state_change(move |from, to| {
                    state_seen.lock().unwrap().push(format!("{} -> {}", from, to))
                })
        };
        let dispatcher = EventDispatcher::new(handlers);

        dispatcher.dispatch(&TrackerEvent::ProgressUpdate(progress("t1", 40.0)));
        dispatcher.dispatch(&TrackerEvent::CalculationComplete {
            task_id: "t1".to_string(),
            result: json!(1),
        });
        dispatcher.dispatch(&TrackerEvent::ConnectionStateChanged {
            from: ConnectionState::Connecting,
            to: ConnectionState::Open,
        });
        // Estimates go to their own kind.
        assert!(!dispatcher.dispatch(&TrackerEvent::ProgressEstimated(progress("t1", 50.0))));

        assert_eq!(
            seen.lock().unwrap().clone(),
            vec!["progress 40", "complete t1 1", "connecting -> open"]
        );
    }

    #[test]
    fn test_estimated_progress_setter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let dispatcher = EventDispatcher::new(EventHandlers::new().on_progress_estimated(move |u| {
            sink.lock().unwrap().push((u.progress, u.estimated))
        }));

        let mut estimate = progress("t1", 12.5);
        estimate.estimated = true;
        assert!(dispatcher.dispatch(&TrackerEvent::ProgressEstimated(estimate)));
        assert!(!dispatcher.dispatch(&TrackerEvent::ProgressUpdate(progress("t1", 40.0))));
        assert_eq!(seen.lock().unwrap().clone(), vec![(12.5, true)]);
    }

    #[test]
    fn test_update_handlers_swaps_only_given_kinds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        let dispatcher = EventDispatcher::new(
            EventHandlers::new()
                .on(EventKind::Pong, move |_| a.lock().unwrap().push("old pong"))
                .on(EventKind::SystemStatus, move |_| b.lock().unwrap().push("status")),
        );

        dispatcher.update_handlers(
            EventHandlers::new().on(EventKind::Pong, move |_| c.lock().unwrap().push("new pong")),
        );
        dispatcher.dispatch(&TrackerEvent::Pong);
        dispatcher.dispatch(&TrackerEvent::SystemStatus(json!({})));
        assert_eq!(log.lock().unwrap().clone(), vec!["new pong", "status"]);

        dispatcher.replace_handlers(EventHandlers::new());
        assert!(!dispatcher.has_handler(EventKind::SystemStatus));
    }

    #[test]
    fn test_task_id_accessor() {
        assert_eq!(
            TrackerEvent::TaskTracked {
                task_id: "t1".to_string()
            }
            .task_id(),
            Some("t1")
        );
        assert_eq!(TrackerEvent::ConnectionLost { attempts: 3 }.task_id(), None);
    }
}
