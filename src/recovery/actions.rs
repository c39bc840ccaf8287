//! Built-in recovery actions.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use super::engine::{
    recovery_key, RecoveryAction, RecoveryActionKind, RecoveryContext, RecoveryError,
    RecoverySnapshot, SnapshotStore,
};
use crate::connection::Connection;

/// Retries by re-subscribing the affected task and asking for its status.
/// Fails while the connection is not open.
pub struct ResubscribeAction {
    connection: Connection,
}

impl ResubscribeAction {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl RecoveryAction for ResubscribeAction {
    fn kind(&self) -> RecoveryActionKind {
        RecoveryActionKind::Retry
    }

    async fn execute(&self, context: &RecoveryContext) -> Result<(), RecoveryError> {
        let Some(task_id) = context.error.task_id() else {
            return Err(RecoveryError::ActionFailed(
                "error is not tied to a task".to_string(),
            ));
        };
        if !self.connection.subscribe_to_task(task_id) {
            return Err(RecoveryError::ActionFailed(format!(
                "connection is {}",
                self.connection.state()
            )));
        }
        self.connection.request_task_status(task_id);
        info!(task_id = %task_id, attempt = context.attempt, "Resubscribed for recovery");
        Ok(())
    }
}

/// Always fails, escalating the error to the user.
#[derive(Debug, Default)]
pub struct ManualInterventionAction;

#[async_trait]
impl RecoveryAction for ManualInterventionAction {
    fn kind(&self) -> RecoveryActionKind {
        RecoveryActionKind::ManualIntervention
    }

    async fn execute(&self, context: &RecoveryContext) -> Result<(), RecoveryError> {
        warn!(
            code = %context.error.code,
            suggestion = %context.error.suggestion,
            "Manual intervention required"
        );
        Err(RecoveryError::ManualInterventionRequired)
    }
}

/// Restores the snapshot taken before recovery started.
pub struct RollbackAction {
    store: Arc<dyn SnapshotStore>,
}

impl RollbackAction {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RecoveryAction for RollbackAction {
    fn kind(&self) -> RecoveryActionKind {
        RecoveryActionKind::Rollback
    }

    async fn execute(&self, context: &RecoveryContext) -> Result<(), RecoveryError> {
        let snapshot = context
            .snapshot
            .as_ref()
            .ok_or(RecoveryError::SnapshotUnavailable)?;
        self.store.restore(snapshot)?;
        info!(key = %snapshot.key, "Rolled back to snapshot");
        Ok(())
    }
}

/// Serves the last known data for the failed task instead of live results.
///
/// Data comes from [`MemorySnapshots::cache`]; the tracker caches every real
/// progress update. The served value is handed back through
/// [`MemorySnapshots::take_restored`].
pub struct UseCachedDataAction {
    store: Arc<MemorySnapshots>,
}

impl UseCachedDataAction {
    pub fn new(store: Arc<MemorySnapshots>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RecoveryAction for UseCachedDataAction {
    fn kind(&self) -> RecoveryActionKind {
        RecoveryActionKind::UseCachedData
    }

    async fn execute(&self, context: &RecoveryContext) -> Result<(), RecoveryError> {
        let key = recovery_key(&context.error);
        let data = self
            .store
            .cached(&key)
            .ok_or_else(|| RecoveryError::ActionFailed(format!("no cached data for {}", key)))?;
        lock(&self.store.restored).insert(key.clone(), data);
        info!(key = %key, "Serving cached data");
        Ok(())
    }
}

/// Known-good state saved by the host, keyed by task id or error code.
///
/// `restore` hands the saved value back through [`MemorySnapshots::take_restored`]
/// so the host can re-apply it.
#[derive(Debug, Default)]
pub struct MemorySnapshots {
    saved: Mutex<HashMap<String, Value>>,
    cached: Mutex<HashMap<String, Value>>,
    restored: Mutex<HashMap<String, Value>>,
}

impl MemorySnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save (or replace) the known-good state for `key`.
    pub fn save(&self, key: impl Into<String>, data: Value) {
        lock(&self.saved).insert(key.into(), data);
    }

    /// Replace the last known data for `key`.
    pub fn cache(&self, key: impl Into<String>, data: Value) {
        lock(&self.cached).insert(key.into(), data);
    }

    pub fn cached(&self, key: &str) -> Option<Value> {
        lock(&self.cached).get(key).cloned()
    }

    pub fn forget(&self, key: &str) {
        lock(&self.saved).remove(key);
        lock(&self.cached).remove(key);
    }

    /// State handed back by a rollback or cached-data recovery for `key`, if
    /// any. Clears it.
    pub fn take_restored(&self, key: &str) -> Option<Value> {
        lock(&self.restored).remove(key)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SnapshotStore for MemorySnapshots {
    fn capture(&self, key: &str) -> Option<Value> {
        lock(&self.saved).get(key).cloned()
    }

    fn restore(&self, snapshot: &RecoverySnapshot) -> Result<(), RecoveryError> {
        lock(&self.restored).insert(snapshot.key.clone(), snapshot.data.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, RecoveryConfig};
    use crate::connection::memory_transport;
    use crate::recovery::classify::{ErrorClassifier, ErrorContext, RawError};
    use crate::recovery::engine::RecoveryEngine;
    use serde_json::json;

    fn error_for(task_id: &str) -> crate::recovery::ClassifiedError {
        ErrorClassifier::classify(
            &RawError::from("connection dropped"),
            ErrorContext::operation("track").with_task(task_id),
        )
    }

    #[tokio::test]
    async fn test_rollback_restores_saved_state() {
        let snapshots = Arc::new(MemorySnapshots::new());
        snapshots.save("t1", json!({ "roughness": 0.1 }));

        let mut engine = RecoveryEngine::new(&RecoveryConfig::default());
        engine.set_snapshot_store(snapshots.clone());
        engine.register(Arc::new(RollbackAction::new(snapshots.clone())));

        let state = engine.attempt_recovery(&error_for("t1")).await;
        assert!(state.success);
        assert_eq!(state.recovered_by, Some(RecoveryActionKind::Rollback));
        assert_eq!(
            snapshots.take_restored("t1"),
            Some(json!({ "roughness": 0.1 }))
        );
        assert_eq!(snapshots.take_restored("t1"), None);
    }

    #[tokio::test]
    async fn test_rollback_without_snapshot_fails() {
        let snapshots = Arc::new(MemorySnapshots::new());
        let mut engine = RecoveryEngine::new(&RecoveryConfig::default());
        engine.set_snapshot_store(snapshots.clone());
        engine.register(Arc::new(RollbackAction::new(snapshots)));

        let state = engine.attempt_recovery(&error_for("t1")).await;
        assert!(!state.success);
    }

    #[tokio::test]
    async fn test_cached_data_served_after_retry_fails() {
        let (transport, _server) = memory_transport();
        let connection = Connection::new(ConnectionConfig::new("ws://calc.test/ws"), Arc::new(transport));
        let snapshots = Arc::new(MemorySnapshots::new());
        snapshots.cache("t1", json!({ "progress": 60.0 }));

        let mut engine = RecoveryEngine::new(&RecoveryConfig::default());
        engine.register(Arc::new(ResubscribeAction::new(connection)));
        engine.register(Arc::new(UseCachedDataAction::new(snapshots.clone())));

        let state = engine.attempt_recovery(&error_for("t1")).await;
        assert!(state.success);
        assert_eq!(state.recovered_by, Some(RecoveryActionKind::UseCachedData));
        assert!(!state.outcomes[0].success);
        assert_eq!(snapshots.take_restored("t1"), Some(json!({ "progress": 60.0 })));
        // The cache itself is kept for later attempts.
        assert!(snapshots.cached("t1").is_some());
    }

    #[tokio::test]
    async fn test_cached_data_missing_fails() {
        let snapshots = Arc::new(MemorySnapshots::new());
        let action = UseCachedDataAction::new(snapshots.clone());
        let context = RecoveryContext {
            error: error_for("t1"),
            snapshot: None,
            attempt: 1,
        };
        assert!(action.execute(&context).await.is_err());

        snapshots.cache("t1", json!(1));
        snapshots.forget("t1");
        assert!(action.execute(&context).await.is_err());
    }

    #[tokio::test]
    async fn test_resubscribe_fails_while_disconnected() {
        let (transport, _server) = memory_transport();
        let connection = Connection::new(ConnectionConfig::new("ws://calc.test/ws"), Arc::new(transport));
        let action = ResubscribeAction::new(connection.clone());
        let context = RecoveryContext {
            error: error_for("t1"),
            snapshot: None,
            attempt: 1,
        };

        assert!(action.execute(&context).await.is_err());
        // The id is still queued for the next open.
        assert!(connection.is_subscribed("t1"));
    }

    #[tokio::test]
    async fn test_manual_intervention_never_succeeds() {
        let context = RecoveryContext {
            error: error_for("t1"),
            snapshot: None,
            attempt: 1,
        };
        assert_eq!(
            ManualInterventionAction.execute(&context).await,
            Err(RecoveryError::ManualInterventionRequired)
        );
    }
}
