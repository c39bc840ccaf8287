//! Recovery engine.
//!
//! Each error category maps to a [`RecoveryStrategy`]: an ordered list of
//! action kinds. [`RecoveryEngine::attempt_recovery`] runs the registered
//! action for each kind in order, each under a timeout, and stops at the
//! first success.
//!
//! # Invariants
//! - Actions run strictly in strategy order; none runs after a success
//! - The rollback snapshot is taken once, before the first action
//! - Critical or non-recoverable errors run no actions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::classify::{ClassifiedError, ErrorCategory};
use crate::config::RecoveryConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("Recovery action failed: {0}")]
    ActionFailed(String),

    #[error("Recovery action timed out after {0:?}")]
    Timeout(Duration),

    #[error("No action registered for {0}")]
    NoAction(RecoveryActionKind),

    #[error("No snapshot available to roll back to")]
    SnapshotUnavailable,

    #[error("Manual intervention required")]
    ManualInterventionRequired,
}

/// Kinds of remediation a strategy can list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionKind {
    Retry,
    RetryWithAdjustedParameters,
    UseCachedData,
    SimplifiedMethod,
    Rollback,
    ManualIntervention,
}

impl RecoveryActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::RetryWithAdjustedParameters => "retry_with_adjusted_parameters",
            Self::UseCachedData => "use_cached_data",
            Self::SimplifiedMethod => "simplified_method",
            Self::Rollback => "rollback",
            Self::ManualIntervention => "manual_intervention",
        }
    }

    /// Whether a success of this kind lets the calculation carry on, as
    /// opposed to restoring client state around a failed one.
    pub fn resumes_task(&self) -> bool {
        matches!(
            self,
            Self::Retry | Self::RetryWithAdjustedParameters | Self::SimplifiedMethod
        )
    }
}

impl std::fmt::Display for RecoveryActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered remediation plan for one error category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryStrategy {
    pub category: ErrorCategory,
    pub actions: Vec<RecoveryActionKind>,
}

impl RecoveryStrategy {
    /// Built-in plan for `category`.
    pub fn for_category(category: ErrorCategory) -> Self {
        use RecoveryActionKind::*;
        let actions = match category {
            ErrorCategory::Network => vec![Retry, UseCachedData, Rollback],
            ErrorCategory::Calculation => vec![RetryWithAdjustedParameters, SimplifiedMethod, Rollback],
            ErrorCategory::Validation | ErrorCategory::Configuration => vec![ManualIntervention],
            ErrorCategory::File => vec![Retry, ManualIntervention],
            ErrorCategory::System => vec![Retry, Rollback],
        };
        Self { category, actions }
    }

    pub fn manual(category: ErrorCategory) -> Self {
        Self {
            category,
            actions: vec![RecoveryActionKind::ManualIntervention],
        }
    }
}

/// State captured before the first action so a rollback has something to
/// restore.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoverySnapshot {
    /// Task id or error code the snapshot belongs to
    pub key: String,
    pub data: Value,
    pub taken_at: DateTime<Utc>,
}

/// Source and sink of rollback snapshots (form inputs, last known-good state).
pub trait SnapshotStore: Send + Sync {
    fn capture(&self, key: &str) -> Option<Value>;

    fn restore(&self, snapshot: &RecoverySnapshot) -> Result<(), RecoveryError>;
}

/// What an action sees while it runs.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub error: ClassifiedError,
    pub snapshot: Option<RecoverySnapshot>,
    /// 1-indexed recovery attempt for this error's key
    pub attempt: u32,
}

/// One pluggable remediation step.
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    fn kind(&self) -> RecoveryActionKind;

    /// `Ok` means the action recovered from the error.
    async fn execute(&self, context: &RecoveryContext) -> Result<(), RecoveryError>;
}

/// Outcome of one executed action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    pub kind: RecoveryActionKind,
    pub success: bool,
    pub error: Option<String>,
}

/// Progress of one recovery attempt.
///
/// # Invariants
/// - `current_action_index` only moves forward
/// - `snapshot` is written at most once
/// - Once `completed`, nothing changes
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryState {
    pub error: ClassifiedError,
    pub strategy: RecoveryStrategy,
    pub current_action_index: usize,
    /// Recovery attempts made for this error's key, this one included
    pub attempts: u32,
    pub max_attempts: u32,
    pub completed: bool,
    pub success: bool,
    /// The action that succeeded
    pub recovered_by: Option<RecoveryActionKind>,
    pub outcomes: Vec<ActionOutcome>,
    snapshot: Option<RecoverySnapshot>,
}

impl RecoveryState {
    fn new(error: ClassifiedError, strategy: RecoveryStrategy, attempts: u32, max_attempts: u32) -> Self {
        Self {
            error,
            strategy,
            current_action_index: 0,
            attempts,
            max_attempts,
            completed: false,
            success: false,
            recovered_by: None,
            outcomes: Vec::new(),
            snapshot: None,
        }
    }

    /// Store the rollback snapshot. Returns `false` if one was already taken.
    pub fn set_snapshot(&mut self, snapshot: RecoverySnapshot) -> bool {
        if self.snapshot.is_some() {
            return false;
        }
        self.snapshot = Some(snapshot);
        true
    }

    pub fn snapshot(&self) -> Option<&RecoverySnapshot> {
        self.snapshot.as_ref()
    }

    fn record(&mut self, kind: RecoveryActionKind, result: Result<(), RecoveryError>) {
        if self.completed {
            return;
        }
        let success = result.is_ok();
        self.outcomes.push(ActionOutcome {
            kind,
            success,
            error: result.err().map(|e| e.to_string()),
        });
        if success {
            self.recovered_by = Some(kind);
            self.finish(true);
        }
    }

    fn advance(&mut self) {
        if !self.completed {
            self.current_action_index += 1;
        }
    }

    fn finish(&mut self, success: bool) {
        if !self.completed {
            self.completed = true;
            self.success = success;
        }
    }
}

/// Runs recovery strategies with registered actions.
pub struct RecoveryEngine {
    actions: HashMap<RecoveryActionKind, Arc<dyn RecoveryAction>>,
    strategies: HashMap<ErrorCategory, RecoveryStrategy>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    action_timeout: Duration,
    max_attempts: u32,
    attempts: Mutex<HashMap<String, u32>>,
}

impl RecoveryEngine {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            actions: HashMap::new(),
            strategies: ErrorCategory::ALL
                .into_iter()
                .map(|c| (c, RecoveryStrategy::for_category(c)))
                .collect(),
            snapshots: None,
            action_timeout: config.action_timeout(),
            max_attempts: config.max_attempts,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Register an action, replacing any previous one of the same kind.
    pub fn register(&mut self, action: Arc<dyn RecoveryAction>) {
        self.actions.insert(action.kind(), action);
    }

    pub fn set_strategy(&mut self, strategy: RecoveryStrategy) {
        self.strategies.insert(strategy.category, strategy);
    }

    pub fn set_snapshot_store(&mut self, store: Arc<dyn SnapshotStore>) {
        self.snapshots = Some(store);
    }

    pub fn has_action(&self, kind: RecoveryActionKind) -> bool {
        self.actions.contains_key(&kind)
    }

    /// Strategy that would run for `error` on its next attempt.
    pub fn strategy_for(&self, error: &ClassifiedError) -> RecoveryStrategy {
        if self.attempts_for(&recovery_key(error)) >= self.max_attempts {
            return RecoveryStrategy::manual(error.category);
        }
        self.strategies
            .get(&error.category)
            .cloned()
            .unwrap_or_else(|| RecoveryStrategy::for_category(error.category))
    }

    pub fn attempts_for(&self, key: &str) -> u32 {
        self.lock_attempts().get(key).copied().unwrap_or(0)
    }

    /// Forget the attempt counter for `key` (a task id or error code).
    pub fn reset_attempts(&self, key: &str) {
        self.lock_attempts().remove(key);
    }

    fn lock_attempts(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run the strategy for `error` and report how it went.
    ///
    /// Once the per-key attempt cap is reached the strategy collapses to
    /// manual intervention. Action failures and timeouts move on to the next
    /// action; they never propagate.
    pub async fn attempt_recovery(&self, error: &ClassifiedError) -> RecoveryState {
        let key = recovery_key(error);
        let strategy = self.strategy_for(error);
        let attempt = {
            let mut attempts = self.lock_attempts();
            let count = attempts.entry(key.clone()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        let mut state = RecoveryState::new(error.clone(), strategy, attempt, self.max_attempts);

        if !error.recoverable {
            warn!(code = %error.code, severity = %error.severity, "Error is not recoverable; skipping recovery");
            state.finish(false);
            return state;
        }

        if let Some(data) = self.snapshots.as_ref().and_then(|store| store.capture(&key)) {
            state.set_snapshot(RecoverySnapshot {
                key: key.clone(),
                data,
                taken_at: Utc::now(),
            });
        }

        info!(
            code = %error.code,
            key = %key,
            attempt,
            actions = state.strategy.actions.len(),
            "Attempting recovery"
        );

        let context = RecoveryContext {
            error: error.clone(),
            snapshot: state.snapshot().cloned(),
            attempt,
        };
        let actions = state.strategy.actions.clone();

        for kind in actions {
            let result = match self.actions.get(&kind) {
                Some(action) => match timeout(self.action_timeout, action.execute(&context)).await {
                    Ok(result) => result,
                    Err(_) => Err(RecoveryError::Timeout(self.action_timeout)),
                },
                None => Err(RecoveryError::NoAction(kind)),
            };

            match &result {
                Ok(()) => info!(code = %error.code, action = %kind, "Recovery succeeded"),
                Err(RecoveryError::NoAction(_)) => debug!(action = %kind, "No action registered; skipping"),
                Err(e) => warn!(code = %error.code, action = %kind, "Recovery action failed: {}", e),
            }

            state.record(kind, result);
            if state.completed {
                return state;
            }
            state.advance();
        }

        warn!(code = %error.code, key = %key, "Recovery strategy exhausted");
        state.finish(false);
        state
    }
}

impl std::fmt::Debug for RecoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryEngine")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("action_timeout", &self.action_timeout)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// Attempts are counted per task, or per error code when no task is involved.
pub fn recovery_key(error: &ClassifiedError) -> String {
    error
        .task_id()
        .map(str::to_string)
        .unwrap_or_else(|| error.code.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::classify::{ErrorClassifier, ErrorContext, RawError};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        kind: RecoveryActionKind,
        succeed: bool,
        delay: Duration,
        calls: Arc<AtomicU32>,
    }

    impl Scripted {
        fn new(kind: RecoveryActionKind, succeed: bool) -> (Arc<Self>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let action = Arc::new(Self {
                kind,
                succeed,
                delay: Duration::ZERO,
                calls: calls.clone(),
            });
            (action, calls)
        }
    }

    #[async_trait]
    impl RecoveryAction for Scripted {
        fn kind(&self) -> RecoveryActionKind {
            self.kind
        }

        async fn execute(&self, _context: &RecoveryContext) -> Result<(), RecoveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.succeed {
                Ok(())
            } else {
                Err(RecoveryError::ActionFailed("scripted".to_string()))
            }
        }
    }

    struct FixedSnapshots;

    impl SnapshotStore for FixedSnapshots {
        fn capture(&self, _key: &str) -> Option<Value> {
            Some(serde_json::json!({ "diameter": 200 }))
        }

        fn restore(&self, _snapshot: &RecoverySnapshot) -> Result<(), RecoveryError> {
            Ok(())
        }
    }

    fn network_error(task_id: &str) -> ClassifiedError {
        ErrorClassifier::classify(
            &RawError::from("connection reset by peer"),
            ErrorContext::operation("subscribe").with_task(task_id),
        )
    }

    fn engine() -> RecoveryEngine {
        RecoveryEngine::new(&RecoveryConfig {
            max_attempts: 2,
            action_timeout_ms: 1000,
            ..RecoveryConfig::default()
        })
    }

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let mut engine = engine();
        let (retry, retry_calls) = Scripted::new(RecoveryActionKind::Retry, false);
        let (cached, cached_calls) = Scripted::new(RecoveryActionKind::UseCachedData, true);
        let (rollback, rollback_calls) = Scripted::new(RecoveryActionKind::Rollback, true);
        engine.register(retry);
        engine.register(cached);
        engine.register(rollback);

        let state = engine.attempt_recovery(&network_error("t1")).await;
        assert!(state.completed);
        assert!(state.success);
        assert_eq!(state.recovered_by, Some(RecoveryActionKind::UseCachedData));
        assert_eq!(state.current_action_index, 1);
        assert_eq!(retry_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cached_calls.load(Ordering::SeqCst), 1);
        assert_eq!(rollback_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let mut engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        engine.register(Arc::new(Scripted {
            kind: RecoveryActionKind::Retry,
            succeed: true,
            delay: Duration::from_secs(5),
            calls: calls.clone(),
        }));
        let (rollback, _) = Scripted::new(RecoveryActionKind::Rollback, true);
        engine.register(rollback);

        let state = engine.attempt_recovery(&network_error("t1")).await;
        assert!(state.success);
        assert_eq!(state.recovered_by, Some(RecoveryActionKind::Rollback));
        assert_eq!(
            state.outcomes[0].error.as_deref(),
            Some("Recovery action timed out after 1s")
        );
    }

    #[tokio::test]
    async fn test_exhausted_strategy_fails() {
        let mut engine = engine();
        let (retry, _) = Scripted::new(RecoveryActionKind::Retry, false);
        engine.register(retry);

        let state = engine.attempt_recovery(&network_error("t1")).await;
        assert!(state.completed);
        assert!(!state.success);
        assert_eq!(state.outcomes.len(), 3);
        assert!(matches!(
            state.outcomes[1].error.as_deref(),
            Some(e) if e.contains("use_cached_data")
        ));
    }

    #[tokio::test]
    async fn test_non_recoverable_runs_nothing() {
        let mut engine = engine();
        let (retry, calls) = Scripted::new(RecoveryActionKind::Retry, true);
        engine.register(retry);

        let critical = ErrorClassifier::classify(
            &RawError::from("fatal network stack failure"),
            ErrorContext::default(),
        );
        let state = engine.attempt_recovery(&critical).await;
        assert!(state.completed);
        assert!(!state.success);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_attempt_cap_collapses_to_manual() {
        let mut engine = engine();
        let (retry, retry_calls) = Scripted::new(RecoveryActionKind::Retry, false);
        engine.register(retry);

        let error = network_error("t1");
        engine.attempt_recovery(&error).await;
        engine.attempt_recovery(&error).await;
        assert_eq!(engine.attempts_for("t1"), 2);
        assert_eq!(
            engine.strategy_for(&error),
            RecoveryStrategy::manual(ErrorCategory::Network)
        );

        let state = engine.attempt_recovery(&error).await;
        assert!(!state.success);
        assert_eq!(state.attempts, 3);
        assert_eq!(retry_calls.load(Ordering::SeqCst), 2);

        engine.reset_attempts("t1");
        assert_eq!(
            engine.strategy_for(&error),
            RecoveryStrategy::for_category(ErrorCategory::Network)
        );
    }

    #[tokio::test]
    async fn test_snapshot_taken_once_before_actions() {
        let mut engine = engine();
        engine.set_snapshot_store(Arc::new(FixedSnapshots));
        let state = engine.attempt_recovery(&network_error("t1")).await;
        let snapshot = state.snapshot().unwrap();
        assert_eq!(snapshot.key, "t1");
        assert_eq!(snapshot.data["diameter"], 200);

        let mut state = state;
        assert!(!state.set_snapshot(RecoverySnapshot {
            key: "other".to_string(),
            data: Value::Null,
            taken_at: Utc::now(),
        }));
        assert_eq!(state.snapshot().unwrap().key, "t1");
    }
}
