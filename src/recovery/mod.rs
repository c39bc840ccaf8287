//! Error classification and recovery.

pub mod actions;
pub mod classify;
pub mod engine;

pub use actions::{
    ManualInterventionAction, MemorySnapshots, ResubscribeAction, RollbackAction,
    UseCachedDataAction,
};
pub use classify::{
    ClassifiedError, ErrorCategory, ErrorClassifier, ErrorContext, ErrorStatistics, RawError,
    Severity,
};
pub use engine::{
    recovery_key, ActionOutcome, RecoveryAction, RecoveryActionKind, RecoveryContext,
    RecoveryEngine, RecoveryError, RecoverySnapshot, RecoveryState, RecoveryStrategy,
    SnapshotStore,
};
