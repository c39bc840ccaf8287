//! Per-task tracking record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::history::RingBuffer;

/// Status of a tracked calculation.
///
/// # State Machine
/// ```text
/// Pending -> Running -> Completed
///        \          \-> Error
///         \-----------> Completed | Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Tracking started, no real progress received yet
    Pending,
    /// At least one progress frame received
    Running,
    Completed,
    Error,
}

impl TaskStatus {
    /// `true` for `Completed` and `Error`. Terminal status never regresses.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One progress observation, real or estimated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub task_id: String,
    /// Percent complete in [0, 100]
    pub progress: f64,
    pub message: String,
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    /// Seconds remaining, if known
    pub eta_secs: Option<f64>,
    /// Produced by the duration estimator rather than the backend
    pub estimated: bool,
}

/// Periodic estimator state for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorState {
    /// Interpolating from elapsed time
    Active,
    /// A real progress frame arrived; estimates are ignored from now on
    Superseded,
    /// Task reached a terminal status
    Stopped,
}

/// Tracking state of one calculation.
///
/// # Invariants
/// - `0.0 <= progress <= 100.0`
/// - `end_time.is_some() == status.is_terminal()`
/// - `history.len() <= history.capacity()`
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub message: String,
    pub stage: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub estimated_duration_secs: f64,
    pub estimated_time_remaining_secs: Option<f64>,
    pub history: RingBuffer<ProgressUpdate>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub estimator: EstimatorState,
}

impl TaskRecord {
    pub(crate) fn new(
        id: &str,
        estimated_duration_secs: f64,
        history_limit: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.to_string(),
            status: TaskStatus::Pending,
            progress: 0.0,
            message: String::new(),
            stage: "pending".to_string(),
            start_time: now,
            end_time: None,
            estimated_duration_secs,
            estimated_time_remaining_secs: Some(estimated_duration_secs),
            history: RingBuffer::new(history_limit),
            result: None,
            error_message: None,
            estimator: EstimatorState::Active,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock seconds between start and `end_time` (or `now` while active).
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> f64 {
        let end = self.end_time.unwrap_or(now);
        (end - self.start_time).num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Seconds from start to terminal status, for finished tasks.
    pub fn duration_secs(&self) -> Option<f64> {
        self.end_time.map(|end| self.elapsed_secs(end))
    }

    pub fn latest_update(&self) -> Option<&ProgressUpdate> {
        self.history.latest()
    }

    pub(crate) fn snapshot(&self, timestamp: DateTime<Utc>, estimated: bool) -> ProgressUpdate {
        ProgressUpdate {
            task_id: self.id.clone(),
            progress: self.progress,
            message: self.message.clone(),
            stage: self.stage.clone(),
            timestamp,
            eta_secs: self.estimated_time_remaining_secs,
            estimated,
        }
    }
}

/// Aggregate counters over the registry, computed on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStatistics {
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    /// Mean start-to-end time of completed tasks; 0 when none completed
    pub average_completion_time_secs: f64,
}
