//! Task registry: per-task progress, status and duration estimates.
//!
//! The registry is plain synchronous state. The tracker owns it behind a
//! mutex and never holds that lock across an await, so each method call is
//! one atomic mutation.

mod record;

pub use record::{EstimatorState, ProgressUpdate, TaskRecord, TaskStatistics, TaskStatus};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::protocol::ProgressPayload;

/// Synthetic estimates never claim more than this until a real frame arrives.
const MAX_ESTIMATED_PROGRESS: f64 = 95.0;

pub const CANCELLED_MESSAGE: &str = "cancelled by user";

/// Clamp a reported percentage into [0, 100]. NaN becomes 0.
pub fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Timing {
    estimated_time: Option<f64>,
    elapsed_time: Option<f64>,
}

/// In-memory registry of tracked calculations.
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskRecord>,
    history_limit: usize,
    default_estimated_duration_secs: f64,
}

impl TaskRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            tasks: HashMap::new(),
            history_limit: config.history_limit,
            default_estimated_duration_secs: config.default_estimated_duration_secs,
        }
    }

    /// Start tracking `task_id`.
    ///
    /// Idempotent: an already tracked id returns its existing record
    /// unchanged, whatever its status.
    pub fn start_tracking(&mut self, task_id: &str, estimated_duration_secs: Option<f64>) -> &TaskRecord {
        let estimate = estimated_duration_secs
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .unwrap_or(self.default_estimated_duration_secs);
        let history_limit = self.history_limit;

        self.tasks.entry(task_id.to_string()).or_insert_with(|| {
            info!(task_id = %task_id, estimated_secs = estimate, "Tracking started");
            TaskRecord::new(task_id, estimate, history_limit, Utc::now())
        })
    }

    /// Record a progress report from the backend.
    ///
    /// Clamps `progress` into [0, 100], moves a pending task to running and
    /// appends one history entry. Returns `None` for unknown ids and for
    /// tasks already in a terminal status.
    pub fn update_progress(
        &mut self,
        task_id: &str,
        progress: f64,
        message: &str,
        stage: &str,
    ) -> Option<&TaskRecord> {
        self.record_progress(task_id, progress, message, stage, Timing::default(), Utc::now())
    }

    /// Like [`update_progress`](Self::update_progress), also taking the
    /// backend's timing fields into account for the ETA.
    pub fn apply_report(
        &mut self,
        task_id: &str,
        report: &ProgressPayload,
        timestamp: DateTime<Utc>,
    ) -> Option<&TaskRecord> {
        let timing = Timing {
            estimated_time: report.estimated_time,
            elapsed_time: report.elapsed_time,
        };
        self.record_progress(
            task_id,
            report.progress,
            &report.message,
            &report.stage,
            timing,
            timestamp,
        )
    }

    fn record_progress(
        &mut self,
        task_id: &str,
        progress: f64,
        message: &str,
        stage: &str,
        timing: Timing,
        timestamp: DateTime<Utc>,
    ) -> Option<&TaskRecord> {
        let Some(record) = self.tasks.get_mut(task_id) else {
            warn!(task_id = %task_id, "Progress for untracked task ignored");
            return None;
        };
        if record.is_terminal() {
            debug!(task_id = %task_id, status = %record.status, "Progress after terminal status ignored");
            return None;
        }

        let progress = clamp_progress(progress);
        record.status = TaskStatus::Running;
        record.estimator = EstimatorState::Superseded;
        record.progress = progress;
        record.message = message.to_string();
        record.stage = stage.to_string();
        record.estimated_time_remaining_secs = remaining_secs(record, progress, timing, timestamp);

        let update = record.snapshot(timestamp, false);
        record.history.push(update);
        Some(record)
    }

    /// Move `task_id` to its terminal status.
    ///
    /// Happens exactly once per task. The transition is followed by one
    /// synthetic history entry: 100% on success, the preserved percentage
    /// with the failure message otherwise. Returns `None` for unknown ids and
    /// for tasks that were already terminal.
    pub fn complete_tracking(
        &mut self,
        task_id: &str,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
    ) -> Option<&TaskRecord> {
        let Some(record) = self.tasks.get_mut(task_id) else {
            warn!(task_id = %task_id, "Completion for untracked task ignored");
            return None;
        };
        if record.is_terminal() {
            debug!(task_id = %task_id, status = %record.status, "Task already terminal");
            return None;
        }

        let now = Utc::now();
        record.end_time = Some(now);
        record.estimator = EstimatorState::Stopped;
        record.estimated_time_remaining_secs = Some(0.0);
        record.result = result;

        if success {
            record.status = TaskStatus::Completed;
            record.progress = 100.0;
            record.message = "Calculation completed".to_string();
            record.stage = "completed".to_string();
        } else {
            let message = error.unwrap_or_else(|| "Calculation failed".to_string());
            record.status = TaskStatus::Error;
            record.message = message.clone();
            record.stage = "error".to_string();
            record.error_message = Some(message);
        }

        info!(
            task_id = %task_id,
            status = %record.status,
            duration_secs = record.elapsed_secs(now),
            "Tracking finished"
        );

        let update = record.snapshot(now, false);
        record.history.push(update);
        Some(record)
    }

    /// Client-side cancel: terminal `Error` with a fixed message.
    pub fn cancel_tracking(&mut self, task_id: &str) -> Option<&TaskRecord> {
        self.complete_tracking(task_id, false, None, Some(CANCELLED_MESSAGE.to_string()))
    }

    /// Advance the duration estimator for every task still waiting on its
    /// first real progress frame.
    ///
    /// Returns the synthetic updates that raised a task's progress. These are
    /// not added to the task's history.
    pub fn tick_estimates(&mut self, now: DateTime<Utc>) -> Vec<ProgressUpdate> {
        let mut updates = Vec::new();
        for record in self.tasks.values_mut() {
            if record.is_terminal() || record.estimator != EstimatorState::Active {
                continue;
            }

            let elapsed = record.elapsed_secs(now);
            let estimate = (elapsed / record.estimated_duration_secs * 100.0)
                .min(MAX_ESTIMATED_PROGRESS);
            if estimate <= record.progress {
                continue;
            }

            record.progress = clamp_progress(estimate);
            record.estimated_time_remaining_secs =
                Some((record.estimated_duration_secs - elapsed).max(0.0));
            updates.push(record.snapshot(now, true));
        }
        updates
    }

    /// Evict one task. Returns the removed record.
    pub fn remove_progress(&mut self, task_id: &str) -> Option<TaskRecord> {
        let removed = self.tasks.remove(task_id);
        if removed.is_some() {
            debug!(task_id = %task_id, "Task record removed");
        }
        removed
    }

    pub fn clear_all(&mut self) {
        debug!("Clearing {} task record(s)", self.tasks.len());
        self.tasks.clear();
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskRecord> {
        self.tasks.get(task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Every record, oldest first.
    pub fn all(&self) -> Vec<&TaskRecord> {
        let mut records: Vec<_> = self.tasks.values().collect();
        records.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Records that have not reached a terminal status, oldest first.
    pub fn active(&self) -> Vec<&TaskRecord> {
        self.all().into_iter().filter(|r| !r.is_terminal()).collect()
    }

    pub fn statistics(&self) -> TaskStatistics {
        let mut stats = TaskStatistics {
            total_tasks: self.tasks.len(),
            ..Default::default()
        };
        let mut completion_total = 0.0;

        for record in self.tasks.values() {
            match record.status {
                TaskStatus::Pending => stats.pending_tasks += 1,
                TaskStatus::Running => stats.running_tasks += 1,
                TaskStatus::Completed => {
                    stats.completed_tasks += 1;
                    completion_total += record.duration_secs().unwrap_or(0.0);
                }
                TaskStatus::Error => stats.failed_tasks += 1,
            }
        }

        if stats.completed_tasks > 0 {
            stats.average_completion_time_secs = completion_total / stats.completed_tasks as f64;
        }
        stats
    }
}

/// ETA from the backend's own estimate, else extrapolated from its elapsed
/// time, else linear against the estimated duration.
fn remaining_secs(record: &TaskRecord, progress: f64, timing: Timing, now: DateTime<Utc>) -> Option<f64> {
    if let Some(remaining) = timing.estimated_time.filter(|s| s.is_finite()) {
        return Some(remaining.max(0.0));
    }
    if progress >= 100.0 {
        return Some(0.0);
    }
    if progress > 0.0 {
        let elapsed = timing
            .elapsed_time
            .filter(|s| s.is_finite())
            .unwrap_or_else(|| record.elapsed_secs(now));
        return Some((elapsed * (100.0 - progress) / progress).max(0.0));
    }
    Some((record.estimated_duration_secs - record.elapsed_secs(now)).max(0.0))
}
