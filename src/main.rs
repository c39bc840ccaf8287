//! hydrotrack - command-line calculation tracker
//!
//! Connects to the backend, tracks the task ids given on the command line and
//! logs their progress until every one of them finishes.
//!
//! ```text
//! hydrotrack [--config <file.json>] <task-id>...
//! ```

use anyhow::{bail, Context};
use hydrotrack::{
    CalculationTracker, ConnectError, EventHandlers, EventKind, TrackerConfig, TrackerEvent,
};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

enum Outcome {
    Finished(String),
    ConnectionLost(u32),
}

struct Args {
    config: Option<PathBuf>,
    task_ids: Vec<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config = None;
    let mut task_ids = Vec::new();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config requires a path")?;
                config = Some(PathBuf::from(path));
            }
            flag if flag.starts_with('-') => bail!("Unknown option: {}", flag),
            _ => task_ids.push(arg),
        }
    }

    if task_ids.is_empty() {
        bail!("Usage: hydrotrack [--config <file.json>] <task-id>...");
    }
    Ok(Args { config, task_ids })
}

fn handlers(outcomes: mpsc::UnboundedSender<Outcome>) -> EventHandlers {
    EventHandlers::new()
        .on_progress_update(|update| {
            info!(
                task_id = %update.task_id,
                stage = %update.stage,
                eta_secs = update.eta_secs.unwrap_or(-1.0),
                "{:5.1}% {}",
                update.progress,
                update.message
            );
        })
        .on_progress_estimated(|update| {
            debug!(task_id = %update.task_id, "~{:.0}% (estimated)", update.progress);
        })
        .on_calculation_complete(|task_id, result| {
            info!(task_id = %task_id, "Calculation complete: {}", result);
        })
        .on_calculation_error(|error| {
            warn!(
                code = %error.code,
                severity = %error.severity,
                "{} {}",
                error.user_message,
                error.suggestion
            );
        })
        .on_connection_state_change(|from, to| {
            info!("Connection {} -> {}", from, to);
        })
        .on_task_status_update(|task_id, status| {
            info!(task_id = task_id.unwrap_or("-"), "Task status: {}", status);
        })
        .on_many(
            &[
                EventKind::TaskCompleted,
                EventKind::TaskFailed,
                EventKind::ConnectionLost,
            ],
            move |event| {
                let outcome = match event {
                    TrackerEvent::TaskCompleted { task_id, .. } => Outcome::Finished(task_id.clone()),
                    TrackerEvent::TaskFailed { task_id, error } => {
                        error!(task_id = %task_id, "Task failed: {}", error);
                        Outcome::Finished(task_id.clone())
                    }
                    TrackerEvent::ConnectionLost { attempts } => Outcome::ConnectionLost(*attempts),
                    _ => return,
                };
                let _ = outcomes.send(outcome);
            },
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hydrotrack=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;

    // Load configuration
    let config = match &args.config {
        Some(path) => TrackerConfig::from_file(path)?,
        None => TrackerConfig::from_env()?,
    };
    info!(
        "Loaded configuration: url={} heartbeat={}ms reconnect={}ms x{}",
        config.connection.url,
        config.connection.heartbeat_interval_ms,
        config.connection.reconnect_interval_ms,
        config.connection.max_reconnect_attempts
    );

    let (outcomes_tx, mut outcomes) = mpsc::unbounded_channel();
    let tracker = CalculationTracker::builder(config)
        .handlers(handlers(outcomes_tx))
        .build();

    for task_id in &args.task_ids {
        tracker.track(task_id, None);
    }

    match tracker.connect().await {
        Ok(()) => {}
        Err(e @ ConnectError::InvalidEndpoint(_)) => return Err(e.into()),
        Err(e) => warn!("Initial connection failed: {}. Retrying in the background.", e),
    }

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break Ok(());
            }
            outcome = outcomes.recv() => match outcome {
                Some(Outcome::Finished(task_id)) => {
                    let remaining = tracker.active_tasks().len();
                    info!(task_id = %task_id, remaining, "Task finished");
                    if remaining == 0 {
                        break Ok(());
                    }
                }
                Some(Outcome::ConnectionLost(attempts)) => {
                    break Err(anyhow::anyhow!(
                        "Connection lost after {} reconnect attempts",
                        attempts
                    ));
                }
                None => break Ok(()),
            },
        }
    };

    let stats = tracker.statistics();
    info!(
        completed = stats.tasks.completed_tasks,
        failed = stats.tasks.failed_tasks,
        errors = stats.errors.total,
        "Average completion time: {:.1}s",
        stats.tasks.average_completion_time_secs
    );
    tracker.destroy();

    result
}
