//! # hydrotrack
//!
//! Real-time tracking of long-running hydraulic-network calculations.
//!
//! This library provides:
//! - A persistent WebSocket connection with heartbeat, reconnection and
//!   resubscription of tracked tasks
//! - A task registry holding progress, status, history and duration estimates
//! - Error classification and strategy-driven recovery
//! - Typed events routed to replaceable presentation handlers
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │       CalculationTracker         │
//!        │  (registry, classifier, events)  │
//!        └────────────────┬─────────────────┘
//!                         │
//!                         ▼
//!                ┌─────────────────┐
//!                │   Connection    │──── driver task (socket + timers)
//!                └────────┬────────┘
//!                         │
//!                         ▼
//!                ┌─────────────────┐
//!                │   Calculation   │
//!                │   backend       │
//!                └─────────────────┘
//! ```
//!
//! ## Task Flow
//! 1. `track(id)` registers the task and subscribes to it
//! 2. Progress frames update the registry and raise progress events
//! 3. Error frames are classified; recoverable ones go through recovery
//! 4. Completion or unrecoverable failure makes the task terminal and
//!    unsubscribes it
//!
//! ## Modules
//! - `connection`: connection state machine, driver and transports
//! - `protocol`: wire envelope and message types
//! - `registry`: per-task tracking state
//! - `recovery`: error taxonomy and recovery engine
//! - `events`: tracker events and dispatcher
//! - `tracker`: the context object tying it together

pub mod config;
pub mod connection;
pub mod events;
pub mod history;
pub mod protocol;
pub mod recovery;
pub mod registry;
pub mod tracker;

pub use config::{ConfigError, ConnectionConfig, RecoveryConfig, RegistryConfig, TrackerConfig};
pub use connection::{ConnectError, Connection, ConnectionHandler, ConnectionState};
pub use events::{EventDispatcher, EventHandlers, EventKind, TrackerEvent};
pub use protocol::{InboundMessage, OutboundMessage, ProtocolError};
pub use recovery::{ClassifiedError, ErrorCategory, ErrorClassifier, ErrorContext, RawError, Severity};
pub use registry::{ProgressUpdate, TaskRecord, TaskRegistry, TaskStatistics, TaskStatus};
pub use tracker::{CalculationTracker, TrackerBuilder, TrackerStatistics};
