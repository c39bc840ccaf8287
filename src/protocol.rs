//! Wire protocol for the calculation backend.
//!
//! Every frame in both directions is a JSON envelope:
//!
//! ```text
//! { "type": "<kind>", "data": { ... }, "timestamp": "<ISO-8601>" }
//! ```
//!
//! Outbound kinds are closed ([`OutboundMessage`]). Inbound kinds the client
//! does not recognize decode to [`InboundMessage::Unknown`] so callers can log
//! and drop them without failing the dispatch path.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid '{kind}' payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

/// The JSON envelope shared by every frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Accepts RFC 3339 as well as naive ISO-8601 timestamps (assumed UTC).
/// Anything unparseable falls back to the receipt time.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Frames the client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    SubscribeTask { task_id: String },
    UnsubscribeTask { task_id: String },
    GetTaskStatus { task_id: String },
    Ping,
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SubscribeTask { .. } => "subscribe_task",
            Self::UnsubscribeTask { .. } => "unsubscribe_task",
            Self::GetTaskStatus { .. } => "get_task_status",
            Self::Ping => "ping",
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::SubscribeTask { task_id }
            | Self::UnsubscribeTask { task_id }
            | Self::GetTaskStatus { task_id } => Some(task_id),
            Self::Ping => None,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let data = match self.task_id() {
            Some(task_id) => json!({ "task_id": task_id }),
            None => json!({}),
        };
        Envelope::new(self.kind(), data)
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&self.to_envelope())?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of a `progress_update` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    #[serde(default)]
    pub task_id: Option<String>,
    /// Percent complete; the registry clamps it to [0, 100]
    pub progress: f64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub stage: String,
    /// Backend's estimate of the remaining seconds
    #[serde(default)]
    pub estimated_time: Option<f64>,
    /// Seconds the backend has spent on the task so far
    #[serde(default)]
    pub elapsed_time: Option<f64>,
}

/// Frames the client understands.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ProgressUpdate(ProgressPayload),
    CalculationComplete { task_id: String, result: Value },
    CalculationError { task_id: String, error: Value },
    TaskStatus { task_id: Option<String>, status: Value },
    Subscribed { task_id: String },
    Pong,
    SystemStatus(Value),
    /// A `type` this client does not handle. Logged and dropped by consumers.
    Unknown { kind: String },
}

impl InboundMessage {
    pub fn kind(&self) -> &str {
        match self {
            Self::ProgressUpdate(_) => "progress_update",
            Self::CalculationComplete { .. } => "calculation_complete",
            Self::CalculationError { .. } => "calculation_error",
            Self::TaskStatus { .. } => "task_status",
            Self::Subscribed { .. } => "subscribed",
            Self::Pong => "pong",
            Self::SystemStatus(_) => "system_status",
            Self::Unknown { kind } => kind,
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub message: InboundMessage,
    pub timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TaskResultPayload {
    task_id: String,
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize)]
struct TaskErrorPayload {
    task_id: String,
    #[serde(default)]
    error: Value,
}

#[derive(Deserialize)]
struct TaskIdPayload {
    task_id: String,
}

/// Decode one text frame.
///
/// # Errors
/// `ProtocolError::Malformed` if the text is not an envelope, and
/// `ProtocolError::InvalidPayload` if a recognized kind carries a payload of
/// the wrong shape. Unrecognized kinds are not an error.
pub fn decode(text: &str) -> Result<InboundFrame, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let kind = envelope.kind.as_str();

    let message = match kind {
        "progress_update" => InboundMessage::ProgressUpdate(payload(kind, envelope.data)?),
        "calculation_complete" => {
            let p: TaskResultPayload = payload(kind, envelope.data)?;
            InboundMessage::CalculationComplete {
                task_id: p.task_id,
                result: p.result,
            }
        }
        "calculation_error" => {
            let p: TaskErrorPayload = payload(kind, envelope.data)?;
            InboundMessage::CalculationError {
                task_id: p.task_id,
                error: p.error,
            }
        }
        "task_status" => InboundMessage::TaskStatus {
            task_id: envelope
                .data
                .get("task_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            status: envelope.data,
        },
        "subscribed" => {
            let p: TaskIdPayload = payload(kind, envelope.data)?;
            InboundMessage::Subscribed { task_id: p.task_id }
        }
        "pong" => InboundMessage::Pong,
        "system_status" => InboundMessage::SystemStatus(envelope.data),
        other => InboundMessage::Unknown {
            kind: other.to_string(),
        },
    };

    Ok(InboundFrame {
        message,
        timestamp: envelope.timestamp,
    })
}

fn payload<T: for<'de> Deserialize<'de>>(kind: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}
