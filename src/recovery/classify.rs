//! Error classification.
//!
//! Turns raw failures (strings, backend payloads, Rust errors) into
//! [`ClassifiedError`]s with a category, severity and plain-language
//! messaging. Rules are ordered and deterministic: the same message with the
//! same context always classifies the same way.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::history::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Calculation,
    Network,
    System,
    File,
    Configuration,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 6] = [
        ErrorCategory::Validation,
        ErrorCategory::Calculation,
        ErrorCategory::Network,
        ErrorCategory::System,
        ErrorCategory::File,
        ErrorCategory::Configuration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Calculation => "calculation",
            Self::Network => "network",
            Self::System => "system",
            Self::File => "file",
            Self::Configuration => "configuration",
        }
    }

    /// Parse a category name as sent by the backend (case-insensitive).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|c| c.as_str() == raw)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Info and warning never block the workflow.
    pub fn is_blocking(&self) -> bool {
        *self >= Severity::Error
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum RawError {
    Message(String),
    /// Structured payload, e.g. the `error` field of a `calculation_error` frame
    Payload(Value),
}

impl RawError {
    pub fn from_error(error: &dyn std::error::Error) -> Self {
        RawError::Message(error.to_string())
    }

    /// Human-readable message carried by the raw error.
    pub fn message(&self) -> String {
        match self {
            RawError::Message(message) => message.clone(),
            RawError::Payload(Value::String(message)) => message.clone(),
            RawError::Payload(value) => ["message", "error", "detail", "reason"]
                .iter()
                .find_map(|key| value.get(key).and_then(Value::as_str))
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string()),
        }
    }

    /// Category declared by the payload itself, if any.
    fn declared_category(&self) -> Option<ErrorCategory> {
        match self {
            RawError::Payload(value) => ["category", "type"]
                .iter()
                .find_map(|key| value.get(key).and_then(Value::as_str))
                .and_then(ErrorCategory::parse),
            RawError::Message(_) => None,
        }
    }
}

impl From<&str> for RawError {
    fn from(message: &str) -> Self {
        RawError::Message(message.to_string())
    }
}

impl From<String> for RawError {
    fn from(message: String) -> Self {
        RawError::Message(message)
    }
}

impl From<Value> for RawError {
    fn from(value: Value) -> Self {
        RawError::Payload(value)
    }
}

/// Where an error happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub operation: Option<String>,
    pub task_id: Option<String>,
    /// Overrides keyword inference
    pub category_hint: Option<ErrorCategory>,
}

impl ErrorContext {
    pub fn operation(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Default::default()
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category_hint = Some(category);
        self
    }
}

/// The typed result of classifying a raw failure. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedError {
    pub id: Uuid,
    pub category: ErrorCategory,
    pub severity: Severity,
    /// Stable code, e.g. `NETWORK_TIMEOUT`
    pub code: String,
    /// Technical message; kept for logs and history
    pub message: String,
    pub user_message: String,
    pub suggestion: String,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
    pub context: ErrorContext,
}

impl ClassifiedError {
    pub fn task_id(&self) -> Option<&str> {
        self.context.task_id.as_deref()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rules
// ─────────────────────────────────────────────────────────────────────────────

/// Keyword rules, checked in order. The first match decides the category
/// and supplies the code tag.
const KEYWORD_RULES: &[(ErrorCategory, &str, &str)] = &[
    (ErrorCategory::Validation, r"validation|validate", "VALIDATION"),
    (ErrorCategory::Validation, r"\binvalid\b", "INVALID_INPUT"),
    (ErrorCategory::Validation, r"\brequired\b|missing field", "MISSING_FIELD"),
    (ErrorCategory::Validation, r"out of range|must be (positive|greater|less)", "OUT_OF_RANGE"),
    (ErrorCategory::Calculation, r"converg", "CONVERGENCE"),
    (ErrorCategory::Calculation, r"solver", "SOLVER"),
    (ErrorCategory::Calculation, r"singular", "SINGULAR_MATRIX"),
    (ErrorCategory::Calculation, r"diverg", "DIVERGENCE"),
    (ErrorCategory::Calculation, r"iteration", "ITERATION_LIMIT"),
    (ErrorCategory::Calculation, r"calculation|computation", "CALCULATION"),
    (ErrorCategory::Network, r"timeout|timed out", "TIMEOUT"),
    (ErrorCategory::Network, r"connection|connect\b", "CONNECTION"),
    (ErrorCategory::Network, r"unreachable|\bdns\b|\bhost\b", "UNREACHABLE"),
    (ErrorCategory::Network, r"network|socket|http", "NETWORK"),
    (ErrorCategory::File, r"permission denied|access denied", "PERMISSION_DENIED"),
    (ErrorCategory::File, r"no such file|file not found", "NOT_FOUND"),
    (ErrorCategory::File, r"\bfile\b|directory|\bpath\b", "FILE_ACCESS"),
    (ErrorCategory::Configuration, r"config|setting|parameter", "CONFIGURATION"),
];

const CRITICAL_PATTERN: &str = r"\b(critical|fatal)\b";
const BENIGN_NOT_FOUND_PATTERN: &str = r"not found|\b404\b|no such file|does not exist";
const FATAL_SYSTEM_PATTERN: &str = r"out of memory|unrecoverable|corrupt|panic";

struct Rules {
    keywords: Vec<(ErrorCategory, Regex, &'static str)>,
    critical: Option<Regex>,
    benign_not_found: Option<Regex>,
    fatal_system: Option<Regex>,
}

fn case_insensitive(pattern: &str) -> Option<Regex> {
    match Regex::new(&format!("(?i){}", pattern)) {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!("Skipping invalid classification pattern {:?}: {}", pattern, e);
            None
        }
    }
}

fn rules() -> &'static Rules {
    static RULES: OnceLock<Rules> = OnceLock::new();
    RULES.get_or_init(|| Rules {
        keywords: KEYWORD_RULES
            .iter()
            .filter_map(|(category, pattern, tag)| {
                case_insensitive(pattern).map(|regex| (*category, regex, *tag))
            })
            .collect(),
        critical: case_insensitive(CRITICAL_PATTERN),
        benign_not_found: case_insensitive(BENIGN_NOT_FOUND_PATTERN),
        fatal_system: case_insensitive(FATAL_SYSTEM_PATTERN),
    })
}

fn matches(regex: &Option<Regex>, message: &str) -> bool {
    regex.as_ref().is_some_and(|r| r.is_match(message))
}

fn infer_category(message: &str) -> (ErrorCategory, Option<&'static str>) {
    rules()
        .keywords
        .iter()
        .find(|(_, regex, _)| regex.is_match(message))
        .map(|(category, _, tag)| (*category, Some(*tag)))
        .unwrap_or((ErrorCategory::System, None))
}

/// Tag from the first keyword rule of `category` matching `message`.
fn tag_within(category: ErrorCategory, message: &str) -> Option<&'static str> {
    rules()
        .keywords
        .iter()
        .find(|(c, regex, _)| *c == category && regex.is_match(message))
        .map(|(_, _, tag)| *tag)
}

fn infer_severity(category: ErrorCategory, message: &str) -> Severity {
    let rules = rules();
    if matches(&rules.critical, message) {
        return Severity::Critical;
    }
    match category {
        ErrorCategory::System => Severity::Error,
        ErrorCategory::Validation | ErrorCategory::Configuration => Severity::Warning,
        ErrorCategory::Network | ErrorCategory::File => {
            if matches(&rules.benign_not_found, message) {
                Severity::Warning
            } else {
                Severity::Error
            }
        }
        ErrorCategory::Calculation => Severity::Error,
    }
}

fn infer_recoverable(category: ErrorCategory, severity: Severity, message: &str) -> bool {
    if severity == Severity::Critical {
        return false;
    }
    !(category == ErrorCategory::System && matches(&rules().fatal_system, message))
}

fn user_message(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Validation => "Some of the input data is invalid.",
        ErrorCategory::Calculation => "The calculation could not be completed.",
        ErrorCategory::Network => "The connection to the calculation server was interrupted.",
        ErrorCategory::System => "An unexpected system error occurred.",
        ErrorCategory::File => "A required file could not be read or written.",
        ErrorCategory::Configuration => "The calculation settings are incomplete or inconsistent.",
    }
}

fn suggestion(category: ErrorCategory, tag: Option<&str>) -> &'static str {
    match (category, tag) {
        (ErrorCategory::Calculation, Some("CONVERGENCE" | "DIVERGENCE" | "ITERATION_LIMIT")) => {
            "Increase the iteration limit or relax the convergence tolerance, then run again."
        }
        (ErrorCategory::Network, Some("TIMEOUT")) => {
            "The server is slow to respond. Wait a moment and try again."
        }
        (ErrorCategory::Validation, _) => "Check the highlighted fields and correct the values.",
        (ErrorCategory::Calculation, _) => "Review the network model for disconnected or inconsistent elements.",
        (ErrorCategory::Network, _) => "Check your network connection. The client reconnects automatically.",
        (ErrorCategory::System, _) => "Try again. If the problem persists, contact support.",
        (ErrorCategory::File, _) => "Check that the file exists and that you have access to it.",
        (ErrorCategory::Configuration, _) => "Review the calculation settings and fill in missing parameters.",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Classifier
// ─────────────────────────────────────────────────────────────────────────────

/// Totals over the error history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStatistics {
    pub total: usize,
    pub recoverable: usize,
    pub by_category: HashMap<ErrorCategory, usize>,
    pub by_severity: HashMap<Severity, usize>,
}

/// Classifies raw errors and keeps a bounded history of the results.
#[derive(Debug)]
pub struct ErrorClassifier {
    history: RingBuffer<ClassifiedError>,
}

impl ErrorClassifier {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history: RingBuffer::new(history_limit),
        }
    }

    /// Classify without recording.
    ///
    /// Category: context hint, then a category declared in the payload, then
    /// the first keyword rule that matches, then `system`.
    pub fn classify(raw: &RawError, context: ErrorContext) -> ClassifiedError {
        let message = raw.message();

        let (category, tag) = match context.category_hint.or_else(|| raw.declared_category()) {
            Some(category) => (category, tag_within(category, &message)),
            None => infer_category(&message),
        };
        let severity = infer_severity(category, &message);
        let recoverable = infer_recoverable(category, severity, &message);
        let code = format!(
            "{}_{}",
            category.as_str().to_ascii_uppercase(),
            tag.map(str::to_string)
                .unwrap_or_else(|| severity.as_str().to_ascii_uppercase())
        );

        ClassifiedError {
            id: Uuid::new_v4(),
            category,
            severity,
            code,
            message,
            user_message: user_message(category).to_string(),
            suggestion: suggestion(category, tag).to_string(),
            recoverable,
            timestamp: Utc::now(),
            context,
        }
    }

    /// Classify and append to the history.
    pub fn record(&mut self, raw: &RawError, context: ErrorContext) -> ClassifiedError {
        let classified = Self::classify(raw, context);
        debug!(
            code = %classified.code,
            severity = %classified.severity,
            recoverable = classified.recoverable,
            task_id = classified.task_id().unwrap_or(""),
            "Classified error: {}",
            classified.message
        );
        self.history.push(classified.clone());
        classified
    }

    /// Newest `limit` errors, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ClassifiedError> {
        self.history.recent(limit).cloned().collect()
    }

    pub fn by_category(&self, category: ErrorCategory) -> Vec<ClassifiedError> {
        self.history
            .iter()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }

    pub fn statistics(&self) -> ErrorStatistics {
        let mut stats = ErrorStatistics {
            total: self.history.len(),
            ..Default::default()
        };
        for error in self.history.iter() {
            *stats.by_category.entry(error.category).or_default() += 1;
            *stats.by_severity.entry(error.severity).or_default() += 1;
            if error.recoverable {
                stats.recoverable += 1;
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}
