// Error taxonomy for node-level failures
//
// Decision: NodeError is a value type (Clone + Serialize) so it can live inside
// task snapshots and routing state; it is never used to unwind across workflow
// boundaries.
// Decision: Raw executor messages are classified by an ordered rule table,
// first match wins, falling back to Execution.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a node-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed input; never retried
    Validation,
    /// Runtime failure in the underlying job; retryable
    Execution,
    /// Job or wait exceeded its time budget; retryable with backoff
    Timeout,
    /// Not enough capacity; rerouted to a fallback node instead of retried
    Resource,
    /// Unrecoverable failure; escalates immediately
    Critical,
    /// Job was cancelled; treated as a high-severity failure, never retried
    Cancelled,
}

/// Severity used by retry routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Ordered classification rules for raw executor messages
const MESSAGE_RULES: &[(&[&str], ErrorKind)] = &[
    (&["cancelled", "canceled", "aborted by user"], ErrorKind::Cancelled),
    (
        &["segmentation fault", "core dumped", "panicked", "fatal error"],
        ErrorKind::Critical,
    ),
    (
        &["invalid", "malformed", "unrecognized", "unknown parameter"],
        ErrorKind::Validation,
    ),
    (
        &[
            "out of memory",
            "oom-kill",
            "insufficient",
            "no gpu",
            "quota exceeded",
            "resource",
        ],
        ErrorKind::Resource,
    ),
    (&["timed out", "timeout", "deadline exceeded"], ErrorKind::Timeout),
];

impl ErrorKind {
    /// Severity associated with this kind
    pub fn severity(&self) -> Severity {
        match self {
            Self::Timeout => Severity::Low,
            Self::Execution => Severity::Medium,
            Self::Resource | Self::Cancelled => Severity::High,
            Self::Validation | Self::Critical => Severity::Critical,
        }
    }

    /// Whether a failure of this kind may be retried on the same node
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution | Self::Timeout)
    }

    /// Stable wire name (e.g. `EXECUTION_ERROR`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Execution => "EXECUTION_ERROR",
            Self::Timeout => "TIMEOUT_ERROR",
            Self::Resource => "RESOURCE_ERROR",
            Self::Critical => "CRITICAL_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Classify a raw error message
    pub fn classify_message(message: &str) -> Self {
        let normalized = message.to_lowercase();
        MESSAGE_RULES
            .iter()
            .find(|(needles, _)| needles.iter().any(|n| normalized.contains(n)))
            .map(|(_, kind)| *kind)
            .unwrap_or(Self::Execution)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of a single node or task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeError {
    /// Error category
    pub kind: ErrorKind,

    /// Human-readable message
    pub message: String,

    /// Additional details (exit code, stderr tail, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl NodeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Critical, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Build an error whose kind is inferred from the message text
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorKind::classify_message(&message), message)
    }

    /// Attach details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for NodeError {}

impl From<anyhow::Error> for NodeError {
    fn from(err: anyhow::Error) -> Self {
        Self::execution(err.to_string())
    }
}

/// Errors from observability sinks
#[derive(Debug, Error)]
pub enum SinkError {
    /// Receiving side of the sink is gone
    #[error("event sink closed")]
    Closed,

    /// Sink-specific failure
    #[error("event sink error: {0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Execution.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Resource.is_retryable());
        assert!(!ErrorKind::Critical.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_cancelled_is_high_severity() {
        assert_eq!(NodeError::cancelled("stop").severity(), Severity::High);
    }

    #[test]
    fn test_classify_message() {
        assert_eq!(
            ErrorKind::classify_message("Job timed out after 300s"),
            ErrorKind::Timeout
        );
        assert_eq!(
            ErrorKind::classify_message("CUDA: out of memory"),
            ErrorKind::Resource
        );
        assert_eq!(
            ErrorKind::classify_message("invalid mesh file"),
            ErrorKind::Validation
        );
        assert_eq!(
            ErrorKind::classify_message("Segmentation fault (core dumped)"),
            ErrorKind::Critical
        );
        assert_eq!(
            ErrorKind::classify_message("solver diverged at step 42"),
            ErrorKind::Execution
        );
    }

    #[test]
    fn test_classification_order_first_match_wins() {
        // Contains both a cancellation and a timeout keyword
        assert_eq!(
            ErrorKind::classify_message("cancelled while waiting: timeout"),
            ErrorKind::Cancelled
        );
    }

    #[test]
    fn test_node_error_display() {
        let err = NodeError::timeout("no answer");
        assert_eq!(err.to_string(), "TIMEOUT_ERROR: no answer");
    }

    #[test]
    fn test_from_anyhow() {
        let err: NodeError = anyhow::anyhow!("broker unreachable").into();
        assert_eq!(err.kind, ErrorKind::Execution);
        assert!(err.is_retryable());
    }
}
