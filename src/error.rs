use thiserror::Error;

/// Error type for find, fetch and evaluation operations.
///
/// Per-finder and per-leaf failures (`BackendUnavailable`, `ProtocolViolation`,
/// `DeadlineExceeded`) are recovered locally and attached to result sets; the
/// remaining variants abort the request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// A single finder or reader call failed.
    #[error("Backend unavailable: {backend}{}: {reason}", display_path(.path))]
    BackendUnavailable {
        backend: String,
        path: Option<String>,
        reason: String,
    },

    /// Every configured finder failed for one find query.
    #[error("No backends available for pattern {pattern:?}: {failures} finder(s) failed")]
    NoBackendsAvailable { pattern: String, failures: usize },

    /// A reader returned a value count inconsistent with its time info.
    #[error("Protocol violation for {path}: expected {expected} values, got {actual}")]
    ProtocolViolation {
        path: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A function was called in violation of its arity/type contract.
    #[error("Evaluation error in {function}: {reason}")]
    EvaluationError { function: String, reason: String },

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Invalid time range: start={start}, end={end}")]
    InvalidTimeRange { start: i64, end: i64 },

    #[error("Feature not implemented: {0}")]
    NotImplemented(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn display_path(path: &Option<String>) -> String {
    path.as_ref().map(|p| format!(" ({})", p)).unwrap_or_default()
}

impl QueryError {
    /// Shorthand used by function implementations.
    pub(crate) fn evaluation(function: &str, reason: impl Into<String>) -> Self {
        QueryError::EvaluationError {
            function: function.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true if the error must abort the whole request.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            QueryError::BackendUnavailable { .. }
                | QueryError::ProtocolViolation { .. }
                | QueryError::DeadlineExceeded(_)
        )
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for QueryError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        QueryError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_unavailable_display_includes_path_when_present() {
        let with_path = QueryError::BackendUnavailable {
            backend: "whisper".to_string(),
            path: Some("a.b".to_string()),
            reason: "timeout".to_string(),
        };
        assert_eq!(with_path.to_string(), "Backend unavailable: whisper (a.b): timeout");

        let without = QueryError::BackendUnavailable {
            backend: "whisper".to_string(),
            path: None,
            reason: "down".to_string(),
        };
        assert_eq!(without.to_string(), "Backend unavailable: whisper: down");
    }

    #[test]
    fn fatality_classification() {
        assert!(!QueryError::DeadlineExceeded("x".into()).is_fatal());
        assert!(!QueryError::ProtocolViolation {
            path: "a".into(),
            expected: 2,
            actual: 1
        }
        .is_fatal());
        assert!(QueryError::InvalidPattern {
            pattern: "a.{b".into(),
            reason: "unbalanced".into()
        }
        .is_fatal());
        assert!(QueryError::evaluation("sumSeries", "bad").is_fatal());
    }
}
