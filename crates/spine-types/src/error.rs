use serde::{Deserialize, Serialize};

/// The error taxonomy surfaced to callers and stored in `error.category`
/// on executions, schedule runs, and alert deliveries (§7).
///
/// `validation` and `not_found` never retry. `conflict` is returned
/// synchronously (idempotency hit, lock held) and also never retries.
/// `transient` is the only category the dispatcher, work-item queue, and
/// alert bus schedule a retry for; `timeout` and `permanent` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Conflict,
    Dependency,
    Timeout,
    Transient,
    Permanent,
}

impl ErrorCategory {
    /// Whether a failure in this category is a retry candidate per §4.3.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }

    /// The HTTP-shaped status code an external API layer maps this to (§7).
    /// Market Spine does not ship an HTTP framework; this exists so a caller
    /// wrapping the core in one reproduces the documented mapping exactly.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorCategory::Validation => 400,
            ErrorCategory::NotFound => 404,
            ErrorCategory::Conflict => 409,
            ErrorCategory::Timeout => 504,
            ErrorCategory::Dependency | ErrorCategory::Transient | ErrorCategory::Permanent => 500,
        }
    }
}

/// A classified, user-facing error. Component crates define their own
/// `thiserror` enums internally and convert into this at the crate boundary,
/// so every caller of `spine-core` sees the same shape regardless of which
/// component raised it.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{category:?}: {message}")]
pub struct SpineError {
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

impl SpineError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Conflict, message)
    }
}
