//! Error types for the triage service.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Moderation service error: {0}")]
    Moderation(#[from] ModerationError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Triage error: {0}")]
    Triage(#[from] TriageError),
}

impl Error {
    /// Whether this error should stop the whole process.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Moderation(e) => e.is_fatal(),
            Self::Triage(e) => e.is_fatal(),
            Self::Config(_) => true,
            Self::Classifier(_) => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the moderation service capability.
#[derive(Debug, thiserror::Error)]
pub enum ModerationError {
    /// Credentials or session rejected. Fatal to the process.
    #[error("Authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// Subject, record or profile no longer exists.
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Timeouts, connection failures, 5xx responses.
    #[error("Transient failure calling {method}: {reason}")]
    Transient { method: String, reason: String },

    /// Any other non-success response.
    #[error("{method} rejected with status {status}: {reason}")]
    Rejected {
        method: String,
        status: u16,
        reason: String,
    },

    #[error("Invalid response from {method}: {reason}")]
    InvalidResponse { method: String, reason: String },

    #[error("Dispatcher is closed")]
    DispatcherClosed,
}

impl ModerationError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthFailed { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// External policy classifier errors.
///
/// Never fatal: callers treat any of these as "no categories found".
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Classifier timed out after {0:?}")]
    Timeout(Duration),

    #[error("Classifier job ended with status {status}")]
    JobFailed { status: String },

    #[error("Classifier policy evaluation failed")]
    EvaluationFailed,

    #[error("Classifier returned no results")]
    NoResults,
}

/// A payload from the moderation service that is missing required fields.
///
/// Not retried: the same shape would recur on the next pass.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Malformed {kind} {id}: {reason}")]
pub struct ValidationError {
    pub kind: &'static str,
    pub id: i64,
    pub reason: String,
}

/// Per-item triage failures.
#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Moderation(#[from] ModerationError),
}

impl TriageError {
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Moderation(e) => e.is_fatal(),
            Self::Validation(_) => false,
        }
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
