//! Error types for the challenge instance control plane

use std::time::Duration;

use thiserror::Error;

/// Result type for control-plane operations
pub type ControlResult<T> = Result<T, ControlError>;

/// A single schema constraint violation, located by dot/index path
/// (e.g. `components[0].image`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// Dot/index path to the offending value (empty string = document root)
    pub path: String,
    /// The schema constraint that was violated
    pub constraint: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "<root>: {}", self.constraint)
        } else {
            write!(f, "{}: {}", self.path, self.constraint)
        }
    }
}

/// Errors that can occur in the control plane
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Schema validation failed: {}", format_violations(.violations))]
    SchemaValidation { violations: Vec<SchemaViolation> },

    #[error("Unknown challenge type '{name}': {message}")]
    UnknownChallengeType { name: String, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {}s waiting for {what}", waited.as_secs())]
    Timeout { what: String, waited: Duration },

    #[error("Rate limit exceeded, retry in {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),
}

fn format_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ControlError {
    /// All violations carried by a `SchemaValidation` error, empty otherwise.
    pub fn violations(&self) -> &[SchemaViolation] {
        match self {
            ControlError::SchemaValidation { violations } => violations,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for ControlError {
    fn from(err: serde_yaml::Error) -> Self {
        ControlError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for ControlError {
    fn from(err: reqwest::Error) -> Self {
        ControlError::Network(err.to_string())
    }
}

impl From<tokio_postgres::Error> for ControlError {
    fn from(err: tokio_postgres::Error) -> Self {
        ControlError::Store(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for ControlError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        ControlError::Store(err.to_string())
    }
}

impl From<deadpool_postgres::CreatePoolError> for ControlError {
    fn from(err: deadpool_postgres::CreatePoolError) -> Self {
        ControlError::Store(err.to_string())
    }
}
