//! Error types for Herald
//!
//! Defines a single error enum covering every failure mode of the scheduler,
//! the tenant store and the two external collaborators (content source and
//! destination). Uses thiserror for ergonomic error handling.

use crate::source::retry::{RetryDecision, RetryableError};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for Herald operations
pub type Result<T> = std::result::Result<T, HeraldError>;

/// Comprehensive error type for Herald operations
#[derive(Error, Debug)]
pub enum HeraldError {
    /// Process configuration errors (config file, environment)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tenant configuration is incomplete or inconsistent
    #[error("Invalid tenant configuration: {0}")]
    Validation(String),

    /// Tenant does not exist in the store
    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    /// Content source unreachable, timed out or returned garbage
    #[error("Content source error: {0}")]
    Source(String),

    /// Content source rejected the credential
    #[error("Content source rejected the credential: {0}")]
    InvalidCredential(String),

    /// Destination unreachable or returned a server error
    #[error("Destination error: {0}")]
    Destination(String),

    /// Destination refused the send for lack of permissions
    #[error("Permission denied on destination: {0}")]
    PermissionDenied(String),

    /// Rate limited (with retry-after duration)
    #[error("Rate limited, retry after {} seconds", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// An external call exceeded its deadline
    #[error("Timed out after {} seconds: {operation}", .after.as_secs())]
    Timeout { operation: String, after: Duration },

    /// Storage errors that are not raw SQLite errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

/// Coarse classification used by the scheduler to decide what a failure means
/// for the rest of the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Tenant incomplete or inconsistent: skip, surface to admins
    Configuration,
    /// Content source trouble: skip this tenant for this cycle
    TransientSource,
    /// Destination trouble: skip this item, leave its watermark alone
    TransientDestination,
    /// Store unavailable: abort the remaining writes of the cycle
    Persistence,
    /// Anything that should stop the process at startup
    Fatal,
}

impl ErrorKind {
    /// Label for metrics and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::TransientSource => "transient_source",
            ErrorKind::TransientDestination => "transient_destination",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl HeraldError {
    /// Classify this error for the scheduler's propagation policy
    pub fn kind(&self) -> ErrorKind {
        match self {
            HeraldError::Validation(_) | HeraldError::TenantNotFound(_) => {
                ErrorKind::Configuration
            }
            HeraldError::Source(_) | HeraldError::InvalidCredential(_) | HeraldError::Http(_) => {
                ErrorKind::TransientSource
            }
            HeraldError::Destination(_)
            | HeraldError::PermissionDenied(_)
            | HeraldError::RateLimited { .. } => ErrorKind::TransientDestination,
            HeraldError::Timeout { .. } => ErrorKind::TransientSource,
            HeraldError::Storage(_) | HeraldError::Database(_) => ErrorKind::Persistence,
            HeraldError::Config(_)
            | HeraldError::Io(_)
            | HeraldError::Json(_)
            | HeraldError::Yaml(_)
            | HeraldError::Other(_) => ErrorKind::Fatal,
        }
    }

    /// Shorthand for a timeout on a named operation
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        HeraldError::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

impl RetryableError for HeraldError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            HeraldError::Source(_) | HeraldError::Destination(_) => RetryDecision::Retry,
            HeraldError::Timeout { .. } => RetryDecision::Retry,
            HeraldError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    RetryDecision::Retry
                } else if let Some(status) = e.status() {
                    match status.as_u16() {
                        429 => RetryDecision::RetryAfter(Duration::from_secs(60)),
                        500..=599 => RetryDecision::Retry,
                        _ => RetryDecision::NoRetry,
                    }
                } else {
                    RetryDecision::Retry
                }
            }
            HeraldError::RateLimited { retry_after } => RetryDecision::RetryAfter(*retry_after),
            _ => RetryDecision::NoRetry,
        }
    }
}
