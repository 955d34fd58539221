//! Error types for the Volume & Drive Queue Manager
//!
//! Every failure the scheduler can report maps onto one of a small set of
//! kinds (see [`ErrorKind`]). Operators act on the distinction directly, so
//! admin-facing variants stay specific ("no such drive" vs. "drive has an
//! active job").

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the scheduler
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    // =========================================================================
    // Optimistic Concurrency
    // =========================================================================
    #[error("Concurrent update lost on {record}")]
    Contended { record: String },

    // =========================================================================
    // Drive / Request Lifecycle Errors
    // =========================================================================
    #[error("Drive {drive} has an active job (request {request})")]
    ResourceBusy { drive: String, request: String },

    #[error("Duplicate mount request for volume {vid} from the same client")]
    DuplicateRequest { vid: String },

    #[error("Illegal drive status transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Drive daemon error: {0}")]
    Daemon(#[from] reqwest::Error),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error taxonomy shared with callers of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown drive, volume, device group or access specification
    NotFound,
    /// Optimistic-concurrency loss; recoverable by retry
    Contended,
    /// Delete of a drive with a bound request
    ResourceBusy,
    /// Unmapped state/enum, incompatible volume/mode, duplicate admission
    InvalidArgument,
    /// Persistence or connectivity failure
    Internal,
}

/// Action to take on error inside a scheduler loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Re-invoke straight away (lost optimistic race)
    RetryImmediately,
    /// Retry with exponential backoff
    RequeueWithBackoff,
    /// Retry after a fixed delay
    RequeueAfter(Duration),
    /// Don't retry, surface to the operator
    NoRequeue,
}

impl Error {
    /// Shorthand for a [`Error::NotFound`] error
    pub fn not_found(kind: &'static str, name: impl ToString) -> Self {
        Error::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    /// Shorthand for a [`Error::Contended`] error
    pub fn contended(record: impl ToString) -> Self {
        Error::Contended {
            record: record.to_string(),
        }
    }

    /// Project this error onto the scheduler's error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Contended { .. } => ErrorKind::Contended,
            Error::ResourceBusy { .. } => ErrorKind::ResourceBusy,
            Error::DuplicateRequest { .. }
            | Error::IllegalTransition { .. }
            | Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Internal(_)
            | Error::Configuration(_)
            | Error::Daemon(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Contended { .. } => ErrorAction::RetryImmediately,

            // Transient errors - retry with backoff
            Error::Daemon(_) | Error::Internal(_) | Error::Io(_) => {
                ErrorAction::RequeueWithBackoff
            }

            // Drive busy - the job may finish soon
            Error::ResourceBusy { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Caller mistakes - don't retry automatically
            Error::NotFound { .. }
            | Error::DuplicateRequest { .. }
            | Error::IllegalTransition { .. }
            | Error::InvalidArgument(_)
            | Error::Configuration(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::NoRequeue,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is a lost optimistic race
    pub fn is_contended(&self) -> bool {
        matches!(self, Error::Contended { .. })
    }
}

/// Result type alias for the scheduler
pub type Result<T> = std::result::Result<T, Error>;
