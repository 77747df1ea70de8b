//! Error taxonomy for the coordination layer.
//!
//! Adapters report failures as [`DbError`] values carrying an
//! [`ErrorKind`]; everything above the `DatabaseClient` boundary moves
//! through `anyhow::Error` and is classified by walking the cause chain
//! (see [`crate::classify`]).

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// Classification of a driver-reported failure.
///
/// Only the first three kinds are ever eligible for retry; anything the
/// driver cannot pin down lands in [`ErrorKind::Other`] and is surfaced
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The database could not serialize the transaction under the active
    /// isolation level and asked for a restart.
    SerializationFailure,
    /// A mutual lock wait was broken by aborting this participant.
    Deadlock,
    /// An insert or update would duplicate a uniqueness constraint.
    UniqueViolation,
    /// Anything unmatched. Never retried.
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::SerializationFailure => "serialization failure",
            ErrorKind::Deadlock => "deadlock",
            ErrorKind::UniqueViolation => "unique violation",
            ErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// A failure surfaced through the [`DatabaseClient`](crate::DatabaseClient)
/// boundary.
///
/// Adapters construct these with a classification already applied, so the
/// retry machinery needs no driver-specific knowledge.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct DbError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl DbError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Like [`DbError::new`], keeping the driver error as the cause.
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Raised when a unique violation keeps recurring past the configured
/// retry budget.
///
/// The last driver-reported error is preserved and reachable through
/// [`RetryLimitExceeded::cause`] (or `downcast` from the `anyhow::Error`
/// returned to the caller).
#[derive(Debug, Error)]
#[error("unique violation persisted after {attempts} attempts (retry limit {limit}): {cause}")]
pub struct RetryLimitExceeded {
    limit: u32,
    attempts: u32,
    cause: anyhow::Error,
}

impl RetryLimitExceeded {
    pub(crate) fn new(limit: u32, attempts: u32, cause: anyhow::Error) -> Self {
        Self {
            limit,
            attempts,
            cause,
        }
    }

    /// The configured `max_unique_retries` that was exhausted.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Total attempts made, including the first one.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The original error from the final attempt.
    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    pub fn into_cause(self) -> anyhow::Error {
        self.cause
    }
}
