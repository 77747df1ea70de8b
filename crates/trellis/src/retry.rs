//! Retry classification and decision engine.
//!
//! A failed unit of work (a whole begin→body→commit sequence or a single
//! standalone statement) is classified by [`classify`] and then judged by
//! [`RetryState::next`]:
//!
//! - any open enclosing transaction disables retry unconditionally —
//!   replaying while nested would re-issue statements the enclosing
//!   scope already sent;
//! - at depth zero, serialization failures and deadlocks retry without
//!   bound (nothing is durable yet);
//! - at depth zero, unique violations retry until the configured budget
//!   is spent, then fail with [`RetryLimitExceeded`] wrapping the
//!   original error;
//! - everything else propagates unchanged.
//!
//! Only unique violations consume the budget, so an interleaved deadlock
//! never shortens a unique-key race's allowance.

use crate::config::Config;
use crate::error::{DbError, ErrorKind, RetryLimitExceeded};

/// Classify an error by the [`DbError`] buried in its cause chain.
///
/// Errors with no `DbError` anywhere in the chain — application errors
/// raised from a transaction body, for instance — come back as
/// [`ErrorKind::Other`] and are never retried.
pub fn classify(error: &anyhow::Error) -> ErrorKind {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<DbError>())
        .map(DbError::kind)
        .unwrap_or(ErrorKind::Other)
}

/// Outcome of consulting the retry policy for one failure.
pub(crate) enum Step {
    /// Run the unit of work again.
    Retry,
    /// Give up with this error (the original, or the budget wrapper).
    Fail(anyhow::Error),
}

/// Per-call retry accounting. Ephemeral: one instance lives for one
/// `run_with_retry`/`run_transaction` invocation and is never persisted.
pub(crate) struct RetryState {
    unique_attempts: u32,
}

impl RetryState {
    pub(crate) fn new() -> Self {
        Self { unique_attempts: 0 }
    }

    /// Decide what to do about `error`, with `depth` read at the moment
    /// of failure.
    pub(crate) fn next(&mut self, error: anyhow::Error, depth: u32, config: &Config) -> Step {
        let kind = classify(&error);
        if depth > 0 {
            return Step::Fail(error);
        }
        match kind {
            ErrorKind::SerializationFailure | ErrorKind::Deadlock => {
                tracing::warn!(reason = %kind, "transaction rollback condition detected, retrying");
                Step::Retry
            }
            ErrorKind::UniqueViolation => {
                if self.unique_attempts < config.max_unique_retries {
                    self.unique_attempts += 1;
                    tracing::warn!(
                        reason = %kind,
                        retry = self.unique_attempts,
                        "transaction rollback condition detected, retrying"
                    );
                    Step::Retry
                } else {
                    Step::Fail(anyhow::Error::new(RetryLimitExceeded::new(
                        config.max_unique_retries,
                        self.unique_attempts + 1,
                        error,
                    )))
                }
            }
            ErrorKind::Other => Step::Fail(error),
        }
    }
}
