//! Coordinator configuration.

/// Tunables for one connection's coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// How many times a unique-violation failure is retried before it is
    /// converted into [`RetryLimitExceeded`](crate::RetryLimitExceeded).
    /// Serialization failures and deadlocks never count against this
    /// budget.
    pub max_unique_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_unique_retries: 5,
        }
    }
}
