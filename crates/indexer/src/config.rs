//! Run configuration.
//!
//! [`IndexerConfig`] is constructed once by the composition root and handed to
//! the engine. Nothing in the core looks configuration up from the environment.

use std::time::Duration;

use crate::IndexerError;

/// Default cap on pages fetched for one repository.
pub const DEFAULT_MAX_PAGES: u32 = 10_000;

/// Bounded exponential back-off for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total fetch attempts per unit before it is abandoned for this run.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Jitter factor (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Back-off before retry number `retry` (1-based), without jitter.
    ///
    /// Doubles from `initial_backoff` and saturates at `max_backoff`.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// What to do when every credential has exhausted its quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Stop taking new work and report what remains.
    #[default]
    Halt,
    /// Sleep until the earliest known quota reset, if it is no further away
    /// than `max_wait`; halt otherwise.
    WaitForReset {
        /// Longest single wait the run will accept.
        max_wait: Duration,
    },
}

/// Everything the engine needs to know about how to run.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexerConfig {
    /// Transient-failure retry schedule.
    pub retry: RetryConfig,
    /// Behaviour when the credential pool is exhausted.
    pub wait: WaitPolicy,
    /// Upper bound on concurrent workers. The effective worker count is also
    /// bounded by the number of usable credentials.
    pub concurrency: usize,
    /// Guard against runaway pagination for one repository.
    pub max_pages: u32,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            wait: WaitPolicy::Halt,
            concurrency: 1,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

impl IndexerConfig {
    /// Checks the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.concurrency == 0 {
            return Err(IndexerError::configuration("concurrency must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(IndexerError::configuration("max attempts must be at least 1"));
        }
        if self.max_pages == 0 {
            return Err(IndexerError::configuration("max pages must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(IndexerError::configuration("jitter must be in [0, 1)"));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(IndexerError::configuration(
                "initial backoff must not exceed max backoff",
            ));
        }
        Ok(())
    }
}
