//! Run outcome reporting.

use indexer::{IndexerError, RepositoryName, RunId, RunStats, Timestamp};

/// Why a run stopped before the work plan was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// Every credential ran out of quota and the wait policy did not allow
    /// (or could not bound) a wait.
    CredentialsExhausted {
        /// The soonest quota reset, if any credential reported one.
        earliest_reset: Option<Timestamp>,
    },
    /// The stop signal fired.
    Cancelled,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CredentialsExhausted {
                earliest_reset: Some(reset),
            } => write!(f, "all credentials exhausted until {reset}"),
            Self::CredentialsExhausted {
                earliest_reset: None,
            } => f.write_str("all credentials exhausted"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// What one run of the engine did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Correlates this summary with the run's log events.
    pub run_id: RunId,
    /// Records in the input list.
    pub total: usize,
    /// Repositories recorded before this run started.
    pub already_completed: usize,
    /// Units in this run's work plan.
    pub planned: usize,
    /// Units fetched and recorded by this run.
    pub completed: usize,
    /// Units recorded with the empty sentinel because the entity is gone.
    pub not_found: usize,
    /// Planned units found already recorded when dequeued (duplicate input names).
    pub skipped: usize,
    /// Units abandoned for this run after exhausting their retry budget.
    /// They stay unrecorded and are planned again next run.
    pub failed: Vec<RepositoryName>,
    /// Units never attempted (or abandoned mid-fetch) because the run stopped.
    pub remaining: usize,
    /// Set when the run stopped early.
    pub halt: Option<HaltReason>,
}

impl RunSummary {
    pub(crate) fn new(run_id: RunId, stats: RunStats) -> Self {
        Self {
            run_id,
            total: stats.total,
            already_completed: stats.completed,
            planned: stats.remaining,
            completed: 0,
            not_found: 0,
            skipped: 0,
            failed: Vec::new(),
            remaining: 0,
            halt: None,
        }
    }

    /// Units that will be planned again on the next run.
    pub fn unprocessed(&self) -> usize {
        self.remaining + self.failed.len()
    }

    /// Units that reached the checkpoint store during this run.
    pub fn recorded(&self) -> usize {
        self.completed + self.not_found
    }
}

/// A run stopped by a fatal error, with what it recorded before stopping.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error}")]
pub struct RunFailure {
    /// Why the run stopped.
    pub error: IndexerError,
    /// Progress up to the failure; the failed unit counts as remaining.
    pub summary: RunSummary,
}
