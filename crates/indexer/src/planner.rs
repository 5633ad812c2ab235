//! Work planning: what is left to do given what has already been recorded.

use crate::{CheckpointStore, RepositoryRecord};

/// Counts reported before a run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    /// Records in the input list.
    pub total: usize,
    /// Repositories already present in the checkpoint store.
    pub completed: usize,
    /// Records still to process.
    pub remaining: usize,
}

/// The ordered units of work for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkPlan {
    /// Records not yet in the store, in input order.
    pub units: Vec<RepositoryRecord>,
    /// Summary figures for the pre-run report.
    pub stats: RunStats,
}

/// Returns every record of `all` whose name is not a key of `store`,
/// preserving the relative order of `all`.
///
/// Pure: reads the store, changes nothing.
pub fn plan(all: &[RepositoryRecord], store: &dyn CheckpointStore) -> WorkPlan {
    let units: Vec<RepositoryRecord> = all
        .iter()
        .filter(|record| !store.contains(&record.name))
        .cloned()
        .collect();

    let stats = RunStats {
        total: all.len(),
        completed: store.len(),
        remaining: units.len(),
    };

    WorkPlan { units, stats }
}
