//! In-memory [`CheckpointStore`], for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::{CheckpointError, CheckpointStore, FollowerSet, RepositoryName};

/// A [`CheckpointStore`] that keeps everything in a map and forgets it on drop.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    entries: RwLock<BTreeMap<RepositoryName, FollowerSet>>,
    fail_writes: AtomicBool,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `entries`.
    pub fn with_entries(entries: impl IntoIterator<Item = (RepositoryName, FollowerSet)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent [`CheckpointStore::put`] fail with
    /// [`CheckpointError::Write`] (or succeed again when `fail` is `false`).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns a copy of every recorded entry, ordered by name.
    pub fn snapshot(&self) -> BTreeMap<RepositoryName, FollowerSet> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    fn contains(&self, name: &RepositoryName) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    fn get(&self, name: &RepositoryName) -> Option<FollowerSet> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn put(
        &self,
        name: &RepositoryName,
        followers: FollowerSet,
    ) -> Result<bool, CheckpointError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CheckpointError::Write {
                location: "memory".to_string(),
                message: "writes disabled".to_string(),
            });
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(name) {
            return Ok(false);
        }
        entries.insert(name.clone(), followers);
        Ok(true)
    }
}
