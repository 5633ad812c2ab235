//! Port traits implemented by infrastructure crates.
//!
//! | Trait | Implemented by |
//! |-------|----------------|
//! | [`FollowersApi`] | `github::GithubFollowersClient` |
//! | [`CheckpointStore`] | `checkpoint::JsonFileStore`, [`crate::InMemoryCheckpointStore`] |
//! | [`Clock`] | [`SystemClock`] |
//!
//! All traits are dyn-compatible so the composition root can hold them as
//! `Arc<dyn ...>`.

use async_trait::async_trait;

use crate::{
    AccessToken, CheckpointError, FetchError, FollowerSet, FollowersPage, PageCursor,
    RateLimitSnapshot, RepositoryName, Timestamp,
};

/// A paginated, rate-limited list endpoint keyed by repository name.
#[async_trait]
pub trait FollowersApi: Send + Sync {
    /// Fetches one page of followers for `repository`, authenticated by `token`.
    ///
    /// # Errors
    ///
    /// - [`FetchError::RateLimited`] when the token's quota is exhausted.
    /// - [`FetchError::NotFound`] when the entity no longer exists.
    /// - [`FetchError::Unauthorized`] when the token is rejected.
    /// - [`FetchError::Transient`] for anything worth retrying.
    async fn followers_page(
        &self,
        repository: &RepositoryName,
        token: &AccessToken,
        page: PageCursor,
    ) -> Result<FollowersPage, FetchError>;

    /// Reports the token's current quota without consuming it.
    ///
    /// Returns `Ok(None)` when the API offers no quota endpoint; the quota is then
    /// learned from the first real response.
    async fn quota(&self, _token: &AccessToken) -> Result<Option<RateLimitSnapshot>, FetchError> {
        Ok(None)
    }
}

/// Source of wall-clock time for quota-reset decisions.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> Timestamp;
}

/// [`Clock`] backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Durable mapping from repository name to its follower set.
///
/// Implementations must uphold two guarantees:
///
/// - A key, once present, is never overwritten.
/// - When [`CheckpointStore::put`] returns `Ok`, the entry survives a crash.
///
/// Concurrent puts for different keys must not corrupt each other.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns `true` if `name` has been recorded.
    fn contains(&self, name: &RepositoryName) -> bool;

    /// Returns the recorded followers for `name`, if any.
    fn get(&self, name: &RepositoryName) -> Option<FollowerSet>;

    /// Number of recorded repositories.
    fn len(&self) -> usize;

    /// Returns `true` if nothing has been recorded.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records `followers` for `name` durably.
    ///
    /// Returns `Ok(false)` without touching the stored value if `name` is
    /// already present.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Write`] if the entry could not be persisted;
    /// the store is then unchanged.
    async fn put(&self, name: &RepositoryName, followers: FollowerSet)
        -> Result<bool, CheckpointError>;
}
