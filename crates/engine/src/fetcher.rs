//! Paginated fetcher: walks every page of one repository's follower list.

use std::sync::Arc;

use indexer::{
    CredentialLease, CredentialPool, FetchError, FollowerSet, FollowersApi, PageCursor,
    RepositoryName,
};

/// Collects all pages of a follower list on a single credential.
///
/// Every request is counted against the credential in the pool before it is
/// sent, and the quota reported with each page replaces the local count.
#[derive(Clone)]
pub struct PaginatedFetcher {
    api: Arc<dyn FollowersApi>,
    pool: Arc<CredentialPool>,
    max_pages: u32,
}

impl PaginatedFetcher {
    /// Creates a fetcher that gives up after `max_pages` pages.
    pub fn new(api: Arc<dyn FollowersApi>, pool: Arc<CredentialPool>, max_pages: u32) -> Self {
        Self {
            api,
            pool,
            max_pages,
        }
    }

    /// Fetches every page for `repository` using `lease`, concatenated in order.
    ///
    /// Stops at the first empty page or the first page without a successor.
    /// Results from earlier pages are discarded on any error, so callers never
    /// see a partial set.
    ///
    /// # Errors
    ///
    /// Propagates the first [`FetchError`] from the API. Exceeding the page
    /// limit, or a next-page pointer that does not move forward, is reported
    /// as [`FetchError::Transient`].
    pub async fn fetch(
        &self,
        repository: &RepositoryName,
        lease: &CredentialLease,
    ) -> Result<FollowerSet, FetchError> {
        let mut followers = FollowerSet::empty();
        let mut cursor = PageCursor::first();
        let mut pages = 0u32;

        loop {
            if pages >= self.max_pages {
                return Err(FetchError::transient(format!(
                    "pagination exceeded {} pages",
                    self.max_pages
                )));
            }

            self.pool.record_request(lease.id());
            let page = self
                .api
                .followers_page(repository, lease.token(), cursor)
                .await?;
            pages += 1;

            if let Some(snapshot) = &page.rate_limit {
                self.pool.observe(lease.id(), snapshot);
            }

            if page.followers.is_empty() {
                break;
            }
            followers.extend_page(page.followers);

            match page.next {
                None => break,
                Some(next) if next > cursor => cursor = next,
                Some(next) => {
                    return Err(FetchError::transient(format!(
                        "next page {next} does not follow page {cursor}"
                    )));
                }
            }
        }

        tracing::debug!(
            repository = %repository,
            pages,
            followers = followers.len(),
            "Fetched follower list"
        );
        Ok(followers)
    }
}
