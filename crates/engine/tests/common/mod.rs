//! Shared fixtures: a scripted followers API with per-token quotas and a
//! clock that follows tokio's (pausable) time.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use engine::IndexingEngine;
use indexer::{
    AccessToken, CheckpointStore, Clock, CredentialPool, FetchError, FollowerLogin, FollowerSet,
    FollowersApi, FollowersPage, IndexerConfig, PageCursor, RateLimitSnapshot, RepositoryName,
    RepositoryRecord, RetryConfig, Timestamp,
};

/// Wall-clock start of every test run.
pub fn epoch() -> Timestamp {
    Timestamp::from_unix_seconds(1_700_000_000).unwrap()
}

/// `epoch()` plus however much tokio time has elapsed since creation.
pub struct TestClock {
    origin: tokio::time::Instant,
}

impl TestClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: tokio::time::Instant::now(),
        })
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Timestamp {
        epoch().after(self.origin.elapsed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub repository: String,
    pub token: String,
    pub page: u32,
}

#[derive(Debug, Clone, Copy)]
struct Quota {
    limit: u32,
    remaining: u32,
    window: Duration,
    reset_at: Timestamp,
}

/// A followers API whose responses are scripted per repository.
///
/// - Repositories without pages answer `NotFound`.
/// - Scripted failures for a repository are returned (in order) before any page.
/// - Tokens with a quota answer `RateLimited` once it is spent, until the
///   window resets on the shared clock.
pub struct MockApi {
    clock: Arc<TestClock>,
    pages: Mutex<HashMap<String, Vec<Vec<String>>>>,
    failures: Mutex<HashMap<String, VecDeque<FetchError>>>,
    quotas: Mutex<HashMap<String, Quota>>,
    rejected: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockApi {
    pub fn new(clock: Arc<TestClock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            pages: Mutex::default(),
            failures: Mutex::default(),
            quotas: Mutex::default(),
            rejected: Mutex::default(),
            latency: Mutex::default(),
            calls: Mutex::default(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Serves `pages` for `repository`, one inner slice per page.
    pub fn with_pages(&self, repository: &str, pages: &[&[&str]]) -> &Self {
        let pages = pages
            .iter()
            .map(|page| page.iter().map(|s| s.to_string()).collect())
            .collect();
        self.pages
            .lock()
            .unwrap()
            .insert(repository.to_string(), pages);
        self
    }

    /// Queues `error` as the next answer for `repository`.
    pub fn with_failure(&self, repository: &str, error: FetchError) -> &Self {
        self.failures
            .lock()
            .unwrap()
            .entry(repository.to_string())
            .or_default()
            .push_back(error);
        self
    }

    /// Gives `token` `limit` calls per `window`, starting now.
    pub fn with_quota(&self, token: &str, limit: u32, window: Duration) -> &Self {
        self.quotas.lock().unwrap().insert(
            token.to_string(),
            Quota {
                limit,
                remaining: limit,
                window,
                reset_at: self.clock.now().after(window),
            },
        );
        self
    }

    /// Makes every call with `token` fail as unauthorized.
    pub fn rejecting(&self, token: &str) -> &Self {
        self.rejected.lock().unwrap().insert(token.to_string());
        self
    }

    /// Delays every call by `latency` of tokio time.
    pub fn with_latency(&self, latency: Duration) -> &Self {
        *self.latency.lock().unwrap() = Some(latency);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, repository: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.repository == repository)
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Spends one call of `token`'s quota, if it has one.
    fn charge(&self, token: &str) -> Result<Option<RateLimitSnapshot>, FetchError> {
        let now = self.clock.now();
        let mut quotas = self.quotas.lock().unwrap();
        let Some(quota) = quotas.get_mut(token) else {
            return Ok(None);
        };

        if now >= quota.reset_at {
            quota.remaining = quota.limit;
            quota.reset_at = now.after(quota.window);
        }
        if quota.remaining == 0 {
            return Err(FetchError::RateLimited {
                reset_at: Some(quota.reset_at),
            });
        }
        quota.remaining -= 1;
        Ok(Some(RateLimitSnapshot {
            limit: Some(quota.limit),
            remaining: quota.remaining,
            reset_at: Some(quota.reset_at),
        }))
    }

    async fn answer(
        &self,
        repository: &RepositoryName,
        token: &AccessToken,
        page: PageCursor,
    ) -> Result<FollowersPage, FetchError> {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.rejected.lock().unwrap().contains(token.expose()) {
            return Err(FetchError::Unauthorized {
                message: "HTTP 401: Bad credentials".into(),
            });
        }
        let rate_limit = self.charge(token.expose())?;

        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(repository.as_str())
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }

        let pages = self.pages.lock().unwrap();
        let Some(pages) = pages.get(repository.as_str()) else {
            return Err(FetchError::NotFound);
        };
        let index = (page.number() - 1) as usize;
        let followers = pages
            .get(index)
            .map(|logins| logins.iter().filter_map(FollowerLogin::new).collect())
            .unwrap_or_default();
        let next = if index + 1 < pages.len() {
            PageCursor::new(page.number() + 1)
        } else {
            None
        };

        Ok(FollowersPage {
            followers,
            next,
            rate_limit,
        })
    }
}

#[async_trait]
impl FollowersApi for MockApi {
    async fn followers_page(
        &self,
        repository: &RepositoryName,
        token: &AccessToken,
        page: PageCursor,
    ) -> Result<FollowersPage, FetchError> {
        self.calls.lock().unwrap().push(Call {
            repository: repository.to_string(),
            token: token.expose().to_string(),
            page: page.number(),
        });

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let result = self.answer(repository, token, page).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn quota(&self, token: &AccessToken) -> Result<Option<RateLimitSnapshot>, FetchError> {
        if self.rejected.lock().unwrap().contains(token.expose()) {
            return Err(FetchError::Unauthorized {
                message: "HTTP 401: Bad credentials".into(),
            });
        }
        Ok(self
            .quotas
            .lock()
            .unwrap()
            .get(token.expose())
            .map(|quota| RateLimitSnapshot {
                limit: Some(quota.limit),
                remaining: quota.remaining,
                reset_at: Some(quota.reset_at),
            }))
    }
}

pub fn name(value: &str) -> RepositoryName {
    RepositoryName::new(value).unwrap()
}

pub fn records(names: &[&str]) -> Vec<RepositoryRecord> {
    names.iter().map(|n| RepositoryRecord::new(name(n))).collect()
}

pub fn followers(logins: &[&str]) -> FollowerSet {
    logins.iter().copied().filter_map(FollowerLogin::new).collect()
}

pub fn pool(tokens: &[&str]) -> Arc<CredentialPool> {
    Arc::new(CredentialPool::new(tokens.iter().copied().filter_map(AccessToken::new)).unwrap())
}

/// Retries fast and without jitter so call counts and timings are exact.
pub fn config() -> IndexerConfig {
    IndexerConfig {
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            jitter: 0.0,
        },
        ..IndexerConfig::default()
    }
}

pub fn engine(
    config: IndexerConfig,
    api: &Arc<MockApi>,
    pool: &Arc<CredentialPool>,
    store: Arc<dyn CheckpointStore>,
    clock: &Arc<TestClock>,
) -> IndexingEngine {
    IndexingEngine::new(config, api.clone(), Arc::clone(pool), store)
        .unwrap()
        .with_clock(clock.clone())
}

pub fn recorded(store: &dyn CheckpointStore, value: &str) -> bool {
    store.contains(&name(value))
}
