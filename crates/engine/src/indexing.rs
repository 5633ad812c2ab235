//! The indexing engine.
//!
//! Each unit of work (one repository) moves through an explicit state machine:
//!
//! ```text
//! Pending ──acquire──▶ Fetching ──ok──────────▶ Done(Completed)
//!    ▲                   │  │ ──not found─────▶ Done(NotFound)      (empty set recorded)
//!    │   rate limited /  │  │ ──transient─────▶ Backoff ──▶ Fetching (same credential)
//!    └── unauthorized ◀──┘  └ ──budget spent──▶ Done(Abandoned)     (not recorded)
//! ```
//!
//! Rotating away from a rate-limited or rejected credential does not count
//! against the unit's retry budget. When no credential can be acquired the
//! unit goes back to the front of the queue and the run halts.
//!
//! Workers pull units from a shared queue. With one worker (the default) units
//! are processed strictly in plan order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use indexer::{
    AcquireError, CheckpointStore, Clock, CredentialLease, CredentialPool, FetchError,
    FollowerSet, FollowersApi, IndexerConfig, IndexerError, RepositoryName, RepositoryRecord,
    RetryConfig, RetryPolicy, RunId, SystemClock, WaitPolicy, WorkPlan, RESET_SLACK,
};
use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::fetcher::PaginatedFetcher;
use crate::summary::{HaltReason, RunFailure, RunSummary};

/// Longest a worker sleeps waiting for a leased credential to come back.
const IN_FLIGHT_POLL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Per-unit state machine
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum UnitOutcome {
    Completed { followers: usize },
    NotFound,
    Skipped,
    Abandoned { error: FetchError },
    Halted(HaltReason),
}

#[derive(Debug)]
enum UnitState {
    Pending {
        attempts: u32,
    },
    Fetching {
        lease: CredentialLease,
        attempts: u32,
    },
    Backoff {
        lease: CredentialLease,
        attempts: u32,
        delay: Duration,
    },
    Done(UnitOutcome),
}

// ---------------------------------------------------------------------------
// Shared run state
// ---------------------------------------------------------------------------

struct RunState {
    queue: Mutex<VecDeque<RepositoryRecord>>,
    summary: Mutex<RunSummary>,
    /// Stop taking new units; in-flight units finish.
    halted: CancellationToken,
    /// Abandon in-flight fetches as well.
    cancel: CancellationToken,
}

impl RunState {
    fn pop(&self) -> Option<RepositoryRecord> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn push_front(&self, record: RepositoryRecord) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_front(record);
    }

    fn update<R>(&self, f: impl FnOnce(&mut RunSummary) -> R) -> R {
        f(&mut self.summary.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn halt(&self, reason: HaltReason) {
        self.update(|summary| {
            summary.halt.get_or_insert(reason);
        });
        self.halted.cancel();
    }

    fn should_stop(&self) -> bool {
        self.halted.is_cancelled() || self.cancel.is_cancelled()
    }

    fn into_summary(self) -> RunSummary {
        let remaining = self
            .queue
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let mut summary = self
            .summary
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        summary.remaining = remaining;
        if remaining > 0 && summary.halt.is_none() && self.cancel.is_cancelled() {
            summary.halt = Some(HaltReason::Cancelled);
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives a [`WorkPlan`] to completion (or to a clean halt).
pub struct IndexingEngine {
    config: IndexerConfig,
    api: Arc<dyn FollowersApi>,
    pool: Arc<CredentialPool>,
    fetcher: PaginatedFetcher,
    store: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
    released: Notify,
}

impl IndexingEngine {
    /// Creates an engine from its collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::Configuration`] if `config` is invalid.
    pub fn new(
        config: IndexerConfig,
        api: Arc<dyn FollowersApi>,
        pool: Arc<CredentialPool>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, IndexerError> {
        config.validate()?;
        let fetcher = PaginatedFetcher::new(Arc::clone(&api), Arc::clone(&pool), config.max_pages);
        Ok(Self {
            config,
            api,
            pool,
            fetcher,
            store,
            clock: Arc::new(SystemClock),
            released: Notify::new(),
        })
    }

    /// Replaces the wall clock used for quota-reset decisions.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Asks the API for each credential's quota before any work starts.
    ///
    /// Credentials the API rejects are disabled. Other check failures are
    /// logged and ignored; the quota is then learned from the first fetch.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::Configuration`] if no credential is usable.
    pub async fn check_credentials(&self) -> Result<(), IndexerError> {
        for (id, token) in self.pool.tokens() {
            match self.api.quota(&token).await {
                Ok(Some(snapshot)) => {
                    tracing::info!(
                        credential = id.index(),
                        remaining = snapshot.remaining,
                        limit = ?snapshot.limit,
                        "Probed credential quota"
                    );
                    self.pool.observe(id, &snapshot);
                }
                Ok(None) => {}
                Err(FetchError::Unauthorized { message }) => {
                    tracing::warn!(credential = id.index(), %message, "Credential rejected during credential check");
                    self.pool.disable(id);
                }
                Err(error) => {
                    tracing::warn!(credential = id.index(), %error, "Credential check failed");
                }
            }
        }

        if self.pool.usable_count() == 0 {
            return Err(IndexerError::configuration(
                "no usable access tokens: every configured token was rejected",
            ));
        }
        Ok(())
    }

    /// Processes `plan` until it is exhausted, the pool halts the run, or
    /// `cancel` fires.
    ///
    /// Per-unit failures are handled here and reported in the summary.
    ///
    /// # Errors
    ///
    /// A [`RunFailure`] carrying the summary so far and one of:
    /// - [`IndexerError::Configuration`] if work is planned but no credential is usable.
    /// - [`IndexerError::Checkpoint`] if a completed unit could not be recorded.
    pub async fn run(
        &self,
        plan: WorkPlan,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunFailure> {
        let run_id = RunId::new_random();
        let span = tracing::info_span!("run", %run_id);
        self.run_inner(run_id, plan, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: RunId,
        plan: WorkPlan,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunFailure> {
        let WorkPlan { units, stats } = plan;
        tracing::info!(
            total = stats.total,
            completed = stats.completed,
            remaining = stats.remaining,
            "Starting indexing run"
        );

        let usable = self.pool.usable_count();
        if usable == 0 && !units.is_empty() {
            let mut summary = RunSummary::new(run_id, stats);
            summary.remaining = units.len();
            return Err(RunFailure {
                error: IndexerError::configuration("no usable access tokens"),
                summary,
            });
        }
        let workers = self.config.concurrency.min(usable).max(1);

        let run = RunState {
            queue: Mutex::new(units.into()),
            summary: Mutex::new(RunSummary::new(run_id, stats)),
            halted: CancellationToken::new(),
            cancel,
        };

        let results = join_all((0..workers).map(|worker| self.worker(&run, worker))).await;
        let first_error = results.into_iter().find_map(Result::err);
        let summary = run.into_summary();

        if let Some(error) = first_error {
            tracing::error!(
                %error,
                completed = summary.completed,
                remaining = summary.remaining,
                "Indexing run aborted"
            );
            return Err(RunFailure { error, summary });
        }

        tracing::info!(
            completed = summary.completed,
            not_found = summary.not_found,
            failed = summary.failed.len(),
            remaining = summary.remaining,
            halt = ?summary.halt.map(|h| h.to_string()),
            "Indexing run finished"
        );
        Ok(summary)
    }

    async fn worker(&self, run: &RunState, worker: usize) -> Result<(), IndexerError> {
        while !run.should_stop() {
            let Some(record) = run.pop() else {
                break;
            };

            let span = tracing::info_span!("unit", repository = %record.name, worker);
            let outcome = match self.process(&record, &run.cancel).instrument(span.clone()).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    run.push_front(record);
                    run.halted.cancel();
                    return Err(error);
                }
            };

            let _entered = span.enter();
            match outcome {
                UnitOutcome::Completed { followers } => {
                    let (recorded, planned) = run.update(|s| {
                        s.completed += 1;
                        (s.recorded(), s.planned)
                    });
                    tracing::info!(followers, recorded, planned, "Indexed followers");
                }
                UnitOutcome::NotFound => {
                    run.update(|s| s.not_found += 1);
                    tracing::warn!("Repository owner not found; recorded empty follower set");
                }
                UnitOutcome::Skipped => {
                    run.update(|s| s.skipped += 1);
                    tracing::debug!("Already recorded; skipping");
                }
                UnitOutcome::Abandoned { error } => {
                    tracing::warn!(%error, "Giving up on repository for this run");
                    run.update(|s| s.failed.push(record.name));
                }
                UnitOutcome::Halted(reason) => {
                    tracing::info!(%reason, "Halting run");
                    run.push_front(record);
                    run.halt(reason);
                }
            }
        }
        Ok(())
    }

    async fn process(
        &self,
        record: &RepositoryRecord,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, IndexerError> {
        if self.store.contains(&record.name) {
            return Ok(UnitOutcome::Skipped);
        }

        let mut state = UnitState::Pending { attempts: 0 };
        loop {
            state = match state {
                UnitState::Pending { attempts } => match self.acquire(cancel).await {
                    Ok(lease) => UnitState::Fetching { lease, attempts },
                    Err(reason) => UnitState::Done(UnitOutcome::Halted(reason)),
                },
                UnitState::Fetching { lease, attempts } => {
                    self.fetch(&record.name, lease, attempts, cancel).await?
                }
                UnitState::Backoff {
                    lease,
                    attempts,
                    delay,
                } => {
                    let cancelled = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled {
                        self.release(lease);
                        UnitState::Done(UnitOutcome::Halted(HaltReason::Cancelled))
                    } else {
                        UnitState::Fetching { lease, attempts }
                    }
                }
                UnitState::Done(outcome) => return Ok(outcome),
            };
        }
    }

    /// The `Fetching` transition.
    async fn fetch(
        &self,
        name: &RepositoryName,
        lease: CredentialLease,
        attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<UnitState, IndexerError> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.fetcher.fetch(name, &lease) => Some(result),
        };
        let Some(result) = result else {
            self.release(lease);
            return Ok(UnitState::Done(UnitOutcome::Halted(HaltReason::Cancelled)));
        };

        match result {
            Ok(followers) => {
                self.release(lease);
                let count = followers.len();
                self.record(name, followers).await?;
                Ok(UnitState::Done(UnitOutcome::Completed { followers: count }))
            }
            Err(FetchError::NotFound) => {
                self.release(lease);
                self.record(name, FollowerSet::empty()).await?;
                Ok(UnitState::Done(UnitOutcome::NotFound))
            }
            Err(FetchError::RateLimited { reset_at }) => {
                self.pool.mark_exhausted(lease, reset_at);
                self.released.notify_waiters();
                Ok(UnitState::Pending { attempts })
            }
            Err(FetchError::Unauthorized { message }) => {
                tracing::warn!(credential = lease.id().index(), %message, "Credential rejected");
                self.pool.revoke(lease);
                self.released.notify_waiters();
                Ok(UnitState::Pending { attempts })
            }
            Err(error @ FetchError::Transient { .. }) => {
                let attempts = attempts + 1;
                if attempts >= self.config.retry.max_attempts {
                    self.release(lease);
                    return Ok(UnitState::Done(UnitOutcome::Abandoned { error }));
                }
                let delay = backoff_delay(&self.config.retry, attempts, &error.retry_policy());
                tracing::warn!(attempt = attempts, ?delay, %error, "Transient failure; retrying");
                Ok(UnitState::Backoff {
                    lease,
                    attempts,
                    delay,
                })
            }
        }
    }

    /// The `Pending` transition: get a credential, waiting if policy allows.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<CredentialLease, HaltReason> {
        loop {
            match self.pool.acquire_at(self.clock.now()) {
                Ok(lease) => return Ok(lease),
                Err(AcquireError::AllInFlight) => {
                    let released = self.released.notified();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(HaltReason::Cancelled),
                        _ = tokio::time::timeout(IN_FLIGHT_POLL, released) => {}
                    }
                }
                Err(AcquireError::Exhausted { earliest_reset }) => {
                    let exhausted = HaltReason::CredentialsExhausted { earliest_reset };
                    let WaitPolicy::WaitForReset { max_wait } = self.config.wait else {
                        return Err(exhausted);
                    };
                    let Some(reset) = earliest_reset else {
                        tracing::warn!("No quota reset time known; cannot wait");
                        return Err(exhausted);
                    };
                    let wait = reset.duration_since(self.clock.now()) + RESET_SLACK;
                    if wait > max_wait {
                        tracing::warn!(?wait, ?max_wait, "Quota reset is too far away to wait for");
                        return Err(exhausted);
                    }

                    tracing::info!(?wait, reset_at = %reset, "All credentials exhausted; waiting for reset");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(HaltReason::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    async fn record(&self, name: &RepositoryName, followers: FollowerSet) -> Result<(), IndexerError> {
        if !self.store.put(name, followers).await? {
            tracing::debug!("Checkpoint already held an entry; left unchanged");
        }
        Ok(())
    }

    fn release(&self, lease: CredentialLease) {
        self.pool.release(lease, None);
        self.released.notify_waiters();
    }
}

/// Delay before retry number `attempt` (1-based).
///
/// A server-requested delay replaces the exponential schedule; either way the
/// result never exceeds `max_backoff`.
fn backoff_delay(retry: &RetryConfig, attempt: u32, policy: &RetryPolicy) -> Duration {
    if let RetryPolicy::Retryable { after: Some(after) } = policy {
        return (*after).min(retry.max_backoff);
    }

    let base = retry.base_delay(attempt);
    if retry.jitter <= 0.0 {
        return base;
    }
    let factor = rand::thread_rng().gen_range((1.0 - retry.jitter)..=(1.0 + retry.jitter));
    base.mul_f64(factor).min(retry.max_backoff)
}
