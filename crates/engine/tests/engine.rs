mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use common::{
    config, engine, epoch, followers, name, pool, recorded, records, MockApi, TestClock,
};
use engine::HaltReason;
use indexer::{
    plan, CheckpointError, CheckpointStore, FetchError, FollowerSet, IndexerConfig, IndexerError,
    InMemoryCheckpointStore, RepositoryName, WaitPolicy,
};
use tokio_util::sync::CancellationToken;

/// Accepts `ok` writes, then fails every write after.
struct FailingAfter {
    inner: InMemoryCheckpointStore,
    ok: AtomicUsize,
}

impl FailingAfter {
    fn new(ok: usize) -> Self {
        Self {
            inner: InMemoryCheckpointStore::new(),
            ok: AtomicUsize::new(ok),
        }
    }
}

#[async_trait]
impl CheckpointStore for FailingAfter {
    fn contains(&self, name: &RepositoryName) -> bool {
        self.inner.contains(name)
    }

    fn get(&self, name: &RepositoryName) -> Option<FollowerSet> {
        self.inner.get(name)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    async fn put(
        &self,
        name: &RepositoryName,
        followers: FollowerSet,
    ) -> Result<bool, CheckpointError> {
        if self
            .ok
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            self.inner.set_fail_writes(true);
        }
        self.inner.put(name, followers).await
    }
}

const HOUR: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn indexes_every_unit_in_plan_order() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.with_pages("a/one", &[&["x", "y"], &["z"]])
        .with_pages("b/two", &[&["w"]])
        .with_pages("c/three", &[&[]]);
    let pool = pool(&["t1"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = engine(config(), &api, &pool, store.clone(), &clock);

    let all = records(&["a/one", "b/two", "c/three"]);
    let summary = engine
        .run(plan(&all, store.as_ref()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed, 3);
    assert_eq!(summary.remaining, 0);
    assert_eq!(summary.halt, None);
    assert!(summary.failed.is_empty());

    let entries = store.snapshot();
    assert_eq!(entries[&name("a/one")], followers(&["x", "y", "z"]));
    assert_eq!(entries[&name("b/two")], followers(&["w"]));
    assert!(entries[&name("c/three")].is_empty());

    let order: Vec<String> = api.calls().into_iter().map(|c| c.repository).collect();
    assert_eq!(order, ["a/one", "a/one", "b/two", "c/three"]);
}

#[tokio::test]
async fn empty_plan_does_nothing() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    let pool = pool(&["t1"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = engine(config(), &api, &pool, store.clone(), &clock);

    let summary = engine
        .run(plan(&[], store.as_ref()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.planned, 0);
    assert_eq!(summary.completed, 0);
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn credentials_rotate_least_recently_used_first() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    for repo in ["o/1", "o/2", "o/3", "o/4"] {
        api.with_pages(repo, &[&["f"]]);
    }
    let pool = pool(&["t1", "t2"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = engine(config(), &api, &pool, store.clone(), &clock);

    let all = records(&["o/1", "o/2", "o/3", "o/4"]);
    engine
        .run(plan(&all, store.as_ref()), CancellationToken::new())
        .await
        .unwrap();

    let tokens: Vec<String> = api.calls().into_iter().map(|c| c.token).collect();
    assert_eq!(tokens, ["t1", "t2", "t1", "t2"]);
}

#[tokio::test]
async fn rate_limited_credential_is_rotated_without_spending_retries() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.with_pages("o/r", &[&["a"]])
        .with_quota("t1", 0, HOUR);
    let pool = pool(&["t1", "t2"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let mut config = config();
    config.retry.max_attempts = 1;
    let engine = engine(config, &api, &pool, store.clone(), &clock);

    let summary = engine
        .run(plan(&records(&["o/r"]), store.as_ref()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed, 1);
    assert!(summary.failed.is_empty());
    let tokens: Vec<String> = api.calls().into_iter().map(|c| c.token).collect();
    assert_eq!(tokens, ["t1", "t2"]);
    assert_eq!(pool.snapshot()[0].remaining, Some(0));
}

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried_on_the_same_credential() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.with_pages("o/r", &[&["a"]])
        .with_failure("o/r", FetchError::transient("HTTP 502"))
        .with_failure("o/r", FetchError::transient("HTTP 502"));
    let pool = pool(&["t1", "t2"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = engine(config(), &api, &pool, store.clone(), &clock);

    let summary = engine
        .run(plan(&records(&["o/r"]), store.as_ref()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed, 1);
    let tokens: Vec<String> = api.calls().into_iter().map(|c| c.token).collect();
    assert_eq!(tokens, ["t1", "t1", "t1"]);
    // 100ms then 200ms of back-off.
    assert!(clock.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn server_requested_delay_is_honoured_within_cap() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.with_pages("o/r", &[&["a"]]).with_failure(
        "o/r",
        FetchError::Transient {
            message: "HTTP 503".into(),
            retry_after: Some(Duration::from_millis(600)),
        },
    );
    let pool = pool(&["t1"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = engine(config(), &api, &pool, store.clone(), &clock);

    engine
        .run(plan(&records(&["o/r"]), store.as_ref()), CancellationToken::new())
        .await
        .unwrap();

    assert!(clock.elapsed() >= Duration::from_millis(600));
    assert!(recorded(store.as_ref(), "o/r"));
}

#[tokio::test(start_paused = true)]
async fn oversized_server_delay_is_capped_at_max_backoff() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.with_pages("o/r", &[&["a"]]).with_failure(
        "o/r",
        FetchError::Transient {
            message: "HTTP 503".into(),
            retry_after: Some(Duration::from_secs(86_400)),
        },
    );
    let pool = pool(&["t1"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let config = config();
    let max_backoff = config.retry.max_backoff;
    let engine = engine(config, &api, &pool, store.clone(), &clock);

    let summary = engine
        .run(plan(&records(&["o/r"]), store.as_ref()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed, 1);
    assert!(
        clock.elapsed() <= max_backoff + Duration::from_millis(10),
        "slept {:?} despite max_backoff {max_backoff:?}",
        clock.elapsed()
    );
}

#[tokio::test(start_paused = true)]
async fn unit_is_abandoned_after_retry_budget_and_run_continues() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.with_pages("o/flaky", &[&["a"]]).with_pages("o/fine", &[&["b"]]);
    for _ in 0..5 {
        api.with_failure("o/flaky", FetchError::transient("connection reset"));
    }
    let pool = pool(&["t1"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = engine(config(), &api, &pool, store.clone(), &clock);

    let summary = engine
        .run(
            plan(&records(&["o/flaky", "o/fine"]), store.as_ref()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.failed, vec![name("o/flaky")]);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.unprocessed(), 1);
    assert_eq!(api.calls_for("o/flaky"), 3);
    assert!(!recorded(store.as_ref(), "o/flaky"));
    assert!(recorded(store.as_ref(), "o/fine"));
}

#[tokio::test]
async fn missing_entity_is_recorded_as_empty() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.with_pages("o/real", &[&["a"]]);
    let pool = pool(&["t1"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = engine(config(), &api, &pool, store.clone(), &clock);

    let summary = engine
        .run(
            plan(&records(&["ghost/gone", "o/real"]), store.as_ref()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.not_found, 1);
    assert_eq!(summary.completed, 1);
    assert!(store.snapshot()[&name("ghost/gone")].is_empty());
    assert_eq!(api.calls_for("ghost/gone"), 1);
}

#[tokio::test]
async fn rejected_credential_is_revoked_and_unit_moves_on() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.with_pages("o/1", &[&["a"]])
        .with_pages("o/2", &[&["b"]])
        .rejecting("bad");
    let pool = pool(&["bad", "good"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let mut config = config();
    config.retry.max_attempts = 1;
    let engine = engine(config, &api, &pool, store.clone(), &clock);

    let summary = engine
        .run(
            plan(&records(&["o/1", "o/2"]), store.as_ref()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.completed, 2);
    assert_eq!(pool.usable_count(), 1);
    let tokens: Vec<String> = api.calls().into_iter().map(|c| c.token).collect();
    assert_eq!(tokens, ["bad", "good", "good"]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_pool_halts_and_reports_remaining() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    for repo in ["r1", "r2", "r3"] {
        api.with_pages(repo, &[&["f"]]);
    }
    api.with_quota("t1", 2, HOUR);
    let pool = pool(&["t1"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = engine(config(), &api, &pool, store.clone(), &clock);

    let summary = engine
        .run(
            plan(&records(&["r1", "r2", "r3"]), store.as_ref()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.remaining, 1);
    assert_eq!(
        summary.halt,
        Some(HaltReason::CredentialsExhausted {
            earliest_reset: Some(epoch().after(HOUR))
        })
    );
    assert_eq!(api.calls_for("r3"), 0);
    assert!(!recorded(store.as_ref(), "r3"));
}

#[tokio::test(start_paused = true)]
async fn waits_for_quota_reset_when_allowed() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.with_pages("r1", &[&["a"]])
        .with_pages("r2", &[&["b"]])
        .with_quota("t1", 1, Duration::from_secs(60));
    let pool = pool(&["t1"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let config = IndexerConfig {
        wait: WaitPolicy::WaitForReset {
            max_wait: Duration::from_secs(120),
        },
        ..config()
    };
    let engine = engine(config, &api, &pool, store.clone(), &clock);

    let summary = engine
        .run(
            plan(&records(&["r1", "r2"]), store.as_ref()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.halt, None);
    assert!(clock.elapsed() >= Duration::from_secs(60));
    assert_eq!(api.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn reset_beyond_max_wait_halts() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.with_pages("r1", &[&["a"]])
        .with_pages("r2", &[&["b"]])
        .with_quota("t1", 1, 2 * HOUR);
    let pool = pool(&["t1"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let config = IndexerConfig {
        wait: WaitPolicy::WaitForReset { max_wait: HOUR },
        ..config()
    };
    let engine = engine(config, &api, &pool, store.clone(), &clock);

    let summary = engine
        .run(
            plan(&records(&["r1", "r2"]), store.as_ref()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.remaining, 1);
    assert!(matches!(
        summary.halt,
        Some(HaltReason::CredentialsExhausted { .. })
    ));
    assert!(clock.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_fetch_records_nothing_partial() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.with_pages("r1", &[&["a"], &["b"]])
        .with_pages("r2", &[&["c"]])
        .with_latency(Duration::from_secs(3));
    let pool = pool(&["t1"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = engine(config(), &api, &pool, store.clone(), &clock);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(4)).await;
        trigger.cancel();
    });

    let summary = engine
        .run(plan(&records(&["r1", "r2"]), store.as_ref()), cancel)
        .await
        .unwrap();

    assert_eq!(summary.halt, Some(HaltReason::Cancelled));
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.remaining, 2);
    assert!(store.snapshot().is_empty());
}

#[tokio::test]
async fn already_cancelled_run_processes_nothing() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.with_pages("r1", &[&["a"]]);
    let pool = pool(&["t1"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = engine(config(), &api, &pool, store.clone(), &clock);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = engine
        .run(plan(&records(&["r1"]), store.as_ref()), cancel)
        .await
        .unwrap();

    assert_eq!(summary.halt, Some(HaltReason::Cancelled));
    assert_eq!(summary.remaining, 1);
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn duplicate_names_are_fetched_once() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.with_pages("o/r", &[&["a"]]);
    let pool = pool(&["t1"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = engine(config(), &api, &pool, store.clone(), &clock);

    let summary = engine
        .run(
            plan(&records(&["o/r", "o/r"]), store.as_ref()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.planned, 2);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn checkpoint_write_failure_aborts_the_run() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.with_pages("r1", &[&["a"]]).with_pages("r2", &[&["b"]]);
    let pool = pool(&["t1"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    store.set_fail_writes(true);
    let engine = engine(config(), &api, &pool, store.clone(), &clock);

    let err = engine
        .run(
            plan(&records(&["r1", "r2"]), store.as_ref()),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err.error,
        IndexerError::Checkpoint(CheckpointError::Write { .. })
    ));
    assert_eq!(err.summary.completed, 0);
    assert_eq!(err.summary.remaining, 2);
    assert!(store.snapshot().is_empty());
    assert_eq!(api.calls_for("r2"), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_workers_share_the_queue() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    let names = ["o/1", "o/2", "o/3", "o/4", "o/5", "o/6"];
    for repo in names {
        api.with_pages(repo, &[&["f"]]);
    }
    api.with_latency(Duration::from_secs(1));
    let pool = pool(&["t1", "t2", "t3"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let config = IndexerConfig {
        concurrency: 3,
        ..config()
    };
    let engine = engine(config, &api, &pool, store.clone(), &clock);

    let summary = engine
        .run(plan(&records(&names), store.as_ref()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed, 6);
    assert_eq!(store.snapshot().len(), 6);
    assert_eq!(api.max_in_flight(), 3);
    assert!(clock.elapsed() < Duration::from_secs(6));
}

#[tokio::test]
async fn failure_after_progress_reports_what_was_recorded() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.with_pages("r1", &[&["a"]])
        .with_pages("r2", &[&["b"]])
        .with_pages("r3", &[&["c"]]);
    let pool = pool(&["t1"]);
    let store = Arc::new(FailingAfter::new(1));
    let engine = engine(config(), &api, &pool, store.clone(), &clock);

    let failure = engine
        .run(
            plan(&records(&["r1", "r2", "r3"]), store.as_ref()),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(failure.error, IndexerError::Checkpoint(_)));
    assert_eq!(failure.summary.completed, 1);
    assert_eq!(failure.summary.remaining, 2);
    assert_eq!(failure.summary.planned, 3);
}

#[tokio::test]
async fn credential_check_disables_rejected_credentials() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.rejecting("bad").with_quota("good", 5000, HOUR);
    let pool = pool(&["bad", "good"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = engine(config(), &api, &pool, store, &clock);

    engine.check_credentials().await.unwrap();

    assert_eq!(pool.usable_count(), 1);
    assert_eq!(pool.snapshot()[1].remaining, Some(5000));
}

#[tokio::test]
async fn credential_check_fails_when_every_credential_is_rejected() {
    let clock = TestClock::new();
    let api = MockApi::new(clock.clone());
    api.rejecting("bad1").rejecting("bad2");
    let pool = pool(&["bad1", "bad2"]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = engine(config(), &api, &pool, store, &clock);

    let err = engine.check_credentials().await.unwrap_err();

    assert!(matches!(err, IndexerError::Configuration { .. }));
}

#[tokio::test]
async fn invalid_config_is_rejected_at_construction() {
    let api = MockApi::new(TestClock::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let config = IndexerConfig {
        concurrency: 0,
        ..IndexerConfig::default()
    };

    let result = engine::IndexingEngine::new(config, api, pool(&["t1"]), store);

    assert!(matches!(result, Err(IndexerError::Configuration { .. })));
}
