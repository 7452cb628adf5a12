//! Worker state machine tests: retry/backoff/dead-letter against in-memory
//! backends.

use async_trait::async_trait;
use jobq::broker::{Broker, Dequeued};
use jobq::engine::{Backoff, ProcessOutcome, PromoterConfig, RetryPromoter, Worker, WorkerConfig};
use jobq::error::{Error, Result};
use jobq::handler::{Handler, HandlerRegistry, Outcome};
use jobq::memory::{MemoryBroker, MemoryStore};
use jobq::model::{Job, JobId, NewJob, Status};
use jobq::service::JobService;
use jobq::store::{JobStore, Transition};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Harness {
    store: Arc<MemoryStore>,
    broker: Arc<MemoryBroker>,
    service: JobService,
    worker: Worker,
    promoter: RetryPromoter,
}

fn harness_with(registry: HandlerRegistry, config: WorkerConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(MemoryBroker::new());
    let shutdown = CancellationToken::new();
    let worker = Worker::new(
        "test-worker",
        store.clone(),
        broker.clone(),
        Arc::new(registry),
        config,
        shutdown.clone(),
    );
    let promoter = RetryPromoter::new(broker.clone(), PromoterConfig::default(), shutdown);
    Harness {
        service: JobService::new(store.clone(), broker.clone()),
        store,
        broker,
        worker,
        promoter,
    }
}

fn harness() -> Harness {
    harness_with(
        HandlerRegistry::with_defaults(Duration::ZERO),
        WorkerConfig::default(),
    )
}

impl Harness {
    async fn submit(&self, payload: &str) -> JobId {
        self.service
            .submit(NewJob::new().payload(payload))
            .await
            .unwrap()
            .job_id
    }

    async fn next_id(&self) -> JobId {
        match self
            .broker
            .dequeue_main(Duration::from_millis(50))
            .await
            .unwrap()
        {
            Dequeued::Job(id) => id,
            Dequeued::Timeout => panic!("expected a job on the main queue"),
        }
    }

    async fn job(&self, id: &JobId) -> Job {
        self.store.get(id).await.unwrap().unwrap()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::test]
async fn fail_times_two_completes_on_third_attempt() {
    let h = harness();
    let id = h.submit("FAIL_TIMES=2").await;

    // Attempt 1 fails: retry ~2000ms out, not back on the main queue.
    let before = now_ms();
    let outcome = h.worker.process(&h.next_id().await).await.unwrap();
    let after = now_ms();
    let ProcessOutcome::Retrying {
        attempts,
        ready_at_ms,
    } = outcome
    else {
        panic!("expected Retrying, got {outcome:?}");
    };
    assert_eq!(attempts, 1);
    assert!(ready_at_ms >= before + 2_000 && ready_at_ms <= after + 2_000);
    assert!(h.broker.main_snapshot().await.is_empty());
    assert_eq!(h.job(&id).await.status, Status::Pending);

    // Not ready yet.
    assert_eq!(h.promoter.tick_at(ready_at_ms - 1).await.unwrap(), 0);
    assert_eq!(h.promoter.tick_at(ready_at_ms).await.unwrap(), 1);

    // Attempt 2 fails: retry ~4000ms out.
    let before = now_ms();
    let outcome = h.worker.process(&h.next_id().await).await.unwrap();
    let after = now_ms();
    let ProcessOutcome::Retrying {
        attempts,
        ready_at_ms,
    } = outcome
    else {
        panic!("expected Retrying, got {outcome:?}");
    };
    assert_eq!(attempts, 2);
    assert!(ready_at_ms >= before + 4_000 && ready_at_ms <= after + 4_000);
    assert_eq!(h.promoter.tick_at(ready_at_ms).await.unwrap(), 1);

    // Attempt 3 succeeds.
    let outcome = h.worker.process(&h.next_id().await).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Completed);

    let job = h.job(&id).await;
    assert_eq!(job.status, Status::Completed);
    assert_eq!(job.attempts, 2);
    assert!(h.broker.list_dead_letter().await.unwrap().is_empty());
}

#[tokio::test]
async fn fail_always_dead_letters_after_exactly_max_retries() {
    let h = harness();
    let id = h.submit("FAIL_ALWAYS").await;

    let mut last_attempts = 0;
    let mut outcomes = Vec::new();
    loop {
        let outcome = h.worker.process(&h.next_id().await).await.unwrap();
        let attempts = h.job(&id).await.attempts;
        assert!(attempts >= last_attempts, "attempts went backwards");
        last_attempts = attempts;

        match outcome {
            ProcessOutcome::Retrying { ready_at_ms, .. } => {
                assert!(h.broker.list_dead_letter().await.unwrap().is_empty());
                h.promoter.tick_at(ready_at_ms).await.unwrap();
                outcomes.push(outcome);
            }
            ProcessOutcome::DeadLettered { .. } => {
                outcomes.push(outcome);
                break;
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(outcomes.len(), 3);
    assert_eq!(
        outcomes.last(),
        Some(&ProcessOutcome::DeadLettered { attempts: 3 })
    );

    let job = h.job(&id).await;
    assert_eq!(job.status, Status::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(h.broker.list_dead_letter().await.unwrap(), vec![id.clone()]);
    assert!(h.broker.retry_snapshot().await.is_empty());
    assert!(h.broker.main_snapshot().await.is_empty());

    let listed = h.service.list_dead_letter().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
}

#[tokio::test]
async fn retries_follow_exponential_schedule() {
    let h = harness_with(
        HandlerRegistry::with_defaults(Duration::ZERO),
        WorkerConfig {
            max_retries: 10,
            ..WorkerConfig::default()
        },
    );
    h.submit("FAIL_ALWAYS").await;

    let expected = [2_000, 4_000, 8_000, 16_000, 30_000, 30_000];
    for want in expected {
        let before = now_ms();
        let outcome = h.worker.process(&h.next_id().await).await.unwrap();
        let after = now_ms();
        let ProcessOutcome::Retrying { ready_at_ms, .. } = outcome else {
            panic!("expected Retrying, got {outcome:?}");
        };
        assert!(ready_at_ms >= before + want && ready_at_ms <= after + want);
        h.promoter.tick_at(ready_at_ms).await.unwrap();
    }
}

#[tokio::test]
async fn missing_job_is_discarded() {
    let h = harness();
    let outcome = h.worker.process(&JobId::from("ghost")).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Missing);
}

#[tokio::test]
async fn stale_entry_for_finished_job_is_discarded() {
    let h = harness();
    let id = h.submit("ok").await;
    // Duplicate entry, as left behind by a racing requeue.
    h.broker.enqueue_main(&id).await.unwrap();

    assert_eq!(
        h.worker.process(&h.next_id().await).await.unwrap(),
        ProcessOutcome::Completed
    );
    assert_eq!(
        h.worker.process(&h.next_id().await).await.unwrap(),
        ProcessOutcome::Stale(Status::Completed)
    );
    assert_eq!(h.job(&id).await.attempts, 0);
}

#[tokio::test]
async fn in_progress_job_is_not_reprocessed() {
    let h = harness();
    let id = h.submit("ok").await;
    h.store.claim(&id).await.unwrap();

    assert_eq!(
        h.worker.process(&id).await.unwrap(),
        ProcessOutcome::Stale(Status::InProgress)
    );
}

/// Holds every attempt open until released, so several workers can pile up
/// on the same id.
struct Gate {
    release: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl Handler for Gate {
    async fn process(&self, _job: &Job) -> Outcome {
        self.release.notified().await;
        Outcome::Succeeded
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_entries_are_processed_by_one_worker() {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(MemoryBroker::new());
    let release = Arc::new(tokio::sync::Notify::new());
    let registry = Arc::new(HandlerRegistry::empty().register(
        "gated",
        Gate {
            release: release.clone(),
        },
    ));
    let service = JobService::new(store.clone(), broker.clone());
    let id = service
        .submit(NewJob::new().job_type("gated"))
        .await
        .unwrap()
        .job_id;

    let mut handles = Vec::new();
    for n in 0..8 {
        let worker = Worker::new(
            format!("w{n}"),
            store.clone(),
            broker.clone(),
            registry.clone(),
            WorkerConfig::default(),
            CancellationToken::new(),
        );
        let id = id.clone();
        handles.push(tokio::spawn(async move { worker.process(&id).await.unwrap() }));
    }

    // Let the losers finish, then release the winner.
    tokio::time::sleep(Duration::from_millis(100)).await;
    release.notify_waiters();
    release.notify_one();

    let mut completed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            ProcessOutcome::Completed => completed += 1,
            ProcessOutcome::Stale(_) | ProcessOutcome::Conflict => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(completed, 1);
    assert_eq!(store.get(&id).await.unwrap().unwrap().status, Status::Completed);
}

struct Panics;

#[async_trait]
impl Handler for Panics {
    async fn process(&self, _job: &Job) -> Outcome {
        panic!("handler blew up");
    }
}

#[tokio::test]
async fn panicking_handler_counts_as_failure() {
    let h = harness_with(
        HandlerRegistry::empty().register("boom", Panics),
        WorkerConfig::default(),
    );
    let id = h
        .service
        .submit(NewJob::new().job_type("boom"))
        .await
        .unwrap()
        .job_id;

    let outcome = h.worker.process(&h.next_id().await).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Retrying { attempts: 1, .. }));
    assert_eq!(h.job(&id).await.status, Status::Pending);
}

#[tokio::test]
async fn unknown_type_goes_through_retries_to_dead_letter() {
    let h = harness();
    let id = h
        .service
        .submit(NewJob::new().job_type("no-such-type"))
        .await
        .unwrap()
        .job_id;

    for _ in 0..3 {
        if let ProcessOutcome::Retrying { ready_at_ms, .. } =
            h.worker.process(&h.next_id().await).await.unwrap()
        {
            h.promoter.tick_at(ready_at_ms).await.unwrap();
        }
    }
    assert_eq!(h.job(&id).await.status, Status::Failed);
    assert_eq!(h.broker.list_dead_letter().await.unwrap(), vec![id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn running_pipeline_dead_letters_failing_job() {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(MemoryBroker::new());
    let shutdown = CancellationToken::new();
    let config = WorkerConfig {
        backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(40)),
        dequeue_timeout: Duration::from_millis(20),
        ..WorkerConfig::default()
    };
    let registry = Arc::new(HandlerRegistry::with_defaults(Duration::ZERO));

    let mut tasks = Vec::new();
    for n in 0..2 {
        let worker = Worker::new(
            format!("w{n}"),
            store.clone(),
            broker.clone(),
            registry.clone(),
            config.clone(),
            shutdown.clone(),
        );
        tasks.push(tokio::spawn(async move { worker.run().await }));
    }
    let promoter = RetryPromoter::new(
        broker.clone(),
        PromoterConfig {
            interval: Duration::from_millis(10),
            batch_size: 50,
        },
        shutdown.clone(),
    );
    tasks.push(tokio::spawn(async move { promoter.run().await }));

    let service = JobService::new(store.clone(), broker.clone());
    let failing = service
        .submit(NewJob::new().payload("FAIL_ALWAYS"))
        .await
        .unwrap()
        .job_id;
    let flaky = service
        .submit(NewJob::new().payload("FAIL_TIMES=1"))
        .await
        .unwrap()
        .job_id;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let a = store.get(&failing).await.unwrap().unwrap();
        let b = store.get(&flaky).await.unwrap().unwrap();
        if a.status == Status::Failed && b.status == Status::Completed {
            assert_eq!(a.attempts, 3);
            assert_eq!(b.attempts, 1);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pipeline did not settle: {a:?} {b:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.cancel();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("task did not stop on shutdown")
            .unwrap();
    }
    assert_eq!(broker.list_dead_letter().await.unwrap(), vec![failing]);
}

/// Store whose first `failures` reads error out.
struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicUsize,
}

impl FlakyStore {
    fn new(failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Other("store unavailable".into()));
        }
        self.inner.get(id).await
    }

    async fn put(&self, job: &Job) -> Result<()> {
        self.inner.put(job).await
    }

    async fn claim(&self, id: &JobId) -> Result<Transition> {
        self.inner.claim(id).await
    }

    async fn complete_success(&self, id: &JobId) -> Result<Transition> {
        self.inner.complete_success(id).await
    }

    async fn record_retry(&self, id: &JobId, attempts: u32) -> Result<Transition> {
        self.inner.record_retry(id, attempts).await
    }

    async fn record_terminal_failure(
        &self,
        id: &JobId,
        attempts: u32,
    ) -> Result<Transition> {
        self.inner.record_terminal_failure(id, attempts).await
    }

    async fn list(&self, status: Option<Status>, limit: usize) -> Result<Vec<Job>> {
        self.inner.list(status, limit).await
    }
}

#[tokio::test]
async fn load_error_returns_id_to_queue() {
    let store = Arc::new(FlakyStore::new(1));
    let broker = Arc::new(MemoryBroker::new());
    let service = JobService::new(store.clone(), broker.clone());
    let worker = Worker::new(
        "w",
        store.clone(),
        broker.clone(),
        Arc::new(HandlerRegistry::with_defaults(Duration::ZERO)),
        WorkerConfig::default(),
        CancellationToken::new(),
    );
    let id = service.submit(NewJob::new()).await.unwrap().job_id;

    let Dequeued::Job(popped) = broker.dequeue_main(Duration::from_millis(50)).await.unwrap()
    else {
        panic!("expected the submitted job");
    };
    assert!(worker.process(&popped).await.is_err());
    assert_eq!(broker.main_snapshot().await, vec![id.clone()]);
    assert_eq!(store.inner.get(&id).await.unwrap().unwrap().status, Status::Pending);

    assert_eq!(worker.process(&id).await.unwrap(), ProcessOutcome::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_keeps_going_after_store_error() {
    let store = Arc::new(FlakyStore::new(1));
    let broker = Arc::new(MemoryBroker::new());
    let shutdown = CancellationToken::new();
    let service = JobService::new(store.clone(), broker.clone());
    let worker = Worker::new(
        "w",
        store.clone(),
        broker.clone(),
        Arc::new(HandlerRegistry::with_defaults(Duration::ZERO)),
        WorkerConfig {
            dequeue_timeout: Duration::from_millis(20),
            error_pause: Duration::from_millis(50),
            ..WorkerConfig::default()
        },
        shutdown.clone(),
    );

    let first = service.submit(NewJob::new()).await.unwrap().job_id;
    let second = service.submit(NewJob::new()).await.unwrap().job_id;
    let task = tokio::spawn(async move { worker.run().await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let a = store.inner.get(&first).await.unwrap().unwrap();
        let b = store.inner.get(&second).await.unwrap().unwrap();
        if a.status == Status::Completed && b.status == Status::Completed {
            assert_eq!(a.attempts, 0);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker stalled: {a:?} {b:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(broker.main_snapshot().await.is_empty());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("worker did not stop on shutdown")
        .unwrap();
}

/// Broker whose retry writes always fail.
struct NoRetryBroker {
    inner: MemoryBroker,
}

#[async_trait]
impl Broker for NoRetryBroker {
    async fn enqueue_main(&self, id: &JobId) -> Result<()> {
        self.inner.enqueue_main(id).await
    }

    async fn dequeue_main(&self, timeout: Duration) -> Result<Dequeued> {
        self.inner.dequeue_main(timeout).await
    }

    async fn schedule_retry(&self, _id: &JobId, _ready_at_ms: i64) -> Result<()> {
        Err(Error::Other("retry set unavailable".into()))
    }

    async fn poll_ready(&self, now_ms: i64, limit: usize) -> Result<Vec<JobId>> {
        self.inner.poll_ready(now_ms, limit).await
    }

    async fn remove_from_retry(&self, id: &JobId) -> Result<bool> {
        self.inner.remove_from_retry(id).await
    }

    async fn push_dead_letter(&self, id: &JobId) -> Result<()> {
        self.inner.push_dead_letter(id).await
    }

    async fn list_dead_letter(&self) -> Result<Vec<JobId>> {
        self.inner.list_dead_letter().await
    }

    async fn remove_dead_letter(&self, id: &JobId) -> Result<bool> {
        self.inner.remove_dead_letter(id).await
    }
}

#[tokio::test]
async fn retry_write_error_after_claim_is_not_requeued() {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(NoRetryBroker {
        inner: MemoryBroker::new(),
    });
    let service = JobService::new(store.clone(), broker.clone());
    let worker = Worker::new(
        "w",
        store.clone(),
        broker.clone(),
        Arc::new(HandlerRegistry::with_defaults(Duration::ZERO)),
        WorkerConfig::default(),
        CancellationToken::new(),
    );
    let id = service
        .submit(NewJob::new().payload("FAIL_ALWAYS"))
        .await
        .unwrap()
        .job_id;

    let Dequeued::Job(popped) = broker.dequeue_main(Duration::from_millis(50)).await.unwrap()
    else {
        panic!("expected the submitted job");
    };
    assert!(worker.process(&popped).await.is_err());

    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, Status::Pending);
    assert_eq!(job.attempts, 1);
    assert!(broker.inner.main_snapshot().await.is_empty());
    assert!(broker.inner.retry_snapshot().await.is_empty());
}
