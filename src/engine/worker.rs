//! Worker loop: dequeue, claim, execute, then complete, retry, or dead-letter.

use super::backoff::Backoff;
use crate::broker::{Broker, Dequeued};
use crate::error::Result;
use crate::handler::{HandlerRegistry, Outcome};
use crate::model::job::{Job, JobId, Status};
use crate::store::{JobStore, Transition};
use crate::telemetry::job::{record_job, record_status_transition, start_job_span};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Failed attempts after which a job is dead-lettered.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// How long one dequeue waits before looping again.
    pub dequeue_timeout: Duration,
    /// Pause after an infrastructure error.
    pub error_pause: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Backoff::default(),
            dequeue_timeout: Duration::from_secs(1),
            error_pause: Duration::from_secs(1),
        }
    }
}

/// What happened to one dequeued id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No such job in the store.
    Missing,
    /// The job was not PENDING; the queue entry was stale or a duplicate.
    Stale(Status),
    /// A conditional transition lost to another actor.
    Conflict,
    Completed,
    /// Failed and parked in the retry structure until `ready_at_ms`.
    Retrying { attempts: u32, ready_at_ms: i64 },
    /// Failed for the last time and pushed to the dead-letter queue.
    DeadLettered { attempts: u32 },
}

enum Acquired {
    Owned(Job),
    Skipped(ProcessOutcome),
}

pub struct Worker {
    name: String,
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            broker,
            registry,
            config,
            shutdown,
        }
    }

    /// Run until the shutdown token is cancelled.
    ///
    /// Cancellation interrupts the dequeue wait and the error pause only; a
    /// job already dequeued is always carried to a final transition.
    pub async fn run(&self) {
        info!(worker = %self.name, "worker started");

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = self.broker.dequeue_main(self.config.dequeue_timeout) => next,
            };

            let result = match next {
                Ok(Dequeued::Job(id)) => self.process(&id).await.map(|_| ()),
                Ok(Dequeued::Timeout) => {
                    debug!(worker = %self.name, "idle");
                    Ok(())
                }
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                error!(worker = %self.name, error = %e, "worker iteration failed");
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.error_pause) => {}
                }
            }
        }

        info!(worker = %self.name, "worker stopped");
    }

    /// Drive one dequeued id through the state machine.
    pub async fn process(&self, id: &JobId) -> Result<ProcessOutcome> {
        let span = start_job_span(&self.name, id);
        self.process_inner(id, &span).instrument(span.clone()).await
    }

    async fn process_inner(&self, id: &JobId, span: &Span) -> Result<ProcessOutcome> {
        let job = match self.acquire(id, span).await {
            Ok(Acquired::Owned(job)) => job,
            Ok(Acquired::Skipped(outcome)) => return Ok(outcome),
            Err(e) => {
                self.return_unclaimed(id).await;
                return Err(e);
            }
        };

        match self.execute(&job).await {
            Outcome::Succeeded => self.on_success(&job, span).await,
            Outcome::Failed { reason } => self.on_failure(&job, &reason, span).await,
        }
    }

    /// Load and claim. Nothing here has changed the job when it errors.
    async fn acquire(&self, id: &JobId, span: &Span) -> Result<Acquired> {
        let Some(job) = self.store.get(id).await? else {
            debug!("job not found, discarding");
            return Ok(Acquired::Skipped(ProcessOutcome::Missing));
        };
        record_job(span, &job.job_type, job.attempts);

        // Cheap filter for stale entries. Ownership comes from `claim` below.
        if job.status != Status::Pending {
            if job.status.is_terminal() {
                debug!(status = %job.status, "job already finished, discarding");
            } else {
                debug!(status = %job.status, "job owned elsewhere, discarding");
            }
            return Ok(Acquired::Skipped(ProcessOutcome::Stale(job.status)));
        }

        if self.store.claim(id).await? == Transition::Conflict {
            debug!("claim lost, discarding");
            return Ok(Acquired::Skipped(ProcessOutcome::Conflict));
        }
        record_status_transition(span, Status::Pending, Status::InProgress);
        Ok(Acquired::Owned(job))
    }

    /// Put an id popped before an infrastructure error back on the dispatch
    /// queue. The job is still PENDING, so a duplicate entry is harmless.
    async fn return_unclaimed(&self, id: &JobId) {
        match self.broker.enqueue_main(id).await {
            Ok(()) => warn!(job_id = %id, "job not claimed after error, returned to queue"),
            Err(e) => error!(
                job_id = %id,
                error = %e,
                "job not claimed and could not be returned to queue, requeue it manually"
            ),
        }
    }

    /// Run the handler in its own task so a panic is just a failed attempt.
    async fn execute(&self, job: &Job) -> Outcome {
        let handler = self.registry.resolve(&job.job_type);
        let owned = job.clone();
        let started = Instant::now();

        let outcome = match tokio::spawn(async move { handler.process(&owned).await }).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::failed(format!("handler panicked: {e}")),
        };

        metrics::handler_duration_ms().record(
            started.elapsed().as_secs_f64() * 1_000.0,
            &[
                KeyValue::new("job_type", job.job_type.clone()),
                KeyValue::new(
                    "outcome",
                    if outcome.is_success() { "succeeded" } else { "failed" },
                ),
            ],
        );
        outcome
    }

    async fn on_success(&self, job: &Job, span: &Span) -> Result<ProcessOutcome> {
        if self.store.complete_success(&job.id).await? == Transition::Conflict {
            warn!("completion conflicted, abandoning");
            return Ok(ProcessOutcome::Conflict);
        }
        record_status_transition(span, Status::InProgress, Status::Completed);
        info!(attempts = job.attempts, "job completed");
        Ok(ProcessOutcome::Completed)
    }

    async fn on_failure(&self, job: &Job, reason: &str, span: &Span) -> Result<ProcessOutcome> {
        let attempts = job.attempts.saturating_add(1);

        if attempts >= self.config.max_retries {
            let recorded = self.store.record_terminal_failure(&job.id, attempts).await?;
            if recorded == Transition::Conflict {
                warn!(attempts, "terminal failure conflicted, abandoning");
                return Ok(ProcessOutcome::Conflict);
            }
            self.broker
                .push_dead_letter(&job.id)
                .await
                .inspect_err(|e| {
                    error!(
                        job_id = %job.id,
                        error = %e,
                        action = "push_dead_letter",
                        "job marked FAILED but not dead-lettered"
                    )
                })?;
            record_status_transition(span, Status::InProgress, Status::Failed);
            metrics::jobs_dead_lettered()
                .add(1, &[KeyValue::new("job_type", job.job_type.clone())]);
            warn!(attempts, reason, "job failed permanently, dead-lettered");
            return Ok(ProcessOutcome::DeadLettered { attempts });
        }

        let delay = self.config.backoff.delay(attempts);
        let ready_at_ms = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;

        if self.store.record_retry(&job.id, attempts).await? == Transition::Conflict {
            warn!(attempts, "retry conflicted, abandoning");
            return Ok(ProcessOutcome::Conflict);
        }
        self.broker
            .schedule_retry(&job.id, ready_at_ms)
            .await
            .inspect_err(|e| {
                error!(
                    job_id = %job.id,
                    error = %e,
                    action = "schedule_retry",
                    ready_at_ms,
                    "job back to PENDING but retry not scheduled"
                )
            })?;
        record_status_transition(span, Status::InProgress, Status::Pending);
        info!(
            attempts,
            backoff_ms = delay.as_millis() as u64,
            reason,
            "job failed, retry scheduled"
        );
        Ok(ProcessOutcome::Retrying {
            attempts,
            ready_at_ms,
        })
    }
}
