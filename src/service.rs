//! Submission and recovery operations: the surface an API or CLI sits on.

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::model::job::{Job, JobId, NewJob, Status, SubmitResult};
use crate::store::JobStore;
use crate::telemetry::metrics;
use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{info, warn};

pub struct JobService {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, broker: Arc<dyn Broker>) -> Self {
        Self { store, broker }
    }

    /// Persist a new PENDING job and put its id on the dispatch queue.
    pub async fn submit(&self, new: NewJob) -> Result<SubmitResult> {
        let job = Job::new(new);
        self.store.put(&job).await?;
        self.broker.enqueue_main(&job.id).await?;

        metrics::jobs_submitted().add(1, &[KeyValue::new("job_type", job.job_type.clone())]);
        info!(job_id = %job.id, job_type = %job.job_type, "job submitted");

        Ok(SubmitResult {
            job_id: job.id,
            status: job.status,
        })
    }

    pub async fn get(&self, id: &JobId) -> Result<Job> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub async fn list(&self, status: Option<Status>, limit: usize) -> Result<Vec<Job>> {
        self.store.list(status, limit).await
    }

    /// Put a job back to PENDING and re-enqueue it. Attempts are kept.
    pub async fn requeue(&self, id: &JobId) -> Result<Job> {
        let job = self.reset(id, None).await?;
        self.broker.enqueue_main(id).await?;
        info!(job_id = %id, attempts = job.attempts, "job requeued");
        Ok(job)
    }

    /// Records for every id in the dead-letter queue. Ids whose record no
    /// longer exists are skipped.
    pub async fn list_dead_letter(&self) -> Result<Vec<Job>> {
        let ids = self.broker.list_dead_letter().await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.store.get(id).await? {
                Some(job) => jobs.push(job),
                None => warn!(job_id = %id, "dead-lettered id has no job record"),
            }
        }
        Ok(jobs)
    }

    /// Reset a dead-lettered job to PENDING with zero attempts, drop it from
    /// the dead-letter queue, and re-enqueue it.
    pub async fn requeue_dead_letter(&self, id: &JobId) -> Result<Job> {
        let job = self.reset(id, Some(0)).await?;
        if !self.broker.remove_dead_letter(id).await? {
            warn!(job_id = %id, "job was not in the dead-letter queue");
        }
        self.broker.enqueue_main(id).await?;
        info!(job_id = %id, "dead-lettered job requeued");
        Ok(job)
    }

    async fn reset(&self, id: &JobId, attempts: Option<u32>) -> Result<Job> {
        let mut job = self.get(id).await?;
        job.status = Status::Pending;
        if let Some(n) = attempts {
            job.attempts = n;
        }
        job.updated_at = Utc::now();
        self.store.put(&job).await?;
        Ok(job)
    }
}
