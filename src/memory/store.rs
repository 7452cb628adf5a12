//! In-process job store.

use crate::error::Result;
use crate::model::job::{Job, JobId, Status};
use crate::store::{JobStore, Transition};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Job store backed by a `HashMap`. Each transition checks its precondition
/// and applies the change under one lock acquisition.
#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `to`/`attempts` if the job is in `from`, or is already exactly
    /// at the target (idempotent reapplication).
    async fn transition(
        &self,
        id: &JobId,
        from: Status,
        to: Status,
        attempts: Option<u32>,
    ) -> Transition {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(id) else {
            return Transition::Conflict;
        };

        let already_there = job.status == to && attempts.is_none_or(|n| job.attempts == n);
        if already_there {
            return Transition::Applied;
        }
        if job.status != from {
            return Transition::Conflict;
        }

        job.status = to;
        if let Some(n) = attempts {
            job.attempts = n;
        }
        job.updated_at = Utc::now();
        Transition::Applied
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn put(&self, job: &Job) -> Result<()> {
        self.jobs.lock().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn claim(&self, id: &JobId) -> Result<Transition> {
        let mut jobs = self.jobs.lock().await;
        let claimed = match jobs.get_mut(id) {
            Some(job) if job.status == Status::Pending => {
                job.status = Status::InProgress;
                job.updated_at = Utc::now();
                true
            }
            _ => false,
        };
        Ok(claimed.into())
    }

    async fn complete_success(&self, id: &JobId) -> Result<Transition> {
        Ok(self
            .transition(id, Status::InProgress, Status::Completed, None)
            .await)
    }

    async fn record_retry(&self, id: &JobId, attempts: u32) -> Result<Transition> {
        Ok(self
            .transition(id, Status::InProgress, Status::Pending, Some(attempts))
            .await)
    }

    async fn record_terminal_failure(&self, id: &JobId, attempts: u32) -> Result<Transition> {
        Ok(self
            .transition(id, Status::InProgress, Status::Failed, Some(attempts))
            .await)
    }

    async fn list(&self, status: Option<Status>, limit: usize) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }
}
