//! Job store over the `jobs` table.
//!
//! Each transition is one `UPDATE ... WHERE id = $1 AND status = ...`;
//! zero affected rows means the precondition no longer held.

use crate::error::Result;
use crate::model::job::{Job, JobId, Status};
use crate::store::{JobStore, Transition};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;

fn record_transition(from: Status, to: Status) {
    metrics::job_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

impl super::Db {
    /// Move `id` from `from` to `to`, optionally setting attempts.
    ///
    /// Also matches a row already sitting at the exact target, so a repeated
    /// call reports `Applied` and leaves `updated_at` alone.
    async fn conditional_transition(
        &self,
        id: &JobId,
        from: Status,
        to: Status,
        attempts: Option<u32>,
    ) -> Result<Transition> {
        let rows_affected = sqlx::query(
            "UPDATE jobs
             SET status = $2,
                 attempts = COALESCE($3, attempts),
                 updated_at = CASE WHEN status = $4 THEN now() ELSE updated_at END
             WHERE id = $1
             AND (status = $4 OR (status = $2 AND attempts = COALESCE($3, attempts)))",
        )
        .bind(id.as_str())
        .bind(to.as_str())
        .bind(attempts.map(|n| n as i32))
        .bind(from.as_str())
        .execute(self.pool())
        .await?
        .rows_affected();

        let outcome = Transition::from(rows_affected > 0);
        if outcome.is_applied() {
            record_transition(from, to);
        }
        Ok(outcome)
    }
}

#[async_trait]
impl JobStore for super::Db {
    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, job_type, payload, status, attempts, created_at, updated_at
             FROM jobs WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(self.pool())
        .await?;

        row.map(JobRow::try_into_job).transpose()
    }

    async fn put(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (id, job_type, payload, status, attempts, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE SET
                job_type = EXCLUDED.job_type,
                payload = EXCLUDED.payload,
                status = EXCLUDED.status,
                attempts = EXCLUDED.attempts,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(job.id.as_str())
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn claim(&self, id: &JobId) -> Result<Transition> {
        // No idempotent branch here: a second claim must lose.
        let rows_affected = sqlx::query(
            "UPDATE jobs SET status = 'IN_PROGRESS', updated_at = now()
             WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id.as_str())
        .execute(self.pool())
        .await?
        .rows_affected();

        let outcome = Transition::from(rows_affected > 0);
        if outcome.is_applied() {
            record_transition(Status::Pending, Status::InProgress);
        }
        Ok(outcome)
    }

    async fn complete_success(&self, id: &JobId) -> Result<Transition> {
        self.conditional_transition(id, Status::InProgress, Status::Completed, None)
            .await
    }

    async fn record_retry(&self, id: &JobId, attempts: u32) -> Result<Transition> {
        self.conditional_transition(id, Status::InProgress, Status::Pending, Some(attempts))
            .await
    }

    async fn record_terminal_failure(&self, id: &JobId, attempts: u32) -> Result<Transition> {
        self.conditional_transition(id, Status::InProgress, Status::Failed, Some(attempts))
            .await
    }

    async fn list(&self, status: Option<Status>, limit: usize) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT id, job_type, payload, status, attempts, created_at, updated_at
             FROM jobs
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY created_at DESC
             LIMIT $2",
        )
        .bind(status.map(Status::as_str))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    payload: String,
    status: String,
    attempts: i32,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            job_type: self.job_type,
            payload: self.payload,
            status: self.status.parse()?,
            attempts: self.attempts.max(0) as u32,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
