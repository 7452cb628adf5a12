//! Broker over Postgres: pgmq for dispatch, tables for retry and dead-letter.

use super::MAIN_QUEUE;
use crate::broker::{Broker, Dequeued};
use crate::error::{Error, Result};
use crate::model::job::JobId;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Visibility timeout for a popped message. It is deleted right after the
/// read, so this only matters if the process dies in between.
const POP_VISIBILITY_SECONDS: i32 = 30;

#[async_trait]
impl Broker for super::Db {
    async fn enqueue_main(&self, id: &JobId) -> Result<()> {
        let payload = serde_json::json!({ "job_id": id.as_str() });
        self.send_to_queue(MAIN_QUEUE, &payload).await?;
        Ok(())
    }

    async fn dequeue_main(&self, timeout: Duration) -> Result<Dequeued> {
        // pgmq polls in whole seconds.
        let poll_seconds = timeout.as_secs_f64().ceil().max(1.0) as i32;
        let Some(msg) = self
            .read_with_poll(MAIN_QUEUE, POP_VISIBILITY_SECONDS, poll_seconds)
            .await?
        else {
            return Ok(Dequeued::Timeout);
        };

        let job_id = msg
            .message
            .get("job_id")
            .and_then(|v| v.as_str())
            .map(JobId::from);

        let Some(job_id) = job_id else {
            self.archive_message(MAIN_QUEUE, msg.msg_id).await?;
            return Err(Error::Other(format!(
                "bad pgmq payload in message {}: missing job_id",
                msg.msg_id
            )));
        };

        if !self.delete_message(MAIN_QUEUE, msg.msg_id).await? {
            // Visibility expired and another reader owns it now.
            warn!(msg_id = msg.msg_id, job_id = %job_id, "message already taken");
            return Ok(Dequeued::Timeout);
        }

        Ok(Dequeued::Job(job_id))
    }

    async fn schedule_retry(&self, id: &JobId, ready_at_ms: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO retry_jobs (job_id, ready_at_ms) VALUES ($1, $2)
             ON CONFLICT (job_id) DO UPDATE SET ready_at_ms = EXCLUDED.ready_at_ms",
        )
        .bind(id.as_str())
        .bind(ready_at_ms)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn poll_ready(&self, now_ms: i64, limit: usize) -> Result<Vec<JobId>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT job_id FROM retry_jobs
             WHERE ready_at_ms <= $1
             ORDER BY ready_at_ms, job_id
             LIMIT $2",
        )
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| JobId(id)).collect())
    }

    async fn remove_from_retry(&self, id: &JobId) -> Result<bool> {
        let rows_affected = sqlx::query("DELETE FROM retry_jobs WHERE job_id = $1")
            .bind(id.as_str())
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn push_dead_letter(&self, id: &JobId) -> Result<()> {
        sqlx::query("INSERT INTO deadletter_jobs (job_id) VALUES ($1)")
            .bind(id.as_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn list_dead_letter(&self) -> Result<Vec<JobId>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT job_id FROM deadletter_jobs ORDER BY seq")
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(|(id,)| JobId(id)).collect())
    }

    async fn remove_dead_letter(&self, id: &JobId) -> Result<bool> {
        let rows_affected = sqlx::query(
            "DELETE FROM deadletter_jobs WHERE seq = (
                SELECT seq FROM deadletter_jobs WHERE job_id = $1
                ORDER BY seq LIMIT 1
                FOR UPDATE SKIP LOCKED
             )",
        )
        .bind(id.as_str())
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }
}
