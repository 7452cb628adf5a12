//! Broker contract: the dispatch queue, the retry structure, and the
//! dead-letter queue.
//!
//! Each operation is atomic on its own. No two calls are atomic together, so
//! consumers must tolerate ids whose job has already moved on.

#[cfg(feature = "redis")]
pub mod redis;

use crate::error::Result;
use crate::model::job::JobId;
use async_trait::async_trait;
use std::time::Duration;

/// Result of a blocking pop on the dispatch queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeued {
    Job(JobId),
    /// Nothing arrived within the timeout. Not an error.
    Timeout,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Append to the tail of the dispatch queue.
    async fn enqueue_main(&self, id: &JobId) -> Result<()>;

    /// Pop from the head, waiting up to `timeout`. Each id goes to exactly
    /// one caller.
    async fn dequeue_main(&self, timeout: Duration) -> Result<Dequeued>;

    /// Insert or reschedule `id` in the retry structure.
    async fn schedule_retry(&self, id: &JobId, ready_at_ms: i64) -> Result<()>;

    /// Up to `limit` ids with a score `<= now_ms`, lowest score first.
    /// Nothing is removed.
    async fn poll_ready(&self, now_ms: i64, limit: usize) -> Result<Vec<JobId>>;

    /// Remove `id` from the retry structure. `true` only for the caller
    /// that actually removed it.
    async fn remove_from_retry(&self, id: &JobId) -> Result<bool>;

    async fn push_dead_letter(&self, id: &JobId) -> Result<()>;

    /// Dead-lettered ids in insertion order.
    async fn list_dead_letter(&self) -> Result<Vec<JobId>>;

    /// Remove one occurrence of `id`. `true` if one was removed.
    async fn remove_dead_letter(&self, id: &JobId) -> Result<bool>;
}
