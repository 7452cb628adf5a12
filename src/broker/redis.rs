//! Redis broker: a list for dispatch, a sorted set for retries, a list for
//! dead letters.

use super::{Broker, Dequeued};
use crate::error::Result;
use crate::model::job::JobId;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::time::Duration;

pub const QUEUE_KEY: &str = "queue:jobs";
pub const RETRY_KEY: &str = "retry:jobs";
pub const DEAD_LETTER_KEY: &str = "deadletter:jobs";

pub struct RedisBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self { client, conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue_main(&self, id: &JobId) -> Result<()> {
        let _: i64 = redis::cmd("RPUSH")
            .arg(QUEUE_KEY)
            .arg(id.as_str())
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn dequeue_main(&self, timeout: Duration) -> Result<Dequeued> {
        // BLPOP holds its connection for the whole wait, so it gets its own
        // instead of stalling the shared multiplexed one.
        let mut blocking = self.client.get_multiplexed_tokio_connection().await?;
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(QUEUE_KEY)
            .arg(timeout.as_secs_f64())
            .query_async(&mut blocking)
            .await?;
        Ok(match popped {
            Some((_, id)) => Dequeued::Job(JobId(id)),
            None => Dequeued::Timeout,
        })
    }

    async fn schedule_retry(&self, id: &JobId, ready_at_ms: i64) -> Result<()> {
        let _: i64 = redis::cmd("ZADD")
            .arg(RETRY_KEY)
            .arg(ready_at_ms)
            .arg(id.as_str())
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn poll_ready(&self, now_ms: i64, limit: usize) -> Result<Vec<JobId>> {
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(RETRY_KEY)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut self.conn())
            .await?;
        Ok(ids.into_iter().map(JobId).collect())
    }

    async fn remove_from_retry(&self, id: &JobId) -> Result<bool> {
        let removed: i64 = redis::cmd("ZREM")
            .arg(RETRY_KEY)
            .arg(id.as_str())
            .query_async(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }

    async fn push_dead_letter(&self, id: &JobId) -> Result<()> {
        let _: i64 = redis::cmd("RPUSH")
            .arg(DEAD_LETTER_KEY)
            .arg(id.as_str())
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn list_dead_letter(&self) -> Result<Vec<JobId>> {
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(DEAD_LETTER_KEY)
            .arg(0)
            .arg(-1)
            .query_async(&mut self.conn())
            .await?;
        Ok(ids.into_iter().map(JobId).collect())
    }

    async fn remove_dead_letter(&self, id: &JobId) -> Result<bool> {
        let removed: i64 = redis::cmd("LREM")
            .arg(DEAD_LETTER_KEY)
            .arg(1)
            .arg(id.as_str())
            .query_async(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }
}
