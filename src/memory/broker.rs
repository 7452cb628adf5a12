//! In-process broker.

use crate::broker::{Broker, Dequeued};
use crate::error::Result;
use crate::model::job::JobId;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct RetrySet {
    by_score: BTreeSet<(i64, JobId)>,
    scores: HashMap<JobId, i64>,
}

/// Broker with the same observable semantics as the Postgres and Redis
/// backends, for tests and single-process embedding.
#[derive(Default)]
pub struct MemoryBroker {
    main: Mutex<VecDeque<JobId>>,
    main_ready: Notify,
    retry: Mutex<RetrySet>,
    dead_letter: Mutex<VecDeque<JobId>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents of the dispatch queue, head first.
    pub async fn main_snapshot(&self) -> Vec<JobId> {
        self.main.lock().await.iter().cloned().collect()
    }

    /// Current contents of the retry structure with their scores, lowest first.
    pub async fn retry_snapshot(&self) -> Vec<(JobId, i64)> {
        self.retry
            .lock()
            .await
            .by_score
            .iter()
            .map(|(score, id)| (id.clone(), *score))
            .collect()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue_main(&self, id: &JobId) -> Result<()> {
        self.main.lock().await.push_back(id.clone());
        self.main_ready.notify_one();
        Ok(())
    }

    async fn dequeue_main(&self, timeout: Duration) -> Result<Dequeued> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before looking, so a push in between still wakes us.
            let notified = self.main_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.main.lock().await.pop_front() {
                return Ok(Dequeued::Job(id));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Dequeued::Timeout);
            }
        }
    }

    async fn schedule_retry(&self, id: &JobId, ready_at_ms: i64) -> Result<()> {
        let mut retry = self.retry.lock().await;
        if let Some(old) = retry.scores.insert(id.clone(), ready_at_ms) {
            retry.by_score.remove(&(old, id.clone()));
        }
        retry.by_score.insert((ready_at_ms, id.clone()));
        Ok(())
    }

    async fn poll_ready(&self, now_ms: i64, limit: usize) -> Result<Vec<JobId>> {
        let retry = self.retry.lock().await;
        Ok(retry
            .by_score
            .iter()
            .take_while(|(score, _)| *score <= now_ms)
            .take(limit)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn remove_from_retry(&self, id: &JobId) -> Result<bool> {
        let mut retry = self.retry.lock().await;
        match retry.scores.remove(id) {
            Some(score) => {
                retry.by_score.remove(&(score, id.clone()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn push_dead_letter(&self, id: &JobId) -> Result<()> {
        self.dead_letter.lock().await.push_back(id.clone());
        Ok(())
    }

    async fn list_dead_letter(&self) -> Result<Vec<JobId>> {
        Ok(self.dead_letter.lock().await.iter().cloned().collect())
    }

    async fn remove_dead_letter(&self, id: &JobId) -> Result<bool> {
        let mut dead_letter = self.dead_letter.lock().await;
        match dead_letter.iter().position(|d| d == id) {
            Some(pos) => {
                dead_letter.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let broker = MemoryBroker::new();
        let got = broker
            .dequeue_main(Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(got, Dequeued::Timeout);
    }

    #[tokio::test]
    async fn blocked_dequeue_wakes_on_enqueue() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dequeue_main(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.enqueue_main(&JobId::from("late")).await.unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, Dequeued::Job(JobId::from("late")));
    }

    #[tokio::test]
    async fn reschedule_replaces_score() {
        let broker = MemoryBroker::new();
        let id = JobId::from("a");
        broker.schedule_retry(&id, 500).await.unwrap();
        broker.schedule_retry(&id, 100).await.unwrap();
        assert_eq!(broker.retry_snapshot().await, vec![(id, 100)]);
    }
}
