//! Retry promoter: moves retry entries whose deadline has passed back into
//! the dispatch queue.
//!
//! Only broker membership changes here. The job is already PENDING in the
//! store from when its retry was recorded.

use crate::broker::Broker;
use crate::error::Result;
use crate::telemetry::metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct PromoterConfig {
    pub interval: Duration,
    /// Upper bound on promotions per tick.
    pub batch_size: usize,
}

impl Default for PromoterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1_000),
            batch_size: 50,
        }
    }
}

pub struct RetryPromoter {
    broker: Arc<dyn Broker>,
    config: PromoterConfig,
    shutdown: CancellationToken,
}

impl RetryPromoter {
    pub fn new(broker: Arc<dyn Broker>, config: PromoterConfig, shutdown: CancellationToken) -> Self {
        Self {
            broker,
            config,
            shutdown,
        }
    }

    /// One pass at wall-clock time.
    pub async fn tick(&self) -> Result<usize> {
        self.tick_at(chrono::Utc::now().timestamp_millis()).await
    }

    /// One pass treating `now_ms` as the current time. Returns how many ids
    /// this call moved to the dispatch queue.
    pub async fn tick_at(&self, now_ms: i64) -> Result<usize> {
        let ready = self.broker.poll_ready(now_ms, self.config.batch_size).await?;
        let mut promoted = 0;

        for id in ready {
            // Whoever removes the entry owns the promotion.
            if self.broker.remove_from_retry(&id).await? {
                self.broker.enqueue_main(&id).await?;
                debug!(job_id = %id, "promoted retry to main queue");
                promoted += 1;
            }
        }

        if promoted > 0 {
            metrics::retries_promoted().add(promoted as u64, &[]);
            info!(promoted, "promoted ready retries");
        }
        Ok(promoted)
    }

    /// Tick every `interval` until the shutdown token is cancelled.
    pub async fn run(&self) {
        info!(interval_ms = self.config.interval.as_millis() as u64, "retry promoter started");

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "retry promotion failed");
            }
        }

        info!("retry promoter stopped");
    }
}
