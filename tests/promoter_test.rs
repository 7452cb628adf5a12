//! Retry promoter tests.

use jobq::broker::Broker;
use jobq::engine::{PromoterConfig, RetryPromoter};
use jobq::memory::MemoryBroker;
use jobq::model::JobId;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn promoter(broker: &Arc<MemoryBroker>, batch_size: usize) -> RetryPromoter {
    RetryPromoter::new(
        broker.clone(),
        PromoterConfig {
            interval: Duration::from_millis(10),
            batch_size,
        },
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn promotes_only_due_entries_in_score_order() {
    let broker = Arc::new(MemoryBroker::new());
    broker.schedule_retry(&JobId::from("b"), 200).await.unwrap();
    broker.schedule_retry(&JobId::from("a"), 100).await.unwrap();
    broker.schedule_retry(&JobId::from("later"), 10_000).await.unwrap();

    let promoted = promoter(&broker, 50).tick_at(500).await.unwrap();
    assert_eq!(promoted, 2);
    assert_eq!(
        broker.main_snapshot().await,
        vec![JobId::from("a"), JobId::from("b")]
    );
    assert_eq!(
        broker.retry_snapshot().await,
        vec![(JobId::from("later"), 10_000)]
    );
}

#[tokio::test]
async fn batch_size_bounds_each_tick() {
    let broker = Arc::new(MemoryBroker::new());
    for n in 0..120 {
        broker
            .schedule_retry(&JobId::from(format!("job-{n}")), n)
            .await
            .unwrap();
    }
    let p = promoter(&broker, 50);

    assert_eq!(p.tick_at(1_000).await.unwrap(), 50);
    assert_eq!(p.tick_at(1_000).await.unwrap(), 50);
    assert_eq!(p.tick_at(1_000).await.unwrap(), 20);
    assert_eq!(p.tick_at(1_000).await.unwrap(), 0);
    assert_eq!(broker.main_snapshot().await.len(), 120);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ticks_never_promote_twice() {
    let broker = Arc::new(MemoryBroker::new());
    for n in 0..200 {
        broker
            .schedule_retry(&JobId::from(format!("job-{n}")), 0)
            .await
            .unwrap();
    }

    let mut ticks = Vec::new();
    for _ in 0..4 {
        let p = promoter(&broker, 500);
        ticks.push(tokio::spawn(async move { p.tick_at(1).await.unwrap() }));
    }
    let mut total = 0;
    for t in ticks {
        total += t.await.unwrap();
    }

    let main = broker.main_snapshot().await;
    let unique: HashSet<_> = main.iter().cloned().collect();
    assert_eq!(total, 200);
    assert_eq!(main.len(), 200);
    assert_eq!(unique.len(), 200);
}

#[tokio::test]
async fn run_promotes_until_cancelled() {
    let broker = Arc::new(MemoryBroker::new());
    let shutdown = CancellationToken::new();
    let p = RetryPromoter::new(
        broker.clone(),
        PromoterConfig {
            interval: Duration::from_millis(10),
            batch_size: 50,
        },
        shutdown.clone(),
    );
    let task = tokio::spawn(async move { p.run().await });

    broker.schedule_retry(&JobId::from("due"), 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.main_snapshot().await, vec![JobId::from("due")]);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("promoter did not stop")
        .unwrap();
}
