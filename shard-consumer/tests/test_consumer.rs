use std::time::Duration;

use anyhow::Result;
use health::ComponentStatus;

use shard_consumer::config::EnvMsDuration;
use shard_consumer::test_utils::{after, record, records};
use shard_consumer::{Cursor, FlushTrigger, Partition, PartitionStatus};

pub mod common;
use common::*;

#[tokio::test(start_paused = true)]
async fn it_delivers_each_partition_in_order() -> Result<()> {
    let mut harness = Harness::new(DEFAULT_CONFIG.clone())?;
    let results = harness.subscribe(&["p0", "p1"], Cursor::AtStart).await;
    assert!(results.iter().all(|result| result.is_ok()));
    harness.run();

    let p0 = harness.transport.accept("p0").await;
    let p1 = harness.transport.accept("p1").await;
    assert_eq!(p0.cursor, Cursor::AtStart);

    p0.sender.push(records(1..=4), false).await?;
    p1.sender.push(records(1..=3), false).await?;
    p0.sender.push(records(5..=9), false).await?;
    p1.sender.push(records(4..=7), true).await?;
    p0.sender.push(records(10..=12), true).await?;

    let collected = harness.collect(2).await;
    assert_eq!(collected.records_of("p0"), (1..=12).collect::<Vec<_>>());
    assert_eq!(collected.records_of("p1"), (1..=7).collect::<Vec<_>>());

    let summary = harness.summary().await;
    assert_eq!(summary.records, 19);
    assert_eq!(summary.closed.len(), 2);
    assert!(summary.errored.is_empty());

    assert_eq!(harness.consumer.checkpoint("p0"), Some(after(12)));
    assert_eq!(
        harness.consumer.partition_status("p1"),
        Some(PartitionStatus::Closed)
    );
    assert_eq!(harness.consumer.in_flight(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn it_emits_partial_batches_after_max_wait() -> Result<()> {
    let mut config = DEFAULT_CONFIG.clone();
    config.max_batch_size = 3;
    config.max_batch_wait = EnvMsDuration(Duration::from_millis(100));

    let mut harness = Harness::new(config)?;
    harness.subscribe(&["p0"], Cursor::AtStart).await;
    harness.run();
    let p0 = harness.transport.accept("p0").await;

    p0.sender.push(records(1..=2), false).await?;
    let started = tokio::time::Instant::now();

    match harness.next_event().await {
        Event::Batch {
            sequence_numbers,
            trigger,
            ..
        } => {
            assert_eq!(sequence_numbers, vec![1, 2]);
            assert_eq!(trigger, FlushTrigger::Timeout);
        }
        other => panic!("expected a batch, got {:?}", other),
    }
    assert!(started.elapsed() <= Duration::from_millis(150));

    harness.consumer.shutdown().await?;
    harness.summary().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn it_closes_split_partitions_on_terminal_push() -> Result<()> {
    let mut harness = Harness::new(DEFAULT_CONFIG.clone())?;
    let child = Partition::with_parent("p1", "p0");
    let results = harness
        .consumer
        .subscribe(vec![child.clone()], &cursors(&["p1"], Cursor::AtStart))
        .await;
    assert_eq!(results, vec![Ok(())]);
    harness.run();

    let p1 = harness.transport.accept("p1").await;
    // Heartbeats keep the partition healthy without producing batches.
    p1.sender.push(vec![], false).await?;
    settle().await;
    let health = harness.consumer.health();
    assert!(health.healthy);
    assert!(matches!(
        health.components.get("partition-p1"),
        Some(ComponentStatus::HealthyUntil(_))
    ));

    p1.sender.push(records(1..=2), true).await?;

    match harness.next_event().await {
        Event::Batch {
            sequence_numbers,
            trigger,
            ..
        } => {
            assert_eq!(sequence_numbers, vec![1, 2]);
            assert_eq!(trigger, FlushTrigger::Close);
        }
        other => panic!("expected a batch, got {:?}", other),
    }
    assert_eq!(harness.next_event().await, Event::Closed(child));

    let summary = harness.summary().await;
    assert_eq!(summary.closed, vec!["p1".to_string()]);
    assert_eq!(summary.batches, 1);
    assert_eq!(
        harness.consumer.health().components.get("partition-p1"),
        Some(&ComponentStatus::Finished)
    );
    assert_eq!(harness.transport.closed_handles(), vec![p1.handle]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn it_checkpoints_after_the_handler_is_done() -> Result<()> {
    let mut harness = Harness::new(DEFAULT_CONFIG.clone())?;
    let start = after(10);
    harness.subscribe(&["p0"], start.clone()).await;
    assert_eq!(harness.consumer.checkpoint("p0"), Some(start.clone()));
    harness.run();

    let p0 = harness.transport.accept("p0").await;
    assert_eq!(p0.cursor, start);

    // Already consumed records are dropped, the rest fill one batch.
    let mut pushed = records(9..=10);
    pushed.extend(records(11..=15));
    p0.sender.push(pushed, false).await?;

    match harness.next_event().await {
        Event::Batch {
            sequence_numbers, ..
        } => assert_eq!(sequence_numbers, vec![11, 12, 13, 14, 15]),
        other => panic!("expected a batch, got {:?}", other),
    }
    settle().await;
    assert_eq!(harness.consumer.checkpoint("p0"), Some(after(15)));
    assert_eq!(harness.consumer.checkpoint("unknown"), None);

    harness.consumer.shutdown().await?;
    let summary = harness.summary().await;
    assert_eq!(summary.stopped, vec!["p0".to_string()]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn it_renews_expired_subscriptions_without_backoff() -> Result<()> {
    let mut config = DEFAULT_CONFIG.clone();
    config.retry_policy.backoff_base = EnvMsDuration(Duration::from_secs(10));
    config.retry_policy.backoff_max = EnvMsDuration(Duration::from_secs(10));

    let mut harness = Harness::new(config)?;
    harness.subscribe(&["p0"], Cursor::AtStart).await;
    harness.run();

    let first = harness.transport.accept("p0").await;
    first.sender.push(records(1..=3), false).await?;
    drop(first.sender);

    let second = tokio::time::timeout(
        Duration::from_secs(1),
        harness.transport.accept("p0"),
    )
    .await
    .expect("renewed right away");
    assert_eq!(second.cursor, after(3));

    second
        .sender
        .push(vec![record(3), record(4), record(5)], true)
        .await?;

    let collected = harness.collect(1).await;
    assert_eq!(collected.records_of("p0"), vec![1, 2, 3, 4, 5]);
    assert_eq!(
        harness.transport.opened_cursors("p0"),
        vec![Cursor::AtStart, after(3)]
    );

    harness.summary().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn it_keeps_batching_across_renewals() -> Result<()> {
    let mut config = DEFAULT_CONFIG.clone();
    config.max_batch_size = 5;
    config.max_batch_wait = EnvMsDuration(Duration::from_secs(60));

    let mut harness = Harness::new(config)?;
    harness.subscribe(&["p0"], Cursor::AtStart).await;
    harness.run();

    let first = harness.transport.accept("p0").await;
    first.sender.push(records(1..=2), false).await?;
    drop(first.sender);

    let second = harness.transport.accept("p0").await;
    assert_eq!(second.cursor, after(2));
    second.sender.push(records(3..=5), false).await?;

    // One full batch, not a partial one cut by the renewal.
    assert_eq!(
        harness.next_event().await,
        Event::Batch {
            partition: "p0".to_string(),
            sequence_numbers: vec![1, 2, 3, 4, 5],
            trigger: FlushTrigger::Size,
            in_flight: 0,
        }
    );

    harness.consumer.shutdown().await?;
    let summary = harness.summary().await;
    assert_eq!(summary.batches, 1);
    assert_eq!(summary.stopped, vec!["p0".to_string()]);
    Ok(())
}
