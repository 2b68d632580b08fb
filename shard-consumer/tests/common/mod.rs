#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use shard_consumer::config::{Config, EnvMsDuration};
use shard_consumer::test_utils::{sequence_numbers, MockTransport};
use shard_consumer::{
    Batch, BatchHandler, Cursor, FlushTrigger, Partition, PartitionError, RunSummary,
    StreamConsumer, SubscriptionError,
};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(60);

pub static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(|| {
    let mut config = Config::default();
    config.max_in_flight = 100;
    config.max_batch_size = 5;
    config.max_batch_wait = EnvMsDuration(Duration::from_millis(50));
    config.backpressure_timeout = EnvMsDuration(Duration::from_millis(200));
    config.backpressure_pause = EnvMsDuration(Duration::from_millis(20));
    config.delivery_buffer = 16;
    config.shutdown_timeout = EnvMsDuration(Duration::from_secs(1));
    config.retry_policy.backoff_base = EnvMsDuration(Duration::from_millis(10));
    config.retry_policy.backoff_max = EnvMsDuration(Duration::from_millis(100));
    config.retry_policy.backoff_jitter = 0.0;
    config.retry_policy.max_retries = 5;
    config
});

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Batch {
        partition: String,
        sequence_numbers: Vec<u128>,
        trigger: FlushTrigger,
        in_flight: usize,
    },
    Failed {
        partition: String,
        error: PartitionError,
    },
    Closed(Partition),
}

/// Forwards everything the consumer hands it to the test.
pub struct RecordingHandler {
    events: mpsc::UnboundedSender<Event>,
    delay: Option<Duration>,
    probe: Option<Arc<StreamConsumer>>,
}

#[async_trait]
impl BatchHandler for RecordingHandler {
    async fn handle_batch(&mut self, batch: Batch) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let in_flight = self
            .probe
            .as_ref()
            .map_or(0, |consumer| consumer.in_flight());

        self.record(Event::Batch {
            partition: batch.partition.id.clone(),
            sequence_numbers: sequence_numbers(&batch.records),
            trigger: batch.trigger,
            in_flight,
        });
    }

    async fn partition_failed(&mut self, partition: &Partition, error: &PartitionError) {
        self.record(Event::Failed {
            partition: partition.id.clone(),
            error: error.clone(),
        });
    }

    async fn partition_closed(&mut self, partition: &Partition) {
        self.record(Event::Closed(partition.clone()));
    }
}

impl RecordingHandler {
    fn record(&self, event: Event) {
        // The test may have stopped listening already.
        self.events.send(event).ok();
    }
}

/// What a run delivered, grouped by partition.
#[derive(Debug, Default)]
pub struct Collected {
    pub records: HashMap<String, Vec<u128>>,
    pub closed: Vec<String>,
    pub failed: Vec<(String, PartitionError)>,
    pub max_in_flight: usize,
}

impl Collected {
    pub fn records_of(&self, partition: &str) -> Vec<u128> {
        self.records.get(partition).cloned().unwrap_or_default()
    }
}

pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub consumer: Arc<StreamConsumer>,
    events: mpsc::UnboundedReceiver<Event>,
    handler: Option<RecordingHandler>,
    run: Option<JoinHandle<RunSummary>>,
}

impl Harness {
    pub fn new(config: Config) -> anyhow::Result<Harness> {
        init_tracing();
        let transport = MockTransport::new();
        let consumer = Arc::new(StreamConsumer::new(transport.clone(), config)?);
        let (tx, events) = mpsc::unbounded_channel();

        Ok(Harness {
            transport,
            consumer,
            events,
            handler: Some(RecordingHandler {
                events: tx,
                delay: None,
                probe: None,
            }),
            run: None,
        })
    }

    /// Make the handler take `delay` per batch and sample the records in flight.
    pub fn with_slow_handler(mut self, delay: Duration) -> Harness {
        if let Some(handler) = self.handler.as_mut() {
            handler.delay = Some(delay);
            handler.probe = Some(self.consumer.clone());
        }
        self
    }

    pub async fn subscribe(
        &self,
        partition_ids: &[&str],
        cursor: Cursor,
    ) -> Vec<Result<(), SubscriptionError>> {
        let partitions = partition_ids.iter().map(|id| Partition::new(id)).collect();
        self.consumer
            .subscribe(partitions, &cursors(partition_ids, cursor))
            .await
    }

    /// Start delivering to the recording handler.
    pub fn run(&mut self) {
        let mut handler = self.handler.take().expect("run is only started once");
        let consumer = self.consumer.clone();
        self.run = Some(tokio::spawn(async move { consumer.run(&mut handler).await }));
    }

    pub async fn next_event(&mut self) -> Event {
        tokio::time::timeout(WAIT_TIMEOUT, self.events.recv())
            .await
            .expect("no event received in time")
            .expect("the handler is gone")
    }

    /// Gather events until `partitions` partitions closed or failed.
    pub async fn collect(&mut self, partitions: usize) -> Collected {
        let mut collected = Collected::default();
        while collected.closed.len() + collected.failed.len() < partitions {
            match self.next_event().await {
                Event::Batch {
                    partition,
                    sequence_numbers,
                    in_flight,
                    ..
                } => {
                    collected.max_in_flight = collected.max_in_flight.max(in_flight);
                    collected
                        .records
                        .entry(partition)
                        .or_default()
                        .extend(sequence_numbers);
                }
                Event::Closed(partition) => collected.closed.push(partition.id),
                Event::Failed { partition, error } => collected.failed.push((partition, error)),
            }
        }
        collected
    }

    /// Wait for the run to return.
    pub async fn summary(&mut self) -> RunSummary {
        let run = self.run.take().expect("run was started");
        tokio::time::timeout(WAIT_TIMEOUT, run)
            .await
            .expect("run did not return in time")
            .expect("run panicked")
    }
}

/// Print consumer logs when running with RUST_LOG set.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn cursors(partition_ids: &[&str], cursor: Cursor) -> HashMap<String, Cursor> {
    partition_ids
        .iter()
        .map(|id| (id.to_string(), cursor.clone()))
        .collect()
}

/// Let every spawned task run until it blocks.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
