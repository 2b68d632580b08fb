//! The consumer: one supervised session per partition, a shared gate, and a
//! single delivery channel drained by the caller's handler.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use health::{HealthHandle, HealthRegistry, HealthStatus};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::{Batch, BatchAggregator};
use crate::config::{Config, ConfigError};
use crate::cursor::Cursor;
use crate::error::{PartitionError, ShutdownError, SubscriptionError, TransportError};
use crate::gate::BackpressureGate;
use crate::record::Partition;
use crate::retry::RetryPolicy;
use crate::session::{Pipeline, Session, SessionEnd};
use crate::transport::Transport;

/// What sessions hand to `StreamConsumer::run`, in order per partition.
#[derive(Debug)]
pub(crate) enum Delivery {
    Batch(Batch),
    /// Sent once per subscription, after its last batch.
    Finished {
        partition: Partition,
        status: PartitionStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionStatus {
    /// The subscription is being opened.
    Opening,
    /// Consuming, or waiting to resubscribe after a recoverable failure.
    Active,
    /// The partition was read to its end.
    Closed,
    /// Stopped by a shutdown.
    Stopped,
    /// Gave up on the partition. It is not retried.
    Errored(PartitionError),
    /// Did not stop in time during a shutdown and was aborted.
    Abandoned,
}

impl PartitionStatus {
    fn is_live(&self) -> bool {
        matches!(self, PartitionStatus::Opening | PartitionStatus::Active)
    }
}

/// What a call to `StreamConsumer::run` went through.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: usize,
    pub records: usize,
    pub closed: Vec<String>,
    pub stopped: Vec<String>,
    pub errored: Vec<(String, PartitionError)>,
    pub abandoned: Vec<String>,
}

/// Receives everything a `StreamConsumer` consumes.
///
/// Calls are sequential. The gate capacity of a batch is only released once
/// the handler drops it, so a slow handler slows down every partition.
#[async_trait]
pub trait BatchHandler: Send {
    async fn handle_batch(&mut self, batch: Batch);

    /// A partition stopped for good. Called exactly once per errored partition.
    async fn partition_failed(&mut self, partition: &Partition, error: &PartitionError) {
        error!(partition = %partition, "partition failed: {}", error);
    }

    /// A partition was read to its end, e.g. after being split or merged.
    async fn partition_closed(&mut self, _partition: &Partition) {}
}

struct PartitionEntry {
    status: PartitionStatus,
    /// Cursor after the last batch the handler finished with.
    checkpoint: Cursor,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: Config,
    retry_policy: RetryPolicy,
    gate: BackpressureGate,
    health: HealthRegistry,
    partitions: Mutex<HashMap<String, PartitionEntry>>,
    deliveries: mpsc::Sender<Delivery>,
    shutdown: CancellationToken,
    /// Number of partitions that are opening or active.
    live: watch::Sender<usize>,
}

pub struct StreamConsumer {
    shared: Arc<Shared>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Delivery>>,
}

impl StreamConsumer {
    pub fn new(transport: Arc<dyn Transport>, config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let gate = BackpressureGate::new(config.max_in_flight, config.backpressure_timeout.0);
        let (deliveries, receiver) = mpsc::channel(config.delivery_buffer);
        let (live, _) = watch::channel(0);

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                retry_policy: config.retry_policy(),
                config,
                gate,
                health: HealthRegistry::new("shard-consumer"),
                partitions: Mutex::new(HashMap::new()),
                deliveries,
                shutdown: CancellationToken::new(),
                live,
            }),
            receiver: tokio::sync::Mutex::new(receiver),
        })
    }

    /// Open a subscription to each partition, starting at its cursor.
    ///
    /// Returns one result per partition, in order. A partition failing to
    /// subscribe does not affect the others. Every partition that subscribed
    /// is consumed by its own task from then on.
    pub async fn subscribe(
        &self,
        partitions: Vec<Partition>,
        cursors: &HashMap<String, Cursor>,
    ) -> Vec<Result<(), SubscriptionError>> {
        let mut results = Vec::with_capacity(partitions.len());
        let mut opening = Vec::new();

        for (index, partition) in partitions.into_iter().enumerate() {
            match self.shared.reserve(&partition, cursors) {
                Ok(cursor) => {
                    opening.push((index, partition, cursor));
                    results.push(Ok(()));
                }
                Err(error) => {
                    warn!(partition = %partition, "cannot subscribe: {}", error);
                    results.push(Err(error));
                }
            }
        }

        let opened = join_all(opening.into_iter().map(|(index, partition, cursor)| {
            let transport = self.shared.transport.clone();
            async move {
                let outcome = Session::open(transport, partition.clone(), cursor).await;
                (index, partition, outcome)
            }
        }))
        .await;

        for (index, partition, outcome) in opened {
            results[index] = match outcome {
                Ok(session) => self.shared.clone().start(session).await,
                Err(error) => Err(self.shared.release(&partition, error)),
            };
        }

        results
    }

    /// Deliver batches to `handler` until no partition is being consumed any
    /// more: every partition closed, errored, stopped or was abandoned.
    ///
    /// Partitions should be subscribed first: with nothing to consume, this
    /// returns right away.
    pub async fn run<H: BatchHandler>(&self, handler: &mut H) -> RunSummary {
        let mut receiver = self.receiver.lock().await;
        let mut live = self.shared.live.subscribe();
        let mut summary = RunSummary::default();

        loop {
            tokio::select! {
                biased;
                delivery = receiver.recv() => match delivery {
                    Some(delivery) => self.deliver(delivery, handler, &mut summary).await,
                    None => break,
                },
                _ = idle(&mut live) => break,
            }
        }
        // Supervisors notify before they stop counting as live, so nothing is left behind.
        while let Ok(delivery) = receiver.try_recv() {
            self.deliver(delivery, handler, &mut summary).await;
        }

        summary.abandoned = self.shared.with_status(PartitionStatus::Abandoned);
        info!(
            batches = summary.batches,
            records = summary.records,
            closed = summary.closed.len(),
            stopped = summary.stopped.len(),
            errored = summary.errored.len(),
            abandoned = summary.abandoned.len(),
            "consumer run finished"
        );
        summary
    }

    async fn deliver<H: BatchHandler>(
        &self,
        delivery: Delivery,
        handler: &mut H,
        summary: &mut RunSummary,
    ) {
        match delivery {
            Delivery::Batch(batch) => {
                let partition_id = batch.partition.id.clone();
                let resume_cursor = batch.resume_cursor();
                summary.batches += 1;
                summary.records += batch.len();

                handler.handle_batch(batch).await;

                if let Some(cursor) = resume_cursor {
                    self.shared.set_checkpoint(&partition_id, cursor);
                }
            }
            Delivery::Finished { partition, status } => match status {
                PartitionStatus::Closed => {
                    handler.partition_closed(&partition).await;
                    summary.closed.push(partition.id);
                }
                PartitionStatus::Errored(error) => {
                    handler.partition_failed(&partition, &error).await;
                    summary.errored.push((partition.id, error));
                }
                PartitionStatus::Stopped => summary.stopped.push(partition.id),
                other => debug!(partition = %partition, status = ?other, "ignoring notification"),
            },
        }
    }

    /// Stop every partition, waiting up to the configured shutdown timeout.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.shutdown_within(self.shared.config.shutdown_timeout.0)
            .await
    }

    /// Stop every partition: sessions flush their partial batch and close
    /// their subscription. Tasks still running after `timeout` are aborted
    /// and their partitions marked abandoned.
    ///
    /// `run` must keep draining deliveries for sessions to be able to flush.
    pub async fn shutdown_within(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let started = tokio::time::Instant::now();
        self.shared.shutdown.cancel();

        let mut tasks: Vec<(String, JoinHandle<()>)> = self
            .shared
            .partitions()
            .iter_mut()
            .filter_map(|(id, entry)| entry.task.take().map(|task| (id.clone(), task)))
            .collect();
        info!(partitions = tasks.len(), "shutting down consumer");

        let joined = tokio::time::timeout(
            timeout,
            join_all(tasks.iter_mut().map(|(_, task)| task)),
        )
        .await;

        let mut remaining = Vec::new();
        match joined {
            Ok(results) => {
                let crashed: Vec<String> = tasks
                    .iter()
                    .zip(results)
                    .filter_map(|((id, _), result)| {
                        let join_error = result.err()?;
                        error!(partition = %id, "partition task failed: {}", join_error);
                        Some(id.clone())
                    })
                    .collect();
                self.shared.abandon(&crashed);
            }
            Err(_) => {
                for (id, task) in &tasks {
                    if !task.is_finished() {
                        task.abort();
                        remaining.push(id.clone());
                    }
                }
                self.shared.abandon(&remaining);
            }
        }
        self.shared.gate.close();

        if remaining.is_empty() {
            info!("consumer shut down");
            return Ok(());
        }

        remaining.sort();
        let elapsed = started.elapsed();
        warn!(abandoned = ?remaining, "shutdown did not complete within {:?}", timeout);
        Err(ShutdownError::Timeout { elapsed, remaining })
    }

    /// Cursor to resume `partition_id` from: after the last batch the
    /// handler finished with, or the cursor it was subscribed with.
    pub fn checkpoint(&self, partition_id: &str) -> Option<Cursor> {
        self.shared
            .partitions()
            .get(partition_id)
            .map(|entry| entry.checkpoint.clone())
    }

    pub fn partition_status(&self, partition_id: &str) -> Option<PartitionStatus> {
        self.shared
            .partitions()
            .get(partition_id)
            .map(|entry| entry.status.clone())
    }

    /// Records admitted by the gate and not yet released by the handler.
    pub fn in_flight(&self) -> usize {
        self.shared.gate.in_flight()
    }

    /// Liveness of every partition task.
    pub fn health(&self) -> HealthStatus {
        self.shared.health.get_status()
    }
}

/// Resolves once no partition is live, or the consumer is gone.
async fn idle(live: &mut watch::Receiver<usize>) {
    if live.wait_for(|live| *live == 0).await.is_err() {
        debug!("live partition count is no longer published");
    }
}

impl Shared {
    fn partitions(&self) -> MutexGuard<'_, HashMap<String, PartitionEntry>> {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_live(&self, partitions: &HashMap<String, PartitionEntry>) {
        let live = partitions
            .values()
            .filter(|entry| entry.status.is_live())
            .count();
        self.live.send_replace(live);
    }

    fn with_status(&self, status: PartitionStatus) -> Vec<String> {
        let mut ids: Vec<String> = self
            .partitions()
            .iter()
            .filter(|(_, entry)| entry.status == status)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Claim a partition for a new subscription.
    fn reserve(
        &self,
        partition: &Partition,
        cursors: &HashMap<String, Cursor>,
    ) -> Result<Cursor, SubscriptionError> {
        if self.shutdown.is_cancelled() {
            return Err(SubscriptionError::ShuttingDown);
        }
        let cursor = cursors
            .get(&partition.id)
            .cloned()
            .ok_or_else(|| SubscriptionError::MissingCursor(partition.id.clone()))?;

        let mut partitions = self.partitions();
        if let Some(entry) = partitions.get(&partition.id) {
            if entry.status.is_live() {
                return Err(SubscriptionError::AlreadySubscribed(partition.id.clone()));
            }
        }
        partitions.insert(
            partition.id.clone(),
            PartitionEntry {
                status: PartitionStatus::Opening,
                checkpoint: cursor.clone(),
                task: None,
            },
        );
        self.publish_live(&partitions);

        Ok(cursor)
    }

    /// Forget a partition whose subscription could not be opened.
    fn release(&self, partition: &Partition, error: TransportError) -> SubscriptionError {
        let mut partitions = self.partitions();
        partitions.remove(&partition.id);
        self.publish_live(&partitions);
        SubscriptionError::from_transport(&partition.id, error)
    }

    /// Hand an opened session over to its supervisor task.
    async fn start(self: Arc<Self>, mut session: Session) -> Result<(), SubscriptionError> {
        let partition_id = session.partition().id.clone();
        let liveness = self.health.register(
            format!("partition-{}", partition_id),
            time::Duration::try_from(self.config.liveness_deadline.0)
                .unwrap_or(time::Duration::MAX),
        );

        {
            let mut partitions = self.partitions();
            if !self.shutdown.is_cancelled() {
                let task = tokio::spawn(self.clone().supervise(session, liveness));
                if let Some(entry) = partitions.get_mut(&partition_id) {
                    entry.status = PartitionStatus::Active;
                    entry.task = Some(task);
                }
                return Ok(());
            }
            partitions.remove(&partition_id);
            self.publish_live(&partitions);
        }

        liveness.report_finished();
        session.close().await;
        Err(SubscriptionError::ShuttingDown)
    }

    async fn supervise(self: Arc<Self>, mut session: Session, liveness: HealthHandle) {
        let partition = session.partition().clone();
        let mut pipeline = Pipeline {
            gate: self.gate.clone(),
            aggregator: BatchAggregator::new(
                partition.clone(),
                self.config.max_batch_size,
                self.config.max_batch_wait.0,
            ),
            deliveries: self.deliveries.clone(),
            cancel: self.shutdown.clone(),
            liveness,
            liveness_interval: self.config.liveness_deadline.0 / 2,
            backpressure_pause: self.config.backpressure_pause.0,
        };
        let mut failures = 0;

        let status = loop {
            let end = session.drive(&mut pipeline).await;
            if session.pushes() > 0 {
                failures = 0;
            }

            let failure = match end {
                SessionEnd::Completed => break PartitionStatus::Closed,
                SessionEnd::Cancelled => break PartitionStatus::Stopped,
                SessionEnd::Errored(error) => {
                    break PartitionStatus::Errored(PartitionError::Fatal(error))
                }
                SessionEnd::Expired if session.pushes() > 0 => None,
                SessionEnd::Expired => Some(TransportError::Network(
                    "subscription ended before delivering any event".to_owned(),
                )),
                SessionEnd::Failed(error) => Some(error),
            };

            let cursor = session.cursor().clone();
            session = match self
                .resubscribe(&mut pipeline, &partition, cursor, &mut failures, failure)
                .await
            {
                Ok(session) => session,
                Err(status) => break status,
            };
        };

        // Whatever the partition still buffers goes out before it is reported done.
        pipeline.flush().await;

        match &status {
            PartitionStatus::Errored(partition_error) => {
                error!(partition = %partition, "partition errored: {}", partition_error);
                metrics::counter!("shard_consumer_partitions_errored_total").increment(1);
                pipeline.liveness.report_unhealthy(partition_error.to_string());
            }
            _ => {
                info!(partition = %partition, status = ?status, "partition stopped");
                pipeline.liveness.report_finished();
            }
        }

        let finished = Delivery::Finished {
            partition: partition.clone(),
            status: status.clone(),
        };
        if self.deliveries.send(finished).await.is_err() {
            debug!(partition = %partition, "no one left to notify");
        }
        self.finish(&partition.id, status);
    }

    /// Open a replacement session from `cursor`. Each failure, including
    /// `failure` when given, counts against the retry policy and is followed
    /// by a backoff, during which the pipeline keeps flushing batches whose
    /// wait runs out.
    async fn resubscribe(
        &self,
        pipeline: &mut Pipeline,
        partition: &Partition,
        cursor: Cursor,
        failures: &mut u32,
        mut failure: Option<TransportError>,
    ) -> Result<Session, PartitionStatus> {
        loop {
            match failure.take() {
                Some(error) => {
                    *failures += 1;
                    if !self.retry_policy.should_retry(*failures) {
                        return Err(PartitionStatus::Errored(PartitionError::RetriesExhausted {
                            attempts: *failures,
                            last: error,
                        }));
                    }

                    let backoff = self.retry_policy.retry_interval(*failures);
                    warn!(
                        partition = %partition,
                        cursor = %cursor,
                        attempt = *failures,
                        error = %error,
                        "resubscribing in {:?}", backoff
                    );
                    if pipeline.wait(backoff).await.is_err() {
                        return Err(PartitionStatus::Stopped);
                    }
                }
                None if self.shutdown.is_cancelled() => return Err(PartitionStatus::Stopped),
                None => info!(partition = %partition, cursor = %cursor, "renewing subscription"),
            }

            metrics::counter!("shard_consumer_resubscriptions_total").increment(1);
            match Session::open(self.transport.clone(), partition.clone(), cursor.clone()).await {
                Ok(session) => return Ok(session),
                Err(error @ TransportError::Rejected(_)) => {
                    return Err(PartitionStatus::Errored(PartitionError::Rejected(error)))
                }
                Err(error) if error.is_recoverable() => failure = Some(error),
                Err(error) => return Err(PartitionStatus::Errored(PartitionError::Fatal(error))),
            }
        }
    }

    fn finish(&self, partition_id: &str, status: PartitionStatus) {
        let mut partitions = self.partitions();
        if let Some(entry) = partitions.get_mut(partition_id) {
            if entry.status == PartitionStatus::Active {
                entry.status = status;
                entry.task = None;
            }
        }
        self.publish_live(&partitions);
    }

    fn abandon(&self, partition_ids: &[String]) {
        if partition_ids.is_empty() {
            return;
        }
        let mut partitions = self.partitions();
        for partition_id in partition_ids {
            if let Some(entry) = partitions.get_mut(partition_id) {
                if entry.status.is_live() {
                    entry.status = PartitionStatus::Abandoned;
                }
            }
        }
        self.publish_live(&partitions);
    }

    fn set_checkpoint(&self, partition_id: &str, cursor: Cursor) {
        if let Some(entry) = self.partitions().get_mut(partition_id) {
            entry.checkpoint = cursor;
        }
    }
}
