//! One push subscription to one partition.
use std::fmt;
use std::sync::Arc;
use std::time;

use health::HealthHandle;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{Batch, BatchAggregator};
use crate::consumer::Delivery;
use crate::cursor::Cursor;
use crate::error::{ErrorClass, GateError, TransportError};
use crate::gate::{BackpressureGate, InFlight};
use crate::record::{Partition, Record};
use crate::transport::{PushEvent, PushReceiver, SubscriptionHandle, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Active,
    ClosingClean,
    Failed,
    Closed,
    Errored,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored)
    }
}

/// How a session's event loop ended.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The transport sent a terminal push: the partition has been read to its end.
    Completed,
    /// The consumer is shutting down.
    Cancelled,
    /// The subscription ended without an error, e.g. it reached its maximum lifetime.
    Expired,
    /// A recoverable transport error. The partition may resubscribe.
    Failed(TransportError),
    /// A fatal transport error. The partition must not resubscribe.
    Errored(TransportError),
}

/// The session's loop was interrupted before it could hand records off.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Interrupted {
    Cancelled,
    /// Nobody receives deliveries any more.
    Disconnected,
}

/// Everything downstream of a session: the shared gate, the partition's
/// aggregator and the channel batches are delivered through.
pub(crate) struct Pipeline {
    pub(crate) gate: BackpressureGate,
    pub(crate) aggregator: BatchAggregator,
    pub(crate) deliveries: mpsc::Sender<Delivery>,
    pub(crate) cancel: CancellationToken,
    pub(crate) liveness: HealthHandle,
    /// How often to report liveness while waiting on capacity or a backoff.
    pub(crate) liveness_interval: time::Duration,
    pub(crate) backpressure_pause: time::Duration,
}

impl Pipeline {
    async fn emit(&self, batch: Batch) -> Result<(), Interrupted> {
        debug!(
            partition = %batch.partition,
            records = batch.len(),
            trigger = batch.trigger.as_str(),
            "emitting batch"
        );
        self.deliveries
            .send(Delivery::Batch(batch))
            .await
            .map_err(|_| Interrupted::Disconnected)
    }

    pub(crate) async fn emit_expired(&mut self) -> Result<(), Interrupted> {
        match self.aggregator.flush_expired() {
            Some(batch) => self.emit(batch).await,
            None => Ok(()),
        }
    }

    /// Emit the partially filled batch, if any. Only for a close or a shutdown:
    /// a failed or expired session leaves it for its replacement.
    pub(crate) async fn flush(&mut self) {
        if let Some(batch) = self.aggregator.flush() {
            if self.emit(batch).await.is_err() {
                debug!("dropping final batch, deliveries are no longer consumed");
            }
        }
    }

    /// Wait for gate capacity for `count` records.
    ///
    /// Batches that time out while waiting are still emitted. A backpressure
    /// timeout pauses the session and then queues for capacity again.
    async fn admit(&mut self, partition: &Partition, count: usize) -> Result<InFlight, Interrupted> {
        let gate = self.gate.clone();
        loop {
            let admit = gate.admit(count);
            tokio::pin!(admit);
            let mut heartbeat = self.heartbeat();

            let result = loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(Interrupted::Cancelled),
                    _ = self.aggregator.expired() => self.emit_expired().await?,
                    result = &mut admit => break result,
                    _ = heartbeat.tick() => self.liveness.report_healthy(),
                }
            };

            match result {
                Ok(capacity) => return Ok(capacity),
                Err(GateError::BackpressureTimeout { requested, waited }) => {
                    warn!(
                        partition = %partition,
                        requested,
                        in_flight = gate.in_flight(),
                        "no capacity after {:?}, pausing session", waited
                    );
                    metrics::counter!("shard_consumer_backpressure_timeouts_total").increment(1);
                    self.wait(self.backpressure_pause).await?;
                }
                Err(GateError::Closed) => return Err(Interrupted::Cancelled),
                Err(error @ GateError::Oversized { .. }) => {
                    // Pushes are chunked to the gate size before admission.
                    unreachable!("{}", error)
                }
            }
        }
    }

    /// Sit out `duration`, e.g. a pause or a backoff. Batches whose wait runs
    /// out meanwhile are still emitted, and the partition keeps reporting live.
    pub(crate) async fn wait(&mut self, duration: time::Duration) -> Result<(), Interrupted> {
        let resume = tokio::time::sleep(duration);
        tokio::pin!(resume);
        let mut heartbeat = self.heartbeat();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Interrupted::Cancelled),
                _ = self.aggregator.expired() => self.emit_expired().await?,
                _ = &mut resume => return Ok(()),
                _ = heartbeat.tick() => self.liveness.report_healthy(),
            }
        }
    }

    /// Ticks right away, then every `liveness_interval`.
    fn heartbeat(&self) -> Interval {
        let period = self.liveness_interval.max(time::Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat
    }
}

/// A push subscription to a single partition.
///
/// The session tracks the cursor of the last record it handed off, which is
/// where a replacement session picks up after a failure.
pub struct Session {
    partition: Partition,
    cursor: Cursor,
    state: SessionState,
    transport: Arc<dyn Transport>,
    handle: Option<SubscriptionHandle>,
    events: Option<PushReceiver>,
    pushes: u64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("partition", &self.partition)
            .field("cursor", &self.cursor)
            .field("state", &self.state)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Session {
    /// Open a subscription to `partition` starting at `cursor`.
    pub async fn open(
        transport: Arc<dyn Transport>,
        partition: Partition,
        cursor: Cursor,
    ) -> Result<Session, TransportError> {
        let mut session = Session {
            partition,
            cursor,
            state: SessionState::Opening,
            transport,
            handle: None,
            events: None,
            pushes: 0,
        };

        let subscription = session
            .transport
            .open_subscription(&session.partition, &session.cursor)
            .await
            .inspect_err(|error| {
                warn!(
                    partition = %session.partition,
                    cursor = %session.cursor,
                    "failed to open subscription: {}", error
                )
            })?;

        session.handle = Some(subscription.handle);
        session.events = Some(subscription.events);
        session.state = SessionState::Active;
        info!(
            partition = %session.partition,
            parent = session.partition.parent_id.as_deref().unwrap_or("none"),
            cursor = %session.cursor,
            "subscription opened"
        );

        Ok(session)
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Position right after the last record this session handed off.
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of pushes received, heartbeats included.
    pub fn pushes(&self) -> u64 {
        self.pushes
    }

    async fn next_event(&mut self) -> Option<PushEvent> {
        match self.events.as_mut() {
            Some(events) => events.next().await,
            None => None,
        }
    }

    /// Hand a push's records to the pipeline, in order.
    ///
    /// Records at or before the cursor were already handed off and are
    /// dropped. The rest are admitted through the gate in chunks no larger
    /// than its capacity and fed to the aggregator, advancing the cursor record
    /// by record.
    pub(crate) async fn on_records_pushed(
        &mut self,
        mut records: Vec<Record>,
        pipeline: &mut Pipeline,
    ) -> Result<(), Interrupted> {
        if self.state != SessionState::Active {
            warn!(partition = %self.partition, state = ?self.state, "ignoring push to inactive session");
            return Ok(());
        }
        self.pushes += 1;
        pipeline.liveness.report_healthy();

        let received = records.len();
        let mut last = self.cursor.last_sequence_number().cloned();
        records.retain(|record| {
            let fresh = last
                .as_ref()
                .map_or(true, |last| record.sequence_number > *last);
            if fresh {
                last = Some(record.sequence_number.clone());
            }
            fresh
        });
        metrics::counter!("shard_consumer_records_received_total").increment(received as u64);
        if records.len() < received {
            let stale = received - records.len();
            debug!(partition = %self.partition, stale, cursor = %self.cursor, "dropping stale records");
            metrics::counter!("shard_consumer_records_stale_total").increment(stale as u64);
        }

        let chunk_size = pipeline.gate.max_in_flight().max(1);
        let mut records = records.into_iter().peekable();
        while records.peek().is_some() {
            let chunk: Vec<Record> = records.by_ref().take(chunk_size).collect();
            let mut capacity = pipeline.admit(&self.partition, chunk.len()).await?;

            for record in chunk {
                let sequence_number = record.sequence_number.clone();
                let emitted = pipeline.aggregator.feed(record, capacity.split(1));
                self.cursor.advance(sequence_number);
                if let Some(batch) = emitted {
                    pipeline.emit(batch).await?;
                }
            }
        }

        Ok(())
    }

    /// Classify a transport error and move to Failed or Errored accordingly.
    pub fn on_transport_error(&mut self, error: &TransportError) -> ErrorClass {
        let class = error.class();
        self.state = match class {
            ErrorClass::Recoverable => {
                warn!(partition = %self.partition, cursor = %self.cursor, "subscription failed: {}", error);
                SessionState::Failed
            }
            ErrorClass::Fatal => {
                tracing::error!(partition = %self.partition, cursor = %self.cursor, "subscription errored: {}", error);
                SessionState::Errored
            }
        };
        class
    }

    /// Close the subscription. No record is delivered after this returns.
    /// Closing a session that already ended has no effect.
    pub async fn close(&mut self) {
        match self.state {
            SessionState::Opening | SessionState::Active => {
                self.state = SessionState::ClosingClean;
                self.release().await;
                self.state = SessionState::Closed;
                info!(partition = %self.partition, cursor = %self.cursor, "subscription closed");
            }
            SessionState::ClosingClean => {}
            SessionState::Failed | SessionState::Errored | SessionState::Closed => {
                self.release().await
            }
        }
    }

    /// Stop receiving and hand the subscription back to the transport, once.
    async fn release(&mut self) {
        self.events = None;
        if let Some(handle) = self.handle.take() {
            self.transport.close_subscription(handle).await;
        }
    }

    /// Run the session until its subscription ends, then release it.
    ///
    /// A terminal push or a shutdown flushes the partially filled batch. A
    /// failed or expired session leaves it in the pipeline, where the
    /// replacement session keeps filling it.
    pub(crate) async fn drive(&mut self, pipeline: &mut Pipeline) -> SessionEnd {
        loop {
            let event = tokio::select! {
                biased;
                _ = pipeline.cancel.cancelled() => {
                    return self.stop(pipeline).await;
                }
                _ = pipeline.aggregator.expired() => {
                    if pipeline.emit_expired().await.is_err() {
                        return self.stop(pipeline).await;
                    }
                    continue;
                }
                event = self.next_event() => event,
            };

            match event {
                Some(PushEvent::Records {
                    records,
                    is_terminal,
                }) => {
                    if self.on_records_pushed(records, pipeline).await.is_err() {
                        return self.stop(pipeline).await;
                    }
                    if is_terminal {
                        info!(partition = %self.partition, cursor = %self.cursor, "partition fully consumed");
                        pipeline.flush().await;
                        self.close().await;
                        return SessionEnd::Completed;
                    }
                }
                Some(PushEvent::Error(error)) => {
                    let class = self.on_transport_error(&error);
                    self.release().await;
                    return match class {
                        ErrorClass::Recoverable => SessionEnd::Failed(error),
                        ErrorClass::Fatal => SessionEnd::Errored(error),
                    };
                }
                None => {
                    info!(partition = %self.partition, cursor = %self.cursor, "subscription expired");
                    self.state = SessionState::Failed;
                    self.release().await;
                    return SessionEnd::Expired;
                }
            }
        }
    }

    async fn stop(&mut self, pipeline: &mut Pipeline) -> SessionEnd {
        pipeline.flush().await;
        self.close().await;
        SessionEnd::Cancelled
    }
}
