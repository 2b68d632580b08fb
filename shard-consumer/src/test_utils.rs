use std::collections::{HashMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::cursor::Cursor;
use crate::error::TransportError;
use crate::record::{Partition, Record, SequenceNumber};
use crate::transport::{push_channel, PushSender, Subscription, SubscriptionHandle, Transport};

pub fn record(sequence_number: u128) -> Record {
    Record::new(
        sequence_number,
        "partition-key",
        format!("payload-{}", sequence_number),
    )
}

pub fn records(sequence_numbers: RangeInclusive<u128>) -> Vec<Record> {
    sequence_numbers.map(record).collect()
}

/// The cursor right after record `sequence_number`.
pub fn after(sequence_number: u128) -> Cursor {
    Cursor::AfterSequence(SequenceNumber::from(sequence_number))
}

/// Sequence numbers of records built with `record`, for comparing with ranges.
pub fn sequence_numbers(records: &[Record]) -> Vec<u128> {
    records
        .iter()
        .map(|record| {
            record
                .sequence_number
                .as_str()
                .parse()
                .expect("test records use small sequence numbers")
        })
        .collect()
}

/// A subscription opened on a `MockTransport`, as seen from the provider side.
pub struct Opened {
    pub handle: SubscriptionHandle,
    pub cursor: Cursor,
    pub sender: PushSender,
}

type Accepted = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Opened>>>;

struct PartitionState {
    opened_tx: mpsc::UnboundedSender<Opened>,
    opened_rx: Accepted,
    cursors: Vec<Cursor>,
    open_failures: VecDeque<TransportError>,
}

impl PartitionState {
    fn new() -> Self {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        Self {
            opened_tx,
            opened_rx: Arc::new(tokio::sync::Mutex::new(opened_rx)),
            cursors: Vec::new(),
            open_failures: VecDeque::new(),
        }
    }
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    partitions: HashMap<String, PartitionState>,
    closed: Vec<SubscriptionHandle>,
}

/// An in-memory transport driven by the test: every successful open hands the
/// push side of the subscription to whoever calls `accept` for that partition.
pub struct MockTransport {
    state: Mutex<MockState>,
    push_buffer: usize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::with_push_buffer(16)
    }

    pub fn with_push_buffer(push_buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            push_buffer,
        })
    }

    /// Make the next open of `partition` fail with `error`.
    pub fn fail_next_open(&self, partition: &str, error: TransportError) {
        let mut state = self.state.lock().unwrap();
        state
            .partitions
            .entry(partition.to_owned())
            .or_insert_with(PartitionState::new)
            .open_failures
            .push_back(error);
    }

    /// Wait for the next subscription to `partition` to be opened.
    pub async fn accept(&self, partition: &str) -> Opened {
        let opened = {
            let mut state = self.state.lock().unwrap();
            state
                .partitions
                .entry(partition.to_owned())
                .or_insert_with(PartitionState::new)
                .opened_rx
                .clone()
        };
        let mut opened = opened.lock().await;
        opened
            .recv()
            .await
            .expect("the transport keeps its sender alive")
    }

    /// Cursors passed to every open attempt of `partition`, failed ones included.
    pub fn opened_cursors(&self, partition: &str) -> Vec<Cursor> {
        let state = self.state.lock().unwrap();
        state
            .partitions
            .get(partition)
            .map(|p| p.cursors.clone())
            .unwrap_or_default()
    }

    pub fn closed_handles(&self) -> Vec<SubscriptionHandle> {
        self.state.lock().unwrap().closed.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_subscription(
        &self,
        partition: &Partition,
        cursor: &Cursor,
    ) -> Result<Subscription, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.next_handle += 1;
        let handle = SubscriptionHandle(state.next_handle);

        let partition_state = state
            .partitions
            .entry(partition.id.clone())
            .or_insert_with(PartitionState::new);
        partition_state.cursors.push(cursor.clone());
        if let Some(error) = partition_state.open_failures.pop_front() {
            return Err(error);
        }

        let (sender, events) = push_channel(self.push_buffer);
        // Nobody may be accepting for this partition; the subscription stays open anyway.
        partition_state
            .opened_tx
            .send(Opened {
                handle,
                cursor: cursor.clone(),
                sender,
            })
            .ok();

        Ok(Subscription { handle, events })
    }

    async fn close_subscription(&self, handle: SubscriptionHandle) {
        self.state.lock().unwrap().closed.push(handle);
    }
}
