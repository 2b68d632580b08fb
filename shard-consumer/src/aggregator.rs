//! Size and time bounded batching of a partition's records.
use std::time;

use tokio::time::Instant;

use crate::cursor::Cursor;
use crate::gate::InFlight;
use crate::record::{Partition, Record, SequenceNumber};

/// What caused a batch to be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The batch reached the maximum batch size.
    Size,
    /// The maximum wait elapsed since the first record of the batch.
    Timeout,
    /// The session ended with a partially filled batch.
    Close,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timeout => "timeout",
            FlushTrigger::Close => "close",
        }
    }
}

/// An ordered, non-empty group of records from one partition.
///
/// A batch holds the gate capacity of its records until it is dropped, so
/// consuming it is what lets more records in.
#[derive(Debug)]
pub struct Batch {
    pub partition: Partition,
    pub records: Vec<Record>,
    pub trigger: FlushTrigger,
    capacity: Option<InFlight>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_sequence_number(&self) -> Option<SequenceNumber> {
        self.records.first().map(|record| record.sequence_number.clone())
    }

    pub fn last_sequence_number(&self) -> Option<SequenceNumber> {
        self.records.last().map(|record| record.sequence_number.clone())
    }

    /// The cursor to resume from once this batch has been processed.
    pub fn resume_cursor(&self) -> Option<Cursor> {
        self.last_sequence_number().map(Cursor::AfterSequence)
    }

    /// Take the records out, releasing their gate capacity.
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

/// Accumulates records into batches of at most `max_size` records, emitting a
/// partial batch once `max_wait` has passed since its first record.
pub struct BatchAggregator {
    partition: Partition,
    max_size: usize,
    max_wait: time::Duration,
    records: Vec<Record>,
    capacity: Option<InFlight>,
    deadline: Option<Instant>,
}

impl BatchAggregator {
    pub fn new(partition: Partition, max_size: usize, max_wait: time::Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            partition,
            max_size,
            max_wait,
            records: Vec::with_capacity(max_size),
            capacity: None,
            deadline: None,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// When the open batch times out, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Append a record and the capacity admitted for it. Returns the batch if
    /// this record filled it.
    pub fn feed(&mut self, record: Record, capacity: InFlight) -> Option<Batch> {
        if self.records.is_empty() {
            self.deadline = Some(Instant::now() + self.max_wait);
        }
        self.records.push(record);
        match self.capacity.as_mut() {
            Some(held) => held.merge(capacity),
            None => self.capacity = Some(capacity),
        }

        if self.records.len() >= self.max_size {
            self.take(FlushTrigger::Size)
        } else {
            None
        }
    }

    /// Resolves once the open batch has reached its maximum wait. Never
    /// resolves while there is no open batch.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Emit the open batch if its maximum wait has elapsed.
    pub fn flush_expired(&mut self) -> Option<Batch> {
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => self.take(FlushTrigger::Timeout),
            _ => None,
        }
    }

    /// Emit whatever is buffered, regardless of size or age.
    pub fn flush(&mut self) -> Option<Batch> {
        self.take(FlushTrigger::Close)
    }

    fn take(&mut self, trigger: FlushTrigger) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }
        self.deadline = None;
        let records = std::mem::replace(&mut self.records, Vec::with_capacity(self.max_size));

        metrics::counter!("shard_consumer_batches_emitted_total", "trigger" => trigger.as_str())
            .increment(1);
        metrics::histogram!("shard_consumer_batch_size").record(records.len() as f64);

        Some(Batch {
            partition: self.partition.clone(),
            records,
            trigger,
            capacity: self.capacity.take(),
        })
    }
}
