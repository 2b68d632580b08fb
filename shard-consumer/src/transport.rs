//! The seam between the consumer and a provider's streaming API.
//!
//! A provider opens a subscription and then pushes events for it: record
//! batches (possibly empty, as heartbeats), an error, or a terminal push once
//! the partition has been fully read. Dropping every `PushSender` ends the
//! subscription, which is how a provider-side expiry looks to the consumer.
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::cursor::Cursor;
use crate::error::TransportError;
use crate::record::{Partition, Record};

/// Transport-assigned identifier of an open subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

#[derive(Debug)]
pub enum PushEvent {
    Records {
        records: Vec<Record>,
        /// No records will ever follow this push on this partition.
        is_terminal: bool,
    },
    Error(TransportError),
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("the subscription is no longer consumed")]
pub struct SubscriptionClosed;

/// The transport's end of a subscription.
///
/// Sending waits while the consumer is not reading, so a slow consumer slows
/// the transport down instead of buffering without bound.
#[derive(Clone)]
pub struct PushSender {
    tx: mpsc::Sender<PushEvent>,
}

impl PushSender {
    pub async fn push(
        &self,
        records: Vec<Record>,
        is_terminal: bool,
    ) -> Result<(), SubscriptionClosed> {
        self.tx
            .send(PushEvent::Records {
                records,
                is_terminal,
            })
            .await
            .map_err(|_| SubscriptionClosed)
    }

    pub async fn fail(&self, error: TransportError) -> Result<(), SubscriptionClosed> {
        self.tx
            .send(PushEvent::Error(error))
            .await
            .map_err(|_| SubscriptionClosed)
    }

    /// True once the consumer closed its end of the subscription.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The consumer's end of a subscription.
pub struct PushReceiver {
    rx: mpsc::Receiver<PushEvent>,
}

impl PushReceiver {
    /// The next pushed event, or `None` once the transport has gone away.
    pub async fn next(&mut self) -> Option<PushEvent> {
        self.rx.recv().await
    }
}

/// Create the channel a transport pushes a subscription's events through.
pub fn push_channel(buffer: usize) -> (PushSender, PushReceiver) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (PushSender { tx }, PushReceiver { rx })
}

/// An open subscription, as returned by `Transport::open_subscription`.
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: PushReceiver,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a push subscription to `partition` starting at `cursor`.
    async fn open_subscription(
        &self,
        partition: &Partition,
        cursor: &Cursor,
    ) -> Result<Subscription, TransportError>;

    /// Release a subscription. Called at most once per handle.
    async fn close_subscription(&self, handle: SubscriptionHandle);
}
