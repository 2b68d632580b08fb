use std::time;

use thiserror::Error;

/// How a transport failure affects the partition that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: the partition is resubscribed with backoff.
    Recoverable,
    /// Permanent: the partition stops and the caller is told.
    Fatal,
}

/// Enumeration of errors reported by a transport, either when opening a
/// subscription or pushed while it is active.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("subscription rejected: {0}")]
    Rejected(String),
    #[error("request throttled: {0}")]
    Throttled(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("subscription session token expired")]
    ExpiredToken,
    #[error("malformed request: {0}")]
    InvalidRequest(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl TransportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Throttled(_)
            | TransportError::Network(_)
            | TransportError::ExpiredToken => ErrorClass::Recoverable,
            TransportError::Rejected(_)
            | TransportError::InvalidRequest(_)
            | TransportError::PermissionDenied(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }
}

/// Enumeration of errors returned by the backpressure gate.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum GateError {
    #[error("timed out after {waited:?} waiting for capacity for {requested} records")]
    BackpressureTimeout {
        requested: usize,
        waited: time::Duration,
    },
    #[error("{requested} records can never be admitted with at most {max_in_flight} in flight")]
    Oversized {
        requested: usize,
        max_in_flight: usize,
    },
    #[error("the gate is closed")]
    Closed,
}

/// Enumeration of per-partition errors returned by `StreamConsumer::subscribe`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscription to partition {partition} rejected: {reason}")]
    Rejected { partition: String, reason: String },
    #[error("partition {0} already has an active subscription")]
    AlreadySubscribed(String),
    #[error("no starting cursor given for partition {0}")]
    MissingCursor(String),
    #[error("failed to open subscription to partition {partition}: {source}")]
    Transport {
        partition: String,
        source: TransportError,
    },
    #[error("the consumer is shutting down")]
    ShuttingDown,
}

impl SubscriptionError {
    pub(crate) fn from_transport(partition: &str, error: TransportError) -> Self {
        match error {
            TransportError::Rejected(reason) => SubscriptionError::Rejected {
                partition: partition.to_owned(),
                reason,
            },
            source => SubscriptionError::Transport {
                partition: partition.to_owned(),
                source,
            },
        }
    }
}

/// Why a partition stopped being consumed. Handed to the caller's handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("fatal transport error: {0}")]
    Fatal(TransportError),
    #[error("gave up after {attempts} consecutive failures, last error: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },
    #[error("resubscription rejected: {0}")]
    Rejected(TransportError),
}

/// Enumeration of errors returned by `StreamConsumer::shutdown`.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("shutdown timed out after {elapsed:?}, abandoned partitions: {remaining:?}")]
    Timeout {
        elapsed: time::Duration,
        remaining: Vec<String>,
    },
}
