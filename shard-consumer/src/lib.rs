//! Consumes partitioned record streams over push subscriptions.
//!
//! A `StreamConsumer` keeps one subscription per partition, batches what each
//! pushes, bounds the records in flight with a shared backpressure gate, and
//! resubscribes partitions after recoverable failures from where they left off.
pub mod aggregator;
pub mod config;
pub mod consumer;
pub mod cursor;
pub mod error;
pub mod gate;
pub mod record;
pub mod retry;
pub mod session;
pub mod transport;

// Shared with the integration tests, so it can't be gated on cfg(test).
pub mod test_utils;

pub use aggregator::{Batch, FlushTrigger};
pub use config::Config;
pub use consumer::{BatchHandler, PartitionStatus, RunSummary, StreamConsumer};
pub use cursor::Cursor;
pub use error::{PartitionError, ShutdownError, SubscriptionError, TransportError};
pub use record::{Partition, Record, SequenceNumber};
pub use transport::Transport;
