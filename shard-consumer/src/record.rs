use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// An ordered sub-stream of records, e.g. a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub id: String,
    /// The partition this one was split or merged from, if any.
    pub parent_id: Option<String>,
}

impl Partition {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            parent_id: None,
        }
    }

    pub fn with_parent(id: &str, parent_id: &str) -> Self {
        Self {
            id: id.to_owned(),
            parent_id: Some(parent_id.to_owned()),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Position of a record within its partition.
///
/// Providers hand these out as decimal strings that can be far longer than
/// any machine integer (56 digits is common), so they are kept as normalized
/// digit strings: no sign, no leading zeros. Ordering is numeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SequenceNumber(String);

impl SequenceNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        // Without leading zeros, a longer number is always the larger one.
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0:?} is not a valid sequence number")]
pub struct ParseSequenceNumberError(String);

impl FromStr for SequenceNumber {
    type Err = ParseSequenceNumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseSequenceNumberError(s.to_owned()));
        }
        match s.trim_start_matches('0') {
            "" => Ok(SequenceNumber("0".to_owned())),
            digits => Ok(SequenceNumber(digits.to_owned())),
        }
    }
}

impl From<SequenceNumber> for String {
    fn from(sequence_number: SequenceNumber) -> Self {
        sequence_number.0
    }
}

impl TryFrom<String> for SequenceNumber {
    type Error = ParseSequenceNumberError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<u128> for SequenceNumber {
    fn from(value: u128) -> Self {
        SequenceNumber(value.to_string())
    }
}

/// A single unit delivered by the transport. Never mutated after it is received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub sequence_number: SequenceNumber,
    pub partition_key: String,
    pub payload: Bytes,
    pub approximate_arrival_time: OffsetDateTime,
}

impl Record {
    pub fn new(
        sequence_number: impl Into<SequenceNumber>,
        partition_key: &str,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            sequence_number: sequence_number.into(),
            partition_key: partition_key.to_owned(),
            payload: payload.into(),
            approximate_arrival_time: OffsetDateTime::now_utc(),
        }
    }
}
