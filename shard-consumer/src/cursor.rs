//! Resumable positions within a partition.
use std::fmt;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::record::SequenceNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorKind {
    AtStart,
    AtEnd,
    AfterSequence,
    AtTimestamp,
}

impl fmt::Display for CursorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            CursorKind::AtStart => "AT_START",
            CursorKind::AtEnd => "AT_END",
            CursorKind::AfterSequence => "AFTER_SEQUENCE",
            CursorKind::AtTimestamp => "AT_TIMESTAMP",
        };
        f.write_str(kind)
    }
}

/// Where to (re)start consuming a partition.
///
/// A session starts from the cursor it was opened with and advances it after
/// every record it hands off, so the cursor always names the position right
/// after the last record the consumer has taken responsibility for. Cursors
/// never move backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cursor {
    /// The oldest record still retained by the partition.
    AtStart,
    /// Only records that arrive after the subscription opens.
    AtEnd,
    /// The record right after the given sequence number.
    AfterSequence(SequenceNumber),
    /// The first record that arrived at or after the given time.
    AtTimestamp(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
}

impl Cursor {
    pub fn kind(&self) -> CursorKind {
        match self {
            Cursor::AtStart => CursorKind::AtStart,
            Cursor::AtEnd => CursorKind::AtEnd,
            Cursor::AfterSequence(_) => CursorKind::AfterSequence,
            Cursor::AtTimestamp(_) => CursorKind::AtTimestamp,
        }
    }

    /// The last sequence number consumed, if the cursor is anchored on one.
    pub fn last_sequence_number(&self) -> Option<&SequenceNumber> {
        match self {
            Cursor::AfterSequence(sequence_number) => Some(sequence_number),
            _ => None,
        }
    }

    /// Whether a record with this sequence number was already consumed.
    pub fn is_stale(&self, sequence_number: &SequenceNumber) -> bool {
        matches!(self.last_sequence_number(), Some(last) if sequence_number <= last)
    }

    /// Move the cursor past `sequence_number`. Returns false, leaving the
    /// cursor untouched, when that would move it backwards.
    pub fn advance(&mut self, sequence_number: SequenceNumber) -> bool {
        if self.is_stale(&sequence_number) {
            return false;
        }
        *self = Cursor::AfterSequence(sequence_number);
        true
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::AtStart | Cursor::AtEnd => write!(f, "{}", self.kind()),
            Cursor::AfterSequence(sequence_number) => {
                write!(f, "{}:{}", self.kind(), sequence_number)
            }
            Cursor::AtTimestamp(timestamp) => match timestamp.format(&Rfc3339) {
                Ok(formatted) => write!(f, "{}:{}", self.kind(), formatted),
                Err(_) => write!(f, "{}:{}", self.kind(), timestamp.unix_timestamp()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn seq(n: u128) -> SequenceNumber {
        SequenceNumber::from(n)
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut cursor = Cursor::AtStart;

        assert!(cursor.advance(seq(10)));
        assert_eq!(cursor, Cursor::AfterSequence(seq(10)));

        assert!(!cursor.advance(seq(9)));
        assert!(!cursor.advance(seq(10)));
        assert_eq!(cursor, Cursor::AfterSequence(seq(10)));

        assert!(cursor.advance(seq(11)));
        assert_eq!(cursor.last_sequence_number(), Some(&seq(11)));
    }

    #[test]
    fn test_advance_past_long_sequence_numbers() {
        let first = "49590338271490256608559692538361571095921575989136588898";
        let mut cursor = Cursor::AfterSequence(first.parse().unwrap());

        assert!(cursor.is_stale(&seq(u128::MAX)));
        assert!(!cursor.advance(seq(u128::MAX)));
        assert!(cursor.advance(
            "49590338271490256608559692538361571095921575989136588899"
                .parse()
                .unwrap()
        ));
        assert_eq!(
            cursor.to_string(),
            "AFTER_SEQUENCE:49590338271490256608559692538361571095921575989136588899"
        );
    }

    #[test]
    fn test_unanchored_cursors_accept_any_record() {
        for cursor in [
            Cursor::AtStart,
            Cursor::AtEnd,
            Cursor::AtTimestamp(datetime!(2024-03-01 12:00 UTC)),
        ] {
            assert!(!cursor.is_stale(&seq(0)));
            assert_eq!(cursor.last_sequence_number(), None);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Cursor::AtStart.to_string(), "AT_START");
        assert_eq!(Cursor::AtEnd.to_string(), "AT_END");
        assert_eq!(
            Cursor::AfterSequence(seq(7)).to_string(),
            "AFTER_SEQUENCE:7"
        );
        assert_eq!(
            Cursor::AtTimestamp(datetime!(2024-03-01 12:00 UTC)).to_string(),
            "AT_TIMESTAMP:2024-03-01T12:00:00Z"
        );
    }

    #[test]
    fn test_cursor_checkpoint_format() {
        let cursor = Cursor::AfterSequence(seq(12345));
        let json = serde_json::to_value(&cursor).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "AFTER_SEQUENCE", "value": "12345"})
        );

        let start: Cursor = serde_json::from_str(r#"{"kind": "AT_START"}"#).unwrap();
        assert_eq!(start, Cursor::AtStart);

        let at: Cursor =
            serde_json::from_str(r#"{"kind": "AT_TIMESTAMP", "value": "2024-03-01T12:00:00Z"}"#)
                .unwrap();
        assert_eq!(at, Cursor::AtTimestamp(datetime!(2024-03-01 12:00 UTC)));
        assert_eq!(at.kind(), CursorKind::AtTimestamp);
    }
}
