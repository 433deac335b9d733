//! Stream identifiers and per-stream positions.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of an event stream.
///
/// Names beginning with `$` are system streams; `$$`-prefixed names are
/// metadata streams. The global log is addressed separately (see
/// [`crate::core::Position`] and the all-stream read/subscribe operations),
/// not through a stream id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamIdError {
    #[error("stream id cannot be empty")]
    Empty,
}

impl StreamId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, StreamIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(StreamIdError::Empty);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// System streams carry a `$` prefix (`$all`, `$stats-…`).
    pub fn is_system(&self) -> bool {
        self.0.starts_with('$')
    }

    /// Metadata streams carry a `$$` prefix.
    pub fn is_metadata(&self) -> bool {
        self.0.starts_with("$$")
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StreamId {
    type Error = StreamIdError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        StreamId::parse(raw)
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> String {
        id.0
    }
}

/// Position of a single event within a stream, as used by point reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventNumber {
    /// A concrete, non-negative position.
    Exact(u64),
    /// The most recent event at read time.
    Last,
}

impl EventNumber {
    pub const FIRST: EventNumber = EventNumber::Exact(0);
}

impl fmt::Display for EventNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventNumber::Exact(n) => write!(f, "{n}"),
            EventNumber::Last => f.write_str("last"),
        }
    }
}

/// Optimistic-concurrency precondition supplied with writes and deletes.
///
/// A write succeeds iff the version the server observes matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No check: the write lands whatever the current version.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream exists and holds no events.
    EmptyStream,
    /// The last event number must equal this value.
    Exact(u64),
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any"),
            ExpectedVersion::NoStream => f.write_str("no-stream"),
            ExpectedVersion::EmptyStream => f.write_str("empty-stream"),
            ExpectedVersion::Exact(n) => write!(f, "{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_rejects_empty() {
        assert_eq!(StreamId::parse(""), Err(StreamIdError::Empty));
    }

    #[test]
    fn stream_id_classifies_system_and_metadata() {
        let plain = StreamId::parse("orders-1").unwrap();
        assert!(!plain.is_system());
        assert!(!plain.is_metadata());

        let system = StreamId::parse("$all").unwrap();
        assert!(system.is_system());
        assert!(!system.is_metadata());

        let meta = StreamId::parse("$$orders-1").unwrap();
        assert!(meta.is_system());
        assert!(meta.is_metadata());
    }
}
