//! Caller-facing error taxonomy.

use std::fmt;

use thiserror::Error;

use crate::client::frame::FrameError;
use crate::core::{EventNumber, ExpectedVersion, StreamId};

/// Whether retrying the same call may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Terminal outcome of an operation or subscription, as surfaced to callers.
///
/// Transient server outcomes (prepare/commit/forward timeouts, not-master
/// redirects) are absorbed by the dispatcher's retry budget and never appear
/// here; what does appear is final for that call.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The server refused the request's credentials (or their absence).
    #[error("access denied")]
    AccessDenied,

    /// The server rejected the request as malformed.
    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    /// Optimistic-concurrency check failed.
    #[error("wrong expected version: expected {expected}, actual {actual:?}")]
    WrongExpectedVersion {
        expected: ExpectedVersion,
        actual: Option<u64>,
    },

    #[error("stream {stream} has been deleted")]
    StreamDeleted { stream: StreamId },

    #[error("stream {stream} not found")]
    StreamNotFound { stream: StreamId },

    #[error("event {number} not found in stream {stream}")]
    EventNotFound {
        stream: StreamId,
        number: EventNumber,
    },

    /// The local per-operation deadline elapsed before a response arrived.
    #[error("operation timed out")]
    OperationTimedOut,

    /// The connection terminated permanently: the socket disappeared and the
    /// reconnect budget is spent, or the client was closed.
    #[error("connection lost")]
    ConnectionLost,

    /// The dispatcher gave up after the retry budget was consumed by
    /// transient failures.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// The server answered this correlation with something unrecognised.
    #[error("unexpected response: message type {command:#04x}")]
    UnexpectedResponse { command: u8 },

    /// Framing violation on the wire.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),

    #[error("subscription dropped: {0}")]
    SubscriptionDropped(DropReason),
}

impl ClientError {
    /// Classify whether the caller could reasonably retry the whole call.
    pub fn transience(&self) -> Transience {
        match self {
            ClientError::OperationTimedOut
            | ClientError::ConnectionLost
            | ClientError::RetriesExhausted { .. } => Transience::Retryable,
            ClientError::AccessDenied
            | ClientError::BadRequest { .. }
            | ClientError::WrongExpectedVersion { .. }
            | ClientError::StreamDeleted { .. }
            | ClientError::StreamNotFound { .. }
            | ClientError::EventNotFound { .. }
            | ClientError::UnexpectedResponse { .. }
            | ClientError::InvalidFrame(_)
            | ClientError::SubscriptionDropped(_) => Transience::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transience().is_retryable()
    }
}

/// Why a subscription terminated. Delivered exactly once per subscription,
/// through the observer's `on_dropped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The caller closed the handle.
    Unsubscribed,
    AccessDenied,
    /// The target stream does not exist or was deleted.
    NotFound,
    ConnectionLost,
    /// The live buffer overflowed while catching up.
    Overflow,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = match self {
            DropReason::Unsubscribed => "unsubscribed",
            DropReason::AccessDenied => "access denied",
            DropReason::NotFound => "not found",
            DropReason::ConnectionLost => "connection lost",
            DropReason::Overflow => "overflow",
        };
        f.write_str(raw)
    }
}
