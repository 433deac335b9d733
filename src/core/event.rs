//! Event payloads going in, event records coming out.

use bytes::Bytes;
use uuid::Uuid;

use super::position::Position;
use super::stream::StreamId;

/// How the server should treat a data or metadata buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    Binary,
    Json,
}

impl ContentType {
    pub fn code(self) -> u8 {
        match self {
            ContentType::Binary => 0,
            ContentType::Json => 1,
        }
    }

    pub fn parse(code: u8) -> Option<Self> {
        match code {
            0 => Some(ContentType::Binary),
            1 => Some(ContentType::Json),
            _ => None,
        }
    }
}

/// An event to be appended to a stream.
///
/// The id must be unique within the stream over its lifetime; the server
/// uses it to deduplicate re-sent writes, so retries of the same logical
/// append must carry the same id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventData {
    pub id: Uuid,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
    pub data_content: ContentType,
    pub metadata_content: ContentType,
}

impl EventData {
    pub fn json(id: Uuid, event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            data: data.into(),
            metadata: Bytes::new(),
            data_content: ContentType::Json,
            metadata_content: ContentType::Binary,
        }
    }

    pub fn binary(id: Uuid, event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            data: data.into(),
            metadata: Bytes::new(),
            data_content: ContentType::Binary,
            metadata_content: ContentType::Binary,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>, content: ContentType) -> Self {
        self.metadata = metadata.into();
        self.metadata_content = content;
        self
    }
}

/// An event as stored by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub stream: StreamId,
    pub number: u64,
    pub id: Uuid,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
    pub data_content: ContentType,
    pub metadata_content: ContentType,
    /// Server-side creation time, milliseconds since the Unix epoch.
    pub created_ms: u64,
}

/// A read result that may have gone through link-to resolution.
///
/// When the read hit a link event and resolution was enabled, `event` is the
/// link's target and `link` is the pointer record. Otherwise `event` is the
/// record itself and `link` is empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedEvent {
    pub event: RecordedEvent,
    pub link: Option<RecordedEvent>,
    /// Global position, when the server provided one (always present for
    /// all-stream reads and subscriptions).
    pub position: Option<Position>,
}

impl ResolvedEvent {
    /// The record as it sits in the stream that was read: the link if one
    /// was followed, the event itself otherwise.
    pub fn original_event(&self) -> &RecordedEvent {
        self.link.as_ref().unwrap_or(&self.event)
    }

    /// Event number in the originating stream; this is the cursor value for
    /// catch-up paging and de-duplication.
    pub fn original_number(&self) -> u64 {
        self.original_event().number
    }

    pub fn original_stream(&self) -> &StreamId {
        &self.original_event().stream
    }
}

/// Outcome of a successful append.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteResult {
    pub first_event_number: u64,
    pub last_event_number: u64,
    pub position: Option<Position>,
}

/// Outcome of a successful stream deletion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteResult {
    pub position: Option<Position>,
}

/// One forward page of a stream read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSlice {
    pub events: Vec<ResolvedEvent>,
    /// Where the next forward read should start.
    pub next_event_number: u64,
    pub last_event_number: u64,
    pub end_of_stream: bool,
}

/// One forward page of the global log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllSlice {
    pub events: Vec<ResolvedEvent>,
    /// Where the next forward read should start.
    pub next_position: Position,
}
