//! Data model shared by the wire protocol and the public API.

mod credentials;
mod event;
mod position;
mod stream;

pub use credentials::{Credentials, CredentialsError};
pub use event::{
    AllSlice, ContentType, DeleteResult, EventData, RecordedEvent, ResolvedEvent, StreamSlice,
    WriteResult,
};
pub use position::Position;
pub use stream::{EventNumber, ExpectedVersion, StreamId, StreamIdError};

/// Bounds applied while decoding inbound payloads.
///
/// These guard the client against a misbehaving peer, not against its own
/// requests; outbound encoding is unchecked beyond the frame cap.
#[derive(Clone, Debug)]
pub struct WireLimits {
    pub max_batch_events: usize,
    pub max_map_entries: usize,
    pub max_string_len: usize,
    pub max_event_bytes: usize,
}

impl Default for WireLimits {
    fn default() -> Self {
        Self {
            max_batch_events: 4096,
            max_map_entries: 64,
            max_string_len: 4096,
            max_event_bytes: 16 * 1024 * 1024,
        }
    }
}
