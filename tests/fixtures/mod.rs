//! Shared fixtures: a scripted protocol server and event builders.

pub mod server;

use bytes::Bytes;
use uuid::Uuid;

use tailstore::config::{DelaySettings, HeartbeatSettings, OperationSettings};
use tailstore::{ContentType, Position, RecordedEvent, ResolvedEvent, Settings, StreamId};

/// Settings pointed at a fixture server, with snappy reconnects so tests
/// never sit out the production defaults.
pub fn test_settings(addr: &str) -> Settings {
    Settings {
        address: addr.to_string(),
        connection_timeout_ms: 2_000,
        reconnection_delay: DelaySettings {
            min_ms: 10,
            max_ms: 50,
        },
        heartbeat: HeartbeatSettings {
            interval_ms: 200,
            timeout_ms: 2_000,
        },
        operation: OperationSettings {
            max_retries: 10,
            timeout_ms: 5_000,
        },
        ..Settings::default()
    }
}

pub fn stream_id(raw: &str) -> StreamId {
    StreamId::parse(raw).expect("stream id")
}

pub fn recorded(stream: &str, number: u64) -> RecordedEvent {
    RecordedEvent {
        stream: stream_id(stream),
        number,
        id: Uuid::from_bytes([number as u8 + 1; 16]),
        event_type: "test-event".into(),
        data: Bytes::from(format!("{{\"n\":{number}}}")),
        metadata: Bytes::new(),
        data_content: ContentType::Json,
        metadata_content: ContentType::Binary,
        created_ms: 1_700_000_000_000 + number,
    }
}

pub fn resolved(stream: &str, number: u64) -> ResolvedEvent {
    ResolvedEvent {
        event: recorded(stream, number),
        link: None,
        position: Some(Position::new(number * 10, number * 10)),
    }
}
