//! Typed protocol messages and their payload codec.
//!
//! The envelope (`packet.rs`) treats payloads as opaque bytes tagged by the
//! message-type code; this module is the bidirectional mapping between those
//! bytes and typed structures. Encoding uses CBOR maps with definite lengths
//! only; decoding skips unknown keys and enforces [`WireLimits`].

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{
    ContentType, EventData, EventNumber, ExpectedVersion, Position, RecordedEvent, ResolvedEvent,
    StreamId, WireLimits,
};

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("event batch too large: {got_events} events, limit {max_events}")]
    BatchTooLarge {
        max_events: usize,
        got_events: usize,
    },
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

// ---------------------------------------------------------------------------
// Requests

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteEvents {
    pub stream: StreamId,
    pub expected: ExpectedVersion,
    pub events: Vec<EventData>,
    pub require_master: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteStream {
    pub stream: StreamId,
    pub expected: ExpectedVersion,
    pub require_master: bool,
    pub hard_delete: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadEvent {
    pub stream: StreamId,
    pub event_number: EventNumber,
    pub resolve_link_tos: bool,
    pub require_master: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadStreamEvents {
    pub stream: StreamId,
    pub from_event_number: u64,
    pub max_count: u64,
    pub resolve_link_tos: bool,
    pub require_master: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadAllEvents {
    pub position: Position,
    pub max_count: u64,
    pub resolve_link_tos: bool,
    pub require_master: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeToStream {
    /// `None` subscribes to the global log.
    pub stream: Option<StreamId>,
    pub resolve_link_tos: bool,
}

// ---------------------------------------------------------------------------
// Responses

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationOutcome {
    Success,
    PrepareTimeout,
    CommitTimeout,
    ForwardTimeout,
    WrongExpectedVersion,
    StreamDeleted,
    AccessDenied,
}

impl OperationOutcome {
    fn as_str(self) -> &'static str {
        match self {
            OperationOutcome::Success => "success",
            OperationOutcome::PrepareTimeout => "prepare_timeout",
            OperationOutcome::CommitTimeout => "commit_timeout",
            OperationOutcome::ForwardTimeout => "forward_timeout",
            OperationOutcome::WrongExpectedVersion => "wrong_expected_version",
            OperationOutcome::StreamDeleted => "stream_deleted",
            OperationOutcome::AccessDenied => "access_denied",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(OperationOutcome::Success),
            "prepare_timeout" => Some(OperationOutcome::PrepareTimeout),
            "commit_timeout" => Some(OperationOutcome::CommitTimeout),
            "forward_timeout" => Some(OperationOutcome::ForwardTimeout),
            "wrong_expected_version" => Some(OperationOutcome::WrongExpectedVersion),
            "stream_deleted" => Some(OperationOutcome::StreamDeleted),
            "access_denied" => Some(OperationOutcome::AccessDenied),
            _ => None,
        }
    }

    /// Transient server outcomes the dispatcher may absorb by retrying.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            OperationOutcome::PrepareTimeout
                | OperationOutcome::CommitTimeout
                | OperationOutcome::ForwardTimeout
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteEventsCompleted {
    pub result: OperationOutcome,
    pub message: Option<String>,
    pub first_event_number: Option<u64>,
    pub last_event_number: Option<u64>,
    pub position: Option<Position>,
    /// Actual stream version, reported with `WrongExpectedVersion`.
    pub current_version: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteStreamCompleted {
    pub result: OperationOutcome,
    pub message: Option<String>,
    pub position: Option<Position>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadEventOutcome {
    Success,
    NotFound,
    NoStream,
    StreamDeleted,
    AccessDenied,
}

impl ReadEventOutcome {
    fn as_str(self) -> &'static str {
        match self {
            ReadEventOutcome::Success => "success",
            ReadEventOutcome::NotFound => "not_found",
            ReadEventOutcome::NoStream => "no_stream",
            ReadEventOutcome::StreamDeleted => "stream_deleted",
            ReadEventOutcome::AccessDenied => "access_denied",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(ReadEventOutcome::Success),
            "not_found" => Some(ReadEventOutcome::NotFound),
            "no_stream" => Some(ReadEventOutcome::NoStream),
            "stream_deleted" => Some(ReadEventOutcome::StreamDeleted),
            "access_denied" => Some(ReadEventOutcome::AccessDenied),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadEventCompleted {
    pub result: ReadEventOutcome,
    pub event: Option<ResolvedEvent>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStreamOutcome {
    Success,
    NoStream,
    StreamDeleted,
    AccessDenied,
}

impl ReadStreamOutcome {
    fn as_str(self) -> &'static str {
        match self {
            ReadStreamOutcome::Success => "success",
            ReadStreamOutcome::NoStream => "no_stream",
            ReadStreamOutcome::StreamDeleted => "stream_deleted",
            ReadStreamOutcome::AccessDenied => "access_denied",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(ReadStreamOutcome::Success),
            "no_stream" => Some(ReadStreamOutcome::NoStream),
            "stream_deleted" => Some(ReadStreamOutcome::StreamDeleted),
            "access_denied" => Some(ReadStreamOutcome::AccessDenied),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadStreamEventsCompleted {
    pub result: ReadStreamOutcome,
    pub events: Vec<ResolvedEvent>,
    pub next_event_number: u64,
    pub last_event_number: u64,
    pub is_end_of_stream: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadAllOutcome {
    Success,
    AccessDenied,
}

impl ReadAllOutcome {
    fn as_str(self) -> &'static str {
        match self {
            ReadAllOutcome::Success => "success",
            ReadAllOutcome::AccessDenied => "access_denied",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(ReadAllOutcome::Success),
            "access_denied" => Some(ReadAllOutcome::AccessDenied),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadAllEventsCompleted {
    pub result: ReadAllOutcome,
    pub events: Vec<ResolvedEvent>,
    pub next_position: Position,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionConfirmation {
    pub last_commit_position: u64,
    /// Absent when subscribing to the global log or to an empty stream.
    pub last_event_number: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEventAppeared {
    pub event: ResolvedEvent,
}

/// Server-initiated drop reasons; `ConnectionLost` is client-side only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubDropCode {
    Unsubscribed,
    AccessDenied,
    NotFound,
    Overflow,
}

impl SubDropCode {
    fn as_str(self) -> &'static str {
        match self {
            SubDropCode::Unsubscribed => "unsubscribed",
            SubDropCode::AccessDenied => "access_denied",
            SubDropCode::NotFound => "not_found",
            SubDropCode::Overflow => "overflow",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "unsubscribed" => Some(SubDropCode::Unsubscribed),
            "access_denied" => Some(SubDropCode::AccessDenied),
            "not_found" => Some(SubDropCode::NotFound),
            "overflow" => Some(SubDropCode::Overflow),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionDropped {
    pub reason: SubDropCode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotHandledReason {
    NotReady,
    TooBusy,
    NotMaster,
}

impl NotHandledReason {
    fn as_str(self) -> &'static str {
        match self {
            NotHandledReason::NotReady => "not_ready",
            NotHandledReason::TooBusy => "too_busy",
            NotHandledReason::NotMaster => "not_master",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "not_ready" => Some(NotHandledReason::NotReady),
            "too_busy" => Some(NotHandledReason::TooBusy),
            "not_master" => Some(NotHandledReason::NotMaster),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotHandled {
    pub reason: NotHandledReason,
    pub master: Option<(String, u16)>,
}

/// `BadRequest` and `NotAuthenticated` carry a raw UTF-8 reason, not CBOR.
pub fn decode_reason(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

// ---------------------------------------------------------------------------
// Encoders

type Enc<'a> = Encoder<&'a mut Vec<u8>>;

pub fn encode_write_events(msg: &WriteEvents) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(4)?;
    enc.str("stream")?;
    enc.str(msg.stream.as_str())?;
    enc.str("expected")?;
    encode_expected(&mut enc, msg.expected)?;
    enc.str("events")?;
    enc.array(msg.events.len() as u64)?;
    for event in &msg.events {
        encode_event_data(&mut enc, event)?;
    }
    enc.str("require_master")?;
    enc.bool(msg.require_master)?;
    Ok(buf)
}

pub fn encode_delete_stream(msg: &DeleteStream) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(4)?;
    enc.str("stream")?;
    enc.str(msg.stream.as_str())?;
    enc.str("expected")?;
    encode_expected(&mut enc, msg.expected)?;
    enc.str("require_master")?;
    enc.bool(msg.require_master)?;
    enc.str("hard_delete")?;
    enc.bool(msg.hard_delete)?;
    Ok(buf)
}

pub fn encode_read_event(msg: &ReadEvent) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(4)?;
    enc.str("stream")?;
    enc.str(msg.stream.as_str())?;
    enc.str("event_number")?;
    match msg.event_number {
        EventNumber::Exact(n) => {
            enc.u64(n)?;
        }
        EventNumber::Last => {
            enc.i64(-1)?;
        }
    }
    enc.str("resolve_link_tos")?;
    enc.bool(msg.resolve_link_tos)?;
    enc.str("require_master")?;
    enc.bool(msg.require_master)?;
    Ok(buf)
}

pub fn encode_read_stream_events(msg: &ReadStreamEvents) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(5)?;
    enc.str("stream")?;
    enc.str(msg.stream.as_str())?;
    enc.str("from_event_number")?;
    enc.u64(msg.from_event_number)?;
    enc.str("max_count")?;
    enc.u64(msg.max_count)?;
    enc.str("resolve_link_tos")?;
    enc.bool(msg.resolve_link_tos)?;
    enc.str("require_master")?;
    enc.bool(msg.require_master)?;
    Ok(buf)
}

pub fn encode_read_all_events(msg: &ReadAllEvents) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(5)?;
    enc.str("commit")?;
    enc.u64(msg.position.commit)?;
    enc.str("prepare")?;
    enc.u64(msg.position.prepare)?;
    enc.str("max_count")?;
    enc.u64(msg.max_count)?;
    enc.str("resolve_link_tos")?;
    enc.bool(msg.resolve_link_tos)?;
    enc.str("require_master")?;
    enc.bool(msg.require_master)?;
    Ok(buf)
}

pub fn encode_subscribe_to_stream(msg: &SubscribeToStream) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    let len = 1 + usize::from(msg.stream.is_some());
    enc.map(len as u64)?;
    if let Some(stream) = &msg.stream {
        enc.str("stream")?;
        enc.str(stream.as_str())?;
    }
    enc.str("resolve_link_tos")?;
    enc.bool(msg.resolve_link_tos)?;
    Ok(buf)
}

/// Unsubscribe carries an empty body, but a zero-length frame is invalid, so
/// an empty map goes on the wire.
pub fn encode_unsubscribe() -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(0)?;
    Ok(buf)
}

pub fn encode_write_events_completed(
    msg: &WriteEventsCompleted,
) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    let mut len = 1;
    len += usize::from(msg.message.is_some());
    len += usize::from(msg.first_event_number.is_some());
    len += usize::from(msg.last_event_number.is_some());
    len += 2 * usize::from(msg.position.is_some());
    len += usize::from(msg.current_version.is_some());
    enc.map(len as u64)?;
    enc.str("result")?;
    enc.str(msg.result.as_str())?;
    if let Some(message) = &msg.message {
        enc.str("message")?;
        enc.str(message)?;
    }
    if let Some(n) = msg.first_event_number {
        enc.str("first_event_number")?;
        enc.u64(n)?;
    }
    if let Some(n) = msg.last_event_number {
        enc.str("last_event_number")?;
        enc.u64(n)?;
    }
    if let Some(position) = msg.position {
        enc.str("commit")?;
        enc.u64(position.commit)?;
        enc.str("prepare")?;
        enc.u64(position.prepare)?;
    }
    if let Some(version) = msg.current_version {
        enc.str("current_version")?;
        enc.u64(version)?;
    }
    Ok(buf)
}

pub fn encode_delete_stream_completed(
    msg: &DeleteStreamCompleted,
) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    let mut len = 1;
    len += usize::from(msg.message.is_some());
    len += 2 * usize::from(msg.position.is_some());
    enc.map(len as u64)?;
    enc.str("result")?;
    enc.str(msg.result.as_str())?;
    if let Some(message) = &msg.message {
        enc.str("message")?;
        enc.str(message)?;
    }
    if let Some(position) = msg.position {
        enc.str("commit")?;
        enc.u64(position.commit)?;
        enc.str("prepare")?;
        enc.u64(position.prepare)?;
    }
    Ok(buf)
}

pub fn encode_read_event_completed(msg: &ReadEventCompleted) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    let len = 1 + usize::from(msg.event.is_some());
    enc.map(len as u64)?;
    enc.str("result")?;
    enc.str(msg.result.as_str())?;
    if let Some(event) = &msg.event {
        enc.str("event")?;
        encode_resolved_event(&mut enc, event)?;
    }
    Ok(buf)
}

pub fn encode_read_stream_events_completed(
    msg: &ReadStreamEventsCompleted,
) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(5)?;
    enc.str("result")?;
    enc.str(msg.result.as_str())?;
    enc.str("events")?;
    enc.array(msg.events.len() as u64)?;
    for event in &msg.events {
        encode_resolved_event(&mut enc, event)?;
    }
    enc.str("next_event_number")?;
    enc.u64(msg.next_event_number)?;
    enc.str("last_event_number")?;
    enc.u64(msg.last_event_number)?;
    enc.str("is_end_of_stream")?;
    enc.bool(msg.is_end_of_stream)?;
    Ok(buf)
}

pub fn encode_read_all_events_completed(
    msg: &ReadAllEventsCompleted,
) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(4)?;
    enc.str("result")?;
    enc.str(msg.result.as_str())?;
    enc.str("events")?;
    enc.array(msg.events.len() as u64)?;
    for event in &msg.events {
        encode_resolved_event(&mut enc, event)?;
    }
    enc.str("next_commit")?;
    enc.u64(msg.next_position.commit)?;
    enc.str("next_prepare")?;
    enc.u64(msg.next_position.prepare)?;
    Ok(buf)
}

pub fn encode_subscription_confirmation(
    msg: &SubscriptionConfirmation,
) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    let len = 1 + usize::from(msg.last_event_number.is_some());
    enc.map(len as u64)?;
    enc.str("last_commit")?;
    enc.u64(msg.last_commit_position)?;
    if let Some(n) = msg.last_event_number {
        enc.str("last_event_number")?;
        enc.u64(n)?;
    }
    Ok(buf)
}

pub fn encode_stream_event_appeared(
    msg: &StreamEventAppeared,
) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(1)?;
    enc.str("event")?;
    encode_resolved_event(&mut enc, &msg.event)?;
    Ok(buf)
}

pub fn encode_subscription_dropped(
    msg: &SubscriptionDropped,
) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(1)?;
    enc.str("reason")?;
    enc.str(msg.reason.as_str())?;
    Ok(buf)
}

pub fn encode_not_handled(msg: &NotHandled) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    let len = 1 + 2 * usize::from(msg.master.is_some());
    enc.map(len as u64)?;
    enc.str("reason")?;
    enc.str(msg.reason.as_str())?;
    if let Some((host, port)) = &msg.master {
        enc.str("master_host")?;
        enc.str(host)?;
        enc.str("master_port")?;
        enc.u16(*port)?;
    }
    Ok(buf)
}

fn encode_expected(enc: &mut Enc<'_>, expected: ExpectedVersion) -> Result<(), ProtoEncodeError> {
    match expected {
        ExpectedVersion::Any => {
            enc.map(1)?;
            enc.str("kind")?;
            enc.str("any")?;
        }
        ExpectedVersion::NoStream => {
            enc.map(1)?;
            enc.str("kind")?;
            enc.str("no_stream")?;
        }
        ExpectedVersion::EmptyStream => {
            enc.map(1)?;
            enc.str("kind")?;
            enc.str("empty_stream")?;
        }
        ExpectedVersion::Exact(version) => {
            enc.map(2)?;
            enc.str("kind")?;
            enc.str("exact")?;
            enc.str("version")?;
            enc.u64(version)?;
        }
    }
    Ok(())
}

fn encode_event_data(enc: &mut Enc<'_>, event: &EventData) -> Result<(), ProtoEncodeError> {
    enc.map(6)?;
    enc.str("id")?;
    enc.bytes(event.id.as_bytes())?;
    enc.str("type")?;
    enc.str(&event.event_type)?;
    enc.str("data")?;
    enc.bytes(&event.data)?;
    enc.str("meta")?;
    enc.bytes(&event.metadata)?;
    enc.str("data_ct")?;
    enc.u8(event.data_content.code())?;
    enc.str("meta_ct")?;
    enc.u8(event.metadata_content.code())?;
    Ok(())
}

fn encode_recorded_event(enc: &mut Enc<'_>, event: &RecordedEvent) -> Result<(), ProtoEncodeError> {
    enc.map(9)?;
    enc.str("stream")?;
    enc.str(event.stream.as_str())?;
    enc.str("number")?;
    enc.u64(event.number)?;
    enc.str("id")?;
    enc.bytes(event.id.as_bytes())?;
    enc.str("type")?;
    enc.str(&event.event_type)?;
    enc.str("data")?;
    enc.bytes(&event.data)?;
    enc.str("meta")?;
    enc.bytes(&event.metadata)?;
    enc.str("data_ct")?;
    enc.u8(event.data_content.code())?;
    enc.str("meta_ct")?;
    enc.u8(event.metadata_content.code())?;
    enc.str("created_ms")?;
    enc.u64(event.created_ms)?;
    Ok(())
}

fn encode_resolved_event(enc: &mut Enc<'_>, event: &ResolvedEvent) -> Result<(), ProtoEncodeError> {
    let mut len = 1;
    len += usize::from(event.link.is_some());
    len += 2 * usize::from(event.position.is_some());
    enc.map(len as u64)?;
    enc.str("event")?;
    encode_recorded_event(enc, &event.event)?;
    if let Some(link) = &event.link {
        enc.str("link")?;
        encode_recorded_event(enc, link)?;
    }
    if let Some(position) = event.position {
        enc.str("commit")?;
        enc.u64(position.commit)?;
        enc.str("prepare")?;
        enc.u64(position.prepare)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Decoders

pub fn decode_write_events(
    bytes: &[u8],
    limits: &WireLimits,
) -> Result<WriteEvents, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut stream = None;
    let mut expected = None;
    let mut events = None;
    let mut require_master = None;

    for _ in 0..map_len {
        match decode_text(&mut dec, limits)? {
            "stream" => stream = Some(decode_stream_id(&mut dec, limits)?),
            "expected" => expected = Some(decode_expected(&mut dec, limits)?),
            "events" => {
                let arr_len = decode_array_len(&mut dec, limits)?;
                if arr_len > limits.max_batch_events {
                    return Err(ProtoDecodeError::BatchTooLarge {
                        max_events: limits.max_batch_events,
                        got_events: arr_len,
                    });
                }
                let mut collected = Vec::with_capacity(arr_len);
                for _ in 0..arr_len {
                    collected.push(decode_event_data(&mut dec, limits)?);
                }
                events = Some(collected);
            }
            "require_master" => require_master = Some(dec.bool()?),
            _ => skip_value(&mut dec)?,
        }
    }
    finish(&dec)?;

    Ok(WriteEvents {
        stream: stream.ok_or(ProtoDecodeError::MissingField("stream"))?,
        expected: expected.ok_or(ProtoDecodeError::MissingField("expected"))?,
        events: events.ok_or(ProtoDecodeError::MissingField("events"))?,
        require_master: require_master.ok_or(ProtoDecodeError::MissingField("require_master"))?,
    })
}

pub fn decode_delete_stream(
    bytes: &[u8],
    limits: &WireLimits,
) -> Result<DeleteStream, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut stream = None;
    let mut expected = None;
    let mut require_master = None;
    let mut hard_delete = None;

    for _ in 0..map_len {
        match decode_text(&mut dec, limits)? {
            "stream" => stream = Some(decode_stream_id(&mut dec, limits)?),
            "expected" => expected = Some(decode_expected(&mut dec, limits)?),
            "require_master" => require_master = Some(dec.bool()?),
            "hard_delete" => hard_delete = Some(dec.bool()?),
            _ => skip_value(&mut dec)?,
        }
    }
    finish(&dec)?;

    Ok(DeleteStream {
        stream: stream.ok_or(ProtoDecodeError::MissingField("stream"))?,
        expected: expected.ok_or(ProtoDecodeError::MissingField("expected"))?,
        require_master: require_master.ok_or(ProtoDecodeError::MissingField("require_master"))?,
        hard_delete: hard_delete.ok_or(ProtoDecodeError::MissingField("hard_delete"))?,
    })
}

pub fn decode_read_event(bytes: &[u8], limits: &WireLimits) -> Result<ReadEvent, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut stream = None;
    let mut event_number = None;
    let mut resolve_link_tos = None;
    let mut require_master = None;

    for _ in 0..map_len {
        match decode_text(&mut dec, limits)? {
            "stream" => stream = Some(decode_stream_id(&mut dec, limits)?),
            "event_number" => {
                let raw = dec.i64()?;
                event_number = Some(if raw < 0 {
                    EventNumber::Last
                } else {
                    EventNumber::Exact(raw as u64)
                });
            }
            "resolve_link_tos" => resolve_link_tos = Some(dec.bool()?),
            "require_master" => require_master = Some(dec.bool()?),
            _ => skip_value(&mut dec)?,
        }
    }
    finish(&dec)?;

    Ok(ReadEvent {
        stream: stream.ok_or(ProtoDecodeError::MissingField("stream"))?,
        event_number: event_number.ok_or(ProtoDecodeError::MissingField("event_number"))?,
        resolve_link_tos: resolve_link_tos
            .ok_or(ProtoDecodeError::MissingField("resolve_link_tos"))?,
        require_master: require_master.ok_or(ProtoDecodeError::MissingField("require_master"))?,
    })
}

pub fn decode_read_stream_events(
    bytes: &[u8],
    limits: &WireLimits,
) -> Result<ReadStreamEvents, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut stream = None;
    let mut from_event_number = None;
    let mut max_count = None;
    let mut resolve_link_tos = None;
    let mut require_master = None;

    for _ in 0..map_len {
        match decode_text(&mut dec, limits)? {
            "stream" => stream = Some(decode_stream_id(&mut dec, limits)?),
            "from_event_number" => from_event_number = Some(dec.u64()?),
            "max_count" => max_count = Some(dec.u64()?),
            "resolve_link_tos" => resolve_link_tos = Some(dec.bool()?),
            "require_master" => require_master = Some(dec.bool()?),
            _ => skip_value(&mut dec)?,
        }
    }
    finish(&dec)?;

    Ok(ReadStreamEvents {
        stream: stream.ok_or(ProtoDecodeError::MissingField("stream"))?,
        from_event_number: from_event_number
            .ok_or(ProtoDecodeError::MissingField("from_event_number"))?,
        max_count: max_count.ok_or(ProtoDecodeError::MissingField("max_count"))?,
        resolve_link_tos: resolve_link_tos
            .ok_or(ProtoDecodeError::MissingField("resolve_link_tos"))?,
        require_master: require_master.ok_or(ProtoDecodeError::MissingField("require_master"))?,
    })
}

pub fn decode_read_all_events(
    bytes: &[u8],
    limits: &WireLimits,
) -> Result<ReadAllEvents, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut commit = None;
    let mut prepare = None;
    let mut max_count = None;
    let mut resolve_link_tos = None;
    let mut require_master = None;

    for _ in 0..map_len {
        match decode_text(&mut dec, limits)? {
            "commit" => commit = Some(dec.u64()?),
            "prepare" => prepare = Some(dec.u64()?),
            "max_count" => max_count = Some(dec.u64()?),
            "resolve_link_tos" => resolve_link_tos = Some(dec.bool()?),
            "require_master" => require_master = Some(dec.bool()?),
            _ => skip_value(&mut dec)?,
        }
    }
    finish(&dec)?;

    Ok(ReadAllEvents {
        position: Position::new(
            commit.ok_or(ProtoDecodeError::MissingField("commit"))?,
            prepare.ok_or(ProtoDecodeError::MissingField("prepare"))?,
        ),
        max_count: max_count.ok_or(ProtoDecodeError::MissingField("max_count"))?,
        resolve_link_tos: resolve_link_tos
            .ok_or(ProtoDecodeError::MissingField("resolve_link_tos"))?,
        require_master: require_master.ok_or(ProtoDecodeError::MissingField("require_master"))?,
    })
}

pub fn decode_subscribe_to_stream(
    bytes: &[u8],
    limits: &WireLimits,
) -> Result<SubscribeToStream, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut stream = None;
    let mut resolve_link_tos = None;

    for _ in 0..map_len {
        match decode_text(&mut dec, limits)? {
            "stream" => stream = Some(decode_stream_id(&mut dec, limits)?),
            "resolve_link_tos" => resolve_link_tos = Some(dec.bool()?),
            _ => skip_value(&mut dec)?,
        }
    }
    finish(&dec)?;

    Ok(SubscribeToStream {
        stream,
        resolve_link_tos: resolve_link_tos
            .ok_or(ProtoDecodeError::MissingField("resolve_link_tos"))?,
    })
}

pub fn decode_write_events_completed(
    bytes: &[u8],
    limits: &WireLimits,
) -> Result<WriteEventsCompleted, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut result = None;
    let mut message = None;
    let mut first_event_number = None;
    let mut last_event_number = None;
    let mut commit = None;
    let mut prepare = None;
    let mut current_version = None;

    for _ in 0..map_len {
        match decode_text(&mut dec, limits)? {
            "result" => result = Some(decode_operation_outcome(&mut dec, limits)?),
            "message" => message = Some(decode_text(&mut dec, limits)?.to_string()),
            "first_event_number" => first_event_number = Some(dec.u64()?),
            "last_event_number" => last_event_number = Some(dec.u64()?),
            "commit" => commit = Some(dec.u64()?),
            "prepare" => prepare = Some(dec.u64()?),
            "current_version" => current_version = Some(dec.u64()?),
            _ => skip_value(&mut dec)?,
        }
    }
    finish(&dec)?;

    Ok(WriteEventsCompleted {
        result: result.ok_or(ProtoDecodeError::MissingField("result"))?,
        message,
        first_event_number,
        last_event_number,
        position: zip_position(commit, prepare)?,
        current_version,
    })
}

pub fn decode_delete_stream_completed(
    bytes: &[u8],
    limits: &WireLimits,
) -> Result<DeleteStreamCompleted, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut result = None;
    let mut message = None;
    let mut commit = None;
    let mut prepare = None;

    for _ in 0..map_len {
        match decode_text(&mut dec, limits)? {
            "result" => result = Some(decode_operation_outcome(&mut dec, limits)?),
            "message" => message = Some(decode_text(&mut dec, limits)?.to_string()),
            "commit" => commit = Some(dec.u64()?),
            "prepare" => prepare = Some(dec.u64()?),
            _ => skip_value(&mut dec)?,
        }
    }
    finish(&dec)?;

    Ok(DeleteStreamCompleted {
        result: result.ok_or(ProtoDecodeError::MissingField("result"))?,
        message,
        position: zip_position(commit, prepare)?,
    })
}

pub fn decode_read_event_completed(
    bytes: &[u8],
    limits: &WireLimits,
) -> Result<ReadEventCompleted, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut result = None;
    let mut event = None;

    for _ in 0..map_len {
        match decode_text(&mut dec, limits)? {
            "result" => {
                let raw = decode_text(&mut dec, limits)?;
                result = Some(ReadEventOutcome::parse(raw).ok_or_else(|| {
                    ProtoDecodeError::InvalidField {
                        field: "result",
                        reason: format!("unknown outcome {raw:?}"),
                    }
                })?);
            }
            "event" => event = Some(decode_resolved_event(&mut dec, limits)?),
            _ => skip_value(&mut dec)?,
        }
    }
    finish(&dec)?;

    Ok(ReadEventCompleted {
        result: result.ok_or(ProtoDecodeError::MissingField("result"))?,
        event,
    })
}

pub fn decode_read_stream_events_completed(
    bytes: &[u8],
    limits: &WireLimits,
) -> Result<ReadStreamEventsCompleted, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut result = None;
    let mut events = None;
    let mut next_event_number = None;
    let mut last_event_number = None;
    let mut is_end_of_stream = None;

    for _ in 0..map_len {
        match decode_text(&mut dec, limits)? {
            "result" => {
                let raw = decode_text(&mut dec, limits)?;
                result = Some(ReadStreamOutcome::parse(raw).ok_or_else(|| {
                    ProtoDecodeError::InvalidField {
                        field: "result",
                        reason: format!("unknown outcome {raw:?}"),
                    }
                })?);
            }
            "events" => events = Some(decode_resolved_events(&mut dec, limits)?),
            "next_event_number" => next_event_number = Some(dec.u64()?),
            "last_event_number" => last_event_number = Some(dec.u64()?),
            "is_end_of_stream" => is_end_of_stream = Some(dec.bool()?),
            _ => skip_value(&mut dec)?,
        }
    }
    finish(&dec)?;

    Ok(ReadStreamEventsCompleted {
        result: result.ok_or(ProtoDecodeError::MissingField("result"))?,
        events: events.ok_or(ProtoDecodeError::MissingField("events"))?,
        next_event_number: next_event_number
            .ok_or(ProtoDecodeError::MissingField("next_event_number"))?,
        last_event_number: last_event_number
            .ok_or(ProtoDecodeError::MissingField("last_event_number"))?,
        is_end_of_stream: is_end_of_stream
            .ok_or(ProtoDecodeError::MissingField("is_end_of_stream"))?,
    })
}

pub fn decode_read_all_events_completed(
    bytes: &[u8],
    limits: &WireLimits,
) -> Result<ReadAllEventsCompleted, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut result = None;
    let mut events = None;
    let mut next_commit = None;
    let mut next_prepare = None;

    for _ in 0..map_len {
        match decode_text(&mut dec, limits)? {
            "result" => {
                let raw = decode_text(&mut dec, limits)?;
                result = Some(ReadAllOutcome::parse(raw).ok_or_else(|| {
                    ProtoDecodeError::InvalidField {
                        field: "result",
                        reason: format!("unknown outcome {raw:?}"),
                    }
                })?);
            }
            "events" => events = Some(decode_resolved_events(&mut dec, limits)?),
            "next_commit" => next_commit = Some(dec.u64()?),
            "next_prepare" => next_prepare = Some(dec.u64()?),
            _ => skip_value(&mut dec)?,
        }
    }
    finish(&dec)?;

    Ok(ReadAllEventsCompleted {
        result: result.ok_or(ProtoDecodeError::MissingField("result"))?,
        events: events.ok_or(ProtoDecodeError::MissingField("events"))?,
        next_position: Position::new(
            next_commit.ok_or(ProtoDecodeError::MissingField("next_commit"))?,
            next_prepare.ok_or(ProtoDecodeError::MissingField("next_prepare"))?,
        ),
    })
}

pub fn decode_subscription_confirmation(
    bytes: &[u8],
    limits: &WireLimits,
) -> Result<SubscriptionConfirmation, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut last_commit = None;
    let mut last_event_number = None;

    for _ in 0..map_len {
        match decode_text(&mut dec, limits)? {
            "last_commit" => last_commit = Some(dec.u64()?),
            "last_event_number" => last_event_number = Some(dec.u64()?),
            _ => skip_value(&mut dec)?,
        }
    }
    finish(&dec)?;

    Ok(SubscriptionConfirmation {
        last_commit_position: last_commit.ok_or(ProtoDecodeError::MissingField("last_commit"))?,
        last_event_number,
    })
}

pub fn decode_stream_event_appeared(
    bytes: &[u8],
    limits: &WireLimits,
) -> Result<StreamEventAppeared, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut event = None;

    for _ in 0..map_len {
        match decode_text(&mut dec, limits)? {
            "event" => event = Some(decode_resolved_event(&mut dec, limits)?),
            _ => skip_value(&mut dec)?,
        }
    }
    finish(&dec)?;

    Ok(StreamEventAppeared {
        event: event.ok_or(ProtoDecodeError::MissingField("event"))?,
    })
}

pub fn decode_subscription_dropped(
    bytes: &[u8],
    limits: &WireLimits,
) -> Result<SubscriptionDropped, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut reason = None;

    for _ in 0..map_len {
        match decode_text(&mut dec, limits)? {
            "reason" => {
                let raw = decode_text(&mut dec, limits)?;
                reason = Some(SubDropCode::parse(raw).ok_or_else(|| {
                    ProtoDecodeError::InvalidField {
                        field: "reason",
                        reason: format!("unknown drop reason {raw:?}"),
                    }
                })?);
            }
            _ => skip_value(&mut dec)?,
        }
    }
    finish(&dec)?;

    Ok(SubscriptionDropped {
        reason: reason.ok_or(ProtoDecodeError::MissingField("reason"))?,
    })
}

pub fn decode_not_handled(bytes: &[u8], limits: &WireLimits) -> Result<NotHandled, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut reason = None;
    let mut master_host = None;
    let mut master_port = None;

    for _ in 0..map_len {
        match decode_text(&mut dec, limits)? {
            "reason" => {
                let raw = decode_text(&mut dec, limits)?;
                reason = Some(NotHandledReason::parse(raw).ok_or_else(|| {
                    ProtoDecodeError::InvalidField {
                        field: "reason",
                        reason: format!("unknown not-handled reason {raw:?}"),
                    }
                })?);
            }
            "master_host" => master_host = Some(decode_text(&mut dec, limits)?.to_string()),
            "master_port" => master_port = Some(dec.u16()?),
            _ => skip_value(&mut dec)?,
        }
    }
    finish(&dec)?;

    let master = match (master_host, master_port) {
        (Some(host), Some(port)) => Some((host, port)),
        (None, None) => None,
        _ => {
            return Err(ProtoDecodeError::InvalidField {
                field: "master_host",
                reason: "host and port must be given together".into(),
            });
        }
    };

    Ok(NotHandled {
        reason: reason.ok_or(ProtoDecodeError::MissingField("reason"))?,
        master,
    })
}

fn decode_operation_outcome(
    dec: &mut Decoder,
    limits: &WireLimits,
) -> Result<OperationOutcome, ProtoDecodeError> {
    let raw = decode_text(dec, limits)?;
    OperationOutcome::parse(raw).ok_or_else(|| ProtoDecodeError::InvalidField {
        field: "result",
        reason: format!("unknown outcome {raw:?}"),
    })
}

fn decode_expected(
    dec: &mut Decoder,
    limits: &WireLimits,
) -> Result<ExpectedVersion, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut kind = None;
    let mut version = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "kind" => kind = Some(decode_text(dec, limits)?.to_string()),
            "version" => version = Some(dec.u64()?),
            _ => skip_value(dec)?,
        }
    }

    match kind.as_deref() {
        Some("any") => Ok(ExpectedVersion::Any),
        Some("no_stream") => Ok(ExpectedVersion::NoStream),
        Some("empty_stream") => Ok(ExpectedVersion::EmptyStream),
        Some("exact") => Ok(ExpectedVersion::Exact(
            version.ok_or(ProtoDecodeError::MissingField("version"))?,
        )),
        Some(other) => Err(ProtoDecodeError::InvalidField {
            field: "kind",
            reason: format!("unknown expected version {other:?}"),
        }),
        None => Err(ProtoDecodeError::MissingField("kind")),
    }
}

fn decode_event_data(dec: &mut Decoder, limits: &WireLimits) -> Result<EventData, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;

    let mut id = None;
    let mut event_type = None;
    let mut data = None;
    let mut metadata = None;
    let mut data_content = None;
    let mut metadata_content = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "id" => id = Some(decode_uuid(dec, limits, "id")?),
            "type" => event_type = Some(decode_text(dec, limits)?.to_string()),
            "data" => data = Some(decode_payload_bytes(dec, limits, "data")?),
            "meta" => metadata = Some(decode_payload_bytes(dec, limits, "meta")?),
            "data_ct" => data_content = Some(decode_content_type(dec, "data_ct")?),
            "meta_ct" => metadata_content = Some(decode_content_type(dec, "meta_ct")?),
            _ => skip_value(dec)?,
        }
    }

    Ok(EventData {
        id: id.ok_or(ProtoDecodeError::MissingField("id"))?,
        event_type: event_type.ok_or(ProtoDecodeError::MissingField("type"))?,
        data: data.ok_or(ProtoDecodeError::MissingField("data"))?,
        metadata: metadata.ok_or(ProtoDecodeError::MissingField("meta"))?,
        data_content: data_content.ok_or(ProtoDecodeError::MissingField("data_ct"))?,
        metadata_content: metadata_content.ok_or(ProtoDecodeError::MissingField("meta_ct"))?,
    })
}

fn decode_recorded_event(
    dec: &mut Decoder,
    limits: &WireLimits,
) -> Result<RecordedEvent, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;

    let mut stream = None;
    let mut number = None;
    let mut id = None;
    let mut event_type = None;
    let mut data = None;
    let mut metadata = None;
    let mut data_content = None;
    let mut metadata_content = None;
    let mut created_ms = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "stream" => stream = Some(decode_stream_id(dec, limits)?),
            "number" => number = Some(dec.u64()?),
            "id" => id = Some(decode_uuid(dec, limits, "id")?),
            "type" => event_type = Some(decode_text(dec, limits)?.to_string()),
            "data" => data = Some(decode_payload_bytes(dec, limits, "data")?),
            "meta" => metadata = Some(decode_payload_bytes(dec, limits, "meta")?),
            "data_ct" => data_content = Some(decode_content_type(dec, "data_ct")?),
            "meta_ct" => metadata_content = Some(decode_content_type(dec, "meta_ct")?),
            "created_ms" => created_ms = Some(dec.u64()?),
            _ => skip_value(dec)?,
        }
    }

    Ok(RecordedEvent {
        stream: stream.ok_or(ProtoDecodeError::MissingField("stream"))?,
        number: number.ok_or(ProtoDecodeError::MissingField("number"))?,
        id: id.ok_or(ProtoDecodeError::MissingField("id"))?,
        event_type: event_type.ok_or(ProtoDecodeError::MissingField("type"))?,
        data: data.ok_or(ProtoDecodeError::MissingField("data"))?,
        metadata: metadata.ok_or(ProtoDecodeError::MissingField("meta"))?,
        data_content: data_content.ok_or(ProtoDecodeError::MissingField("data_ct"))?,
        metadata_content: metadata_content.ok_or(ProtoDecodeError::MissingField("meta_ct"))?,
        created_ms: created_ms.ok_or(ProtoDecodeError::MissingField("created_ms"))?,
    })
}

fn decode_resolved_event(
    dec: &mut Decoder,
    limits: &WireLimits,
) -> Result<ResolvedEvent, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;

    let mut event = None;
    let mut link = None;
    let mut commit = None;
    let mut prepare = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "event" => event = Some(decode_recorded_event(dec, limits)?),
            "link" => link = Some(decode_recorded_event(dec, limits)?),
            "commit" => commit = Some(dec.u64()?),
            "prepare" => prepare = Some(dec.u64()?),
            _ => skip_value(dec)?,
        }
    }

    Ok(ResolvedEvent {
        event: event.ok_or(ProtoDecodeError::MissingField("event"))?,
        link,
        position: zip_position(commit, prepare)?,
    })
}

fn decode_resolved_events(
    dec: &mut Decoder,
    limits: &WireLimits,
) -> Result<Vec<ResolvedEvent>, ProtoDecodeError> {
    let arr_len = decode_array_len(dec, limits)?;
    if arr_len > limits.max_batch_events {
        return Err(ProtoDecodeError::BatchTooLarge {
            max_events: limits.max_batch_events,
            got_events: arr_len,
        });
    }
    let mut out = Vec::with_capacity(arr_len);
    for _ in 0..arr_len {
        out.push(decode_resolved_event(dec, limits)?);
    }
    Ok(out)
}

fn decode_content_type(
    dec: &mut Decoder,
    field: &'static str,
) -> Result<ContentType, ProtoDecodeError> {
    let code = dec.u8()?;
    ContentType::parse(code).ok_or_else(|| ProtoDecodeError::InvalidField {
        field,
        reason: format!("unknown content type {code}"),
    })
}

fn decode_stream_id(dec: &mut Decoder, limits: &WireLimits) -> Result<StreamId, ProtoDecodeError> {
    let raw = decode_text(dec, limits)?;
    StreamId::parse(raw).map_err(|e| ProtoDecodeError::InvalidField {
        field: "stream",
        reason: e.to_string(),
    })
}

fn decode_uuid(
    dec: &mut Decoder,
    limits: &WireLimits,
    field: &'static str,
) -> Result<Uuid, ProtoDecodeError> {
    let raw = decode_bytes(dec, limits, field)?;
    let bytes: [u8; 16] = raw.try_into().map_err(|_| ProtoDecodeError::InvalidField {
        field,
        reason: "expected 16-byte uuid".into(),
    })?;
    Ok(Uuid::from_bytes(bytes))
}

fn decode_payload_bytes(
    dec: &mut Decoder,
    limits: &WireLimits,
    field: &'static str,
) -> Result<Bytes, ProtoDecodeError> {
    let raw = decode_bytes(dec, limits, field)?;
    if raw.len() > limits.max_event_bytes {
        return Err(ProtoDecodeError::DecodeLimit("max_event_bytes"));
    }
    Ok(Bytes::copy_from_slice(raw))
}

fn zip_position(
    commit: Option<u64>,
    prepare: Option<u64>,
) -> Result<Option<Position>, ProtoDecodeError> {
    match (commit, prepare) {
        (Some(commit), Some(prepare)) => Ok(Some(Position::new(commit, prepare))),
        (None, None) => Ok(None),
        _ => Err(ProtoDecodeError::InvalidField {
            field: "commit",
            reason: "commit and prepare must be given together".into(),
        }),
    }
}

fn decode_map_len(dec: &mut Decoder, limits: &WireLimits) -> Result<usize, ProtoDecodeError> {
    let Some(len) = dec.map()? else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > limits.max_map_entries as u64 {
        return Err(ProtoDecodeError::DecodeLimit("max_map_entries"));
    }
    usize::try_from(len).map_err(|_| ProtoDecodeError::DecodeLimit("max_map_entries"))
}

fn decode_array_len(dec: &mut Decoder, limits: &WireLimits) -> Result<usize, ProtoDecodeError> {
    let Some(len) = dec.array()? else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > limits.max_batch_events as u64 {
        return Err(ProtoDecodeError::DecodeLimit("array entries"));
    }
    usize::try_from(len).map_err(|_| ProtoDecodeError::DecodeLimit("array entries"))
}

fn decode_text<'a>(dec: &mut Decoder<'a>, limits: &WireLimits) -> Result<&'a str, ProtoDecodeError> {
    if matches!(dec.datatype()?, Type::StringIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let s = dec.str()?;
    if s.len() > limits.max_string_len {
        return Err(ProtoDecodeError::DecodeLimit("max_string_len"));
    }
    Ok(s)
}

fn decode_bytes<'a>(
    dec: &mut Decoder<'a>,
    limits: &WireLimits,
    field: &'static str,
) -> Result<&'a [u8], ProtoDecodeError> {
    if matches!(dec.datatype()?, Type::BytesIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let bytes = dec.bytes()?;
    if bytes.len() > limits.max_event_bytes {
        return Err(ProtoDecodeError::InvalidField {
            field,
            reason: "bytes length exceeds limit".into(),
        });
    }
    Ok(bytes)
}

fn skip_value(dec: &mut Decoder) -> Result<(), ProtoDecodeError> {
    if matches!(
        dec.datatype()?,
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef
    ) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    dec.skip()?;
    Ok(())
}

fn finish(dec: &Decoder) -> Result<(), ProtoDecodeError> {
    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }
    Ok(())
}
