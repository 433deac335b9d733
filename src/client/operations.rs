//! Operation dispatcher: correlation table, deadlines, retries, and typed
//! completion routing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use uuid::Uuid;

use crate::core::{
    AllSlice, Credentials, DeleteResult, ResolvedEvent, StreamSlice, WireLimits, WriteResult,
};
use crate::error::ClientError;

use super::command::MessageKind;
use super::packet::Packet;
use super::proto::{
    self, NotHandledReason, OperationOutcome, ProtoEncodeError, ReadAllOutcome, ReadEventOutcome,
    ReadStreamOutcome,
};

/// One submitted request, paired with the channel that resolves the caller.
pub(crate) enum Call {
    Write {
        req: proto::WriteEvents,
        respond: Sender<Result<WriteResult, ClientError>>,
    },
    Delete {
        req: proto::DeleteStream,
        respond: Sender<Result<DeleteResult, ClientError>>,
    },
    ReadEvent {
        req: proto::ReadEvent,
        respond: Sender<Result<ResolvedEvent, ClientError>>,
    },
    ReadStream {
        req: proto::ReadStreamEvents,
        respond: Sender<Result<StreamSlice, ClientError>>,
    },
    ReadAll {
        req: proto::ReadAllEvents,
        respond: Sender<Result<AllSlice, ClientError>>,
    },
}

impl Call {
    fn kind(&self) -> MessageKind {
        match self {
            Call::Write { .. } => MessageKind::WriteEvents,
            Call::Delete { .. } => MessageKind::DeleteStream,
            Call::ReadEvent { .. } => MessageKind::ReadEvent,
            Call::ReadStream { .. } => MessageKind::ReadStreamEventsForward,
            Call::ReadAll { .. } => MessageKind::ReadAllEventsForward,
        }
    }

    fn completion_kind(&self) -> MessageKind {
        match self {
            Call::Write { .. } => MessageKind::WriteEventsCompleted,
            Call::Delete { .. } => MessageKind::DeleteStreamCompleted,
            Call::ReadEvent { .. } => MessageKind::ReadEventCompleted,
            Call::ReadStream { .. } => MessageKind::ReadStreamEventsForwardCompleted,
            Call::ReadAll { .. } => MessageKind::ReadAllEventsForwardCompleted,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, ProtoEncodeError> {
        match self {
            Call::Write { req, .. } => proto::encode_write_events(req),
            Call::Delete { req, .. } => proto::encode_delete_stream(req),
            Call::ReadEvent { req, .. } => proto::encode_read_event(req),
            Call::ReadStream { req, .. } => proto::encode_read_stream_events(req),
            Call::ReadAll { req, .. } => proto::encode_read_all_events(req),
        }
    }

    pub(crate) fn fail(&self, err: ClientError) {
        match self {
            Call::Write { respond, .. } => {
                let _ = respond.send(Err(err));
            }
            Call::Delete { respond, .. } => {
                let _ = respond.send(Err(err));
            }
            Call::ReadEvent { respond, .. } => {
                let _ = respond.send(Err(err));
            }
            Call::ReadStream { respond, .. } => {
                let _ = respond.send(Err(err));
            }
            Call::ReadAll { respond, .. } => {
                let _ = respond.send(Err(err));
            }
        }
    }
}

struct OperationRecord {
    call: Call,
    credentials: Option<Credentials>,
    deadline: Instant,
    retries_left: u32,
    /// Submission order, so re-sends after a reconnect keep request order.
    seq: u64,
}

/// What the driver should do with an inbound packet it asked us about.
pub(crate) enum PacketOutcome {
    /// Correlation not in the table; probably a subscription's, or late.
    Unknown,
    /// The operation completed (successfully or not) and was removed.
    Handled,
    /// Transient server outcome: send this packet again, same correlation.
    Resend(Packet),
    /// The node refused as non-master; reconnect (to `master` when given)
    /// and leave the operation installed for re-send.
    Reconnect { master: Option<(String, u16)> },
}

pub(crate) struct Dispatcher {
    table: HashMap<Uuid, OperationRecord>,
    limits: WireLimits,
    max_retries: u32,
    timeout: Duration,
    next_seq: u64,
}

impl Dispatcher {
    pub fn new(max_retries: u32, timeout: Duration, limits: WireLimits) -> Self {
        Self {
            table: HashMap::new(),
            limits,
            max_retries,
            timeout,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Install the call under a fresh correlation id and produce its packet.
    /// An unencodable request fails its caller directly and yields `None`.
    pub fn submit(
        &mut self,
        call: Call,
        credentials: Option<Credentials>,
        now: Instant,
    ) -> Option<Packet> {
        let payload = match call.encode_payload() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("request encode failed: {err}");
                call.fail(ClientError::BadRequest {
                    reason: err.to_string(),
                });
                return None;
            }
        };
        let correlation = Uuid::new_v4();
        let packet = Packet::new(call.kind(), correlation, payload)
            .with_credentials(credentials.clone());

        let record = OperationRecord {
            call,
            credentials,
            deadline: now + self.timeout,
            retries_left: self.max_retries,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.table.insert(correlation, record);
        Some(packet)
    }

    /// Route an inbound packet to its operation.
    pub fn on_packet(&mut self, packet: &Packet) -> PacketOutcome {
        let Some(record) = self.table.get_mut(&packet.correlation) else {
            return PacketOutcome::Unknown;
        };

        if packet.kind == MessageKind::NotAuthenticated {
            let reason = proto::decode_reason(&packet.payload);
            tracing::debug!(correlation = %packet.correlation, %reason, "not authenticated");
            return self.complete_err(packet.correlation, ClientError::AccessDenied);
        }
        if packet.kind == MessageKind::BadRequest {
            let reason = proto::decode_reason(&packet.payload);
            return self.complete_err(packet.correlation, ClientError::BadRequest { reason });
        }
        if packet.kind == MessageKind::NotHandled {
            return self.on_not_handled(packet);
        }
        if packet.kind != record.call.completion_kind() {
            tracing::warn!(
                correlation = %packet.correlation,
                got = ?packet.kind,
                expected = ?record.call.completion_kind(),
                "response type does not match the outstanding operation"
            );
            return self.complete_err(
                packet.correlation,
                ClientError::UnexpectedResponse {
                    command: packet.kind.code(),
                },
            );
        }

        match &record.call {
            Call::Write { .. } => self.on_write_completed(packet),
            Call::Delete { .. } => self.on_delete_completed(packet),
            Call::ReadEvent { .. } => self.on_read_event_completed(packet),
            Call::ReadStream { .. } => self.on_read_stream_completed(packet),
            Call::ReadAll { .. } => self.on_read_all_completed(packet),
        }
    }

    /// Fail every operation whose deadline has passed; returns the failed
    /// correlations so the driver can drop any stashed packets.
    pub fn sweep(&mut self, now: Instant) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .table
            .iter()
            .filter(|(_, record)| now >= record.deadline)
            .map(|(correlation, _)| *correlation)
            .collect();
        for correlation in &expired {
            if let Some(record) = self.table.remove(correlation) {
                tracing::warn!(correlation = %correlation, "operation timed out");
                record.call.fail(ClientError::OperationTimedOut);
            }
        }
        expired
    }

    /// Re-encode every outstanding operation, oldest submission first. The
    /// driver stashes these on disconnect so they flush after reconnect with
    /// their original correlation ids.
    pub fn pending_packets(&self) -> Vec<Packet> {
        let mut records: Vec<(&Uuid, &OperationRecord)> = self.table.iter().collect();
        records.sort_by_key(|(_, record)| record.seq);

        let mut packets = Vec::with_capacity(records.len());
        for (correlation, record) in records {
            match record.call.encode_payload() {
                Ok(payload) => packets.push(
                    Packet::new(record.call.kind(), *correlation, payload)
                        .with_credentials(record.credentials.clone()),
                ),
                Err(err) => {
                    tracing::warn!(correlation = %correlation, "re-encode failed: {err}");
                }
            }
        }
        packets
    }

    /// Fail one operation by correlation (stash eviction, unknown-type
    /// responses). Returns whether it was ours.
    pub fn fail_correlation(&mut self, correlation: Uuid, err: ClientError) -> bool {
        match self.table.remove(&correlation) {
            Some(record) => {
                record.call.fail(err);
                true
            }
            None => false,
        }
    }

    /// Terminal connection failure: everything outstanding dies.
    pub fn fail_all(&mut self) {
        for (_, record) in self.table.drain() {
            record.call.fail(ClientError::ConnectionLost);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.table.values().map(|record| record.deadline).min()
    }

    fn on_not_handled(&mut self, packet: &Packet) -> PacketOutcome {
        let correlation = packet.correlation;
        let msg = match proto::decode_not_handled(&packet.payload, &self.limits) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(correlation = %correlation, "bad not-handled payload: {err}");
                return self.complete_err(
                    correlation,
                    ClientError::UnexpectedResponse {
                        command: packet.kind.code(),
                    },
                );
            }
        };

        if self.consume_retry(correlation).is_none() {
            return PacketOutcome::Handled;
        }

        match msg.reason {
            NotHandledReason::NotMaster => PacketOutcome::Reconnect { master: msg.master },
            NotHandledReason::NotReady | NotHandledReason::TooBusy => {
                match self.reencode(correlation) {
                    Some(packet) => PacketOutcome::Resend(packet),
                    None => PacketOutcome::Handled,
                }
            }
        }
    }

    fn on_write_completed(&mut self, packet: &Packet) -> PacketOutcome {
        let correlation = packet.correlation;
        let msg = match proto::decode_write_events_completed(&packet.payload, &self.limits) {
            Ok(msg) => msg,
            Err(err) => return self.decode_failed(correlation, packet, err),
        };

        if msg.result.is_retryable() {
            return self.retry(correlation, msg.result);
        }

        let Some(record) = self.table.remove(&correlation) else {
            return PacketOutcome::Unknown;
        };
        let Call::Write { req, respond } = record.call else {
            unreachable!("completion kind checked against call");
        };

        let result = match msg.result {
            OperationOutcome::Success => {
                let first = msg.first_event_number.unwrap_or(0);
                Ok(WriteResult {
                    first_event_number: first,
                    last_event_number: msg.last_event_number.unwrap_or(first),
                    position: msg.position,
                })
            }
            OperationOutcome::WrongExpectedVersion => Err(ClientError::WrongExpectedVersion {
                expected: req.expected,
                actual: msg.current_version,
            }),
            OperationOutcome::StreamDeleted => Err(ClientError::StreamDeleted {
                stream: req.stream.clone(),
            }),
            OperationOutcome::AccessDenied => Err(ClientError::AccessDenied),
            OperationOutcome::PrepareTimeout
            | OperationOutcome::CommitTimeout
            | OperationOutcome::ForwardTimeout => unreachable!("retryable handled above"),
        };
        let _ = respond.send(result);
        PacketOutcome::Handled
    }

    fn on_delete_completed(&mut self, packet: &Packet) -> PacketOutcome {
        let correlation = packet.correlation;
        let msg = match proto::decode_delete_stream_completed(&packet.payload, &self.limits) {
            Ok(msg) => msg,
            Err(err) => return self.decode_failed(correlation, packet, err),
        };

        if msg.result.is_retryable() {
            return self.retry(correlation, msg.result);
        }

        let Some(record) = self.table.remove(&correlation) else {
            return PacketOutcome::Unknown;
        };
        let Call::Delete { req, respond } = record.call else {
            unreachable!("completion kind checked against call");
        };

        let result = match msg.result {
            OperationOutcome::Success => Ok(DeleteResult {
                position: msg.position,
            }),
            OperationOutcome::WrongExpectedVersion => Err(ClientError::WrongExpectedVersion {
                expected: req.expected,
                actual: None,
            }),
            OperationOutcome::StreamDeleted => Err(ClientError::StreamDeleted {
                stream: req.stream.clone(),
            }),
            OperationOutcome::AccessDenied => Err(ClientError::AccessDenied),
            OperationOutcome::PrepareTimeout
            | OperationOutcome::CommitTimeout
            | OperationOutcome::ForwardTimeout => unreachable!("retryable handled above"),
        };
        let _ = respond.send(result);
        PacketOutcome::Handled
    }

    fn on_read_event_completed(&mut self, packet: &Packet) -> PacketOutcome {
        let correlation = packet.correlation;
        let msg = match proto::decode_read_event_completed(&packet.payload, &self.limits) {
            Ok(msg) => msg,
            Err(err) => return self.decode_failed(correlation, packet, err),
        };

        let Some(record) = self.table.remove(&correlation) else {
            return PacketOutcome::Unknown;
        };
        let Call::ReadEvent { req, respond } = record.call else {
            unreachable!("completion kind checked against call");
        };

        let result = match msg.result {
            ReadEventOutcome::Success => match msg.event {
                Some(event) => Ok(event),
                None => Err(ClientError::UnexpectedResponse {
                    command: packet.kind.code(),
                }),
            },
            ReadEventOutcome::NotFound => Err(ClientError::EventNotFound {
                stream: req.stream.clone(),
                number: req.event_number,
            }),
            ReadEventOutcome::NoStream => Err(ClientError::StreamNotFound {
                stream: req.stream.clone(),
            }),
            ReadEventOutcome::StreamDeleted => Err(ClientError::StreamDeleted {
                stream: req.stream.clone(),
            }),
            ReadEventOutcome::AccessDenied => Err(ClientError::AccessDenied),
        };
        let _ = respond.send(result);
        PacketOutcome::Handled
    }

    fn on_read_stream_completed(&mut self, packet: &Packet) -> PacketOutcome {
        let correlation = packet.correlation;
        let msg = match proto::decode_read_stream_events_completed(&packet.payload, &self.limits) {
            Ok(msg) => msg,
            Err(err) => return self.decode_failed(correlation, packet, err),
        };

        let Some(record) = self.table.remove(&correlation) else {
            return PacketOutcome::Unknown;
        };
        let Call::ReadStream { req, respond } = record.call else {
            unreachable!("completion kind checked against call");
        };

        let result = match msg.result {
            ReadStreamOutcome::Success => Ok(StreamSlice {
                events: msg.events,
                next_event_number: msg.next_event_number,
                last_event_number: msg.last_event_number,
                end_of_stream: msg.is_end_of_stream,
            }),
            ReadStreamOutcome::NoStream => Err(ClientError::StreamNotFound {
                stream: req.stream.clone(),
            }),
            ReadStreamOutcome::StreamDeleted => Err(ClientError::StreamDeleted {
                stream: req.stream.clone(),
            }),
            ReadStreamOutcome::AccessDenied => Err(ClientError::AccessDenied),
        };
        let _ = respond.send(result);
        PacketOutcome::Handled
    }

    fn on_read_all_completed(&mut self, packet: &Packet) -> PacketOutcome {
        let correlation = packet.correlation;
        let msg = match proto::decode_read_all_events_completed(&packet.payload, &self.limits) {
            Ok(msg) => msg,
            Err(err) => return self.decode_failed(correlation, packet, err),
        };

        let Some(record) = self.table.remove(&correlation) else {
            return PacketOutcome::Unknown;
        };
        let Call::ReadAll { respond, .. } = record.call else {
            unreachable!("completion kind checked against call");
        };

        let result = match msg.result {
            ReadAllOutcome::Success => Ok(AllSlice {
                events: msg.events,
                next_position: msg.next_position,
            }),
            ReadAllOutcome::AccessDenied => Err(ClientError::AccessDenied),
        };
        let _ = respond.send(result);
        PacketOutcome::Handled
    }

    fn retry(&mut self, correlation: Uuid, outcome: OperationOutcome) -> PacketOutcome {
        tracing::debug!(correlation = %correlation, ?outcome, "transient server outcome");
        if self.consume_retry(correlation).is_none() {
            return PacketOutcome::Handled;
        }
        match self.reencode(correlation) {
            Some(packet) => PacketOutcome::Resend(packet),
            None => PacketOutcome::Handled,
        }
    }

    /// Decrement the record's retry counter; `None` means the budget is gone
    /// and the operation has been failed.
    fn consume_retry(&mut self, correlation: Uuid) -> Option<()> {
        let record = self.table.get_mut(&correlation)?;
        if record.retries_left == 0 {
            let attempts = self.max_retries;
            let record = self.table.remove(&correlation).expect("record present");
            record
                .call
                .fail(ClientError::RetriesExhausted { attempts });
            return None;
        }
        record.retries_left -= 1;
        Some(())
    }

    fn reencode(&self, correlation: Uuid) -> Option<Packet> {
        let record = self.table.get(&correlation)?;
        match record.call.encode_payload() {
            Ok(payload) => Some(
                Packet::new(record.call.kind(), correlation, payload)
                    .with_credentials(record.credentials.clone()),
            ),
            Err(err) => {
                tracing::warn!(correlation = %correlation, "re-encode failed: {err}");
                None
            }
        }
    }

    fn decode_failed(
        &mut self,
        correlation: Uuid,
        packet: &Packet,
        err: super::proto::ProtoDecodeError,
    ) -> PacketOutcome {
        tracing::warn!(correlation = %correlation, kind = ?packet.kind, "undecodable completion: {err}");
        self.complete_err(
            correlation,
            ClientError::UnexpectedResponse {
                command: packet.kind.code(),
            },
        )
    }

    fn complete_err(&mut self, correlation: Uuid, err: ClientError) -> PacketOutcome {
        if self.fail_correlation(correlation, err) {
            PacketOutcome::Handled
        } else {
            PacketOutcome::Unknown
        }
    }
}
