//! Operation round-trips through a scripted server: writes, reads, deletes,
//! credentials, and the transient-outcome retry path.

mod fixtures;

use std::time::Duration;

use crossbeam::channel::unbounded;
use uuid::Uuid;

use fixtures::server::{self, Control};
use fixtures::{resolved, stream_id, test_settings};
use tailstore::client::command::MessageKind;
use tailstore::client::proto::{
    DeleteStreamCompleted, OperationOutcome, ReadEventCompleted, ReadEventOutcome,
    WriteEventsCompleted, decode_write_events, encode_delete_stream_completed,
    encode_read_event_completed, encode_write_events_completed,
};
use tailstore::core::WireLimits;
use tailstore::{
    Client, ClientError, Credentials, EventData, EventNumber, ExpectedVersion, Position,
};

fn write_completed(result: OperationOutcome) -> WriteEventsCompleted {
    WriteEventsCompleted {
        result,
        message: None,
        first_event_number: Some(0),
        last_event_number: Some(0),
        position: Some(Position::new(100, 100)),
        current_version: None,
    }
}

#[test]
fn append_round_trips_and_carries_credentials() {
    let (seen_tx, seen_rx) = unbounded();
    let server = server::spawn(move |_, packet, conn| {
        match packet.kind {
            MessageKind::WriteEvents => {
                let req = decode_write_events(&packet.payload, &WireLimits::default())
                    .expect("decode write");
                let login = packet.credentials.as_ref().map(|c| c.login().to_string());
                let _ = seen_tx.send((req, login));
                let body = encode_write_events_completed(&write_completed(
                    OperationOutcome::Success,
                ))
                .expect("encode completion");
                conn.send_msg(MessageKind::WriteEventsCompleted, packet.correlation, body);
            }
            _ => conn.ack_heartbeat(&packet),
        }
        Control::Continue
    });

    let mut settings = test_settings(&server.addr);
    settings.default_credentials = Some(Credentials::new("admin", "changeit").unwrap());
    let client = Client::connect(settings).unwrap();

    let event = EventData::json(Uuid::new_v4(), "order-placed", "{}".as_bytes());
    let result = client
        .append_to_stream(
            stream_id("orders-1"),
            ExpectedVersion::NoStream,
            vec![event.clone()],
            None,
        )
        .unwrap();
    assert_eq!(result.first_event_number, 0);
    assert_eq!(result.position, Some(Position::new(100, 100)));

    let (req, login) = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(req.stream, stream_id("orders-1"));
    assert_eq!(req.expected, ExpectedVersion::NoStream);
    assert_eq!(req.events, vec![event]);
    assert!(req.require_master);
    // The configured default credentials rode the envelope.
    assert_eq!(login.as_deref(), Some("admin"));

    client.close();
}

#[test]
fn wrong_expected_version_reports_given_and_actual() {
    let server = server::spawn(|_, packet, conn| {
        match packet.kind {
            MessageKind::WriteEvents => {
                let body = encode_write_events_completed(&WriteEventsCompleted {
                    result: OperationOutcome::WrongExpectedVersion,
                    message: Some("version check failed".into()),
                    first_event_number: None,
                    last_event_number: None,
                    position: None,
                    current_version: Some(3),
                })
                .expect("encode completion");
                conn.send_msg(MessageKind::WriteEventsCompleted, packet.correlation, body);
            }
            _ => conn.ack_heartbeat(&packet),
        }
        Control::Continue
    });

    let client = Client::connect(test_settings(&server.addr)).unwrap();
    let err = client
        .append_to_stream(
            stream_id("s"),
            ExpectedVersion::Exact(2),
            vec![EventData::json(Uuid::new_v4(), "e", "{}".as_bytes())],
            None,
        )
        .unwrap_err();

    match err {
        ClientError::WrongExpectedVersion { expected, actual } => {
            assert_eq!(expected, ExpectedVersion::Exact(2));
            assert_eq!(actual, Some(3));
        }
        other => panic!("expected wrong-expected-version, got {other:?}"),
    }
    client.close();
}

#[test]
fn prepare_timeout_retries_with_the_same_correlation() {
    let (corr_tx, corr_rx) = unbounded();
    let mut attempts = 0u32;
    let server = server::spawn(move |_, packet, conn| {
        match packet.kind {
            MessageKind::WriteEvents => {
                attempts += 1;
                let req = decode_write_events(&packet.payload, &WireLimits::default())
                    .expect("decode write");
                let _ = corr_tx.send((packet.correlation, req.events[0].id));
                let outcome = if attempts == 1 {
                    OperationOutcome::PrepareTimeout
                } else {
                    OperationOutcome::Success
                };
                let body = encode_write_events_completed(&write_completed(outcome))
                    .expect("encode completion");
                conn.send_msg(MessageKind::WriteEventsCompleted, packet.correlation, body);
            }
            _ => conn.ack_heartbeat(&packet),
        }
        Control::Continue
    });

    let client = Client::connect(test_settings(&server.addr)).unwrap();
    let event_id = Uuid::new_v4();
    let result = client
        .append_to_stream(
            stream_id("s"),
            ExpectedVersion::Any,
            vec![EventData::json(event_id, "e", "{}".as_bytes())],
            None,
        )
        .unwrap();
    assert_eq!(result.first_event_number, 0);

    let (first_corr, first_id) = corr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let (second_corr, second_id) = corr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first_corr, second_corr, "retry must reuse the correlation id");
    // Both attempts carry the same event id, so the server deduplicates.
    assert_eq!(first_id, event_id);
    assert_eq!(second_id, event_id);
    client.close();
}

#[test]
fn read_event_not_found_maps_to_event_not_found() {
    let server = server::spawn(|_, packet, conn| {
        match packet.kind {
            MessageKind::ReadEvent => {
                let body = encode_read_event_completed(&ReadEventCompleted {
                    result: ReadEventOutcome::NotFound,
                    event: None,
                })
                .expect("encode completion");
                conn.send_msg(MessageKind::ReadEventCompleted, packet.correlation, body);
            }
            _ => conn.ack_heartbeat(&packet),
        }
        Control::Continue
    });

    let client = Client::connect(test_settings(&server.addr)).unwrap();
    let err = client
        .read_event(stream_id("s"), EventNumber::Exact(7), None)
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::EventNotFound { stream, number }
            if stream == stream_id("s") && number == EventNumber::Exact(7)
    ));
    client.close();
}

#[test]
fn read_event_returns_the_resolved_event() {
    let server = server::spawn(|_, packet, conn| {
        match packet.kind {
            MessageKind::ReadEvent => {
                let body = encode_read_event_completed(&ReadEventCompleted {
                    result: ReadEventOutcome::Success,
                    event: Some(resolved("s", 4)),
                })
                .expect("encode completion");
                conn.send_msg(MessageKind::ReadEventCompleted, packet.correlation, body);
            }
            _ => conn.ack_heartbeat(&packet),
        }
        Control::Continue
    });

    let client = Client::connect(test_settings(&server.addr)).unwrap();
    let event = client
        .read_event(stream_id("s"), EventNumber::Last, None)
        .unwrap();
    assert_eq!(event, resolved("s", 4));
    client.close();
}

#[test]
fn delete_stream_round_trips() {
    let server = server::spawn(|_, packet, conn| {
        match packet.kind {
            MessageKind::DeleteStream => {
                let body = encode_delete_stream_completed(&DeleteStreamCompleted {
                    result: OperationOutcome::Success,
                    message: None,
                    position: Some(Position::new(7, 7)),
                })
                .expect("encode completion");
                conn.send_msg(MessageKind::DeleteStreamCompleted, packet.correlation, body);
            }
            _ => conn.ack_heartbeat(&packet),
        }
        Control::Continue
    });

    let client = Client::connect(test_settings(&server.addr)).unwrap();
    let result = client
        .delete_stream(stream_id("s"), ExpectedVersion::Exact(3), true, None)
        .unwrap();
    assert_eq!(result.position, Some(Position::new(7, 7)));
    client.close();
}
