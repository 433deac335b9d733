//! Connection-level behavior: heartbeat starvation, oversized frames, and
//! reconnect-budget exhaustion, observed through in-flight operations.

mod fixtures;

use std::time::Duration;

use crossbeam::channel::unbounded;

use fixtures::server::{self, Control};
use fixtures::{resolved, stream_id, test_settings};
use tailstore::client::command::MessageKind;
use tailstore::client::frame::MAX_FRAME_BYTES;
use tailstore::client::proto::{
    ReadEventCompleted, ReadEventOutcome, encode_read_event_completed,
};
use tailstore::config::{DelaySettings, HeartbeatSettings};
use tailstore::{Client, ClientError, EventNumber};

#[test]
fn heartbeat_starvation_recycles_the_connection_and_retries_in_flight_reads() {
    let (corr_tx, corr_rx) = unbounded();
    let server = server::spawn(move |conn_index, packet, conn| {
        if packet.kind == MessageKind::ReadEvent {
            let _ = corr_tx.send((conn_index, packet.correlation));
        }
        match conn_index {
            // First connection: swallow everything, including heartbeats.
            0 => Control::Continue,
            // After the reconnect: behave.
            _ => {
                match packet.kind {
                    MessageKind::ReadEvent => {
                        let body = encode_read_event_completed(&ReadEventCompleted {
                            result: ReadEventOutcome::Success,
                            event: Some(resolved("s", 1)),
                        })
                        .expect("encode completion");
                        conn.send_msg(MessageKind::ReadEventCompleted, packet.correlation, body);
                    }
                    _ => conn.ack_heartbeat(&packet),
                }
                Control::Continue
            }
        }
    });

    let mut settings = test_settings(&server.addr);
    settings.heartbeat = HeartbeatSettings {
        interval_ms: 50,
        timeout_ms: 150,
    };
    let client = Client::connect(settings).unwrap();

    // Submitted against the silent connection; completes after the recycle.
    let event = client
        .read_event(stream_id("s"), EventNumber::Exact(1), None)
        .unwrap();
    assert_eq!(event, resolved("s", 1));

    let (first_conn, first_corr) = corr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let (second_conn, second_corr) = corr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first_conn, 0);
    assert!(second_conn >= 1);
    assert_eq!(
        first_corr, second_corr,
        "the retried read keeps its original correlation id"
    );
    client.close();
}

#[test]
fn oversized_frame_recycles_the_connection() {
    let server = server::spawn(move |conn_index, packet, conn| {
        match (conn_index, packet.kind) {
            (0, MessageKind::ReadEvent) => {
                // Declare a frame just past the cap; the client must treat
                // this as a protocol error and recycle the connection.
                let bogus = (MAX_FRAME_BYTES as u32 + 1).to_le_bytes();
                conn.send_raw(&bogus);
            }
            (_, MessageKind::ReadEvent) => {
                let body = encode_read_event_completed(&ReadEventCompleted {
                    result: ReadEventOutcome::Success,
                    event: Some(resolved("s", 0)),
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
        .read_event(stream_id("s"), EventNumber::Exact(0), None)
        .unwrap();
    assert_eq!(event, resolved("s", 0));
    client.close();
}

#[test]
fn exhausted_reconnect_budget_fails_operations_with_connection_lost() {
    // Nobody listens on a raw port 1; connects fail fast.
    let mut settings = test_settings("127.0.0.1:1");
    settings.max_reconnections = 1;
    settings.reconnection_delay = DelaySettings {
        min_ms: 10,
        max_ms: 20,
    };
    let client = Client::connect(settings).unwrap();

    let err = client
        .read_event(stream_id("s"), EventNumber::Exact(0), None)
        .unwrap_err();
    assert!(matches!(err, ClientError::ConnectionLost));

    // Terminated is permanent: later submissions fail the same way.
    let err = client
        .read_event(stream_id("s"), EventNumber::Exact(1), None)
        .unwrap_err();
    assert!(matches!(err, ClientError::ConnectionLost));
    client.close();
}
