//! Subscription flows end to end: volatile live delivery, catch-up over
//! preloaded history, and close semantics.

mod fixtures;

use std::time::Duration;

use crossbeam::channel::unbounded;

use fixtures::server::{self, Control};
use fixtures::{resolved, stream_id, test_settings};
use tailstore::client::command::MessageKind;
use tailstore::client::proto::{
    ReadStreamEventsCompleted, ReadStreamOutcome, StreamEventAppeared, SubscriptionConfirmation,
    decode_read_stream_events, decode_subscribe_to_stream, encode_read_stream_events_completed,
    encode_stream_event_appeared, encode_subscription_confirmation,
};
use tailstore::core::WireLimits;
use tailstore::{Client, DropReason, SubscriptionEvent};

const RECV: Duration = Duration::from_secs(5);

#[test]
fn volatile_subscribe_delivers_live_events_until_closed() {
    let (unsub_tx, unsub_rx) = unbounded();
    let server = server::spawn(move |_, packet, conn| {
        match packet.kind {
            MessageKind::SubscribeToStream => {
                let req = decode_subscribe_to_stream(&packet.payload, &WireLimits::default())
                    .expect("decode subscribe");
                assert_eq!(req.stream, Some(stream_id("s")));

                let conf = encode_subscription_confirmation(&SubscriptionConfirmation {
                    last_commit_position: 0,
                    last_event_number: None,
                })
                .expect("encode confirmation");
                conn.send_msg(MessageKind::SubscriptionConfirmation, packet.correlation, conf);

                let push = encode_stream_event_appeared(&StreamEventAppeared {
                    event: resolved("s", 0),
                })
                .expect("encode push");
                conn.send_msg(MessageKind::StreamEventAppeared, packet.correlation, push);
            }
            MessageKind::UnsubscribeFromStream => {
                let _ = unsub_tx.send(packet.correlation);
            }
            _ => conn.ack_heartbeat(&packet),
        }
        Control::Continue
    });

    let client = Client::connect(test_settings(&server.addr)).unwrap();
    let (events_tx, events_rx) = unbounded::<SubscriptionEvent>();
    let handle = client
        .subscribe_to_stream(stream_id("s"), events_tx, None)
        .unwrap();

    assert_eq!(
        events_rx.recv_timeout(RECV).unwrap(),
        SubscriptionEvent::LiveProcessingStart
    );
    assert_eq!(
        events_rx.recv_timeout(RECV).unwrap(),
        SubscriptionEvent::Event(resolved("s", 0))
    );

    handle.close();
    // The terminal callback lands before close() returns.
    assert_eq!(
        events_rx.try_recv().unwrap(),
        SubscriptionEvent::Dropped(DropReason::Unsubscribed)
    );
    // And the server saw the unsubscribe.
    unsub_rx.recv_timeout(RECV).unwrap();

    // Silence afterwards.
    assert!(events_rx.recv_timeout(Duration::from_millis(200)).is_err());
    client.close();
}

#[test]
fn catch_up_replays_history_then_goes_live() {
    // Stream s holds e0, e1; e2 appears once the subscription is live.
    let mut sub_correlation = None;
    let server = server::spawn(move |_, packet, conn| {
        match packet.kind {
            MessageKind::ReadStreamEventsForward => {
                let req = decode_read_stream_events(&packet.payload, &WireLimits::default())
                    .expect("decode read");
                assert_eq!(req.stream, stream_id("s"));

                let (events, end) = if req.from_event_number == 0 {
                    (vec![resolved("s", 0), resolved("s", 1)], true)
                } else {
                    (Vec::new(), true)
                };
                let next = req.from_event_number.max(2);
                let body = encode_read_stream_events_completed(&ReadStreamEventsCompleted {
                    result: ReadStreamOutcome::Success,
                    events,
                    next_event_number: next,
                    last_event_number: 1,
                    is_end_of_stream: end,
                })
                .expect("encode read page");
                conn.send_msg(
                    MessageKind::ReadStreamEventsForwardCompleted,
                    packet.correlation,
                    body,
                );

                // The final read (from 2) closes the gap; push a fresh event
                // right behind it, as the live feed would.
                if req.from_event_number >= 2
                    && let Some(correlation) = sub_correlation
                {
                    let push = encode_stream_event_appeared(&StreamEventAppeared {
                        event: resolved("s", 2),
                    })
                    .expect("encode push");
                    conn.send_msg(MessageKind::StreamEventAppeared, correlation, push);
                }
            }
            MessageKind::SubscribeToStream => {
                sub_correlation = Some(packet.correlation);
                let conf = encode_subscription_confirmation(&SubscriptionConfirmation {
                    last_commit_position: 20,
                    last_event_number: Some(1),
                })
                .expect("encode confirmation");
                conn.send_msg(MessageKind::SubscriptionConfirmation, packet.correlation, conf);
            }
            _ => conn.ack_heartbeat(&packet),
        }
        Control::Continue
    });

    let client = Client::connect(test_settings(&server.addr)).unwrap();
    let (events_tx, events_rx) = unbounded::<SubscriptionEvent>();
    let handle = client
        .subscribe_to_stream_from(stream_id("s"), None, events_tx, None)
        .unwrap();

    assert_eq!(
        events_rx.recv_timeout(RECV).unwrap(),
        SubscriptionEvent::Event(resolved("s", 0))
    );
    assert_eq!(
        events_rx.recv_timeout(RECV).unwrap(),
        SubscriptionEvent::Event(resolved("s", 1))
    );
    assert_eq!(
        events_rx.recv_timeout(RECV).unwrap(),
        SubscriptionEvent::LiveProcessingStart
    );
    assert_eq!(
        events_rx.recv_timeout(RECV).unwrap(),
        SubscriptionEvent::Event(resolved("s", 2))
    );

    handle.close();
    assert_eq!(
        events_rx.try_recv().unwrap(),
        SubscriptionEvent::Dropped(DropReason::Unsubscribed)
    );
    client.close();
}

#[test]
fn catch_up_on_missing_stream_goes_live_and_sees_first_event() {
    let mut sub_correlation = None;
    let server = server::spawn(move |_, packet, conn| {
        match packet.kind {
            MessageKind::ReadStreamEventsForward => {
                let body = encode_read_stream_events_completed(&ReadStreamEventsCompleted {
                    result: ReadStreamOutcome::NoStream,
                    events: Vec::new(),
                    next_event_number: 0,
                    last_event_number: 0,
                    is_end_of_stream: true,
                })
                .expect("encode read page");
                conn.send_msg(
                    MessageKind::ReadStreamEventsForwardCompleted,
                    packet.correlation,
                    body,
                );

                if let Some(correlation) = sub_correlation {
                    let push = encode_stream_event_appeared(&StreamEventAppeared {
                        event: resolved("s", 0),
                    })
                    .expect("encode push");
                    conn.send_msg(MessageKind::StreamEventAppeared, correlation, push);
                }
            }
            MessageKind::SubscribeToStream => {
                sub_correlation = Some(packet.correlation);
                let conf = encode_subscription_confirmation(&SubscriptionConfirmation {
                    last_commit_position: 0,
                    last_event_number: None,
                })
                .expect("encode confirmation");
                conn.send_msg(MessageKind::SubscriptionConfirmation, packet.correlation, conf);
            }
            _ => conn.ack_heartbeat(&packet),
        }
        Control::Continue
    });

    let client = Client::connect(test_settings(&server.addr)).unwrap();
    let (events_tx, events_rx) = unbounded::<SubscriptionEvent>();
    let handle = client
        .subscribe_to_stream_from(stream_id("s"), None, events_tx, None)
        .unwrap();

    assert_eq!(
        events_rx.recv_timeout(RECV).unwrap(),
        SubscriptionEvent::LiveProcessingStart
    );
    assert_eq!(
        events_rx.recv_timeout(RECV).unwrap(),
        SubscriptionEvent::Event(resolved("s", 0))
    );

    handle.close();
    client.close();
}
