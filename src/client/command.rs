//! Message-type byte table for the TCP protocol.

/// Every logical operation the protocol knows, keyed by its one-byte code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    HeartbeatRequest,
    HeartbeatResponse,
    Ping,
    Pong,
    WriteEvents,
    WriteEventsCompleted,
    DeleteStream,
    DeleteStreamCompleted,
    ReadEvent,
    ReadEventCompleted,
    ReadStreamEventsForward,
    ReadStreamEventsForwardCompleted,
    ReadAllEventsForward,
    ReadAllEventsForwardCompleted,
    SubscribeToStream,
    SubscriptionConfirmation,
    StreamEventAppeared,
    UnsubscribeFromStream,
    SubscriptionDropped,
    NotHandled,
    BadRequest,
    NotAuthenticated,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        match self {
            MessageKind::HeartbeatRequest => 0x01,
            MessageKind::HeartbeatResponse => 0x02,
            MessageKind::Ping => 0x03,
            MessageKind::Pong => 0x04,
            MessageKind::WriteEvents => 0x82,
            MessageKind::WriteEventsCompleted => 0x83,
            MessageKind::DeleteStream => 0x8A,
            MessageKind::DeleteStreamCompleted => 0x8B,
            MessageKind::ReadEvent => 0xB0,
            MessageKind::ReadEventCompleted => 0xB1,
            MessageKind::ReadStreamEventsForward => 0xB2,
            MessageKind::ReadStreamEventsForwardCompleted => 0xB3,
            MessageKind::ReadAllEventsForward => 0xB6,
            MessageKind::ReadAllEventsForwardCompleted => 0xB7,
            MessageKind::SubscribeToStream => 0xC0,
            MessageKind::SubscriptionConfirmation => 0xC1,
            MessageKind::StreamEventAppeared => 0xC2,
            MessageKind::UnsubscribeFromStream => 0xC3,
            MessageKind::SubscriptionDropped => 0xC4,
            MessageKind::NotHandled => 0xF1,
            MessageKind::BadRequest => 0xF0,
            MessageKind::NotAuthenticated => 0xF4,
        }
    }

    pub fn parse(code: u8) -> Option<Self> {
        let kind = match code {
            0x01 => MessageKind::HeartbeatRequest,
            0x02 => MessageKind::HeartbeatResponse,
            0x03 => MessageKind::Ping,
            0x04 => MessageKind::Pong,
            0x82 => MessageKind::WriteEvents,
            0x83 => MessageKind::WriteEventsCompleted,
            0x8A => MessageKind::DeleteStream,
            0x8B => MessageKind::DeleteStreamCompleted,
            0xB0 => MessageKind::ReadEvent,
            0xB1 => MessageKind::ReadEventCompleted,
            0xB2 => MessageKind::ReadStreamEventsForward,
            0xB3 => MessageKind::ReadStreamEventsForwardCompleted,
            0xB6 => MessageKind::ReadAllEventsForward,
            0xB7 => MessageKind::ReadAllEventsForwardCompleted,
            0xC0 => MessageKind::SubscribeToStream,
            0xC1 => MessageKind::SubscriptionConfirmation,
            0xC2 => MessageKind::StreamEventAppeared,
            0xC3 => MessageKind::UnsubscribeFromStream,
            0xC4 => MessageKind::SubscriptionDropped,
            0xF1 => MessageKind::NotHandled,
            0xF0 => MessageKind::BadRequest,
            0xF4 => MessageKind::NotAuthenticated,
            _ => return None,
        };
        Some(kind)
    }

    /// Liveness traffic the connection manager answers or absorbs itself;
    /// never routed to the dispatcher.
    pub fn is_liveness(self) -> bool {
        matches!(
            self,
            MessageKind::HeartbeatRequest
                | MessageKind::HeartbeatResponse
                | MessageKind::Ping
                | MessageKind::Pong
        )
    }
}
