//! The on-wire envelope: flags, message type, correlation id, optional
//! credentials, opaque payload.

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::core::Credentials;

use super::command::MessageKind;

/// Minimum envelope: flags(1) + message-type(1) + correlation-id(16).
pub const PACKET_MIN_LEN: usize = 18;

const FLAG_AUTH: u8 = 0x01;
const RESERVED_FLAGS: u8 = !FLAG_AUTH;

/// One framed protocol message, minus the length prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub kind: MessageKind,
    pub correlation: Uuid,
    pub credentials: Option<Credentials>,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(kind: MessageKind, correlation: Uuid, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            correlation,
            credentials: None,
            payload: payload.into(),
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn heartbeat_request(correlation: Uuid) -> Self {
        Self::new(MessageKind::HeartbeatRequest, correlation, Bytes::new())
    }

    pub fn heartbeat_response(correlation: Uuid) -> Self {
        Self::new(MessageKind::HeartbeatResponse, correlation, Bytes::new())
    }

    pub fn pong(correlation: Uuid) -> Self {
        Self::new(MessageKind::Pong, correlation, Bytes::new())
    }
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet too short: {got_bytes} bytes")]
    TooShort { got_bytes: usize },
    #[error("reserved flag bits set: {flags:#04x}")]
    ReservedFlags { flags: u8 },
    /// The correlation id still decodes for unknown types, so the caller can
    /// fail the matching operation rather than drop the bytes on the floor.
    #[error("unknown message type {code:#04x} for correlation {correlation}")]
    UnknownMessageType { code: u8, correlation: Uuid },
    #[error("auth field truncated")]
    AuthTruncated,
    #[error("auth field not valid utf-8")]
    AuthInvalidUtf8,
    #[error("invalid credentials in auth field: {0}")]
    AuthInvalid(#[from] crate::core::CredentialsError),
}

pub fn encode_packet(packet: &Packet) -> Vec<u8> {
    let auth_len = packet
        .credentials
        .as_ref()
        .map(|c| 2 + c.login().len() + c.password().len())
        .unwrap_or(0);
    let mut buf = Vec::with_capacity(PACKET_MIN_LEN + auth_len + packet.payload.len());

    let flags = if packet.credentials.is_some() {
        FLAG_AUTH
    } else {
        0
    };
    buf.push(flags);
    buf.push(packet.kind.code());
    buf.extend_from_slice(packet.correlation.as_bytes());

    if let Some(creds) = &packet.credentials {
        // Credentials::new enforces the u8 length bound.
        buf.push(creds.login().len() as u8);
        buf.extend_from_slice(creds.login().as_bytes());
        buf.push(creds.password().len() as u8);
        buf.extend_from_slice(creds.password().as_bytes());
    }

    buf.extend_from_slice(&packet.payload);
    buf
}

pub fn decode_packet(bytes: &[u8]) -> Result<Packet, PacketError> {
    if bytes.len() < PACKET_MIN_LEN {
        return Err(PacketError::TooShort {
            got_bytes: bytes.len(),
        });
    }

    let flags = bytes[0];
    if flags & RESERVED_FLAGS != 0 {
        return Err(PacketError::ReservedFlags { flags });
    }

    let mut correlation_bytes = [0u8; 16];
    correlation_bytes.copy_from_slice(&bytes[2..18]);
    let correlation = Uuid::from_bytes(correlation_bytes);

    let kind = MessageKind::parse(bytes[1]).ok_or(PacketError::UnknownMessageType {
        code: bytes[1],
        correlation,
    })?;

    let mut at = PACKET_MIN_LEN;
    let credentials = if flags & FLAG_AUTH != 0 {
        let (creds, next) = decode_auth(bytes, at)?;
        at = next;
        Some(creds)
    } else {
        None
    };

    Ok(Packet {
        kind,
        correlation,
        credentials,
        payload: Bytes::copy_from_slice(&bytes[at..]),
    })
}

fn decode_auth(bytes: &[u8], at: usize) -> Result<(Credentials, usize), PacketError> {
    let (login, at) = take_auth_field(bytes, at)?;
    let (password, at) = take_auth_field(bytes, at)?;
    Ok((Credentials::new(login, password)?, at))
}

fn take_auth_field(bytes: &[u8], at: usize) -> Result<(&str, usize), PacketError> {
    let len = *bytes.get(at).ok_or(PacketError::AuthTruncated)? as usize;
    let end = at + 1 + len;
    let raw = bytes.get(at + 1..end).ok_or(PacketError::AuthTruncated)?;
    let text = std::str::from_utf8(raw).map_err(|_| PacketError::AuthInvalidUtf8)?;
    Ok((text, end))
}
