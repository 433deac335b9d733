#![forbid(unsafe_code)]

//! Client for the Tailstore append-only event-log database.
//!
//! One long-lived TCP session multiplexes concurrent operations by
//! correlation id, with heartbeat liveness probes and automatic
//! reconnection. Catch-up subscriptions replay history and switch to live
//! delivery without losing or duplicating events.

pub mod client;
pub mod config;
pub mod core;
pub mod error;

pub use client::{Client, SubscriptionEvent, SubscriptionHandle, SubscriptionObserver};
pub use client::discovery::{DiscoveryError, Endpoint, EndpointResolver, StaticEndpoint};
pub use config::{Settings, SettingsOverride};
pub use error::{ClientError, DropReason, Transience};

pub use crate::core::{
    AllSlice, ContentType, Credentials, CredentialsError, DeleteResult, EventData, EventNumber,
    ExpectedVersion, Position, RecordedEvent, ResolvedEvent, StreamId, StreamIdError, StreamSlice,
    WriteResult,
};

pub type Result<T> = std::result::Result<T, ClientError>;
