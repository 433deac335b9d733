//! The TCP client: facade, connection runtime, and protocol layers.

pub mod command;
pub mod discovery;
mod driver;
pub mod frame;
pub mod packet;
pub mod proto;
pub mod subscription;

mod machine;
mod operations;

use std::thread::JoinHandle;

use crossbeam::channel::{Sender, bounded};

use crate::config::Settings;
use crate::core::{
    AllSlice, Credentials, DeleteResult, EventData, EventNumber, ExpectedVersion, Position,
    ResolvedEvent, StreamId, StreamSlice, WriteResult,
};
use crate::error::ClientError;

use discovery::{Endpoint, EndpointResolver, StaticEndpoint};
use driver::{Command, Driver};
use operations::Call;
use subscription::{CatchUpSub, SubId};

pub use subscription::{SubscriptionEvent, SubscriptionObserver};

/// Handle to the single long-lived connection.
///
/// Every request method blocks the calling thread until the operation
/// terminates (success, definitive failure, retry exhaustion, or the
/// per-operation timeout). Defaults from [`Settings`] for the operation
/// timeout, credentials, `resolve_link_tos` and `require_master` are
/// applied here and nowhere else.
pub struct Client {
    cmd_tx: Sender<Command>,
    settings: Settings,
    driver: Option<JoinHandle<()>>,
}

impl Client {
    /// Connect to the configured address with the default static resolver.
    pub fn connect(settings: Settings) -> Result<Client, ClientError> {
        let endpoint = Endpoint::parse(&settings.address).map_err(|err| {
            ClientError::BadRequest {
                reason: err.to_string(),
            }
        })?;
        Self::connect_with_resolver(settings, Box::new(StaticEndpoint::new(endpoint)))
    }

    /// Connect using a caller-provided endpoint resolver (e.g. a
    /// cluster-aware one).
    pub fn connect_with_resolver(
        settings: Settings,
        resolver: Box<dyn EndpointResolver>,
    ) -> Result<Client, ClientError> {
        settings.validate().map_err(|err| ClientError::BadRequest {
            reason: err.to_string(),
        })?;
        let (cmd_tx, driver) = Driver::spawn(settings.clone(), resolver);
        Ok(Client {
            cmd_tx,
            settings,
            driver: Some(driver),
        })
    }

    /// Append events to a stream, subject to the expected-version check.
    pub fn append_to_stream(
        &self,
        stream: StreamId,
        expected: ExpectedVersion,
        events: Vec<EventData>,
        credentials: Option<Credentials>,
    ) -> Result<WriteResult, ClientError> {
        let (tx, rx) = bounded(1);
        self.submit(
            Call::Write {
                req: proto::WriteEvents {
                    stream,
                    expected,
                    events,
                    require_master: self.settings.require_master,
                },
                respond: tx,
            },
            credentials,
        );
        rx.recv().map_err(|_| ClientError::ConnectionLost)?
    }

    /// Delete a stream. A hard delete tombstones it permanently.
    pub fn delete_stream(
        &self,
        stream: StreamId,
        expected: ExpectedVersion,
        hard_delete: bool,
        credentials: Option<Credentials>,
    ) -> Result<DeleteResult, ClientError> {
        let (tx, rx) = bounded(1);
        self.submit(
            Call::Delete {
                req: proto::DeleteStream {
                    stream,
                    expected,
                    require_master: self.settings.require_master,
                    hard_delete,
                },
                respond: tx,
            },
            credentials,
        );
        rx.recv().map_err(|_| ClientError::ConnectionLost)?
    }

    /// Read one event by position; [`EventNumber::Last`] reads the newest.
    pub fn read_event(
        &self,
        stream: StreamId,
        event_number: EventNumber,
        credentials: Option<Credentials>,
    ) -> Result<ResolvedEvent, ClientError> {
        let (tx, rx) = bounded(1);
        self.submit(
            Call::ReadEvent {
                req: proto::ReadEvent {
                    stream,
                    event_number,
                    resolve_link_tos: self.settings.resolve_link_tos,
                    require_master: self.settings.require_master,
                },
                respond: tx,
            },
            credentials,
        );
        rx.recv().map_err(|_| ClientError::ConnectionLost)?
    }

    /// Read a forward page of a stream.
    pub fn read_stream_forward(
        &self,
        stream: StreamId,
        from_event_number: u64,
        max_count: usize,
        credentials: Option<Credentials>,
    ) -> Result<StreamSlice, ClientError> {
        let (tx, rx) = bounded(1);
        self.submit(
            Call::ReadStream {
                req: proto::ReadStreamEvents {
                    stream,
                    from_event_number,
                    max_count: max_count as u64,
                    resolve_link_tos: self.settings.resolve_link_tos,
                    require_master: self.settings.require_master,
                },
                respond: tx,
            },
            credentials,
        );
        rx.recv().map_err(|_| ClientError::ConnectionLost)?
    }

    /// Read a forward page of the global log.
    pub fn read_all_forward(
        &self,
        from: Position,
        max_count: usize,
        credentials: Option<Credentials>,
    ) -> Result<AllSlice, ClientError> {
        let (tx, rx) = bounded(1);
        self.submit(
            Call::ReadAll {
                req: proto::ReadAllEvents {
                    position: from,
                    max_count: max_count as u64,
                    resolve_link_tos: self.settings.resolve_link_tos,
                    require_master: self.settings.require_master,
                },
                respond: tx,
            },
            credentials,
        );
        rx.recv().map_err(|_| ClientError::ConnectionLost)?
    }

    /// Live-only subscription to a stream.
    pub fn subscribe_to_stream(
        &self,
        stream: StreamId,
        observer: impl SubscriptionObserver + 'static,
        credentials: Option<Credentials>,
    ) -> Result<SubscriptionHandle, ClientError> {
        self.subscribe_volatile(Some(stream), observer, credentials)
    }

    /// Live-only subscription to the global log.
    pub fn subscribe_to_all(
        &self,
        observer: impl SubscriptionObserver + 'static,
        credentials: Option<Credentials>,
    ) -> Result<SubscriptionHandle, ClientError> {
        self.subscribe_volatile(None, observer, credentials)
    }

    /// Catch-up subscription to a stream: replay history after
    /// `from_exclusive` (`None` replays everything), then go live with no
    /// gaps or duplicates.
    pub fn subscribe_to_stream_from(
        &self,
        stream: StreamId,
        from_exclusive: Option<u64>,
        observer: impl SubscriptionObserver + 'static,
        credentials: Option<Credentials>,
    ) -> Result<SubscriptionHandle, ClientError> {
        let sub = CatchUpSub::stream(
            stream,
            from_exclusive,
            self.settings.resolve_link_tos,
            self.settings.read_batch_size as u64,
            self.settings.live_buffer_limit,
        );
        self.subscribe_catch_up(sub, observer, credentials)
    }

    /// Catch-up subscription to the global log from an exclusive position.
    pub fn subscribe_to_all_from(
        &self,
        from_exclusive: Option<Position>,
        observer: impl SubscriptionObserver + 'static,
        credentials: Option<Credentials>,
    ) -> Result<SubscriptionHandle, ClientError> {
        let sub = CatchUpSub::all(
            from_exclusive,
            self.settings.resolve_link_tos,
            self.settings.read_batch_size as u64,
            self.settings.live_buffer_limit,
        );
        self.subscribe_catch_up(sub, observer, credentials)
    }

    /// Shut the connection down, failing anything outstanding.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn submit(&self, call: Call, credentials: Option<Credentials>) {
        let credentials = credentials.or_else(|| self.settings.default_credentials.clone());
        // A dead driver drops the call's responder and the caller's recv
        // surfaces ConnectionLost.
        let _ = self.cmd_tx.send(Command::Submit { call, credentials });
    }

    fn subscribe_volatile(
        &self,
        stream: Option<StreamId>,
        observer: impl SubscriptionObserver + 'static,
        credentials: Option<Credentials>,
    ) -> Result<SubscriptionHandle, ClientError> {
        let credentials = credentials.or_else(|| self.settings.default_credentials.clone());
        let (tx, rx) = bounded(1);
        self.cmd_tx
            .send(Command::SubscribeVolatile {
                stream,
                resolve_link_tos: self.settings.resolve_link_tos,
                credentials,
                observer: Box::new(observer),
                respond: tx,
            })
            .map_err(|_| ClientError::ConnectionLost)?;
        let id = rx.recv().map_err(|_| ClientError::ConnectionLost)?;
        Ok(SubscriptionHandle {
            id,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    fn subscribe_catch_up(
        &self,
        sub: CatchUpSub,
        observer: impl SubscriptionObserver + 'static,
        credentials: Option<Credentials>,
    ) -> Result<SubscriptionHandle, ClientError> {
        let credentials = credentials.or_else(|| self.settings.default_credentials.clone());
        let (tx, rx) = bounded(1);
        self.cmd_tx
            .send(Command::SubscribeCatchUp {
                sub,
                credentials,
                observer: Box::new(observer),
                respond: tx,
            })
            .map_err(|_| ClientError::ConnectionLost)?;
        let id = rx.recv().map_err(|_| ClientError::ConnectionLost)?;
        Ok(SubscriptionHandle {
            id,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    fn shutdown(&mut self) {
        if let Some(driver) = self.driver.take() {
            let (tx, rx) = bounded(1);
            if self.cmd_tx.send(Command::Shutdown { ack: tx }).is_ok() {
                let _ = rx.recv();
            }
            let _ = driver.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to one subscription. `close()` unsubscribes best-effort and
/// guarantees that no observer callback is delivered after it returns.
pub struct SubscriptionHandle {
    id: SubId,
    cmd_tx: Sender<Command>,
}

impl SubscriptionHandle {
    pub fn close(self) {
        let (tx, rx) = bounded(1);
        if self
            .cmd_tx
            .send(Command::CloseSubscription {
                id: self.id,
                ack: tx,
            })
            .is_ok()
        {
            let _ = rx.recv();
        }
    }
}
