//! Socket and thread runtime behind the client facade.
//!
//! One driver thread owns the connection machine, the dispatcher, and the
//! subscription registry, and runs them to completion per message. A reader
//! thread per socket decodes frames into the driver's channel under the
//! inbound budget; connect attempts run on short-lived connector threads so
//! the driver keeps servicing timers and submissions while dialing.

use std::collections::VecDeque;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;

use crate::config::Settings;
use crate::core::{Credentials, StreamId, WireLimits};
use crate::error::{ClientError, DropReason};

use super::discovery::{Endpoint, EndpointResolver};
use super::frame::{
    BudgetError, FrameError, FrameReader, FrameWriter, InboundBudget, MAX_FRAME_BYTES,
};
use super::machine::{ConnAction, ConnPhase, ConnectionMachine};
use super::operations::{Call, Dispatcher, PacketOutcome};
use super::packet::{Packet, PacketError, decode_packet, encode_packet};
use super::subscription::{
    CatchUpSub, RegistryVerdict, SubId, SubscriptionObserver, SubscriptionRegistry,
};

/// Requests from the facade to the driver thread.
pub(crate) enum Command {
    Submit {
        call: Call,
        credentials: Option<Credentials>,
    },
    SubscribeVolatile {
        stream: Option<StreamId>,
        resolve_link_tos: bool,
        credentials: Option<Credentials>,
        observer: Box<dyn SubscriptionObserver>,
        respond: Sender<SubId>,
    },
    SubscribeCatchUp {
        sub: CatchUpSub,
        credentials: Option<Credentials>,
        observer: Box<dyn SubscriptionObserver>,
        respond: Sender<SubId>,
    },
    CloseSubscription {
        id: SubId,
        ack: Sender<()>,
    },
    Shutdown {
        ack: Sender<()>,
    },
}

#[derive(Debug, Error)]
pub(crate) enum DisconnectReason {
    #[error("peer closed the connection")]
    Eof,
    #[error("framing error: {0}")]
    Frame(FrameError),
    #[error("inbound budget: {0}")]
    Budget(BudgetError),
}

/// Facts reported by reader and connector threads.
pub(crate) enum NetEvent {
    Connected {
        epoch: u64,
        stream: TcpStream,
        endpoint: Endpoint,
    },
    ConnectFailed {
        epoch: u64,
        error: std::io::Error,
        endpoint: Endpoint,
    },
    Frame {
        epoch: u64,
        bytes: Vec<u8>,
    },
    Disconnected {
        epoch: u64,
        reason: DisconnectReason,
    },
}

struct SocketHandle {
    writer: FrameWriter<TcpStream>,
    stream: TcpStream,
    budget: Arc<InboundBudget>,
    epoch: u64,
}

pub(crate) struct Driver {
    settings: Settings,
    resolver: Box<dyn EndpointResolver>,
    cmd_rx: Receiver<Command>,
    net_tx: Sender<NetEvent>,
    net_rx: Receiver<NetEvent>,
    machine: ConnectionMachine,
    dispatcher: Dispatcher,
    subscriptions: SubscriptionRegistry,
    socket: Option<SocketHandle>,
    /// Connection generation; events from older sockets are stale.
    epoch: u64,
    /// Endpoint a not-master redirect pointed at; tried once, next connect.
    master_hint: Option<Endpoint>,
    current_endpoint: Option<Endpoint>,
}

impl Driver {
    pub fn spawn(
        settings: Settings,
        resolver: Box<dyn EndpointResolver>,
    ) -> (Sender<Command>, thread::JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = channel::unbounded();
        let (net_tx, net_rx) = channel::unbounded();
        let now = Instant::now();
        let limits = WireLimits::default();
        let driver = Driver {
            machine: ConnectionMachine::new(&settings, now),
            dispatcher: Dispatcher::new(
                settings.operation.max_retries,
                settings.operation.timeout(),
                limits.clone(),
            ),
            subscriptions: SubscriptionRegistry::new(limits, settings.require_master),
            settings,
            resolver,
            cmd_rx,
            net_tx,
            net_rx,
            socket: None,
            epoch: 0,
            master_hint: None,
            current_endpoint: None,
        };
        let handle = thread::spawn(move || driver.run());
        (cmd_tx, handle)
    }

    fn run(mut self) {
        let cmd_rx = self.cmd_rx.clone();
        let net_rx = self.net_rx.clone();

        let actions = self.machine.start();
        self.apply(actions);

        loop {
            let tick = channel::after(self.next_wakeup());
            crossbeam::select! {
                recv(cmd_rx) -> cmd => match cmd {
                    Ok(cmd) => {
                        if self.on_command(cmd) {
                            break;
                        }
                    }
                    // Facade dropped without an explicit close.
                    Err(_) => {
                        self.teardown();
                        break;
                    }
                },
                recv(net_rx) -> event => {
                    if let Ok(event) = event {
                        self.on_net(event);
                    }
                },
                recv(tick) -> _ => {
                    let now = Instant::now();
                    let actions = self.machine.on_tick(now);
                    self.apply(actions);
                    let expired = self.dispatcher.sweep(now);
                    self.machine.purge_stashed(&expired);
                },
            }
        }
    }

    fn next_wakeup(&self) -> Duration {
        let now = Instant::now();
        let deadline = [
            self.machine.next_deadline(),
            self.dispatcher.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min();
        match deadline {
            Some(deadline) => deadline
                .saturating_duration_since(now)
                .clamp(Duration::from_millis(5), Duration::from_millis(500)),
            None => Duration::from_millis(500),
        }
    }

    /// Returns true when the driver should stop.
    fn on_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Submit { call, credentials } => {
                if self.machine.phase() == ConnPhase::Terminated {
                    call.fail(ClientError::ConnectionLost);
                    return false;
                }
                if let Some(packet) = self.dispatcher.submit(call, credentials, Instant::now()) {
                    let actions = self.machine.on_outbound(packet);
                    self.apply(actions);
                }
            }
            Command::SubscribeVolatile {
                stream,
                resolve_link_tos,
                credentials,
                observer,
                respond,
            } => {
                let (id, packets) =
                    self.subscriptions
                        .add_volatile(stream, resolve_link_tos, observer, credentials);
                let _ = respond.send(id);
                self.send_packets(packets);
            }
            Command::SubscribeCatchUp {
                sub,
                credentials,
                observer,
                respond,
            } => {
                let (id, packets) = self.subscriptions.add_catch_up(sub, observer, credentials);
                let _ = respond.send(id);
                self.send_packets(packets);
            }
            Command::CloseSubscription { id, ack } => {
                let packets = self.subscriptions.close(id);
                self.send_packets(packets);
                // The terminal callback already ran; after this ack the
                // caller's close() returns and nothing more is delivered.
                let _ = ack.send(());
            }
            Command::Shutdown { ack } => {
                self.teardown();
                let _ = ack.send(());
                return true;
            }
        }
        false
    }

    fn on_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connected {
                epoch,
                stream,
                endpoint,
            } => {
                if epoch != self.epoch {
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
                match self.install_socket(stream) {
                    Ok(()) => {
                        tracing::info!(%endpoint, "connected");
                        self.resolver.mark_reachable(&endpoint);
                        self.current_endpoint = Some(endpoint);
                        let actions = self.machine.on_connected(Instant::now());
                        self.apply(actions);
                    }
                    Err(err) => {
                        tracing::warn!(%endpoint, "socket setup failed: {err}");
                        self.resolver.mark_failed(&endpoint);
                        let actions = self.machine.on_connect_failed(Instant::now());
                        self.apply(actions);
                    }
                }
            }
            NetEvent::ConnectFailed {
                epoch,
                error,
                endpoint,
            } => {
                if epoch != self.epoch {
                    return;
                }
                tracing::warn!(%endpoint, "connect failed: {error}");
                self.resolver.mark_failed(&endpoint);
                let actions = self.machine.on_connect_failed(Instant::now());
                self.apply(actions);
            }
            NetEvent::Frame { epoch, bytes } => {
                let current = self
                    .socket
                    .as_ref()
                    .is_some_and(|socket| socket.epoch == epoch);
                if !current {
                    return;
                }
                if let Some(socket) = &self.socket {
                    socket.budget.release(bytes.len());
                }
                self.on_frame(bytes);
            }
            NetEvent::Disconnected { epoch, reason } => {
                let current = self
                    .socket
                    .as_ref()
                    .is_some_and(|socket| socket.epoch == epoch);
                if !current {
                    return;
                }
                tracing::warn!("connection lost: {reason}");
                self.handle_disconnect();
            }
        }
    }

    fn on_frame(&mut self, bytes: Vec<u8>) {
        match decode_packet(&bytes) {
            Ok(packet) => {
                let actions = self.machine.on_inbound(packet, Instant::now());
                self.apply(actions);
            }
            Err(PacketError::UnknownMessageType { code, correlation }) => {
                // The envelope still told us who was waiting.
                if self.dispatcher.fail_correlation(
                    correlation,
                    ClientError::UnexpectedResponse { command: code },
                ) {
                    return;
                }
                if self
                    .subscriptions
                    .fail_correlation(correlation, DropReason::ConnectionLost)
                {
                    return;
                }
                tracing::debug!(code, %correlation, "unknown message type with no owner");
            }
            Err(err) => {
                tracing::warn!("undecodable packet, recycling connection: {err}");
                self.handle_disconnect();
            }
        }
    }

    /// Route a delivered (non-liveness) packet: dispatcher first, then the
    /// subscription registry; a correlation owned by neither is a late
    /// response and is dropped.
    fn route_inbound(&mut self, packet: Packet) {
        match self.dispatcher.on_packet(&packet) {
            PacketOutcome::Handled => {}
            PacketOutcome::Resend(next) => {
                let actions = self.machine.on_outbound(next);
                self.apply(actions);
            }
            PacketOutcome::Reconnect { master } => {
                if let Some((host, port)) = master {
                    self.master_hint = Some(Endpoint::new(host, port));
                }
                if let Some(current) = self.current_endpoint.take() {
                    self.resolver.mark_failed(&current);
                }
                tracing::info!("server is not master, reconnecting");
                self.handle_disconnect();
            }
            PacketOutcome::Unknown => match self.subscriptions.handle_packet(&packet) {
                RegistryVerdict::Packets(packets) => self.send_packets(packets),
                RegistryVerdict::NotOurs => {
                    tracing::debug!(
                        correlation = %packet.correlation,
                        "dropping response with no outstanding owner"
                    );
                }
                RegistryVerdict::ProtocolError => {
                    tracing::warn!("undecodable payload, recycling connection");
                    self.handle_disconnect();
                }
            },
        }
    }

    fn apply(&mut self, actions: Vec<ConnAction>) {
        let mut queue: VecDeque<ConnAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                ConnAction::Connect => self.start_connect(),
                ConnAction::Send(packet) => {
                    let Some(socket) = self.socket.as_mut() else {
                        // The socket died earlier in this batch; operations
                        // were already restashed, subscriptions dropped.
                        tracing::debug!(
                            correlation = %packet.correlation,
                            "no socket for outbound packet, dropping"
                        );
                        continue;
                    };
                    let bytes = encode_packet(&packet);
                    if let Err(err) = socket.writer.write_frame(&bytes) {
                        tracing::warn!("write failed: {err}");
                        self.handle_disconnect();
                    }
                }
                ConnAction::Deliver(packet) => self.route_inbound(packet),
                ConnAction::CloseSocket => self.teardown_socket(),
                ConnAction::Terminate => {
                    self.dispatcher.fail_all();
                    let _ = self.subscriptions.drop_all(DropReason::ConnectionLost);
                    self.teardown_socket();
                }
                ConnAction::EvictStashed(packet) => {
                    let correlation = packet.correlation;
                    if self
                        .dispatcher
                        .fail_correlation(correlation, ClientError::ConnectionLost)
                    {
                        continue;
                    }
                    if self
                        .subscriptions
                        .fail_correlation(correlation, DropReason::ConnectionLost)
                    {
                        continue;
                    }
                    tracing::debug!(%correlation, "evicted stashed packet with no owner");
                }
            }
        }
    }

    /// Current socket is gone (error, EOF, heartbeat-driven close, redirect).
    /// Subscriptions drop; in-flight operations restash for the next
    /// connection with their original correlation ids.
    fn handle_disconnect(&mut self) {
        if self.machine.phase() != ConnPhase::Connected {
            return;
        }
        self.teardown_socket();
        self.current_endpoint = None;

        let dropped = self.subscriptions.drop_all(DropReason::ConnectionLost);
        self.machine.purge_stashed(&dropped);

        let pending = self.dispatcher.pending_packets();
        tracing::debug!(in_flight = self.dispatcher.len(), "restashing operations");
        let actions = self.machine.on_socket_closed(Instant::now());
        self.apply(actions);

        if self.machine.phase() == ConnPhase::Connecting {
            for packet in pending {
                let actions = self.machine.on_outbound(packet);
                self.apply(actions);
            }
        }
    }

    fn start_connect(&mut self) {
        self.epoch += 1;
        let endpoint = match self.master_hint.take() {
            Some(endpoint) => endpoint,
            None => match self.resolver.next_endpoint() {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    tracing::warn!("endpoint resolution failed: {err}");
                    let actions = self.machine.on_connect_failed(Instant::now());
                    self.apply(actions);
                    return;
                }
            },
        };
        tracing::debug!(%endpoint, "connecting");
        let epoch = self.epoch;
        let timeout = self.settings.connection_timeout();
        let net_tx = self.net_tx.clone();
        thread::spawn(move || run_connector(endpoint, epoch, timeout, net_tx));
    }

    fn install_socket(&mut self, stream: TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        let reader_stream = stream.try_clone()?;
        let writer_stream = stream.try_clone()?;

        let bp = &self.settings.backpressure;
        let budget = InboundBudget::new(bp.low_bytes, bp.high_bytes, bp.max_bytes);
        let epoch = self.epoch;
        let net_tx = self.net_tx.clone();
        let reader_budget = Arc::clone(&budget);
        thread::spawn(move || run_reader(reader_stream, epoch, reader_budget, net_tx));

        self.socket = Some(SocketHandle {
            writer: FrameWriter::new(writer_stream, MAX_FRAME_BYTES),
            stream,
            budget,
            epoch,
        });
        Ok(())
    }

    fn teardown_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.budget.abort();
            let _ = socket.stream.shutdown(Shutdown::Both);
        }
    }

    fn send_packets(&mut self, packets: Vec<Packet>) {
        for packet in packets {
            let actions = self.machine.on_outbound(packet);
            self.apply(actions);
        }
    }

    /// Full shutdown: cancel timers by exiting the loop; fail everything.
    fn teardown(&mut self) {
        self.dispatcher.fail_all();
        let _ = self.subscriptions.drop_all(DropReason::ConnectionLost);
        self.teardown_socket();
    }
}

fn run_connector(endpoint: Endpoint, epoch: u64, timeout: Duration, net_tx: Sender<NetEvent>) {
    match connect_endpoint(&endpoint, timeout) {
        Ok(stream) => {
            let _ = net_tx.send(NetEvent::Connected {
                epoch,
                stream,
                endpoint,
            });
        }
        Err(error) => {
            let _ = net_tx.send(NetEvent::ConnectFailed {
                epoch,
                error,
                endpoint,
            });
        }
    }
}

fn connect_endpoint(endpoint: &Endpoint, timeout: Duration) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (endpoint.host(), endpoint.port()).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
    }))
}

fn run_reader(
    stream: TcpStream,
    epoch: u64,
    budget: Arc<InboundBudget>,
    net_tx: Sender<NetEvent>,
) {
    let mut reader = FrameReader::new(stream, MAX_FRAME_BYTES);
    loop {
        match reader.read_next() {
            Ok(Some(frame)) => {
                if let Err(err) = budget.admit(frame.len()) {
                    if !matches!(err, BudgetError::Aborted) {
                        let _ = net_tx.send(NetEvent::Disconnected {
                            epoch,
                            reason: DisconnectReason::Budget(err),
                        });
                    }
                    return;
                }
                if net_tx.send(NetEvent::Frame { epoch, bytes: frame }).is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = net_tx.send(NetEvent::Disconnected {
                    epoch,
                    reason: DisconnectReason::Eof,
                });
                return;
            }
            Err(err) => {
                let _ = net_tx.send(NetEvent::Disconnected {
                    epoch,
                    reason: DisconnectReason::Frame(err),
                });
                return;
            }
        }
    }
}
