//! Volatile and catch-up subscription engines.
//!
//! The machines are pure: the driver feeds them decoded messages and applies
//! the actions they return. Catch-up pages history forward, buffers live
//! pushes while the final read closes the gap, and de-duplicates on the
//! switch so the observer sees every event exactly once, in order.

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::core::{Credentials, Position, ResolvedEvent, StreamId, WireLimits};
use crate::error::DropReason;

use super::command::MessageKind;
use super::packet::Packet;
use super::proto::{
    self, ReadAllOutcome, ReadStreamOutcome, SubDropCode, SubscriptionConfirmation,
};

/// Callbacks delivered by the subscription engine.
///
/// Events arrive in server order, `on_live_processing_start` fires once when
/// a subscription goes live, and exactly one `on_dropped` terminates the
/// subscription. Nothing is delivered after the handle's `close()` returns.
pub trait SubscriptionObserver: Send {
    fn on_event(&mut self, event: &ResolvedEvent);
    fn on_live_processing_start(&mut self) {}
    fn on_dropped(&mut self, reason: DropReason);
}

/// Observer callbacks reified for channel-based consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Event(ResolvedEvent),
    LiveProcessingStart,
    Dropped(DropReason),
}

impl SubscriptionObserver for crossbeam::channel::Sender<SubscriptionEvent> {
    fn on_event(&mut self, event: &ResolvedEvent) {
        let _ = self.send(SubscriptionEvent::Event(event.clone()));
    }

    fn on_live_processing_start(&mut self) {
        let _ = self.send(SubscriptionEvent::LiveProcessingStart);
    }

    fn on_dropped(&mut self, reason: DropReason) {
        let _ = self.send(SubscriptionEvent::Dropped(reason));
    }
}

#[derive(Debug)]
pub(crate) enum SubAction {
    Subscribe {
        stream: Option<StreamId>,
        resolve_link_tos: bool,
    },
    Unsubscribe,
    Read(ReadPage),
    Emit(ResolvedEvent),
    LiveStarted,
    /// Always the last action of a terminated machine.
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadPage {
    Stream {
        stream: StreamId,
        from: u64,
        count: u64,
        resolve_link_tos: bool,
    },
    All {
        from: Position,
        count: u64,
        resolve_link_tos: bool,
    },
}

/// One decoded forward page, normalised by the registry.
#[derive(Debug)]
pub(crate) enum PageResult {
    Stream {
        events: Vec<ResolvedEvent>,
        /// `None` keeps the cursor where it is (stream does not exist yet).
        next_event_number: Option<u64>,
        end_of_stream: bool,
    },
    All {
        events: Vec<ResolvedEvent>,
        next_position: Position,
    },
}

// ---------------------------------------------------------------------------
// Volatile subscription: live only.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VolatileState {
    Subscribing,
    Running,
    Unsubscribed,
}

pub(crate) struct VolatileSub {
    stream: Option<StreamId>,
    resolve_link_tos: bool,
    state: VolatileState,
}

impl VolatileSub {
    pub fn new(stream: Option<StreamId>, resolve_link_tos: bool) -> Self {
        Self {
            stream,
            resolve_link_tos,
            state: VolatileState::Subscribing,
        }
    }

    pub fn start(&mut self) -> Vec<SubAction> {
        vec![SubAction::Subscribe {
            stream: self.stream.clone(),
            resolve_link_tos: self.resolve_link_tos,
        }]
    }

    pub fn on_confirmation(&mut self, _conf: SubscriptionConfirmation) -> Vec<SubAction> {
        if self.state != VolatileState::Subscribing {
            return Vec::new();
        }
        self.state = VolatileState::Running;
        vec![SubAction::LiveStarted]
    }

    pub fn on_event_appeared(&mut self, event: ResolvedEvent) -> Vec<SubAction> {
        if self.state != VolatileState::Running {
            return Vec::new();
        }
        vec![SubAction::Emit(event)]
    }

    pub fn on_failed(&mut self, reason: DropReason) -> Vec<SubAction> {
        if self.state == VolatileState::Unsubscribed {
            return Vec::new();
        }
        self.state = VolatileState::Unsubscribed;
        vec![SubAction::Dropped(reason)]
    }

    pub fn stop(&mut self) -> Vec<SubAction> {
        if self.state == VolatileState::Unsubscribed {
            return Vec::new();
        }
        self.state = VolatileState::Unsubscribed;
        vec![
            SubAction::Unsubscribe,
            SubAction::Dropped(DropReason::Unsubscribed),
        ]
    }
}

// ---------------------------------------------------------------------------
// Catch-up subscription: history, then live, no gaps and no duplicates.

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CatchUpTarget {
    Stream(StreamId),
    All,
}

/// Where live delivery began, snapshotted from the subscription
/// confirmation; the final read loop pages until it reaches this.
#[derive(Clone, Copy, Debug)]
enum LiveStart {
    Stream(Option<u64>),
    All(u64),
}

enum CatchUpPhase {
    Reading,
    CatchingUp {
        live_start: Option<LiveStart>,
        buffer: VecDeque<ResolvedEvent>,
    },
    Live,
    Dropped,
}

enum Cursor {
    Stream {
        next: u64,
        last_emitted: Option<u64>,
    },
    All {
        next: Position,
        last_emitted: Option<Position>,
    },
}

pub(crate) struct CatchUpSub {
    target: CatchUpTarget,
    resolve_link_tos: bool,
    batch: u64,
    live_buffer_limit: usize,
    cursor: Cursor,
    phase: CatchUpPhase,
}

impl CatchUpSub {
    pub fn stream(
        stream: StreamId,
        from_exclusive: Option<u64>,
        resolve_link_tos: bool,
        batch: u64,
        live_buffer_limit: usize,
    ) -> Self {
        Self {
            target: CatchUpTarget::Stream(stream),
            resolve_link_tos,
            batch: batch.max(1),
            live_buffer_limit: live_buffer_limit.max(1),
            cursor: Cursor::Stream {
                next: from_exclusive.map(|n| n + 1).unwrap_or(0),
                last_emitted: from_exclusive,
            },
            phase: CatchUpPhase::Reading,
        }
    }

    pub fn all(
        from_exclusive: Option<Position>,
        resolve_link_tos: bool,
        batch: u64,
        live_buffer_limit: usize,
    ) -> Self {
        Self {
            target: CatchUpTarget::All,
            resolve_link_tos,
            batch: batch.max(1),
            live_buffer_limit: live_buffer_limit.max(1),
            cursor: Cursor::All {
                next: from_exclusive.unwrap_or(Position::START),
                last_emitted: from_exclusive,
            },
            phase: CatchUpPhase::Reading,
        }
    }

    pub fn start(&mut self) -> Vec<SubAction> {
        vec![SubAction::Read(self.read_page())]
    }

    pub fn on_read_page(&mut self, page: PageResult) -> Vec<SubAction> {
        match self.phase {
            CatchUpPhase::Reading => {
                let (mut actions, end) = self.consume_page(page);
                if end {
                    actions.push(SubAction::Subscribe {
                        stream: match &self.target {
                            CatchUpTarget::Stream(stream) => Some(stream.clone()),
                            CatchUpTarget::All => None,
                        },
                        resolve_link_tos: self.resolve_link_tos,
                    });
                    self.phase = CatchUpPhase::CatchingUp {
                        live_start: None,
                        buffer: VecDeque::new(),
                    };
                } else {
                    actions.push(SubAction::Read(self.read_page()));
                }
                actions
            }
            CatchUpPhase::CatchingUp { .. } => {
                let (mut actions, end) = self.consume_page(page);
                let caught_up = end || self.reached_live_start();
                if caught_up {
                    actions.push(SubAction::LiveStarted);
                    let CatchUpPhase::CatchingUp { buffer, .. } =
                        std::mem::replace(&mut self.phase, CatchUpPhase::Live)
                    else {
                        unreachable!("phase checked above");
                    };
                    for event in buffer {
                        if self.admit(&event) {
                            actions.push(SubAction::Emit(event));
                        }
                    }
                } else {
                    actions.push(SubAction::Read(self.read_page()));
                }
                actions
            }
            CatchUpPhase::Live | CatchUpPhase::Dropped => Vec::new(),
        }
    }

    pub fn on_confirmation(&mut self, conf: SubscriptionConfirmation) -> Vec<SubAction> {
        match &mut self.phase {
            CatchUpPhase::CatchingUp { live_start, .. } if live_start.is_none() => {
                *live_start = Some(match self.target {
                    CatchUpTarget::Stream(_) => LiveStart::Stream(conf.last_event_number),
                    CatchUpTarget::All => LiveStart::All(conf.last_commit_position),
                });
                // One read always runs after confirmation, closing the race
                // between the end of history and the start of live pushes.
                vec![SubAction::Read(self.read_page())]
            }
            _ => Vec::new(),
        }
    }

    pub fn on_event_appeared(&mut self, event: ResolvedEvent) -> Vec<SubAction> {
        match &mut self.phase {
            CatchUpPhase::CatchingUp { buffer, .. } => {
                if buffer.len() >= self.live_buffer_limit {
                    self.phase = CatchUpPhase::Dropped;
                    return vec![
                        SubAction::Unsubscribe,
                        SubAction::Dropped(DropReason::Overflow),
                    ];
                }
                buffer.push_back(event);
                Vec::new()
            }
            CatchUpPhase::Live => {
                if self.admit(&event) {
                    vec![SubAction::Emit(event)]
                } else {
                    Vec::new()
                }
            }
            CatchUpPhase::Reading | CatchUpPhase::Dropped => Vec::new(),
        }
    }

    pub fn on_failed(&mut self, reason: DropReason) -> Vec<SubAction> {
        if matches!(self.phase, CatchUpPhase::Dropped) {
            return Vec::new();
        }
        self.phase = CatchUpPhase::Dropped;
        vec![SubAction::Dropped(reason)]
    }

    pub fn stop(&mut self) -> Vec<SubAction> {
        match self.phase {
            CatchUpPhase::Dropped => Vec::new(),
            CatchUpPhase::Reading => {
                self.phase = CatchUpPhase::Dropped;
                vec![SubAction::Dropped(DropReason::Unsubscribed)]
            }
            CatchUpPhase::CatchingUp { .. } | CatchUpPhase::Live => {
                self.phase = CatchUpPhase::Dropped;
                vec![
                    SubAction::Unsubscribe,
                    SubAction::Dropped(DropReason::Unsubscribed),
                ]
            }
        }
    }

    fn read_page(&self) -> ReadPage {
        match (&self.target, &self.cursor) {
            (CatchUpTarget::Stream(stream), Cursor::Stream { next, .. }) => ReadPage::Stream {
                stream: stream.clone(),
                from: *next,
                count: self.batch,
                resolve_link_tos: self.resolve_link_tos,
            },
            (CatchUpTarget::All, Cursor::All { next, .. }) => ReadPage::All {
                from: *next,
                count: self.batch,
                resolve_link_tos: self.resolve_link_tos,
            },
            _ => unreachable!("cursor always matches target"),
        }
    }

    /// Emit a page's events through the dedup filter and advance the read
    /// cursor; returns the actions plus whether the page ended history.
    fn consume_page(&mut self, page: PageResult) -> (Vec<SubAction>, bool) {
        let mut actions = Vec::new();
        let (events, end) = match page {
            PageResult::Stream {
                events,
                next_event_number,
                end_of_stream,
            } => {
                let Cursor::Stream { next, .. } = &mut self.cursor else {
                    debug_assert!(false, "stream page on an all-log cursor");
                    return (actions, true);
                };
                if let Some(n) = next_event_number {
                    *next = n;
                }
                (events, end_of_stream)
            }
            PageResult::All {
                events,
                next_position,
            } => {
                let Cursor::All { next, .. } = &mut self.cursor else {
                    debug_assert!(false, "all-log page on a stream cursor");
                    return (actions, true);
                };
                let end = (events.len() as u64) < self.batch || next_position <= *next;
                *next = next_position;
                (events, end)
            }
        };
        for event in events {
            if self.admit(&event) {
                actions.push(SubAction::Emit(event));
            }
        }
        (actions, end)
    }

    fn reached_live_start(&self) -> bool {
        let CatchUpPhase::CatchingUp { live_start, .. } = &self.phase else {
            return false;
        };
        match (live_start, &self.cursor) {
            (None, _) => false,
            (Some(LiveStart::Stream(None)), _) => true,
            (Some(LiveStart::Stream(Some(last))), Cursor::Stream { next, .. }) => *next > *last,
            (Some(LiveStart::All(commit)), Cursor::All { next, .. }) => next.commit >= *commit,
            _ => false,
        }
    }

    /// Dedup filter: drop anything at or before the last emitted place.
    fn admit(&mut self, event: &ResolvedEvent) -> bool {
        match &mut self.cursor {
            Cursor::Stream { last_emitted, .. } => {
                let number = event.original_number();
                if last_emitted.is_some_and(|last| number <= last) {
                    return false;
                }
                *last_emitted = Some(number);
                true
            }
            Cursor::All { last_emitted, .. } => {
                let Some(position) = event.position else {
                    tracing::warn!("all-log event without a position, skipping");
                    return false;
                };
                if last_emitted.is_some_and(|last| position <= last) {
                    return false;
                }
                *last_emitted = Some(position);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Registry: machines + observers + correlation routing + packet building.

pub(crate) type SubId = u64;

enum Machine {
    Volatile(VolatileSub),
    CatchUp(CatchUpSub),
}

impl Machine {
    fn on_confirmation(&mut self, conf: SubscriptionConfirmation) -> Vec<SubAction> {
        match self {
            Machine::Volatile(sub) => sub.on_confirmation(conf),
            Machine::CatchUp(sub) => sub.on_confirmation(conf),
        }
    }

    fn on_event_appeared(&mut self, event: ResolvedEvent) -> Vec<SubAction> {
        match self {
            Machine::Volatile(sub) => sub.on_event_appeared(event),
            Machine::CatchUp(sub) => sub.on_event_appeared(event),
        }
    }

    fn on_failed(&mut self, reason: DropReason) -> Vec<SubAction> {
        match self {
            Machine::Volatile(sub) => sub.on_failed(reason),
            Machine::CatchUp(sub) => sub.on_failed(reason),
        }
    }

    fn stop(&mut self) -> Vec<SubAction> {
        match self {
            Machine::Volatile(sub) => sub.stop(),
            Machine::CatchUp(sub) => sub.stop(),
        }
    }
}

enum Route {
    Main,
    Read,
}

struct Entry {
    machine: Machine,
    observer: Box<dyn SubscriptionObserver>,
    main: Uuid,
    read: Option<Uuid>,
    credentials: Option<Credentials>,
}

pub(crate) enum RegistryVerdict {
    /// Correlation belongs to no subscription.
    NotOurs,
    /// Handled; send these packets (possibly none).
    Packets(Vec<Packet>),
    /// The peer sent something undecodable; recycle the connection.
    ProtocolError,
}

pub(crate) struct SubscriptionRegistry {
    entries: HashMap<SubId, Entry>,
    routes: HashMap<Uuid, (SubId, Route)>,
    limits: WireLimits,
    require_master: bool,
    next_id: SubId,
}

impl SubscriptionRegistry {
    pub fn new(limits: WireLimits, require_master: bool) -> Self {
        Self {
            entries: HashMap::new(),
            routes: HashMap::new(),
            limits,
            require_master,
            next_id: 0,
        }
    }

    pub fn add_volatile(
        &mut self,
        stream: Option<StreamId>,
        resolve_link_tos: bool,
        observer: Box<dyn SubscriptionObserver>,
        credentials: Option<Credentials>,
    ) -> (SubId, Vec<Packet>) {
        let mut sub = VolatileSub::new(stream, resolve_link_tos);
        let actions = sub.start();
        self.install(Machine::Volatile(sub), observer, credentials, actions)
    }

    pub fn add_catch_up(
        &mut self,
        mut sub: CatchUpSub,
        observer: Box<dyn SubscriptionObserver>,
        credentials: Option<Credentials>,
    ) -> (SubId, Vec<Packet>) {
        let actions = sub.start();
        self.install(Machine::CatchUp(sub), observer, credentials, actions)
    }

    fn install(
        &mut self,
        machine: Machine,
        observer: Box<dyn SubscriptionObserver>,
        credentials: Option<Credentials>,
        actions: Vec<SubAction>,
    ) -> (SubId, Vec<Packet>) {
        let id = self.next_id;
        self.next_id += 1;
        let main = Uuid::new_v4();
        self.routes.insert(main, (id, Route::Main));
        self.entries.insert(
            id,
            Entry {
                machine,
                observer,
                main,
                read: None,
                credentials,
            },
        );
        let packets = self.apply(id, actions);
        (id, packets)
    }

    /// Route an inbound packet to the subscription owning its correlation.
    pub fn handle_packet(&mut self, packet: &Packet) -> RegistryVerdict {
        let (id, is_read) = match self.routes.get(&packet.correlation) {
            Some((id, Route::Main)) => (*id, false),
            Some((id, Route::Read)) => (*id, true),
            None => return RegistryVerdict::NotOurs,
        };
        if is_read {
            self.on_read_packet(id, packet)
        } else {
            self.on_main_packet(id, packet)
        }
    }

    /// Caller-initiated close; the terminal callback fires before this
    /// returns, so nothing is delivered after the handle's `close()`.
    pub fn close(&mut self, id: SubId) -> Vec<Packet> {
        let Some(entry) = self.entries.get_mut(&id) else {
            return Vec::new();
        };
        let actions = entry.machine.stop();
        self.apply(id, actions)
    }

    /// Drop the subscription owning this correlation (stash eviction,
    /// unroutable responses). Returns whether one was ours.
    pub fn fail_correlation(&mut self, correlation: Uuid, reason: DropReason) -> bool {
        let Some((id, _)) = self.routes.get(&correlation) else {
            return false;
        };
        let id = *id;
        if let Some(entry) = self.entries.get_mut(&id) {
            let actions = entry.machine.on_failed(reason);
            let packets = self.apply(id, actions);
            debug_assert!(packets.is_empty());
        }
        true
    }

    /// Connection gone: every subscription drops. Returns the correlations
    /// that were in use so the driver can purge its stash.
    pub fn drop_all(&mut self, reason: DropReason) -> Vec<Uuid> {
        let ids: Vec<SubId> = self.entries.keys().copied().collect();
        let mut correlations = Vec::new();
        for id in ids {
            if let Some(entry) = self.entries.get_mut(&id) {
                correlations.push(entry.main);
                correlations.extend(entry.read);
                let actions = entry.machine.on_failed(reason);
                // No packets can be sent; apply only delivers callbacks.
                let packets = self.apply(id, actions);
                debug_assert!(packets.is_empty());
            }
        }
        correlations
    }

    fn on_main_packet(&mut self, id: SubId, packet: &Packet) -> RegistryVerdict {
        let Some(entry) = self.entries.get_mut(&id) else {
            return RegistryVerdict::NotOurs;
        };
        let actions = match packet.kind {
            MessageKind::SubscriptionConfirmation => {
                match proto::decode_subscription_confirmation(&packet.payload, &self.limits) {
                    Ok(conf) => entry.machine.on_confirmation(conf),
                    Err(err) => {
                        tracing::warn!(correlation = %packet.correlation, "bad confirmation: {err}");
                        return RegistryVerdict::ProtocolError;
                    }
                }
            }
            MessageKind::StreamEventAppeared => {
                match proto::decode_stream_event_appeared(&packet.payload, &self.limits) {
                    Ok(msg) => entry.machine.on_event_appeared(msg.event),
                    Err(err) => {
                        tracing::warn!(correlation = %packet.correlation, "bad event push: {err}");
                        return RegistryVerdict::ProtocolError;
                    }
                }
            }
            MessageKind::SubscriptionDropped => {
                match proto::decode_subscription_dropped(&packet.payload, &self.limits) {
                    Ok(msg) => entry.machine.on_failed(map_drop_code(msg.reason)),
                    Err(err) => {
                        tracing::warn!(correlation = %packet.correlation, "bad drop notice: {err}");
                        return RegistryVerdict::ProtocolError;
                    }
                }
            }
            MessageKind::NotAuthenticated => entry.machine.on_failed(DropReason::AccessDenied),
            other => {
                tracing::warn!(
                    correlation = %packet.correlation,
                    kind = ?other,
                    "unexpected message for subscription, dropping it"
                );
                entry.machine.on_failed(DropReason::ConnectionLost)
            }
        };
        RegistryVerdict::Packets(self.apply(id, actions))
    }

    fn on_read_packet(&mut self, id: SubId, packet: &Packet) -> RegistryVerdict {
        // The read correlation is one-shot.
        self.routes.remove(&packet.correlation);
        let Some(entry) = self.entries.get_mut(&id) else {
            return RegistryVerdict::NotOurs;
        };
        entry.read = None;

        let Machine::CatchUp(sub) = &mut entry.machine else {
            tracing::warn!("read completion routed to a volatile subscription");
            let actions = entry.machine.on_failed(DropReason::ConnectionLost);
            return RegistryVerdict::Packets(self.apply(id, actions));
        };

        let actions = match packet.kind {
            MessageKind::ReadStreamEventsForwardCompleted => {
                match proto::decode_read_stream_events_completed(&packet.payload, &self.limits) {
                    Ok(msg) => match msg.result {
                        ReadStreamOutcome::Success => sub.on_read_page(PageResult::Stream {
                            events: msg.events,
                            next_event_number: Some(msg.next_event_number),
                            end_of_stream: msg.is_end_of_stream,
                        }),
                        // A stream that does not exist yet reads as empty
                        // history; the subscription still goes live.
                        ReadStreamOutcome::NoStream => sub.on_read_page(PageResult::Stream {
                            events: Vec::new(),
                            next_event_number: None,
                            end_of_stream: true,
                        }),
                        ReadStreamOutcome::StreamDeleted => {
                            sub.on_failed(DropReason::NotFound)
                        }
                        ReadStreamOutcome::AccessDenied => {
                            sub.on_failed(DropReason::AccessDenied)
                        }
                    },
                    Err(err) => {
                        tracing::warn!(correlation = %packet.correlation, "bad read page: {err}");
                        return RegistryVerdict::ProtocolError;
                    }
                }
            }
            MessageKind::ReadAllEventsForwardCompleted => {
                match proto::decode_read_all_events_completed(&packet.payload, &self.limits) {
                    Ok(msg) => match msg.result {
                        ReadAllOutcome::Success => sub.on_read_page(PageResult::All {
                            events: msg.events,
                            next_position: msg.next_position,
                        }),
                        ReadAllOutcome::AccessDenied => sub.on_failed(DropReason::AccessDenied),
                    },
                    Err(err) => {
                        tracing::warn!(correlation = %packet.correlation, "bad read page: {err}");
                        return RegistryVerdict::ProtocolError;
                    }
                }
            }
            MessageKind::NotAuthenticated => sub.on_failed(DropReason::AccessDenied),
            other => {
                tracing::warn!(
                    correlation = %packet.correlation,
                    kind = ?other,
                    "unexpected read completion for subscription, dropping it"
                );
                sub.on_failed(DropReason::ConnectionLost)
            }
        };
        RegistryVerdict::Packets(self.apply(id, actions))
    }

    /// Turn machine actions into packets and observer callbacks. A
    /// `Dropped` action removes the subscription; machines order it last.
    fn apply(&mut self, id: SubId, actions: Vec<SubAction>) -> Vec<Packet> {
        let mut packets = Vec::new();
        for action in actions {
            let Some(entry) = self.entries.get_mut(&id) else {
                break;
            };
            match action {
                SubAction::Subscribe {
                    stream,
                    resolve_link_tos,
                } => match proto::encode_subscribe_to_stream(&proto::SubscribeToStream {
                    stream,
                    resolve_link_tos,
                }) {
                    Ok(payload) => packets.push(
                        Packet::new(MessageKind::SubscribeToStream, entry.main, payload)
                            .with_credentials(entry.credentials.clone()),
                    ),
                    Err(err) => {
                        tracing::warn!("subscribe encode failed: {err}");
                    }
                },
                SubAction::Unsubscribe => match proto::encode_unsubscribe() {
                    Ok(payload) => packets.push(Packet::new(
                        MessageKind::UnsubscribeFromStream,
                        entry.main,
                        payload,
                    )),
                    Err(err) => {
                        tracing::warn!("unsubscribe encode failed: {err}");
                    }
                },
                SubAction::Read(page) => {
                    let correlation = Uuid::new_v4();
                    let encoded = match &page {
                        ReadPage::Stream {
                            stream,
                            from,
                            count,
                            resolve_link_tos,
                        } => proto::encode_read_stream_events(&proto::ReadStreamEvents {
                            stream: stream.clone(),
                            from_event_number: *from,
                            max_count: *count,
                            resolve_link_tos: *resolve_link_tos,
                            require_master: self.require_master,
                        })
                        .map(|payload| (MessageKind::ReadStreamEventsForward, payload)),
                        ReadPage::All {
                            from,
                            count,
                            resolve_link_tos,
                        } => proto::encode_read_all_events(&proto::ReadAllEvents {
                            position: *from,
                            max_count: *count,
                            resolve_link_tos: *resolve_link_tos,
                            require_master: self.require_master,
                        })
                        .map(|payload| (MessageKind::ReadAllEventsForward, payload)),
                    };
                    match encoded {
                        Ok((kind, payload)) => {
                            entry.read = Some(correlation);
                            self.routes.insert(correlation, (id, Route::Read));
                            packets.push(
                                Packet::new(kind, correlation, payload)
                                    .with_credentials(entry.credentials.clone()),
                            );
                        }
                        Err(err) => {
                            tracing::warn!("read encode failed: {err}");
                        }
                    }
                }
                SubAction::Emit(event) => entry.observer.on_event(&event),
                SubAction::LiveStarted => entry.observer.on_live_processing_start(),
                SubAction::Dropped(reason) => {
                    entry.observer.on_dropped(reason);
                    if let Some(entry) = self.entries.remove(&id) {
                        self.routes.remove(&entry.main);
                        if let Some(read) = entry.read {
                            self.routes.remove(&read);
                        }
                    }
                }
            }
        }
        packets
    }
}

fn map_drop_code(code: SubDropCode) -> DropReason {
    match code {
        SubDropCode::Unsubscribed => DropReason::Unsubscribed,
        SubDropCode::AccessDenied => DropReason::AccessDenied,
        SubDropCode::NotFound => DropReason::NotFound,
        SubDropCode::Overflow => DropReason::Overflow,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    use crate::core::{ContentType, RecordedEvent};

    fn stream_id(raw: &str) -> StreamId {
        StreamId::parse(raw).unwrap()
    }

    fn event(number: u64) -> ResolvedEvent {
        ResolvedEvent {
            event: RecordedEvent {
                stream: stream_id("s"),
                number,
                id: Uuid::from_bytes([number as u8; 16]),
                event_type: "t".into(),
                data: Bytes::new(),
                metadata: Bytes::new(),
                data_content: ContentType::Binary,
                metadata_content: ContentType::Binary,
                created_ms: number,
            },
            link: None,
            position: None,
        }
    }

    fn all_event(commit: u64) -> ResolvedEvent {
        let mut ev = event(commit);
        ev.position = Some(Position::new(commit, commit));
        ev
    }

    /// Collapse actions for assertions: emitted numbers plus markers.
    #[derive(Debug, PartialEq, Eq)]
    enum Step {
        Emit(u64),
        Read(u64),
        Subscribe,
        Unsubscribe,
        Live,
        Dropped(DropReason),
    }

    fn steps(actions: Vec<SubAction>) -> Vec<Step> {
        actions
            .into_iter()
            .map(|action| match action {
                SubAction::Emit(ev) => Step::Emit(ev.original_number()),
                SubAction::Read(ReadPage::Stream { from, .. }) => Step::Read(from),
                SubAction::Read(ReadPage::All { from, .. }) => Step::Read(from.commit),
                SubAction::Subscribe { .. } => Step::Subscribe,
                SubAction::Unsubscribe => Step::Unsubscribe,
                SubAction::LiveStarted => Step::Live,
                SubAction::Dropped(reason) => Step::Dropped(reason),
            })
            .collect()
    }

    fn page(events: Vec<ResolvedEvent>, next: u64, end: bool) -> PageResult {
        PageResult::Stream {
            events,
            next_event_number: Some(next),
            end_of_stream: end,
        }
    }

    #[test]
    fn catch_up_pages_history_then_goes_live() {
        // Scenario: two preloaded events, empty final read, then a push.
        let mut sub = CatchUpSub::stream(stream_id("s"), None, false, 500, 1024);
        assert_eq!(steps(sub.start()), vec![Step::Read(0)]);

        let actions = sub.on_read_page(page(vec![event(0), event(1)], 2, true));
        assert_eq!(
            steps(actions),
            vec![Step::Emit(0), Step::Emit(1), Step::Subscribe]
        );

        let actions = sub.on_confirmation(SubscriptionConfirmation {
            last_commit_position: 90,
            last_event_number: Some(1),
        });
        assert_eq!(steps(actions), vec![Step::Read(2)]);

        let actions = sub.on_read_page(page(vec![], 2, true));
        assert_eq!(steps(actions), vec![Step::Live]);

        let actions = sub.on_event_appeared(event(2));
        assert_eq!(steps(actions), vec![Step::Emit(2)]);
    }

    #[test]
    fn catch_up_from_exclusive_skips_older_events() {
        let mut sub = CatchUpSub::stream(stream_id("s"), Some(1), false, 500, 1024);
        assert_eq!(steps(sub.start()), vec![Step::Read(2)]);

        // Server replays from an earlier point; only newer events pass.
        let actions = sub.on_read_page(page(vec![event(1), event(2), event(3)], 4, true));
        assert_eq!(
            steps(actions),
            vec![Step::Emit(2), Step::Emit(3), Step::Subscribe]
        );
    }

    #[test]
    fn buffered_live_events_deduplicate_against_final_read() {
        let mut sub = CatchUpSub::stream(stream_id("s"), None, false, 500, 1024);
        sub.start();
        sub.on_read_page(page(vec![event(0)], 1, true));
        sub.on_confirmation(SubscriptionConfirmation {
            last_commit_position: 10,
            last_event_number: Some(0),
        });

        // Pushes race in while the final read is outstanding.
        assert!(sub.on_event_appeared(event(1)).is_empty());
        assert!(sub.on_event_appeared(event(2)).is_empty());

        // The final read already observed event 1.
        let actions = sub.on_read_page(page(vec![event(1)], 2, true));
        assert_eq!(
            steps(actions),
            vec![Step::Emit(1), Step::Live, Step::Emit(2)]
        );
    }

    #[test]
    fn nonexistent_stream_catch_up_goes_live_immediately() {
        let mut sub = CatchUpSub::stream(stream_id("s"), None, false, 500, 1024);
        sub.start();
        let actions = sub.on_read_page(PageResult::Stream {
            events: Vec::new(),
            next_event_number: None,
            end_of_stream: true,
        });
        assert_eq!(steps(actions), vec![Step::Subscribe]);

        let actions = sub.on_confirmation(SubscriptionConfirmation {
            last_commit_position: 0,
            last_event_number: None,
        });
        assert_eq!(steps(actions), vec![Step::Read(0)]);

        let actions = sub.on_read_page(PageResult::Stream {
            events: Vec::new(),
            next_event_number: None,
            end_of_stream: true,
        });
        assert_eq!(steps(actions), vec![Step::Live]);

        let actions = sub.on_event_appeared(event(0));
        assert_eq!(steps(actions), vec![Step::Emit(0)]);
    }

    #[test]
    fn live_buffer_overflow_drops_subscription() {
        let mut sub = CatchUpSub::stream(stream_id("s"), None, false, 500, 2);
        sub.start();
        sub.on_read_page(page(vec![], 0, true));
        sub.on_confirmation(SubscriptionConfirmation {
            last_commit_position: 0,
            last_event_number: None,
        });

        assert!(sub.on_event_appeared(event(0)).is_empty());
        assert!(sub.on_event_appeared(event(1)).is_empty());
        let actions = sub.on_event_appeared(event(2));
        assert_eq!(
            steps(actions),
            vec![Step::Unsubscribe, Step::Dropped(DropReason::Overflow)]
        );

        // Terminal: nothing more comes out.
        assert!(sub.on_event_appeared(event(3)).is_empty());
        assert!(sub.stop().is_empty());
    }

    #[test]
    fn stop_is_terminal_and_silent_afterwards() {
        let mut sub = CatchUpSub::stream(stream_id("s"), None, false, 500, 1024);
        sub.start();
        sub.on_read_page(page(vec![event(0)], 1, true));
        sub.on_confirmation(SubscriptionConfirmation {
            last_commit_position: 5,
            last_event_number: Some(0),
        });
        sub.on_read_page(page(vec![], 1, true));

        let actions = sub.stop();
        assert_eq!(
            steps(actions),
            vec![Step::Unsubscribe, Step::Dropped(DropReason::Unsubscribed)]
        );
        assert!(sub.on_event_appeared(event(1)).is_empty());
        assert!(sub.on_failed(DropReason::ConnectionLost).is_empty());
    }

    #[test]
    fn all_catch_up_orders_by_position() {
        let mut sub = CatchUpSub::all(None, false, 2, 1024);
        assert_eq!(steps(sub.start()), vec![Step::Read(0)]);

        let actions = sub.on_read_page(PageResult::All {
            events: vec![all_event(1), all_event(2)],
            next_position: Position::new(3, 3),
        });
        assert_eq!(
            steps(actions),
            vec![Step::Emit(1), Step::Emit(2), Step::Read(3)]
        );

        let actions = sub.on_read_page(PageResult::All {
            events: vec![all_event(3)],
            next_position: Position::new(4, 4),
        });
        assert_eq!(steps(actions), vec![Step::Emit(3), Step::Subscribe]);

        let actions = sub.on_confirmation(SubscriptionConfirmation {
            last_commit_position: 3,
            last_event_number: None,
        });
        assert_eq!(steps(actions), vec![Step::Read(4)]);

        // Cursor is already past live start; empty page flips to live.
        let actions = sub.on_read_page(PageResult::All {
            events: vec![],
            next_position: Position::new(4, 4),
        });
        assert_eq!(steps(actions), vec![Step::Live]);

        // A replayed push at or below the last emitted position is dropped.
        assert!(sub.on_event_appeared(all_event(3)).is_empty());
        let actions = sub.on_event_appeared(all_event(4));
        assert_eq!(steps(actions), vec![Step::Emit(4)]);
    }

    #[test]
    fn volatile_flow_matches_live_only_contract() {
        let mut sub = VolatileSub::new(Some(stream_id("s")), false);
        assert!(matches!(
            sub.start().as_slice(),
            [SubAction::Subscribe { .. }]
        ));

        // Events before confirmation are ignored.
        assert!(sub.on_event_appeared(event(0)).is_empty());

        let actions = sub.on_confirmation(SubscriptionConfirmation {
            last_commit_position: 0,
            last_event_number: None,
        });
        assert_eq!(steps(actions), vec![Step::Live]);

        let actions = sub.on_event_appeared(event(0));
        assert_eq!(steps(actions), vec![Step::Emit(0)]);

        let actions = sub.stop();
        assert_eq!(
            steps(actions),
            vec![Step::Unsubscribe, Step::Dropped(DropReason::Unsubscribed)]
        );
        assert!(sub.on_event_appeared(event(1)).is_empty());
    }

    proptest! {
        /// For any historical prefix and live suffix appended during
        /// catch-up, the observer sees exactly H ++ L, in order, once each.
        #[test]
        fn catch_up_no_loss_no_duplicates(
            h_len in 0usize..20,
            l_len in 0usize..10,
            read_visible in 0usize..11,
            batch in 1u64..5,
        ) {
            let read_visible = read_visible.min(l_len);
            let mut sub = CatchUpSub::stream(stream_id("s"), None, false, batch, 1024);
            let mut emitted = Vec::new();
            let mut live_started = 0usize;

            // The log as the read phase sees it while paging history.
            let mut log: Vec<u64> = (0..h_len as u64).collect();

            let mut queue: VecDeque<SubAction> = sub.start().into();
            let mut subscribed = false;
            while let Some(action) = queue.pop_front() {
                match action {
                    SubAction::Read(ReadPage::Stream { from, count, .. }) => {
                        let from = from as usize;
                        let take = (count as usize).min(log.len().saturating_sub(from));
                        let events: Vec<ResolvedEvent> =
                            log[from..from + take].iter().map(|n| event(*n)).collect();
                        let next = (from + take) as u64;
                        let end = from + take >= log.len();
                        queue.extend(sub.on_read_page(page(events, next, end)));
                    }
                    SubAction::Emit(ev) => emitted.push(ev.original_number()),
                    SubAction::LiveStarted => live_started += 1,
                    SubAction::Subscribe { .. } => {
                        prop_assert!(!subscribed);
                        subscribed = true;
                        // Confirmation snapshots the end of history; then the
                        // live suffix lands: `read_visible` of them become
                        // readable, all of them are pushed.
                        let last = log.last().copied();
                        for number in h_len as u64..(h_len + read_visible) as u64 {
                            log.push(number);
                        }
                        let mut follow = sub.on_confirmation(SubscriptionConfirmation {
                            last_commit_position: 0,
                            last_event_number: last,
                        });
                        for number in h_len as u64..(h_len + l_len) as u64 {
                            follow.extend(sub.on_event_appeared(event(number)));
                        }
                        queue.extend(follow);
                    }
                    other => prop_assert!(
                        false,
                        "unexpected action during catch-up: {other:?}"
                    ),
                }
            }

            let expected: Vec<u64> = (0..(h_len + l_len) as u64).collect();
            prop_assert_eq!(emitted, expected);
            prop_assert_eq!(live_started, 1);
        }
    }
}
