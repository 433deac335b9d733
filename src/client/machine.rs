//! Connection lifecycle state machine.
//!
//! Pure state: the driver feeds it socket and timer facts and applies the
//! actions it returns. Owns heartbeat bookkeeping, the reconnect budget and
//! backoff, and the outbound stash used while no socket is up.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::Settings;

use super::command::MessageKind;
use super::packet::Packet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnPhase {
    Idle,
    Connecting,
    Connected,
    Terminated,
}

#[derive(Debug)]
pub(crate) enum ConnAction {
    /// Resolve an endpoint and spawn a connect attempt.
    Connect,
    /// Write this packet to the socket.
    Send(Packet),
    /// Hand this packet to the dispatcher / subscription registry.
    Deliver(Packet),
    /// Tear the current socket down.
    CloseSocket,
    /// The reconnect budget is spent: fail everything outstanding.
    Terminate,
    /// A stashed packet was evicted (overflow) or refused (terminated); its
    /// owner must be failed with `ConnectionLost`.
    EvictStashed(Packet),
}

pub(crate) struct ConnectionMachine {
    phase: ConnPhase,
    heartbeat: HeartbeatState,
    backoff: Backoff,
    budget: ReconnectBudget,
    stash: VecDeque<Packet>,
    stash_limit: usize,
    retry_at: Option<Instant>,
}

impl ConnectionMachine {
    pub fn new(settings: &Settings, now: Instant) -> Self {
        Self {
            phase: ConnPhase::Idle,
            heartbeat: HeartbeatState::new(
                settings.heartbeat.interval(),
                settings.heartbeat.timeout(),
                now,
            ),
            backoff: Backoff::new(
                settings.reconnection_delay.min(),
                settings.reconnection_delay.max(),
            ),
            budget: ReconnectBudget::new(settings.max_reconnections),
            stash: VecDeque::new(),
            stash_limit: settings.stash_limit.max(1),
            retry_at: None,
        }
    }

    pub fn phase(&self) -> ConnPhase {
        self.phase
    }

    pub fn start(&mut self) -> Vec<ConnAction> {
        if self.phase != ConnPhase::Idle {
            return Vec::new();
        }
        self.phase = ConnPhase::Connecting;
        vec![ConnAction::Connect]
    }

    pub fn on_connected(&mut self, now: Instant) -> Vec<ConnAction> {
        if self.phase != ConnPhase::Connecting {
            return Vec::new();
        }
        self.phase = ConnPhase::Connected;
        self.budget.reset();
        self.backoff.reset();
        self.retry_at = None;
        self.heartbeat.reset(now);
        // Flush in enqueue order.
        self.stash.drain(..).map(ConnAction::Send).collect()
    }

    pub fn on_connect_failed(&mut self, now: Instant) -> Vec<ConnAction> {
        if self.phase != ConnPhase::Connecting {
            return Vec::new();
        }
        self.begin_reconnect(now, false)
    }

    pub fn on_socket_closed(&mut self, now: Instant) -> Vec<ConnAction> {
        if self.phase != ConnPhase::Connected {
            return Vec::new();
        }
        self.begin_reconnect(now, true)
    }

    pub fn on_outbound(&mut self, packet: Packet) -> Vec<ConnAction> {
        match self.phase {
            ConnPhase::Connected => vec![ConnAction::Send(packet)],
            ConnPhase::Idle | ConnPhase::Connecting => {
                self.stash.push_back(packet);
                if self.stash.len() > self.stash_limit {
                    let evicted = self.stash.pop_front().expect("stash non-empty");
                    tracing::warn!(
                        correlation = %evicted.correlation,
                        "outbound stash overflow, failing oldest packet"
                    );
                    return vec![ConnAction::EvictStashed(evicted)];
                }
                Vec::new()
            }
            ConnPhase::Terminated => vec![ConnAction::EvictStashed(packet)],
        }
    }

    /// Remove stashed packets whose owners have already been failed.
    pub fn purge_stashed(&mut self, correlations: &[Uuid]) {
        if correlations.is_empty() {
            return;
        }
        self.stash
            .retain(|packet| !correlations.contains(&packet.correlation));
    }

    pub fn on_inbound(&mut self, packet: Packet, now: Instant) -> Vec<ConnAction> {
        if self.phase != ConnPhase::Connected {
            tracing::debug!(kind = ?packet.kind, "dropping inbound packet while not connected");
            return Vec::new();
        }
        self.heartbeat.on_activity(now);
        match packet.kind {
            MessageKind::HeartbeatRequest => {
                vec![ConnAction::Send(Packet::heartbeat_response(
                    packet.correlation,
                ))]
            }
            MessageKind::Ping => vec![ConnAction::Send(Packet::pong(packet.correlation))],
            MessageKind::HeartbeatResponse | MessageKind::Pong => {
                if !self.heartbeat.clear_probe(packet.correlation) {
                    tracing::debug!(
                        correlation = %packet.correlation,
                        "ignoring liveness reply that matches no outstanding probe"
                    );
                }
                Vec::new()
            }
            _ => vec![ConnAction::Deliver(packet)],
        }
    }

    pub fn on_tick(&mut self, now: Instant) -> Vec<ConnAction> {
        match self.phase {
            ConnPhase::Connecting => {
                if let Some(retry_at) = self.retry_at
                    && now >= retry_at
                {
                    self.retry_at = None;
                    return vec![ConnAction::Connect];
                }
                Vec::new()
            }
            ConnPhase::Connected => match self.heartbeat.on_tick(now) {
                HeartbeatVerdict::Quiet => Vec::new(),
                HeartbeatVerdict::Probe(correlation) => {
                    vec![ConnAction::Send(Packet::heartbeat_request(correlation))]
                }
                HeartbeatVerdict::TimedOut => {
                    tracing::warn!("heartbeat timed out, recycling connection");
                    self.begin_reconnect(now, true)
                }
            },
            ConnPhase::Idle | ConnPhase::Terminated => Vec::new(),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            ConnPhase::Connecting => self.retry_at,
            ConnPhase::Connected => Some(self.heartbeat.next_deadline()),
            ConnPhase::Idle | ConnPhase::Terminated => None,
        }
    }

    fn begin_reconnect(&mut self, now: Instant, close_socket: bool) -> Vec<ConnAction> {
        let mut actions = Vec::new();
        if close_socket {
            actions.push(ConnAction::CloseSocket);
        }
        if self.budget.consume() {
            let delay = self.backoff.next_delay();
            tracing::info!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            self.retry_at = Some(now + delay);
            self.phase = ConnPhase::Connecting;
        } else {
            tracing::warn!("reconnect budget exhausted, terminating connection");
            self.phase = ConnPhase::Terminated;
            for packet in self.stash.drain(..) {
                actions.push(ConnAction::EvictStashed(packet));
            }
            actions.push(ConnAction::Terminate);
        }
        actions
    }
}

enum HeartbeatVerdict {
    Quiet,
    Probe(Uuid),
    TimedOut,
}

struct HeartbeatState {
    interval: Duration,
    timeout: Duration,
    last_activity: Instant,
    /// Outstanding probe: correlation id and when it expires.
    probe: Option<(Uuid, Instant)>,
}

impl HeartbeatState {
    fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            last_activity: now,
            probe: None,
        }
    }

    fn reset(&mut self, now: Instant) {
        self.last_activity = now;
        self.probe = None;
    }

    fn on_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    fn clear_probe(&mut self, correlation: Uuid) -> bool {
        match self.probe {
            Some((expected, _)) if expected == correlation => {
                self.probe = None;
                true
            }
            _ => false,
        }
    }

    fn on_tick(&mut self, now: Instant) -> HeartbeatVerdict {
        if let Some((_, due)) = self.probe {
            if now >= due {
                self.probe = None;
                return HeartbeatVerdict::TimedOut;
            }
            return HeartbeatVerdict::Quiet;
        }
        if now.duration_since(self.last_activity) >= self.interval {
            let correlation = Uuid::new_v4();
            self.probe = Some((correlation, now + self.timeout));
            return HeartbeatVerdict::Probe(correlation);
        }
        HeartbeatVerdict::Quiet
    }

    fn next_deadline(&self) -> Instant {
        match self.probe {
            Some((_, due)) => due,
            None => self.last_activity + self.interval,
        }
    }
}

struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, next: min }
    }

    fn reset(&mut self) {
        self.next = self.min;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

enum ReconnectBudget {
    Infinite,
    Limited { remaining: u32, initial: u32 },
}

impl ReconnectBudget {
    fn new(max_reconnections: i32) -> Self {
        if max_reconnections < 0 {
            ReconnectBudget::Infinite
        } else {
            ReconnectBudget::Limited {
                remaining: max_reconnections as u32,
                initial: max_reconnections as u32,
            }
        }
    }

    fn consume(&mut self) -> bool {
        match self {
            ReconnectBudget::Infinite => true,
            ReconnectBudget::Limited { remaining, .. } => {
                if *remaining == 0 {
                    false
                } else {
                    *remaining -= 1;
                    true
                }
            }
        }
    }

    fn reset(&mut self) {
        if let ReconnectBudget::Limited { remaining, initial } = self {
            *remaining = *initial;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn settings() -> Settings {
        Settings {
            max_reconnections: 2,
            ..Settings::default()
        }
    }

    fn packet(tag: u8) -> Packet {
        Packet::new(
            MessageKind::WriteEvents,
            Uuid::from_bytes([tag; 16]),
            Bytes::new(),
        )
    }

    fn connect(machine: &mut ConnectionMachine, now: Instant) {
        let actions = machine.start();
        assert!(matches!(actions.as_slice(), [ConnAction::Connect]));
        machine.on_connected(now);
        assert_eq!(machine.phase(), ConnPhase::Connected);
    }

    #[test]
    fn stash_flushes_in_enqueue_order_on_connect() {
        let now = Instant::now();
        let mut machine = ConnectionMachine::new(&settings(), now);
        machine.start();

        assert!(machine.on_outbound(packet(1)).is_empty());
        assert!(machine.on_outbound(packet(2)).is_empty());

        let actions = machine.on_connected(now);
        let sent: Vec<u8> = actions
            .iter()
            .map(|a| match a {
                ConnAction::Send(p) => p.correlation.as_bytes()[0],
                other => panic!("expected send, got {other:?}"),
            })
            .collect();
        assert_eq!(sent, vec![1, 2]);
    }

    #[test]
    fn stash_overflow_evicts_oldest() {
        let now = Instant::now();
        let mut settings = settings();
        settings.stash_limit = 2;
        let mut machine = ConnectionMachine::new(&settings, now);
        machine.start();

        assert!(machine.on_outbound(packet(1)).is_empty());
        assert!(machine.on_outbound(packet(2)).is_empty());
        let actions = machine.on_outbound(packet(3));
        match actions.as_slice() {
            [ConnAction::EvictStashed(evicted)] => {
                assert_eq!(evicted.correlation.as_bytes()[0], 1);
            }
            other => panic!("expected eviction, got {other:?}"),
        }
    }

    #[test]
    fn heartbeat_probe_then_timeout_recycles_connection() {
        let t0 = Instant::now();
        let mut machine = ConnectionMachine::new(&settings(), t0);
        connect(&mut machine, t0);

        // Quiet until the interval elapses.
        assert!(machine.on_tick(t0 + Duration::from_millis(499)).is_empty());

        let actions = machine.on_tick(t0 + Duration::from_millis(500));
        let probe = match actions.as_slice() {
            [ConnAction::Send(p)] => {
                assert_eq!(p.kind, MessageKind::HeartbeatRequest);
                p.correlation
            }
            other => panic!("expected probe, got {other:?}"),
        };

        // A reply with the wrong correlation is ignored; the probe stands.
        machine.on_inbound(
            Packet::heartbeat_response(Uuid::new_v4()),
            t0 + Duration::from_millis(600),
        );

        // interval + timeout of total silence: the connection recycles.
        let actions = machine.on_tick(t0 + Duration::from_millis(5_500));
        assert!(matches!(actions.first(), Some(ConnAction::CloseSocket)));
        assert_eq!(machine.phase(), ConnPhase::Connecting);
        let _ = probe;
    }

    #[test]
    fn heartbeat_reply_clears_probe() {
        let t0 = Instant::now();
        let mut machine = ConnectionMachine::new(&settings(), t0);
        connect(&mut machine, t0);

        let actions = machine.on_tick(t0 + Duration::from_millis(500));
        let probe = match actions.as_slice() {
            [ConnAction::Send(p)] => p.correlation,
            other => panic!("expected probe, got {other:?}"),
        };

        machine.on_inbound(
            Packet::heartbeat_response(probe),
            t0 + Duration::from_millis(600),
        );
        // Well past the old probe's deadline, but it was answered.
        let actions = machine.on_tick(t0 + Duration::from_millis(1_050));
        match actions.as_slice() {
            [] => {}
            [ConnAction::Send(p)] => assert_eq!(p.kind, MessageKind::HeartbeatRequest),
            other => panic!("unexpected actions {other:?}"),
        }
        assert_eq!(machine.phase(), ConnPhase::Connected);
    }

    #[test]
    fn inbound_heartbeat_request_is_answered_not_delivered() {
        let t0 = Instant::now();
        let mut machine = ConnectionMachine::new(&settings(), t0);
        connect(&mut machine, t0);

        let correlation = Uuid::new_v4();
        let actions = machine.on_inbound(Packet::heartbeat_request(correlation), t0);
        match actions.as_slice() {
            [ConnAction::Send(reply)] => {
                assert_eq!(reply.kind, MessageKind::HeartbeatResponse);
                assert_eq!(reply.correlation, correlation);
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let t0 = Instant::now();
        let mut machine = ConnectionMachine::new(&settings(), t0);
        connect(&mut machine, t0);

        let correlation = Uuid::new_v4();
        let actions = machine.on_inbound(
            Packet::new(MessageKind::Ping, correlation, Bytes::new()),
            t0,
        );
        match actions.as_slice() {
            [ConnAction::Send(reply)] => {
                assert_eq!(reply.kind, MessageKind::Pong);
                assert_eq!(reply.correlation, correlation);
            }
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[test]
    fn budget_exhaustion_terminates_and_evicts_stash() {
        let t0 = Instant::now();
        let mut settings = settings();
        settings.max_reconnections = 1;
        let mut machine = ConnectionMachine::new(&settings, t0);
        machine.start();
        machine.on_outbound(packet(9));

        // First failure consumes the single reconnection.
        let actions = machine.on_connect_failed(t0);
        assert!(actions.is_empty());
        assert_eq!(machine.phase(), ConnPhase::Connecting);

        // Second failure exhausts the budget.
        machine.on_tick(t0 + Duration::from_secs(60));
        let actions = machine.on_connect_failed(t0 + Duration::from_secs(61));
        assert_eq!(machine.phase(), ConnPhase::Terminated);
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, ConnAction::EvictStashed(_)))
        );
        assert!(actions.iter().any(|a| matches!(a, ConnAction::Terminate)));

        // Further submissions fail immediately.
        let actions = machine.on_outbound(packet(4));
        assert!(matches!(actions.as_slice(), [ConnAction::EvictStashed(_)]));
    }

    #[test]
    fn budget_resets_on_successful_connect() {
        let t0 = Instant::now();
        let mut settings = settings();
        settings.max_reconnections = 1;
        let mut machine = ConnectionMachine::new(&settings, t0);
        machine.start();
        machine.on_connect_failed(t0);
        machine.on_tick(t0 + Duration::from_secs(60));
        machine.on_connected(t0 + Duration::from_secs(60));

        // Budget is back: the next drop schedules a retry instead of dying.
        machine.on_socket_closed(t0 + Duration::from_secs(70));
        assert_eq!(machine.phase(), ConnPhase::Connecting);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_millis(1000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }
}
