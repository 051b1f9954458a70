//! Connection lifecycle manager.
//!
//! Owns the single peer-connection slot and every decision around it:
//! election outcomes, signal exchange over the broadcast channel, retry
//! after failure and teardown. It performs no I/O scheduling of its own;
//! the participant runtime feeds it messages, ticks and deadlines together
//! with the current instant, which keeps every transition reproducible.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use transport_bus::BusMessage;

use crate::channel::ParticipantId;
use crate::config::ChatConfig;
use crate::election::{self, ElectionState, Presence, PresenceDecision};
use crate::envelope::{SignalEnvelope, SignalPayload};
use crate::error::{ChatError, ChatResult};
use crate::events::{
    ChatEvent, ChatMessage, MessageOrigin, NOTICE_CLOSED, NOTICE_CONNECTED, NOTICE_ERROR,
    NOTICE_GAVE_UP, NOTICE_STALLED, NOTICE_STARTED,
};
use crate::peer::{
    ConnectionId, PeerConnector, PeerEvent, PeerEventSink, PeerLink, PeerNotice, Role,
};
use crate::throttle::SignalThrottle;
use crate::transport::ChannelPublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Created but never handed to a transport, e.g. the connector refused it.
    New,
    Negotiating,
    Connected,
    Closed,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub role: Role,
    pub status: ConnectionStatus,
    pub created_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSnapshot {
    pub participant: ParticipantId,
    pub state: ElectionState,
    pub connection: Option<ConnectionInfo>,
    pub last_finished: Option<ConnectionInfo>,
    pub pending_signals: usize,
    pub connections_created: u64,
    pub reconnect_due: Option<Instant>,
}

struct PeerConnection {
    id: ConnectionId,
    role: Role,
    created_at: Instant,
    link: Box<dyn PeerLink>,
}

impl PeerConnection {
    fn info(&self, status: ConnectionStatus) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            role: self.role,
            status,
            created_at: self.created_at,
        }
    }
}

enum ConnectionSlot {
    Empty,
    Negotiating(PeerConnection),
    Connected(PeerConnection),
}

impl ConnectionSlot {
    fn is_active(&self) -> bool {
        !matches!(self, ConnectionSlot::Empty)
    }

    fn current(&self) -> Option<&PeerConnection> {
        match self {
            ConnectionSlot::Empty => None,
            ConnectionSlot::Negotiating(conn) | ConnectionSlot::Connected(conn) => Some(conn),
        }
    }

    fn current_mut(&mut self) -> Option<&mut PeerConnection> {
        match self {
            ConnectionSlot::Empty => None,
            ConnectionSlot::Negotiating(conn) | ConnectionSlot::Connected(conn) => Some(conn),
        }
    }

    fn info(&self) -> Option<ConnectionInfo> {
        match self {
            ConnectionSlot::Empty => None,
            ConnectionSlot::Negotiating(conn) => Some(conn.info(ConnectionStatus::Negotiating)),
            ConnectionSlot::Connected(conn) => Some(conn.info(ConnectionStatus::Connected)),
        }
    }

    fn take(&mut self) -> Option<PeerConnection> {
        match std::mem::replace(self, ConnectionSlot::Empty) {
            ConnectionSlot::Empty => None,
            ConnectionSlot::Negotiating(conn) | ConnectionSlot::Connected(conn) => Some(conn),
        }
    }

    /// Takes the negotiating connection, leaving any other slot untouched.
    fn take_negotiating(&mut self) -> Result<PeerConnection, ConnectionSlot> {
        match std::mem::replace(self, ConnectionSlot::Empty) {
            ConnectionSlot::Negotiating(conn) => Ok(conn),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
struct Reconnect {
    due: Instant,
    role: Role,
}

pub struct LifecycleManager {
    config: ChatConfig,
    publisher: ChannelPublisher,
    connector: Arc<dyn PeerConnector>,
    peer_tx: mpsc::UnboundedSender<PeerNotice>,
    events: mpsc::UnboundedSender<ChatEvent>,
    throttle: SignalThrottle<SignalEnvelope>,
    slot: ConnectionSlot,
    phase: Phase,
    reconnect: Option<Reconnect>,
    failures: u32,
    next_connection: u64,
    connections_created: u64,
    last_finished: Option<ConnectionInfo>,
    reported: ElectionState,
}

impl LifecycleManager {
    pub fn new(
        config: ChatConfig,
        publisher: ChannelPublisher,
        connector: Arc<dyn PeerConnector>,
        peer_tx: mpsc::UnboundedSender<PeerNotice>,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> Self {
        let throttle = SignalThrottle::new(config.throttle_interval);
        Self {
            config,
            publisher,
            connector,
            peer_tx,
            events,
            throttle,
            slot: ConnectionSlot::Empty,
            phase: Phase::NotStarted,
            reconnect: None,
            failures: 0,
            next_connection: 0,
            connections_created: 0,
            last_finished: None,
            reported: ElectionState::Idle,
        }
    }

    pub fn state(&self) -> ElectionState {
        if self.phase != Phase::Running {
            return ElectionState::Idle;
        }
        match &self.slot {
            ConnectionSlot::Empty => ElectionState::AwaitingPeers,
            ConnectionSlot::Negotiating(conn) => ElectionState::for_role(conn.role),
            ConnectionSlot::Connected(_) => ElectionState::Connected,
        }
    }

    pub fn snapshot(&self) -> ParticipantSnapshot {
        ParticipantSnapshot {
            participant: self.publisher.participant().clone(),
            state: self.state(),
            connection: self.slot.info(),
            last_finished: self.last_finished,
            pending_signals: self.throttle.pending(),
            connections_created: self.connections_created,
            reconnect_due: self.reconnect.map(|r| r.due),
        }
    }

    pub fn start(&mut self, _now: Instant) {
        if self.phase != Phase::NotStarted {
            return;
        }
        self.phase = Phase::Running;
        info!(
            target = "tabchat.lifecycle",
            topic = %self.publisher.topic(),
            participant = %self.publisher.participant(),
            "starting chat participant"
        );
        self.notify(NOTICE_STARTED);
        self.publish(SignalEnvelope::PresenceCheck);
        self.sync_status();
    }

    /// Earliest instant at which [`LifecycleManager::on_deadline`] has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        let reconnect = self.reconnect.map(|r| r.due);
        match (reconnect, self.negotiation_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn negotiation_deadline(&self) -> Option<Instant> {
        let timeout = self.config.negotiation_timeout?;
        match &self.slot {
            ConnectionSlot::Negotiating(conn) => Some(conn.created_at + timeout),
            _ => None,
        }
    }

    pub fn on_broadcast(&mut self, now: Instant, message: BusMessage) {
        if self.phase != Phase::Running {
            return;
        }
        if message.origin == self.publisher.participant().as_str() {
            trace!(target = "tabchat.transport", "dropping self-originated envelope");
            return;
        }
        let envelope = match SignalEnvelope::decode_broadcast(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    target = "tabchat.transport",
                    origin = %message.origin,
                    error = %err,
                    "dropping malformed broadcast envelope"
                );
                return;
            }
        };
        match self.throttle.admit(now, envelope) {
            Some(envelope) => self.process(now, envelope),
            None => debug!(
                target = "tabchat.throttle",
                pending = self.throttle.pending(),
                "envelope queued"
            ),
        }
    }

    pub fn on_drain_tick(&mut self, now: Instant) {
        if self.phase != Phase::Running {
            return;
        }
        if let Some(envelope) = self.throttle.drain_one(now) {
            trace!(
                target = "tabchat.throttle",
                kind = envelope.kind(),
                remaining = self.throttle.pending(),
                "draining queued envelope"
            );
            self.process(now, envelope);
        }
    }

    pub fn on_presence_tick(&mut self, _now: Instant) {
        if self.phase == Phase::Running && election::should_announce(self.state()) {
            self.publish(SignalEnvelope::PresenceCheck);
        }
    }

    fn process(&mut self, now: Instant, envelope: SignalEnvelope) {
        match envelope {
            SignalEnvelope::PresenceCheck => {
                match election::decide(self.state(), Presence::Check) {
                    PresenceDecision::BecomeResponder => {
                        info!(target = "tabchat.election", "peer found, joining as responder");
                        if self.create_connection(Role::Responder, now).is_ok() {
                            self.publish(SignalEnvelope::PresenceResponse);
                        }
                    }
                    _ => trace!(target = "tabchat.election", "presence check ignored"),
                }
            }
            SignalEnvelope::PresenceResponse => {
                match election::decide(self.state(), Presence::Response) {
                    PresenceDecision::BecomeInitiator => {
                        info!(target = "tabchat.election", "peer answered, becoming initiator");
                        match self.create_connection(Role::Initiator, now) {
                            Ok(id) => debug!(
                                target = "tabchat.election",
                                connection = %id,
                                "initiator connection started"
                            ),
                            Err(err) => debug!(
                                target = "tabchat.election",
                                error = %err,
                                "initiator connection not started"
                            ),
                        }
                    }
                    _ => trace!(target = "tabchat.election", "presence response ignored"),
                }
            }
            SignalEnvelope::Signal(payload) => self.on_signal(now, payload),
            SignalEnvelope::ChatData(_) => {
                debug!(target = "tabchat.transport", "chat data on broadcast channel ignored")
            }
        }
        self.sync_status();
    }

    fn on_signal(&mut self, now: Instant, payload: SignalPayload) {
        if !self.slot.is_active() && self.create_connection(Role::Responder, now).is_err() {
            return;
        }
        if let Some(conn) = self.slot.current_mut() {
            if let Err(err) = conn.link.signal(payload) {
                warn!(
                    target = "tabchat.lifecycle",
                    connection = %conn.id,
                    error = %err,
                    "peer rejected signal"
                );
            }
        }
    }

    /// Open a connection in `role` unless one is already negotiating or
    /// connected.
    pub fn create_connection(&mut self, role: Role, now: Instant) -> ChatResult<ConnectionId> {
        if self.phase != Phase::Running {
            return Err(ChatError::ClosedChannel);
        }
        if self.slot.is_active() {
            debug!(
                target = "tabchat.lifecycle",
                %role,
                "connection already active, not creating another"
            );
            return Err(ChatError::CreateConnectionRejected);
        }
        self.next_connection += 1;
        let id = ConnectionId(self.next_connection);
        let sink = PeerEventSink::new(id, self.peer_tx.clone());
        match self.connector.connect(role, sink) {
            Ok(link) => {
                self.connections_created += 1;
                info!(
                    target = "tabchat.lifecycle",
                    connection = %id,
                    %role,
                    "creating peer connection"
                );
                self.slot = ConnectionSlot::Negotiating(PeerConnection {
                    id,
                    role,
                    created_at: now,
                    link,
                });
                self.sync_status();
                Ok(id)
            }
            Err(err) => {
                warn!(
                    target = "tabchat.lifecycle",
                    connection = %id,
                    %role,
                    error = %err,
                    "peer connection setup failed"
                );
                self.last_finished = Some(ConnectionInfo {
                    id,
                    role,
                    status: ConnectionStatus::New,
                    created_at: now,
                });
                self.notify(NOTICE_ERROR);
                self.schedule_reconnect(role, now);
                Err(ChatError::ConnectionSetupFailure(err.to_string()))
            }
        }
    }

    pub fn on_peer_notice(&mut self, now: Instant, notice: PeerNotice) {
        if self.phase != Phase::Running {
            return;
        }
        let current = self.slot.current().map(|conn| conn.id);
        if current != Some(notice.connection) {
            trace!(
                target = "tabchat.lifecycle",
                connection = %notice.connection,
                "ignoring event from stale connection"
            );
            return;
        }
        match notice.event {
            PeerEvent::Signal(payload) => {
                debug!(
                    target = "tabchat.lifecycle",
                    connection = %notice.connection,
                    "publishing local signal data"
                );
                self.publish(SignalEnvelope::Signal(payload));
            }
            PeerEvent::Connected => self.mark_connected(),
            PeerEvent::Data(bytes) => self.on_data(&bytes),
            PeerEvent::Error(reason) => self.finish(now, ConnectionStatus::Errored, &reason),
            PeerEvent::Closed => self.finish(now, ConnectionStatus::Closed, "closed by peer"),
        }
        self.sync_status();
    }

    fn mark_connected(&mut self) {
        self.slot = match self.slot.take_negotiating() {
            Ok(conn) => {
                info!(
                    target = "tabchat.lifecycle",
                    connection = %conn.id,
                    role = %conn.role,
                    "peer connected"
                );
                self.failures = 0;
                self.reconnect = None;
                self.notify(NOTICE_CONNECTED);
                ConnectionSlot::Connected(conn)
            }
            Err(unchanged) => unchanged,
        };
    }

    fn on_data(&mut self, bytes: &[u8]) {
        match SignalEnvelope::decode_chat(bytes) {
            Ok(SignalEnvelope::ChatData(text)) => {
                self.emit(ChatEvent::Message(ChatMessage::new(text, MessageOrigin::Peer)));
            }
            Ok(_) => {}
            Err(err) => warn!(
                target = "tabchat.lifecycle",
                error = %err,
                "dropping malformed peer payload"
            ),
        }
    }

    fn finish(&mut self, now: Instant, status: ConnectionStatus, reason: &str) {
        let Some(mut conn) = self.slot.take() else {
            return;
        };
        conn.link.close();
        self.last_finished = Some(conn.info(status));
        if status == ConnectionStatus::Errored {
            warn!(
                target = "tabchat.lifecycle",
                connection = %conn.id,
                reason,
                "peer connection failed"
            );
            self.notify(NOTICE_ERROR);
        } else {
            info!(
                target = "tabchat.lifecycle",
                connection = %conn.id,
                reason,
                "peer connection closed"
            );
            self.notify(NOTICE_CLOSED);
        }
        self.schedule_reconnect(conn.role, now);
    }

    fn schedule_reconnect(&mut self, role: Role, now: Instant) {
        self.failures += 1;
        if let Some(limit) = self.config.reconnect_limit {
            if self.failures > limit {
                warn!(
                    target = "tabchat.lifecycle",
                    limit,
                    "reconnect limit reached, waiting for presence instead"
                );
                self.failures = 0;
                self.reconnect = None;
                self.notify(NOTICE_GAVE_UP);
                return;
            }
        }
        let due = now + self.config.reconnect_delay;
        debug!(
            target = "tabchat.lifecycle",
            %role,
            attempt = self.failures,
            delay_ms = self.config.reconnect_delay.as_millis() as u64,
            "reconnect scheduled"
        );
        self.reconnect = Some(Reconnect { due, role });
    }

    pub fn on_deadline(&mut self, now: Instant) {
        if self.phase != Phase::Running {
            return;
        }
        if let Some(reconnect) = self.reconnect.filter(|r| r.due <= now) {
            self.reconnect = None;
            match self.create_connection(reconnect.role, now) {
                Ok(id) => debug!(
                    target = "tabchat.lifecycle",
                    connection = %id,
                    "reconnect attempt started"
                ),
                Err(ChatError::CreateConnectionRejected) => debug!(
                    target = "tabchat.lifecycle",
                    "reconnect skipped, a connection is already active"
                ),
                Err(_) => {}
            }
        }
        if self.negotiation_deadline().is_some_and(|deadline| deadline <= now) {
            if let Some(mut conn) = self.slot.take() {
                warn!(
                    target = "tabchat.lifecycle",
                    connection = %conn.id,
                    role = %conn.role,
                    "negotiation stalled, abandoning connection"
                );
                conn.link.close();
                self.last_finished = Some(conn.info(ConnectionStatus::Closed));
                self.notify(NOTICE_STALLED);
            }
        }
        self.sync_status();
    }

    /// Echo `text` locally and hand it to the connected peer.
    pub fn send_text(&mut self, text: &str) -> ChatResult<()> {
        if self.phase != Phase::Running {
            return Err(ChatError::ClosedChannel);
        }
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.emit(ChatEvent::Message(ChatMessage::new(text, MessageOrigin::Local)));
        let ConnectionSlot::Connected(conn) = &mut self.slot else {
            debug!(target = "tabchat.lifecycle", "no connected peer, message not sent");
            return Err(ChatError::NoActivePeer);
        };
        let payload = SignalEnvelope::ChatData(text.to_string()).encode()?;
        if let Err(err) = conn.link.send(payload) {
            warn!(
                target = "tabchat.lifecycle",
                connection = %conn.id,
                error = %err,
                "failed to send chat message"
            );
        }
        Ok(())
    }

    /// Close the connection and the broadcast channel. Safe to call twice.
    pub fn teardown(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        if let Some(mut conn) = self.slot.take() {
            conn.link.close();
            self.last_finished = Some(conn.info(ConnectionStatus::Closed));
        }
        self.reconnect = None;
        self.throttle.clear();
        self.publisher.close();
        self.phase = Phase::Stopped;
        info!(
            target = "tabchat.lifecycle",
            topic = %self.publisher.topic(),
            "chat participant torn down"
        );
        self.sync_status();
    }

    fn publish(&self, envelope: SignalEnvelope) {
        if let Err(err) = self.publisher.publish(&envelope) {
            warn!(
                target = "tabchat.transport",
                kind = envelope.kind(),
                error = %err,
                "failed to publish envelope"
            );
        }
    }

    fn notify(&self, text: &str) {
        self.emit(ChatEvent::Message(ChatMessage::new(text, MessageOrigin::System)));
    }

    fn emit(&self, event: ChatEvent) {
        // The UI may have stopped listening; the protocol keeps running.
        let _ = self.events.send(event);
    }

    fn sync_status(&mut self) {
        let state = self.state();
        if state != self.reported {
            debug!(
                target = "tabchat.election",
                from = ?self.reported,
                to = ?state,
                "state changed"
            );
            self.reported = state;
            self.emit(ChatEvent::Status(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use transport_bus::LocalBus;

    use super::*;
    use crate::channel::ChannelId;
    use crate::peer::memory::MemoryNetwork;
    use crate::transport::{ChannelSubscription, open_channel};

    const LOCAL: &str = "local";
    const REMOTE: &str = "remote";

    fn secs(value: f64) -> Duration {
        Duration::from_secs_f64(value)
    }

    struct RemotePeer {
        link: Box<dyn PeerLink>,
        rx: mpsc::UnboundedReceiver<PeerNotice>,
    }

    impl RemotePeer {
        fn next_event(&mut self) -> Option<PeerEvent> {
            self.rx.try_recv().ok().map(|notice| notice.event)
        }
    }

    struct Harness {
        manager: LifecycleManager,
        network: MemoryNetwork,
        remote_sub: ChannelSubscription,
        peer_rx: mpsc::UnboundedReceiver<PeerNotice>,
        events_rx: mpsc::UnboundedReceiver<ChatEvent>,
        t0: Instant,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(ChatConfig::default())
        }

        fn with_config(config: ChatConfig) -> Self {
            let bus = Arc::new(LocalBus::new());
            let channel = ChannelId::new("alpha").unwrap();
            let network = MemoryNetwork::new();
            let (publisher, _own_sub) = open_channel(
                bus.clone(),
                &channel,
                &config.channel_prefix,
                ParticipantId::from(LOCAL),
            )
            .unwrap();
            let (_remote_pub, remote_sub) = open_channel(
                bus,
                &channel,
                &config.channel_prefix,
                ParticipantId::from(REMOTE),
            )
            .unwrap();
            let (peer_tx, peer_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let manager = LifecycleManager::new(
                config,
                publisher,
                Arc::new(network.connector(LOCAL)),
                peer_tx,
                events_tx,
            );
            Self {
                manager,
                network,
                remote_sub,
                peer_rx,
                events_rx,
                t0: Instant::now(),
            }
        }

        fn started() -> Self {
            let mut harness = Self::new();
            harness.manager.start(harness.t0);
            harness.published();
            harness.events();
            harness
        }

        fn at(&self, offset: f64) -> Instant {
            self.t0 + secs(offset)
        }

        fn deliver(&mut self, offset: f64, envelope: SignalEnvelope) {
            let now = self.at(offset);
            self.manager.on_broadcast(now, message(REMOTE, &envelope));
            self.pump(offset);
        }

        fn pump(&mut self, offset: f64) {
            let now = self.at(offset);
            while let Ok(notice) = self.peer_rx.try_recv() {
                self.manager.on_peer_notice(now, notice);
            }
        }

        /// Envelopes the manager put on the broadcast channel since the last call.
        fn published(&mut self) -> Vec<SignalEnvelope> {
            let mut out = Vec::new();
            while let Ok(Some(message)) = self.remote_sub.try_recv() {
                if message.origin == LOCAL {
                    out.push(SignalEnvelope::decode_broadcast(&message.payload).unwrap());
                }
            }
            out
        }

        fn events(&mut self) -> Vec<ChatEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events_rx.try_recv() {
                out.push(event);
            }
            out
        }

        fn notices(&mut self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    ChatEvent::Message(ChatMessage {
                        text,
                        origin: MessageOrigin::System,
                    }) => Some(text),
                    _ => None,
                })
                .collect()
        }

        fn remote_initiator(&self) -> (RemotePeer, SignalPayload) {
            let (tx, rx) = mpsc::unbounded_channel();
            let link = self
                .network
                .connector(REMOTE)
                .connect(Role::Initiator, PeerEventSink::new(ConnectionId(1), tx))
                .unwrap();
            let mut remote = RemotePeer { link, rx };
            let offer = match remote.next_event() {
                Some(PeerEvent::Signal(payload)) => payload,
                other => panic!("expected offer, got {other:?}"),
            };
            (remote, offer)
        }

        /// Drive the local side to Connected as responder; returns the remote end.
        fn connect_as_responder(&mut self, offset: f64) -> RemotePeer {
            self.deliver(offset, SignalEnvelope::PresenceCheck);
            assert_eq!(self.manager.state(), ElectionState::Responder);
            let (mut remote, offer) = self.remote_initiator();
            self.deliver(offset + 1.0, SignalEnvelope::Signal(offer));
            let answer = self
                .published()
                .into_iter()
                .find_map(|envelope| match envelope {
                    SignalEnvelope::Signal(payload) => Some(payload),
                    _ => None,
                })
                .expect("answer published");
            remote.link.signal(answer).unwrap();
            assert_eq!(remote.next_event(), Some(PeerEvent::Connected));
            self.pump(offset + 1.0);
            assert_eq!(self.manager.state(), ElectionState::Connected);
            let link = self.network.live_link(LOCAL).expect("local end registered");
            assert!(self.network.is_paired(link));
            self.events();
            remote
        }
    }

    fn message(origin: &str, envelope: &SignalEnvelope) -> BusMessage {
        BusMessage {
            topic: "tabchat-alpha".into(),
            origin: origin.into(),
            payload: envelope.encode().unwrap(),
        }
    }

    #[test]
    fn start_announces_presence() {
        let mut h = Harness::new();
        assert_eq!(h.manager.state(), ElectionState::Idle);
        h.manager.start(h.t0);
        assert_eq!(h.manager.state(), ElectionState::AwaitingPeers);
        assert_eq!(h.published(), vec![SignalEnvelope::PresenceCheck]);
        assert_eq!(
            h.events(),
            vec![
                ChatEvent::Message(ChatMessage::new(NOTICE_STARTED, MessageOrigin::System)),
                ChatEvent::Status(ElectionState::AwaitingPeers),
            ]
        );
    }

    #[test]
    fn presence_tick_only_announces_while_waiting() {
        let mut h = Harness::started();
        h.manager.on_presence_tick(h.at(5.0));
        assert_eq!(h.published(), vec![SignalEnvelope::PresenceCheck]);

        h.deliver(6.0, SignalEnvelope::PresenceCheck);
        h.published();
        h.manager.on_presence_tick(h.at(10.0));
        assert!(h.published().is_empty());
    }

    #[test]
    fn presence_check_makes_responder_and_replies() {
        let mut h = Harness::started();
        h.deliver(0.0, SignalEnvelope::PresenceCheck);

        assert_eq!(h.manager.state(), ElectionState::Responder);
        assert_eq!(h.published(), vec![SignalEnvelope::PresenceResponse]);
        let attempts = h.network.attempts_by(LOCAL);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].role, Role::Responder);
        assert_eq!(h.events(), vec![ChatEvent::Status(ElectionState::Responder)]);
    }

    #[test]
    fn presence_response_makes_initiator_and_publishes_offer() {
        let mut h = Harness::started();
        h.deliver(0.0, SignalEnvelope::PresenceResponse);

        assert_eq!(h.manager.state(), ElectionState::Initiator);
        let published = h.published();
        assert_eq!(published.len(), 1);
        match &published[0] {
            SignalEnvelope::Signal(payload) => assert_eq!(payload["type"], "offer"),
            other => panic!("expected offer signal, got {other:?}"),
        }
    }

    #[test]
    fn presence_ignored_while_connection_active() {
        let mut h = Harness::started();
        h.deliver(0.0, SignalEnvelope::PresenceCheck);
        h.published();

        h.deliver(1.0, SignalEnvelope::PresenceCheck);
        h.deliver(2.0, SignalEnvelope::PresenceResponse);

        assert_eq!(h.manager.state(), ElectionState::Responder);
        assert_eq!(h.network.attempts_by(LOCAL).len(), 1);
        assert!(h.published().is_empty());
    }

    #[test]
    fn every_presence_sequence_creates_at_most_one_connection() {
        for len in 1..=6u32 {
            for bits in 0..(1u32 << len) {
                let sequence: Vec<Presence> = (0..len)
                    .map(|i| {
                        if bits & (1 << i) == 0 {
                            Presence::Check
                        } else {
                            Presence::Response
                        }
                    })
                    .collect();
                let mut h = Harness::started();
                for (i, presence) in sequence.iter().enumerate() {
                    let envelope = match presence {
                        Presence::Check => SignalEnvelope::PresenceCheck,
                        Presence::Response => SignalEnvelope::PresenceResponse,
                    };
                    h.deliver(i as f64, envelope);
                }
                let attempts = h.network.attempts_by(LOCAL);
                assert_eq!(attempts.len(), 1, "sequence {sequence:?}");
                let expected = match sequence[0] {
                    Presence::Check => Role::Responder,
                    Presence::Response => Role::Initiator,
                };
                assert_eq!(attempts[0].role, expected, "sequence {sequence:?}");
                assert_eq!(h.manager.state(), ElectionState::for_role(expected));
            }
        }
    }

    #[test]
    fn signal_without_connection_creates_responder() {
        let mut h = Harness::started();
        let (_remote, offer) = h.remote_initiator();
        h.deliver(0.0, SignalEnvelope::Signal(offer));

        assert_eq!(h.manager.state(), ElectionState::Responder);
        let attempts = h.network.attempts_by(LOCAL);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].role, Role::Responder);
        match h.published().as_slice() {
            [SignalEnvelope::Signal(payload)] => assert_eq!(payload["type"], "answer"),
            other => panic!("expected a single answer, got {other:?}"),
        }
    }

    #[test]
    fn self_originated_envelopes_are_ignored() {
        let mut h = Harness::started();
        h.manager
            .on_broadcast(h.t0, message(LOCAL, &SignalEnvelope::PresenceCheck));
        assert_eq!(h.manager.state(), ElectionState::AwaitingPeers);
        assert!(h.network.attempts().is_empty());
        assert_eq!(h.manager.snapshot().pending_signals, 0);
    }

    #[test]
    fn malformed_broadcast_is_dropped_without_consuming_the_throttle() {
        let mut h = Harness::started();
        h.manager.on_broadcast(
            h.t0,
            BusMessage {
                topic: "tabchat-alpha".into(),
                origin: REMOTE.into(),
                payload: Bytes::from_static(b"not json"),
            },
        );
        assert_eq!(h.manager.state(), ElectionState::AwaitingPeers);

        h.deliver(0.0, SignalEnvelope::PresenceCheck);
        assert_eq!(h.manager.state(), ElectionState::Responder);
    }

    #[test]
    fn throttled_envelopes_wait_for_the_drain_tick() {
        let mut h = Harness::started();
        h.deliver(0.0, SignalEnvelope::PresenceResponse);
        let (_remote, offer) = h.remote_initiator();
        h.deliver(0.1, SignalEnvelope::PresenceCheck);
        h.deliver(0.2, SignalEnvelope::Signal(offer));
        assert_eq!(h.manager.snapshot().pending_signals, 2);

        h.manager.on_drain_tick(h.at(1.0));
        assert_eq!(h.manager.snapshot().pending_signals, 1);
        h.manager.on_drain_tick(h.at(2.0));
        assert_eq!(h.manager.snapshot().pending_signals, 0);
        h.manager.on_drain_tick(h.at(3.0));
        assert_eq!(h.network.attempts_by(LOCAL).len(), 1);
    }

    #[test]
    fn error_reconnects_in_same_role_after_delay() {
        let mut h = Harness::started();
        let _remote = h.connect_as_responder(0.0);
        let link = h.network.live_link(LOCAL).unwrap();

        assert!(h.network.inject_error(link, "ice failed"));
        h.pump(5.0);
        assert_eq!(h.manager.state(), ElectionState::AwaitingPeers);
        assert!(h.notices().contains(&NOTICE_ERROR.to_string()));
        let snapshot = h.manager.snapshot();
        assert_eq!(
            snapshot.last_finished.map(|info| info.status),
            Some(ConnectionStatus::Errored)
        );
        assert_eq!(h.manager.next_deadline(), Some(h.at(7.0)));

        h.manager.on_deadline(h.at(6.9));
        assert_eq!(h.network.attempts_by(LOCAL).len(), 1);

        h.manager.on_deadline(h.at(7.0));
        let attempts = h.network.attempts_by(LOCAL);
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].role, Role::Responder);
        assert_eq!(h.manager.state(), ElectionState::Responder);
        assert_eq!(h.manager.snapshot().reconnect_due, None);
    }

    #[test]
    fn remote_close_announces_and_schedules_reconnect() {
        let mut h = Harness::started();
        let mut remote = h.connect_as_responder(0.0);

        remote.link.close();
        h.pump(3.0);
        assert_eq!(h.manager.state(), ElectionState::AwaitingPeers);
        assert_eq!(h.notices(), vec![NOTICE_CLOSED.to_string()]);
        let snapshot = h.manager.snapshot();
        assert_eq!(
            snapshot.last_finished.map(|info| info.status),
            Some(ConnectionStatus::Closed)
        );
        assert_eq!(snapshot.reconnect_due, Some(h.at(5.0)));
    }

    #[test]
    fn events_from_replaced_connection_are_ignored() {
        let mut h = Harness::started();
        let _remote = h.connect_as_responder(0.0);
        let first = h.manager.snapshot().connection.unwrap().id;
        let link = h.network.live_link(LOCAL).unwrap();
        h.network.inject_error(link, "boom");
        h.pump(2.0);
        h.manager.on_deadline(h.at(4.0));
        assert_eq!(h.manager.state(), ElectionState::Responder);

        h.manager.on_peer_notice(
            h.at(4.5),
            PeerNotice {
                connection: first,
                event: PeerEvent::Closed,
            },
        );
        h.manager.on_peer_notice(
            h.at(4.5),
            PeerNotice {
                connection: first,
                event: PeerEvent::Connected,
            },
        );
        assert_eq!(h.manager.state(), ElectionState::Responder);
        assert_eq!(h.manager.snapshot().reconnect_due, None);
    }

    #[test]
    fn malformed_peer_payload_keeps_connection() {
        let mut h = Harness::started();
        let _remote = h.connect_as_responder(0.0);
        let link = h.network.live_link(LOCAL).unwrap();

        h.network.inject_data(link, Bytes::from_static(b"\x00garbage"));
        h.pump(2.0);
        assert_eq!(h.manager.state(), ElectionState::Connected);
        assert!(h.events().is_empty());
    }

    #[test]
    fn chat_text_flows_over_the_peer_link() {
        let mut h = Harness::started();
        let mut remote = h.connect_as_responder(0.0);

        h.manager.send_text("  hi  ").unwrap();
        assert_eq!(
            h.events(),
            vec![ChatEvent::Message(ChatMessage::new("hi", MessageOrigin::Local))]
        );
        match remote.next_event() {
            Some(PeerEvent::Data(bytes)) => assert_eq!(
                SignalEnvelope::decode_chat(&bytes).unwrap(),
                SignalEnvelope::ChatData("hi".into())
            ),
            other => panic!("expected data, got {other:?}"),
        }

        let reply = SignalEnvelope::ChatData("hello back".into()).encode().unwrap();
        remote.link.send(reply).unwrap();
        h.pump(2.0);
        assert_eq!(
            h.events(),
            vec![ChatEvent::Message(ChatMessage::new(
                "hello back",
                MessageOrigin::Peer
            ))]
        );
        assert!(h.published().is_empty());
    }

    #[test]
    fn send_text_without_peer_echoes_and_reports() {
        let mut h = Harness::started();
        assert!(h.manager.send_text("   ").is_ok());
        assert!(h.events().is_empty());

        assert!(matches!(
            h.manager.send_text("anyone?"),
            Err(ChatError::NoActivePeer)
        ));
        assert_eq!(
            h.events(),
            vec![ChatEvent::Message(ChatMessage::new(
                "anyone?",
                MessageOrigin::Local
            ))]
        );

        h.deliver(0.0, SignalEnvelope::PresenceCheck);
        assert!(matches!(
            h.manager.send_text("still negotiating"),
            Err(ChatError::NoActivePeer)
        ));
    }

    #[test]
    fn stalled_negotiation_is_abandoned() {
        let mut h = Harness::started();
        h.deliver(0.0, SignalEnvelope::PresenceCheck);
        h.events();
        assert_eq!(h.manager.next_deadline(), Some(h.at(30.0)));

        h.manager.on_deadline(h.at(29.0));
        assert_eq!(h.manager.state(), ElectionState::Responder);

        h.manager.on_deadline(h.at(30.0));
        assert_eq!(h.manager.state(), ElectionState::AwaitingPeers);
        assert_eq!(h.manager.next_deadline(), None);
        assert!(h.notices().contains(&NOTICE_STALLED.to_string()));
        assert_eq!(h.network.live_link(LOCAL), None);
    }

    #[test]
    fn disabled_negotiation_timeout_waits_forever() {
        let mut h =
            Harness::with_config(ChatConfig::default().with_negotiation_timeout(None));
        h.manager.start(h.t0);
        h.deliver(0.0, SignalEnvelope::PresenceCheck);
        assert_eq!(h.manager.next_deadline(), None);
    }

    #[test]
    fn reconnect_limit_falls_back_to_presence() {
        let mut h = Harness::with_config(ChatConfig::default().with_reconnect_limit(Some(1)));
        h.manager.start(h.t0);
        let _remote = h.connect_as_responder(0.0);

        let link = h.network.live_link(LOCAL).unwrap();
        h.network.inject_error(link, "first");
        h.pump(2.0);
        assert!(h.manager.snapshot().reconnect_due.is_some());
        h.manager.on_deadline(h.at(4.0));
        assert_eq!(h.manager.state(), ElectionState::Responder);

        let link = h.network.live_link(LOCAL).unwrap();
        h.network.inject_error(link, "second");
        h.pump(5.0);
        assert_eq!(h.manager.state(), ElectionState::AwaitingPeers);
        assert_eq!(h.manager.snapshot().reconnect_due, None);
        assert!(h.notices().contains(&NOTICE_GAVE_UP.to_string()));
    }

    #[test]
    fn connector_refusal_goes_through_retry() {
        let mut h = Harness::started();
        h.network.refuse_next(LOCAL, "no ice servers");
        h.deliver(0.0, SignalEnvelope::PresenceCheck);

        assert_eq!(h.manager.state(), ElectionState::AwaitingPeers);
        assert!(h.published().is_empty());
        assert_eq!(h.notices(), vec![NOTICE_ERROR.to_string()]);
        let snapshot = h.manager.snapshot();
        assert_eq!(
            snapshot.last_finished.map(|info| info.status),
            Some(ConnectionStatus::New)
        );
        assert_eq!(snapshot.reconnect_due, Some(h.at(2.0)));

        h.manager.on_deadline(h.at(2.0));
        assert_eq!(h.manager.state(), ElectionState::Responder);
        assert_eq!(h.network.attempts_by(LOCAL).len(), 1);
    }

    #[test]
    fn refused_initiator_retries_in_the_same_role() {
        let mut h = Harness::started();
        h.network.refuse_next(LOCAL, "no ice servers");
        h.deliver(0.0, SignalEnvelope::PresenceResponse);

        assert_eq!(h.manager.state(), ElectionState::AwaitingPeers);
        let snapshot = h.manager.snapshot();
        let finished = snapshot.last_finished.expect("refused connection recorded");
        assert_eq!(finished.role, Role::Initiator);
        assert_eq!(finished.status, ConnectionStatus::New);
        assert_eq!(snapshot.reconnect_due, Some(h.at(2.0)));

        h.manager.on_deadline(h.at(2.0));
        assert_eq!(h.manager.state(), ElectionState::Initiator);
        assert_eq!(h.network.attempts_by(LOCAL).len(), 1);
    }

    #[test]
    fn create_connection_rejects_second_active_connection() {
        let mut h = Harness::started();
        let id = h.manager.create_connection(Role::Initiator, h.t0).unwrap();
        assert!(matches!(
            h.manager.create_connection(Role::Responder, h.t0),
            Err(ChatError::CreateConnectionRejected)
        ));
        assert_eq!(h.manager.snapshot().connection.map(|c| c.id), Some(id));
        assert_eq!(h.manager.snapshot().connections_created, 1);
    }

    #[test]
    fn teardown_is_idempotent_and_closes_the_peer() {
        let mut h = Harness::started();
        let mut remote = h.connect_as_responder(0.0);

        h.manager.teardown();
        assert_eq!(h.manager.state(), ElectionState::Idle);
        assert_eq!(remote.next_event(), Some(PeerEvent::Closed));
        assert_eq!(h.events(), vec![ChatEvent::Status(ElectionState::Idle)]);

        h.manager.teardown();
        assert!(h.events().is_empty());
        assert!(matches!(h.manager.send_text("hi"), Err(ChatError::ClosedChannel)));
        assert!(matches!(
            h.manager.create_connection(Role::Initiator, h.at(3.0)),
            Err(ChatError::ClosedChannel)
        ));
        h.deliver(4.0, SignalEnvelope::PresenceCheck);
        h.manager.on_presence_tick(h.at(5.0));
        assert!(h.published().is_empty());
        assert_eq!(h.manager.next_deadline(), None);
    }
}
