//! Latency manager event loop
//!
//! One task owns every piece of mutable state: the session registry, the
//! scheduler's freshness tracker, the roster, identity, match flag and
//! signaling transport. Host calls arrive as [`Command`]s through a
//! [`LatencyHandle`]; backend callbacks and timers arrive as session events.
//! Nothing else ever touches a session, so there is no locking.
//!
//! Control flow for one measurement:
//! tick -> select peer -> build session -> offer/answer/candidates ->
//! channel open -> pings -> finalize -> publish -> teardown.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connector::open_session;
use crate::measurement::summarize;
use crate::protocol::{
    DeclineReason, IceCandidate, ProbeMessage, Route, SessionDescription, SignalEnvelope,
};
use crate::publisher::{LatencyBook, LatencyRecord};
use crate::registry::SessionRegistry;
use crate::scheduler::PeerScheduler;
use crate::session::{FailureReason, LoopEvent, SessionOutcome, SessionState, TimerKind};
use crate::transport::{
    ConnectionRequest, PeerConnection, PeerConnectionFactory, SessionEvent, SignalingTransport,
    TransportError,
};
use crate::types::{
    unix_millis, Direction, LatencyConfig, LocalIdentity, PeerInfo, SessionHandle, SessionId,
};

#[derive(Debug, Error)]
pub enum LatencyError {
    #[error("Latency manager has shut down")]
    Closed,
}

/// Host-side control signals
pub enum Command {
    SetLocalIdentity(Option<LocalIdentity>),
    SetPeers(Vec<PeerInfo>),
    SetMatchActive(bool),
    AttachTransport(Option<Arc<dyn SignalingTransport>>),
    /// Detach only if this exact transport is still the attached one
    DetachTransport(Arc<dyn SignalingTransport>),
    Signal(SignalEnvelope),
    Tick,
    Snapshot(oneshot::Sender<ManagerSnapshot>),
    Shutdown,
}

/// One live session as seen from outside
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub target_uid: String,
    pub direction: Direction,
    pub state: SessionState,
}

/// Point-in-time view of the manager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerSnapshot {
    pub identity: Option<String>,
    pub match_active: bool,
    pub transport_open: bool,
    pub live_sessions: usize,
    pub inbound_sessions: usize,
    pub outbound: Option<SessionId>,
    pub sessions: Vec<SessionSummary>,
}

impl ManagerSnapshot {
    pub fn outbound_target(&self) -> Option<&str> {
        let id = self.outbound.as_ref()?;
        self.sessions
            .iter()
            .find(|s| &s.id == id)
            .map(|s| s.target_uid.as_str())
    }
}

/// Cloneable handle used by the host to drive the manager
#[derive(Clone)]
pub struct LatencyHandle {
    tx: mpsc::UnboundedSender<Command>,
    book: LatencyBook,
}

impl LatencyHandle {
    fn send(&self, cmd: Command) -> Result<(), LatencyError> {
        self.tx.send(cmd).map_err(|_| LatencyError::Closed)
    }

    /// Set or clear the local user; clearing tears down every session
    pub fn set_local_identity(&self, identity: Option<LocalIdentity>) -> Result<(), LatencyError> {
        self.send(Command::SetLocalIdentity(identity))
    }

    /// Replace the lobby roster
    pub fn set_peers(&self, peers: Vec<PeerInfo>) -> Result<(), LatencyError> {
        self.send(Command::SetPeers(peers))
    }

    /// Entering a match cancels the outbound session and pauses scheduling
    pub fn set_match_active(&self, active: bool) -> Result<(), LatencyError> {
        self.send(Command::SetMatchActive(active))
    }

    /// Attach or detach the signaling transport; detaching tears down every session
    pub fn attach_transport(
        &self,
        transport: Option<Arc<dyn SignalingTransport>>,
    ) -> Result<(), LatencyError> {
        self.send(Command::AttachTransport(transport))
    }

    /// Detach `transport` if it is still attached; a superseded transport is ignored
    pub fn detach_transport(
        &self,
        transport: Arc<dyn SignalingTransport>,
    ) -> Result<(), LatencyError> {
        self.send(Command::DetachTransport(transport))
    }

    pub fn handle_signal(&self, envelope: SignalEnvelope) -> Result<(), LatencyError> {
        self.send(Command::Signal(envelope))
    }

    /// Feed a raw relay frame; returns false if it is not a latency envelope
    pub fn handle_signal_json(&self, raw: &str) -> bool {
        match SignalEnvelope::from_json(raw) {
            Ok(Some(envelope)) => {
                if self.handle_signal(envelope).is_err() {
                    debug!("[Latency] Manager gone, dropping signal");
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                debug!("[Latency] Malformed signal: {}", e);
                false
            }
        }
    }

    /// Run a scheduling pass now instead of waiting for the interval
    pub fn tick_now(&self) -> Result<(), LatencyError> {
        self.send(Command::Tick)
    }

    pub async fn snapshot(&self) -> Result<ManagerSnapshot, LatencyError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| LatencyError::Closed)
    }

    /// Published results
    pub fn book(&self) -> &LatencyBook {
        &self.book
    }

    /// Stop the loop after tearing down every session
    pub fn shutdown(&self) -> Result<(), LatencyError> {
        self.send(Command::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owner of all latency measurement state
pub struct LatencyManager<F: PeerConnectionFactory> {
    config: LatencyConfig,
    factory: Arc<F>,
    registry: SessionRegistry,
    scheduler: PeerScheduler,
    book: LatencyBook,
    identity: Option<LocalIdentity>,
    peers: Vec<PeerInfo>,
    transport: Option<Arc<dyn SignalingTransport>>,
    in_match: bool,
    rng: StdRng,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<LoopEvent>>,
}

impl<F: PeerConnectionFactory + 'static> LatencyManager<F> {
    pub fn new(config: LatencyConfig, factory: Arc<F>, book: LatencyBook) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            registry: SessionRegistry::new(config.max_inbound_sessions),
            scheduler: PeerScheduler::new(config.measurement_ttl),
            config,
            factory,
            book,
            identity: None,
            peers: Vec::new(),
            transport: None,
            in_match: false,
            rng: StdRng::from_entropy(),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Use a fixed seed for the selection tie-breaker
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Start the event loop on the current runtime
    pub fn spawn(self) -> LatencyHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = LatencyHandle {
            tx,
            book: self.book.clone(),
        };
        tokio::spawn(self.run(rx));
        handle
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let Some(mut events) = self.events_rx.take() else {
            return;
        };
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; scheduling starts one interval in
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.reset_all_sessions("shutdown").await;
        debug!("[Latency] Manager stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetLocalIdentity(identity) => self.set_local_identity(identity).await,
            Command::SetPeers(peers) => self.peers = peers,
            Command::SetMatchActive(active) => self.set_match_active(active).await,
            Command::AttachTransport(transport) => self.attach_transport(transport).await,
            Command::DetachTransport(transport) => self.detach_transport(transport).await,
            Command::Signal(envelope) => self.handle_signal(envelope).await,
            Command::Tick => self.tick().await,
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn snapshot(&self) -> ManagerSnapshot {
        let mut sessions: Vec<_> = self
            .registry
            .iter()
            .map(|s| SessionSummary {
                id: s.id().clone(),
                target_uid: s.target_uid().to_string(),
                direction: s.direction(),
                state: s.state(),
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        ManagerSnapshot {
            identity: self.identity.as_ref().map(|i| i.uid.clone()),
            match_active: self.in_match,
            transport_open: self.transport_open(),
            live_sessions: self.registry.len(),
            inbound_sessions: self.registry.inbound_count(),
            outbound: self
                .registry
                .outbound()
                .and_then(|h| self.registry.get(h))
                .map(|s| s.id().clone()),
            sessions,
        }
    }

    // ---- host control ----

    async fn set_local_identity(&mut self, identity: Option<LocalIdentity>) {
        let previous = self.identity.as_ref().map(|i| i.uid.clone());
        let next = identity.as_ref().map(|i| i.uid.clone());
        self.identity = identity;

        if next.is_none() {
            self.reset_all_sessions("identity cleared").await;
        }
        if previous != next {
            if previous.is_some() {
                self.scheduler.clear();
            }
            self.book.bind_owner(next.as_deref());
            info!("[Latency] Local identity: {:?}", next);
        }
    }

    async fn set_match_active(&mut self, active: bool) {
        self.in_match = active;
        if active {
            if let Some(handle) = self.registry.outbound() {
                self.fail_session(handle, FailureReason::Cancelled).await;
            }
        }
    }

    async fn attach_transport(&mut self, transport: Option<Arc<dyn SignalingTransport>>) {
        let detached = transport.is_none();
        self.transport = transport;
        if detached {
            self.reset_all_sessions("transport detached").await;
        }
    }

    async fn detach_transport(&mut self, transport: Arc<dyn SignalingTransport>) {
        let attached = self
            .transport
            .as_ref()
            .is_some_and(|current| same_transport(current, &transport));
        if attached {
            self.attach_transport(None).await;
        } else {
            debug!("[Latency] Ignoring detach of a superseded transport");
        }
    }

    fn transport_open(&self) -> bool {
        self.transport.as_ref().map(|t| t.is_open()).unwrap_or(false)
    }

    async fn send_signal(&self, envelope: SignalEnvelope) -> Result<(), TransportError> {
        match &self.transport {
            Some(transport) if transport.is_open() => transport.send(envelope).await,
            _ => Err(TransportError::NotConnected),
        }
    }

    fn route_to(&self, id: &SessionId, to: &str) -> Option<Route> {
        let identity = self.identity.as_ref()?;
        Some(Route {
            measurement_id: id.clone(),
            to: to.to_string(),
            from: identity.uid.clone(),
        })
    }

    // ---- scheduling ----

    async fn tick(&mut self) {
        if self.in_match || self.registry.outbound().is_some() {
            return;
        }
        let Some(identity) = self.identity.as_ref() else {
            return;
        };
        if !self.transport_open() {
            return;
        }

        let target = self
            .scheduler
            .select_next(identity, &self.peers, &self.config, Instant::now(), &mut self.rng)
            .map(|p| p.uid.clone());
        if let Some(target) = target {
            self.start_outbound(&target).await;
        }
    }

    /// Start measuring `target`; a no-op while another outbound session is live
    async fn start_outbound(&mut self, target: &str) {
        if self.registry.outbound().is_some() {
            return;
        }
        let Some(identity) = self.identity.clone() else {
            return;
        };
        if !self.transport_open() {
            return;
        }

        let id = SessionId::outbound(&identity.uid, target, unix_millis(SystemTime::now()));
        let request = ConnectionRequest {
            session_id: id.clone(),
            local_uid: identity.uid.clone(),
            target_uid: target.to_string(),
            direction: Direction::Outbound,
        };
        let opened = open_session(&*self.factory, &mut self.registry, request, &self.events_tx);
        let handle = match opened.await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("[Latency] Could not start session with {}: {}", target, e);
                return;
            }
        };
        info!("[Latency] Measuring {} ({})", target, id);

        let Some(connection) = self.registry.get(handle).map(|s| s.connection.clone()) else {
            return;
        };
        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("[Latency] Offer failed for {}: {}", id, e);
                self.fail_session(handle, FailureReason::OfferError).await;
                return;
            }
        };
        if let Some(session) = self.registry.get_mut(handle) {
            session.begin_negotiating();
        }

        let Some(route) = self.route_to(&id, target) else {
            return;
        };
        if let Err(e) = self.send_signal(SignalEnvelope::offer(route, offer)).await {
            warn!("[Latency] Could not send offer {}: {}", id, e);
            self.fail_session(handle, FailureReason::SendFailed).await;
            return;
        }
        if let Some(session) = self.registry.get_mut(handle) {
            session.timers.arm(TimerKind::Setup, self.config.setup_timeout);
        }
    }

    // ---- signaling ----

    async fn handle_signal(&mut self, envelope: SignalEnvelope) {
        if let Some(identity) = &self.identity {
            if !envelope.is_for(&identity.uid) {
                debug!(
                    "[Latency] Ignoring {} addressed to {:?}",
                    envelope.msg_type(),
                    envelope.to_uid()
                );
                return;
            }
        }

        match envelope {
            SignalEnvelope::Offer {
                measurement_id,
                from,
                offer,
                ..
            } => self.handle_offer(measurement_id, from, offer).await,
            SignalEnvelope::Answer {
                measurement_id: Some(id),
                answer: Some(answer),
                ..
            } => self.handle_answer(&id, answer).await,
            SignalEnvelope::Candidate {
                measurement_id: Some(id),
                candidate: Some(candidate),
                ..
            } => self.handle_candidate(&id, candidate).await,
            SignalEnvelope::Decline {
                measurement_id: Some(id),
                reason,
                ..
            } => {
                let reason = reason.unwrap_or_else(|| DeclineReason::Other(String::new()));
                self.handle_decline(&id, reason).await
            }
            other => debug!("[Latency] Incomplete {} dropped", other.msg_type()),
        }
    }

    async fn decline(&self, id: &SessionId, to: &str, reason: DeclineReason) {
        let Some(route) = self.route_to(id, to) else {
            return;
        };
        if let Err(e) = self.send_signal(SignalEnvelope::decline(route, reason)).await {
            debug!("[Latency] Could not decline {}: {}", id, e);
        }
    }

    async fn handle_offer(
        &mut self,
        id: Option<SessionId>,
        from: Option<String>,
        offer: Option<SessionDescription>,
    ) {
        let (Some(id), Some(from)) = (id, from) else {
            return;
        };
        let Some(identity) = self.identity.clone() else {
            return;
        };
        if self.in_match {
            debug!("[Latency] Declining {} from {}: busy", id, from);
            self.decline(&id, &from, DeclineReason::Busy).await;
            return;
        }
        let Some(offer) = offer else {
            return;
        };
        if self.registry.lookup(&id).is_some() {
            debug!("[Latency] Duplicate offer {} dropped", id);
            return;
        }
        if !self.registry.has_inbound_capacity() {
            debug!("[Latency] Declining {} from {}: at capacity", id, from);
            self.decline(&id, &from, DeclineReason::AtCapacity).await;
            return;
        }

        let request = ConnectionRequest {
            session_id: id.clone(),
            local_uid: identity.uid.clone(),
            target_uid: from.clone(),
            direction: Direction::Inbound,
        };
        let opened = open_session(&*self.factory, &mut self.registry, request, &self.events_tx);
        let handle = match opened.await {
            Ok(handle) => handle,
            Err(e) => {
                debug!("[Latency] Could not accept {} from {}: {}", id, from, e);
                self.decline(&id, &from, DeclineReason::AnswerError).await;
                return;
            }
        };

        let answer = match self.answer_offer(handle, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                debug!("[Latency] Answer failed for {}: {}", id, e);
                self.fail_session(handle, FailureReason::AnswerError).await;
                self.decline(&id, &from, DeclineReason::AnswerError).await;
                return;
            }
        };
        if let Some(session) = self.registry.get_mut(handle) {
            session.begin_negotiating();
        }

        let Some(route) = self.route_to(&id, &from) else {
            return;
        };
        if let Err(e) = self.send_signal(SignalEnvelope::answer(route, answer)).await {
            debug!("[Latency] Could not send answer {}: {}", id, e);
            self.fail_session(handle, FailureReason::SendFailed).await;
            return;
        }
        if let Some(session) = self.registry.get_mut(handle) {
            session.timers.arm(TimerKind::Setup, self.config.setup_timeout);
        }
    }

    async fn handle_answer(&mut self, id: &SessionId, answer: SessionDescription) {
        let Some(handle) = self.registry.outbound_matching(id) else {
            return;
        };
        let Some(session) = self.registry.get(handle) else {
            return;
        };
        if session.remote_description_set() {
            debug!("[Latency] Duplicate answer for {} ignored", id);
            return;
        }
        let connection = session.connection.clone();

        if let Err(e) = connection.set_remote_description(answer).await {
            warn!("[Latency] Could not apply answer for {}: {}", id, e);
            self.fail_session(handle, FailureReason::AnswerError).await;
            return;
        }
        let pending = match self.registry.get_mut(handle) {
            Some(session) => session.mark_remote_description_set(),
            None => return,
        };
        flush_candidates(&*connection, id, pending).await;
    }

    /// Apply a remote offer, flush candidates that arrived ahead of it, and answer
    async fn answer_offer(
        &mut self,
        handle: SessionHandle,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let Some(session) = self.registry.get(handle) else {
            return Err(TransportError::Closed);
        };
        let (id, connection) = (session.id.clone(), session.connection.clone());
        connection.set_remote_description(offer).await?;
        let pending = self
            .registry
            .get_mut(handle)
            .map(|s| s.mark_remote_description_set())
            .unwrap_or_default();
        flush_candidates(&*connection, &id, pending).await;
        connection.create_answer().await
    }

    async fn handle_candidate(&mut self, id: &SessionId, candidate: IceCandidate) {
        let Some(handle) = self.registry.lookup(id) else {
            return;
        };
        let Some(session) = self.registry.get_mut(handle) else {
            return;
        };
        let Some(candidate) = session.route_candidate(candidate) else {
            return;
        };
        let connection = session.connection.clone();
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            warn!("[Latency] Candidate rejected for {}: {}", id, e);
        }
    }

    async fn handle_decline(&mut self, id: &SessionId, reason: DeclineReason) {
        let Some(handle) = self.registry.outbound_matching(id) else {
            return;
        };
        self.fail_session(handle, FailureReason::Declined(reason)).await;
    }

    // ---- session events ----

    async fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Session(handle, event) => self.handle_session_event(handle, event).await,
            LoopEvent::Timer(handle, kind, token) => self.handle_timer(handle, kind, token).await,
        }
    }

    async fn handle_session_event(&mut self, handle: SessionHandle, event: SessionEvent) {
        let Some(session) = self.registry.get_mut(handle) else {
            // Session already torn down
            return;
        };
        let direction = session.direction;

        match event {
            SessionEvent::LocalCandidate(candidate) => {
                let (id, target) = (session.id.clone(), session.target_uid.clone());
                let Some(route) = self.route_to(&id, &target) else {
                    return;
                };
                let envelope = SignalEnvelope::candidate(route, candidate);
                if let Err(e) = self.send_signal(envelope).await {
                    debug!("[Latency] Could not forward candidate for {}: {}", id, e);
                }
            }
            SessionEvent::IceState(state) => {
                if state.is_fatal() {
                    self.fail_session(handle, FailureReason::IceFailed).await;
                }
            }
            SessionEvent::ChannelAccepted(channel) => {
                if direction == Direction::Inbound && !session.accept_channel(channel.clone()) {
                    channel.close().await;
                }
            }
            SessionEvent::ChannelOpen => self.on_channel_open(handle),
            SessionEvent::ChannelMessage(text) => self.on_probe_message(handle, &text).await,
            SessionEvent::ChannelClosed => match direction {
                Direction::Outbound => {
                    self.fail_session(handle, FailureReason::ChannelClosed).await;
                }
                Direction::Inbound => {
                    self.close_session(handle, SessionOutcome::Closed).await;
                }
            },
        }
    }

    fn on_channel_open(&mut self, handle: SessionHandle) {
        let Some(session) = self.registry.get_mut(handle) else {
            return;
        };
        if !session.open() {
            return;
        }
        debug!("[Latency] Probe channel open for {}", session.id);
        session.timers.cancel(TimerKind::Setup);
        session
            .timers
            .arm(TimerKind::Measurement, self.config.measurement_timeout);
        if session.direction == Direction::Outbound {
            session.timers.arm(TimerKind::Ping, self.config.warmup_delay);
        }
    }

    async fn handle_timer(&mut self, handle: SessionHandle, kind: TimerKind, token: u64) {
        let Some(session) = self.registry.get_mut(handle) else {
            return;
        };
        if !session.timers.take_fired(kind, token) {
            return;
        }
        let measuring = session.state() == SessionState::Measuring;
        match kind {
            TimerKind::Setup => self.fail_session(handle, FailureReason::Timeout).await,
            // Keep whatever samples made it back before the deadline
            TimerKind::Measurement if measuring && self.registry.outbound() == Some(handle) => {
                self.finalize(handle).await
            }
            TimerKind::Measurement => self.fail_session(handle, FailureReason::Timeout).await,
            TimerKind::Ping => self.send_next_ping(handle).await,
            TimerKind::Completion => self.finalize(handle).await,
        }
    }

    async fn send_next_ping(&mut self, handle: SessionHandle) {
        let Some(session) = self.registry.get_mut(handle) else {
            return;
        };
        let Some((channel, ping, sent)) = session.next_ping() else {
            return;
        };
        if !channel.is_open() {
            self.fail_session(handle, FailureReason::ChannelClosed).await;
            return;
        }
        let sent_ok = match ping.encode() {
            Ok(text) => channel.send_text(text).await.is_ok(),
            Err(_) => false,
        };
        if !sent_ok {
            self.fail_session(handle, FailureReason::SendFailed).await;
            return;
        }

        let Some(session) = self.registry.get_mut(handle) else {
            return;
        };
        if sent < self.config.ping_sample_target {
            session.timers.arm(TimerKind::Ping, self.config.ping_interval);
        } else {
            session
                .timers
                .arm(TimerKind::Completion, self.config.completion_grace());
        }
    }

    async fn on_probe_message(&mut self, handle: SessionHandle, text: &str) {
        let Some(msg) = ProbeMessage::parse(text) else {
            return;
        };
        let Some(session) = self.registry.get_mut(handle) else {
            return;
        };

        match msg {
            ProbeMessage::Ping { seq, time } => {
                // Responder side: echo, never score
                let Some(channel) = session.channel() else {
                    return;
                };
                if session.direction == Direction::Inbound {
                    session.begin_measuring();
                }
                if let Ok(text) = (ProbeMessage::Pong { seq, time }).encode() {
                    if let Err(e) = channel.send_text(text).await {
                        debug!("[Latency] Pong {} not sent: {}", seq, e);
                    }
                }
            }
            ProbeMessage::Pong { seq, .. } => {
                if session.direction != Direction::Outbound {
                    return;
                }
                let early = self.config.early_finalize_samples;
                let Some(probe) = session.probe_mut() else {
                    return;
                };
                if let Some(rtt) = probe.record_pong(seq, Instant::now()) {
                    debug!("[Latency] {} pong {} in {:.1}ms", session.id, seq, rtt);
                }
                let ready = session
                    .probe()
                    .map(|p| p.can_finalize_early(early))
                    .unwrap_or(false);
                if ready {
                    self.finalize(handle).await;
                }
            }
            ProbeMessage::Complete => {
                self.close_session(handle, SessionOutcome::Closed).await;
            }
        }
    }

    /// Aggregate, publish and close an outbound session
    async fn finalize(&mut self, handle: SessionHandle) {
        if self.registry.outbound() != Some(handle) {
            return;
        }
        let Some(session) = self.registry.get_mut(handle) else {
            return;
        };
        let Some((channel, samples)) = session.begin_finalizing() else {
            return;
        };
        let Some(summary) = summarize(&samples, self.config.unstable_jitter_ms) else {
            self.fail_session(handle, FailureReason::NoSamples).await;
            return;
        };

        let target = session.target_uid.clone();
        let started_by = session.started_by.clone();
        let connection = session.connection.clone();
        let network_type = connection.network_path_type().await;

        self.scheduler.mark_measured(&target, Instant::now());
        let current = self.identity.as_ref().map(|i| i.uid.as_str());
        if current == Some(started_by.as_str()) {
            let record =
                LatencyRecord::from_summary(&target, &summary, network_type, SystemTime::now());
            self.book.publish(&started_by, record);
        }
        info!(
            "[Latency] {}: {}ms, jitter {}ms{} over {} samples",
            target,
            summary.ping,
            summary.jitter,
            if summary.is_unstable { " (unstable)" } else { "" },
            summary.sample_count
        );

        if channel.is_open() {
            if let Ok(text) = ProbeMessage::Complete.encode() {
                let _ = channel.send_text(text).await;
            }
        }
        self.close_session(handle, SessionOutcome::Closed).await;
    }

    // ---- teardown ----

    async fn fail_session(&mut self, handle: SessionHandle, reason: FailureReason) {
        self.close_session(handle, SessionOutcome::Failed(reason)).await;
    }

    /// Single teardown path; later calls for the same handle do nothing
    async fn close_session(&mut self, handle: SessionHandle, outcome: SessionOutcome) -> bool {
        let Some(session) = self.registry.teardown(handle) else {
            return false;
        };

        match (&outcome, session.direction) {
            (SessionOutcome::Failed(reason), Direction::Outbound) => {
                warn!(
                    "[Latency] Session {} with {} failed: {}",
                    session.id, session.target_uid, reason
                );
                let reached_channel =
                    matches!(session.state(), SessionState::Open | SessionState::Measuring);
                if reason.is_negotiation_failure() && !reached_channel {
                    self.scheduler
                        .mark_attempted(&session.target_uid, Instant::now());
                }
            }
            (SessionOutcome::Failed(reason), Direction::Inbound) => {
                debug!(
                    "[Latency] Inbound session {} from {} failed: {}",
                    session.id, session.target_uid, reason
                );
            }
            (SessionOutcome::Closed, _) => {
                debug!("[Latency] Session {} closed after {:?}", session.id, session.age());
            }
        }

        session.shutdown().await;
        true
    }

    async fn reset_all_sessions(&mut self, why: &str) {
        let sessions = self.registry.drain();
        if sessions.is_empty() {
            return;
        }
        info!("[Latency] Tearing down {} session(s): {}", sessions.len(), why);
        for session in sessions {
            session.shutdown().await;
        }
    }
}

/// Hand candidates to the backend in receipt order; a rejected one is logged and skipped
async fn flush_candidates(
    connection: &dyn PeerConnection,
    id: &SessionId,
    pending: Vec<IceCandidate>,
) {
    for candidate in pending {
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            warn!("[Latency] Queued candidate rejected for {}: {}", id, e);
        }
    }
}

/// Identity of a transport object, ignoring which vtable the pointer carries
fn same_transport(a: &Arc<dyn SignalingTransport>, b: &Arc<dyn SignalingTransport>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
