//! Measurement session state machine
//!
//! A session is one latency measurement attempt against one peer in one
//! direction. Its lifecycle is
//! `created -> negotiating -> open -> measuring -> finalizing -> closed`,
//! with `failed` reachable from anywhere. Phase-specific data lives in the
//! [`Phase`] variants so a session can't hold samples without a channel or
//! queue candidates after the remote description is known.
//!
//! Sessions are removed from the registry when they reach `closed`/`failed`,
//! so those two states only show up as a [`SessionOutcome`].

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::measurement::ProbeState;
use crate::protocol::{DeclineReason, IceCandidate, ProbeMessage};
use crate::transport::{PeerConnection, ProbeChannel, SessionEvent};
use crate::types::{Direction, SessionHandle, SessionId};

/// Everything the manager loop reacts to besides host commands
pub(crate) enum LoopEvent {
    Session(SessionHandle, SessionEvent),
    Timer(SessionHandle, TimerKind, u64),
}

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Negotiating,
    Open,
    Measuring,
    Finalizing,
    Closed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Negotiating => "negotiating",
            SessionState::Open => "open",
            SessionState::Measuring => "measuring",
            SessionState::Finalizing => "finalizing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a session ended in `failed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Setup or measurement deadline passed
    Timeout,
    OfferError,
    AnswerError,
    Declined(DeclineReason),
    IceFailed,
    ChannelClosed,
    /// Channel opened but no pong ever came back
    NoSamples,
    SendFailed,
    /// Cancelled by the host (match started, identity or transport lost)
    Cancelled,
}

impl FailureReason {
    /// Failures that should keep the peer out of rotation for a while
    pub fn is_negotiation_failure(&self) -> bool {
        matches!(self, FailureReason::Timeout | FailureReason::Declined(_))
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::OfferError => write!(f, "offer-error"),
            FailureReason::AnswerError => write!(f, "answer-error"),
            FailureReason::Declined(reason) => write!(f, "declined ({})", reason),
            FailureReason::IceFailed => write!(f, "ice-failed"),
            FailureReason::ChannelClosed => write!(f, "channel-closed"),
            FailureReason::NoSamples => write!(f, "no-samples"),
            FailureReason::SendFailed => write!(f, "send-failed"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Terminal result of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Closed,
    Failed(FailureReason),
}

impl SessionOutcome {
    pub fn state(&self) -> SessionState {
        match self {
            SessionOutcome::Closed => SessionState::Closed,
            SessionOutcome::Failed(_) => SessionState::Failed,
        }
    }
}

/// Per-session timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Channel must open before this fires
    Setup,
    /// Session must finish after opening before this fires
    Measurement,
    /// Next ping is due
    Ping,
    /// Force finalization after the last ping
    Completion,
}

/// Cancellable timers owned by one session
///
/// Each arm gets a fresh token. A timer event is only honoured if its token
/// is still the armed one, so an expiry that raced with a cancel is ignored.
pub(crate) struct SessionTimers {
    handle: SessionHandle,
    tx: mpsc::UnboundedSender<LoopEvent>,
    next_token: u64,
    armed: HashMap<TimerKind, (u64, JoinHandle<()>)>,
}

impl SessionTimers {
    pub(crate) fn new(handle: SessionHandle, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self {
            handle,
            tx,
            next_token: 0,
            armed: HashMap::new(),
        }
    }

    /// Arm (or re-arm) a timer
    pub(crate) fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);
        self.next_token += 1;
        let token = self.next_token;
        let tx = self.tx.clone();
        let handle = self.handle;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(LoopEvent::Timer(handle, kind, token));
        });
        self.armed.insert(kind, (token, task));
    }

    pub(crate) fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, task)) = self.armed.remove(&kind) {
            task.abort();
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, (_, task)) in self.armed.drain() {
            task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Consume a fired timer; false if it was cancelled or re-armed since
    pub(crate) fn take_fired(&mut self, kind: TimerKind, token: u64) -> bool {
        match self.armed.get(&kind) {
            Some((armed, _)) if *armed == token => {
                self.armed.remove(&kind);
                true
            }
            _ => false,
        }
    }
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Pre-open negotiation data
#[derive(Default)]
pub(crate) struct Negotiation {
    /// Remote candidates received before the remote description
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    /// Created locally (outbound) or accepted from the remote (inbound)
    channel: Option<Arc<dyn ProbeChannel>>,
}

/// Phase with its phase-specific payload
pub(crate) enum Phase {
    Created(Negotiation),
    Negotiating(Negotiation),
    Open {
        channel: Arc<dyn ProbeChannel>,
    },
    Measuring {
        channel: Arc<dyn ProbeChannel>,
        probe: ProbeState,
    },
    Finalizing,
}

/// One in-flight latency measurement
pub struct Session {
    pub(crate) handle: SessionHandle,
    pub(crate) id: SessionId,
    pub(crate) target_uid: String,
    pub(crate) direction: Direction,
    /// Local uid at creation; results are only published for this identity
    pub(crate) started_by: String,
    pub(crate) started_at: Instant,
    pub(crate) connection: Arc<dyn PeerConnection>,
    pub(crate) phase: Phase,
    pub(crate) timers: SessionTimers,
}

impl Session {
    pub(crate) fn new(
        handle: SessionHandle,
        id: SessionId,
        target_uid: String,
        direction: Direction,
        started_by: String,
        connection: Arc<dyn PeerConnection>,
        channel: Option<Arc<dyn ProbeChannel>>,
        tx: mpsc::UnboundedSender<LoopEvent>,
    ) -> Self {
        Self {
            handle,
            id,
            target_uid,
            direction,
            started_by,
            started_at: Instant::now(),
            connection,
            phase: Phase::Created(Negotiation {
                channel,
                ..Default::default()
            }),
            timers: SessionTimers::new(handle, tx),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn target_uid(&self) -> &str {
        &self.target_uid
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// How long ago the session was created
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn state(&self) -> SessionState {
        match self.phase {
            Phase::Created(_) => SessionState::Created,
            Phase::Negotiating(_) => SessionState::Negotiating,
            Phase::Open { .. } => SessionState::Open,
            Phase::Measuring { .. } => SessionState::Measuring,
            Phase::Finalizing => SessionState::Finalizing,
        }
    }

    /// Probe channel once one exists
    pub(crate) fn channel(&self) -> Option<Arc<dyn ProbeChannel>> {
        match &self.phase {
            Phase::Created(n) | Phase::Negotiating(n) => n.channel.clone(),
            Phase::Open { channel } | Phase::Measuring { channel, .. } => Some(channel.clone()),
            Phase::Finalizing => None,
        }
    }

    pub(crate) fn remote_description_set(&self) -> bool {
        match &self.phase {
            Phase::Created(n) | Phase::Negotiating(n) => n.remote_description_set,
            _ => true,
        }
    }

    /// Local description is installed: `created -> negotiating`
    pub(crate) fn begin_negotiating(&mut self) {
        if let Phase::Created(n) = &mut self.phase {
            let n = mem::take(n);
            self.phase = Phase::Negotiating(n);
        }
    }

    /// Route a remote candidate: queue it, or hand it back to apply now
    pub(crate) fn route_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        match &mut self.phase {
            Phase::Created(n) | Phase::Negotiating(n) if !n.remote_description_set => {
                n.pending_candidates.push(candidate);
                None
            }
            Phase::Finalizing => None,
            _ => Some(candidate),
        }
    }

    /// Remote description applied; returns queued candidates in receipt order
    pub(crate) fn mark_remote_description_set(&mut self) -> Vec<IceCandidate> {
        match &mut self.phase {
            Phase::Created(n) | Phase::Negotiating(n) => {
                n.remote_description_set = true;
                mem::take(&mut n.pending_candidates)
            }
            _ => Vec::new(),
        }
    }

    /// Capture the channel the remote side created
    pub(crate) fn accept_channel(&mut self, channel: Arc<dyn ProbeChannel>) -> bool {
        match &mut self.phase {
            Phase::Created(n) | Phase::Negotiating(n) if n.channel.is_none() => {
                n.channel = Some(channel);
                true
            }
            _ => false,
        }
    }

    /// Probe channel reported ready: `negotiating -> open`
    pub(crate) fn open(&mut self) -> bool {
        let channel = match &mut self.phase {
            Phase::Created(n) | Phase::Negotiating(n) => match n.channel.take() {
                Some(channel) => channel,
                None => return false,
            },
            _ => return false,
        };
        self.phase = Phase::Open { channel };
        true
    }

    /// Move an open session into `measuring` (idempotent once measuring)
    pub(crate) fn begin_measuring(&mut self) -> bool {
        match &self.phase {
            Phase::Measuring { .. } => true,
            Phase::Open { channel } => {
                let channel = channel.clone();
                self.phase = Phase::Measuring {
                    channel,
                    probe: ProbeState::new(Instant::now()),
                };
                true
            }
            _ => false,
        }
    }

    /// Allocate the next ping, entering `measuring` on the first one
    pub(crate) fn next_ping(&mut self) -> Option<(Arc<dyn ProbeChannel>, ProbeMessage, u32)> {
        if !self.begin_measuring() {
            return None;
        }
        match &mut self.phase {
            Phase::Measuring { channel, probe } => {
                let msg = probe.next_ping(Instant::now());
                Some((channel.clone(), msg, probe.sent()))
            }
            _ => None,
        }
    }

    pub(crate) fn probe(&self) -> Option<&ProbeState> {
        match &self.phase {
            Phase::Measuring { probe, .. } => Some(probe),
            _ => None,
        }
    }

    pub(crate) fn probe_mut(&mut self) -> Option<&mut ProbeState> {
        match &mut self.phase {
            Phase::Measuring { probe, .. } => Some(probe),
            _ => None,
        }
    }

    /// `measuring -> finalizing`; yields the channel and collected samples
    pub(crate) fn begin_finalizing(&mut self) -> Option<(Arc<dyn ProbeChannel>, Vec<f64>)> {
        match mem::replace(&mut self.phase, Phase::Finalizing) {
            Phase::Measuring { channel, probe } => {
                self.timers.cancel(TimerKind::Ping);
                self.timers.cancel(TimerKind::Completion);
                self.timers.cancel(TimerKind::Measurement);
                Some((channel, probe.samples().to_vec()))
            }
            other => {
                self.phase = other;
                None
            }
        }
    }

    /// Release every resource the session owns
    pub(crate) async fn shutdown(mut self) {
        self.timers.cancel_all();
        if let Some(channel) = self.channel() {
            if channel.is_open() {
                channel.close().await;
            }
        }
        self.connection.close().await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("id", &self.id)
            .field("target_uid", &self.target_uid)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::SessionDescription;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Connection stub that only counts closes
    #[derive(Default)]
    pub(crate) struct StubConnection {
        pub closes: AtomicUsize,
    }

    #[async_trait]
    impl PeerConnection for StubConnection {
        async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
            Ok(SessionDescription::offer("stub"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
            Ok(SessionDescription::answer("stub"))
        }

        async fn set_remote_description(
            &self,
            _desc: SessionDescription,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn add_ice_candidate(&self, _c: IceCandidate) -> Result<(), TransportError> {
            Ok(())
        }

        async fn create_probe_channel(&self) -> Result<Arc<dyn ProbeChannel>, TransportError> {
            Ok(Arc::new(StubChannel::default()))
        }

        async fn network_path_type(&self) -> Option<String> {
            None
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) struct StubChannel {
        pub open: AtomicBool,
    }

    impl Default for StubChannel {
        fn default() -> Self {
            Self {
                open: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl ProbeChannel for StubChannel {
        async fn send_text(&self, _text: String) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn stub_session(
        handle: u64,
        id: &str,
        direction: Direction,
        channel: Option<Arc<dyn ProbeChannel>>,
    ) -> (Session, mpsc::UnboundedReceiver<LoopEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(
            SessionHandle(handle),
            SessionId::from(id),
            "bob".to_string(),
            direction,
            "alice".to_string(),
            Arc::new(StubConnection::default()),
            channel,
            tx,
        );
        (session, rx)
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let (mut session, _rx) = stub_session(1, "s", Direction::Outbound, None);
        assert!(session
            .route_candidate(IceCandidate::new("c1"))
            .is_none());
        session.begin_negotiating();
        assert!(session
            .route_candidate(IceCandidate::new("c2"))
            .is_none());

        let flushed = session.mark_remote_description_set();
        let names: Vec<_> = flushed.iter().map(|c| c.candidate.as_str()).collect();
        assert_eq!(names, vec!["c1", "c2"]);

        let direct = session.route_candidate(IceCandidate::new("c3"));
        assert_eq!(direct.map(|c| c.candidate), Some("c3".to_string()));
        assert!(session.mark_remote_description_set().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_is_monotonic() {
        let channel: Arc<dyn ProbeChannel> = Arc::new(StubChannel::default());
        let (mut session, _rx) = stub_session(1, "s", Direction::Outbound, Some(channel));
        assert_eq!(session.state(), SessionState::Created);

        // No samples without an open channel
        assert!(session.begin_finalizing().is_none());

        session.begin_negotiating();
        assert_eq!(session.state(), SessionState::Negotiating);
        assert!(session.open());
        assert_eq!(session.state(), SessionState::Open);
        assert!(!session.open());

        let (_, ping, sent) = session.next_ping().unwrap();
        assert_eq!(sent, 1);
        assert!(matches!(ping, ProbeMessage::Ping { seq: 1, .. }));
        assert_eq!(session.state(), SessionState::Measuring);

        let (_, samples) = session.begin_finalizing().unwrap();
        assert!(samples.is_empty());
        assert_eq!(session.state(), SessionState::Finalizing);
        assert!(session.next_ping().is_none());
        assert!(session.channel().is_none());
    }

    #[tokio::test]
    async fn test_inbound_waits_for_remote_channel() {
        let (mut session, _rx) = stub_session(1, "s", Direction::Inbound, None);
        assert!(!session.open());

        let channel: Arc<dyn ProbeChannel> = Arc::new(StubChannel::default());
        assert!(session.accept_channel(channel.clone()));
        assert!(!session.accept_channel(channel));
        assert!(session.open());
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_is_ignored() {
        let (mut session, mut rx) = stub_session(7, "s", Direction::Outbound, None);
        session.timers.arm(TimerKind::Setup, Duration::from_millis(10));
        session.timers.arm(TimerKind::Setup, Duration::from_millis(50));

        let Some(LoopEvent::Timer(handle, kind, token)) = rx.recv().await else {
            panic!("expected timer event");
        };
        assert_eq!(handle, SessionHandle(7));
        assert_eq!(kind, TimerKind::Setup);
        assert!(session.timers.take_fired(kind, token));
        assert!(!session.timers.take_fired(kind, token));
        assert!(!session.timers.is_armed(TimerKind::Setup));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_everything() {
        let stub = Arc::new(StubConnection::default());
        let channel = Arc::new(StubChannel::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(
            SessionHandle(1),
            SessionId::from("s"),
            "bob".to_string(),
            Direction::Outbound,
            "alice".to_string(),
            stub.clone(),
            Some(channel.clone() as Arc<dyn ProbeChannel>),
            tx,
        );
        session.timers.arm(TimerKind::Setup, Duration::from_secs(10));
        session.shutdown().await;
        assert_eq!(stub.closes.load(Ordering::SeqCst), 1);
        assert!(!channel.is_open());
    }
}
