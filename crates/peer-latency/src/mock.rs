//! In-memory network for tests and simulation
//!
//! [`MockNetwork`] stands in for both the signaling relay and the WebRTC
//! stack:
//! - a signaling hub that routes envelopes by `to` into registered managers
//!   and keeps a log of everything sent
//! - mock peer connections whose "SDP" is just a link id, paired up when the
//!   answerer applies the offer
//! - mock probe channels that deliver frames after a configurable one-way
//!   latency, optionally dropping them
//!
//! Peers that never registered a handle are "silent": envelopes addressed to
//! them are logged and dropped, which is how setup timeouts are exercised.
//! Delivery uses `tokio::time::sleep`, so under a paused clock every
//! round trip is exact.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::manager::{LatencyHandle, LatencyManager};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription, SignalEnvelope};
use crate::publisher::LatencyBook;
use crate::transport::{
    ConnectionRequest, IceConnectionState, PeerConnection, PeerConnectionFactory, ProbeChannel,
    SessionEvents, SignalingTransport, TransportError,
};
use crate::types::{LatencyConfig, LocalIdentity};

const MOCK_SDP_PREFIX: &str = "mock-link:";

fn link_sdp(link: u64) -> String {
    format!("{}{}", MOCK_SDP_PREFIX, link)
}

fn parse_link(sdp: &str) -> Option<u64> {
    sdp.strip_prefix(MOCK_SDP_PREFIX)?.parse().ok()
}

/// Repeating list of one-way delays
struct DelayPattern {
    delays: Vec<Duration>,
    next: usize,
}

impl DelayPattern {
    fn next(&mut self) -> Option<Duration> {
        if self.delays.is_empty() {
            return None;
        }
        let delay = self.delays[self.next % self.delays.len()];
        self.next += 1;
        Some(delay)
    }
}

/// Offer/answer pairing state for one mock connection attempt
struct MockLink {
    offerer_events: SessionEvents,
    offerer_uid: String,
    offerer_channel: Option<Arc<MockProbeChannel>>,
    answerer: Option<(SessionEvents, Arc<MockProbeChannel>)>,
}

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<String, LatencyHandle>,
    sent: Vec<SignalEnvelope>,
    links: HashMap<u64, MockLink>,
    next_link: u64,
    default_latency: Duration,
    latency: HashMap<(String, String), DelayPattern>,
    lossy: HashSet<(String, String)>,
    failing_offers: HashSet<String>,
    applied_candidates: HashMap<String, Vec<IceCandidate>>,
    frames: HashMap<(String, String), usize>,
    connections: HashMap<u64, (String, SessionEvents)>,
    next_connection: u64,
}

/// Shared in-memory signaling relay and peer-to-peer fabric
#[derive(Default)]
pub struct MockNetwork {
    state: Mutex<NetworkState>,
    next_seed: AtomicU64,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // The lock is never held across an await
    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Signaling transport for `uid`, initially open
    pub fn transport(self: &Arc<Self>, uid: &str) -> Arc<MockSignalingTransport> {
        Arc::new(MockSignalingTransport {
            uid: uid.to_string(),
            network: self.clone(),
            open: AtomicBool::new(true),
        })
    }

    pub fn factory(self: &Arc<Self>) -> MockConnectionFactory {
        MockConnectionFactory {
            network: self.clone(),
        }
    }

    /// Route envelopes addressed to `uid` into `handle`
    pub fn register(&self, uid: &str, handle: LatencyHandle) {
        self.lock().inboxes.insert(uid.to_string(), handle);
    }

    /// Make `uid` silent
    pub fn unregister(&self, uid: &str) {
        self.lock().inboxes.remove(uid);
    }

    /// Spawn a manager for `identity`, wired to this network and registered
    pub fn spawn_peer(
        self: &Arc<Self>,
        identity: LocalIdentity,
        config: LatencyConfig,
    ) -> LatencyHandle {
        let seed = self.next_seed.fetch_add(1, Ordering::Relaxed);
        let manager = LatencyManager::new(config, Arc::new(self.factory()), LatencyBook::new())
            .with_seed(seed);
        let handle = manager.spawn();
        self.register(&identity.uid, handle.clone());

        let transport: Arc<dyn SignalingTransport> = self.transport(&identity.uid);
        let _ = handle.attach_transport(Some(transport));
        let _ = handle.set_local_identity(Some(identity));
        handle
    }

    /// One-way latency for every link without an explicit setting
    pub fn set_default_latency(&self, latency: Duration) {
        self.lock().default_latency = latency;
    }

    /// Fixed one-way latency from `from` to `to`
    pub fn set_latency(&self, from: &str, to: &str, latency: Duration) {
        self.set_latency_pattern(from, to, vec![latency]);
    }

    /// One-way latencies from `from` to `to`, cycled per frame
    pub fn set_latency_pattern(&self, from: &str, to: &str, delays: Vec<Duration>) {
        self.lock().latency.insert(
            (from.to_string(), to.to_string()),
            DelayPattern { delays, next: 0 },
        );
    }

    /// Drop every probe frame from `from` to `to`
    pub fn set_loss(&self, from: &str, to: &str, lossy: bool) {
        let key = (from.to_string(), to.to_string());
        let mut state = self.lock();
        if lossy {
            state.lossy.insert(key);
        } else {
            state.lossy.remove(&key);
        }
    }

    /// Make offer creation fail for connections owned by `uid`
    pub fn set_offer_failure(&self, uid: &str, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing_offers.insert(uid.to_string());
        } else {
            state.failing_offers.remove(uid);
        }
    }

    /// Every envelope sent through any mock transport, in order
    pub fn sent_envelopes(&self) -> Vec<SignalEnvelope> {
        self.lock().sent.clone()
    }

    /// Envelopes of one wire type sent by `from`
    pub fn sent_by(&self, from: &str, msg_type: &str) -> Vec<SignalEnvelope> {
        self.lock()
            .sent
            .iter()
            .filter(|e| e.from_uid() == Some(from) && e.msg_type() == msg_type)
            .cloned()
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.lock().sent.len()
    }

    /// Remote candidates applied by `uid`'s connections, in order
    pub fn applied_candidates(&self, uid: &str) -> Vec<IceCandidate> {
        self.lock()
            .applied_candidates
            .get(uid)
            .cloned()
            .unwrap_or_default()
    }

    /// Probe frames sent from `from` to `to` (including dropped ones)
    pub fn frames_sent(&self, from: &str, to: &str) -> usize {
        self.lock()
            .frames
            .get(&(from.to_string(), to.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Mock connections created and not yet closed
    pub fn live_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Report `state` on every open connection owned by `uid`; returns how many
    pub fn set_ice_state(&self, uid: &str, state: IceConnectionState) -> usize {
        let targets: Vec<SessionEvents> = self
            .lock()
            .connections
            .values()
            .filter(|(owner, _)| owner == uid)
            .map(|(_, events)| events.clone())
            .collect();
        for events in &targets {
            events.ice_state(state);
        }
        targets.len()
    }

    fn deliver(&self, envelope: SignalEnvelope) {
        let target = {
            let mut state = self.lock();
            state.sent.push(envelope.clone());
            envelope
                .to_uid()
                .and_then(|to| state.inboxes.get(to).cloned())
        };
        if let Some(handle) = target {
            let _ = handle.handle_signal(envelope);
        }
    }

    /// Decide the fate of one probe frame: `None` means dropped
    fn frame_delay(&self, from: &str, to: &str) -> Option<Duration> {
        let key = (from.to_string(), to.to_string());
        let mut state = self.lock();
        *state.frames.entry(key.clone()).or_default() += 1;
        if state.lossy.contains(&key) {
            return None;
        }
        let default = state.default_latency;
        Some(
            state
                .latency
                .get_mut(&key)
                .and_then(|p| p.next())
                .unwrap_or(default),
        )
    }

    /// Latency of a link without consuming its pattern or counting a frame
    fn base_delay(&self, from: &str, to: &str) -> Duration {
        let state = self.lock();
        state
            .latency
            .get(&(from.to_string(), to.to_string()))
            .and_then(|p| p.delays.first().copied())
            .unwrap_or(state.default_latency)
    }
}

/// Signaling transport attached to a [`MockNetwork`]
pub struct MockSignalingTransport {
    uid: String,
    network: Arc<MockNetwork>,
    open: AtomicBool,
}

impl MockSignalingTransport {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Simulate the relay socket dropping or coming back
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Relaxed);
    }
}

#[async_trait]
impl SignalingTransport for MockSignalingTransport {
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        self.network.deliver(envelope);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

struct RemoteEnd {
    events: SessionEvents,
    channel: Weak<MockProbeChannel>,
}

/// Probe channel delivering frames through the mock network
pub struct MockProbeChannel {
    network: Arc<MockNetwork>,
    local_uid: String,
    remote_uid: String,
    open: AtomicBool,
    remote: Mutex<Option<RemoteEnd>>,
}

impl MockProbeChannel {
    fn new(network: Arc<MockNetwork>, local_uid: &str, remote_uid: &str) -> Arc<Self> {
        Arc::new(Self {
            network,
            local_uid: local_uid.to_string(),
            remote_uid: remote_uid.to_string(),
            open: AtomicBool::new(false),
            remote: Mutex::new(None),
        })
    }

    fn remote(&self) -> MutexGuard<'_, Option<RemoteEnd>> {
        self.remote.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn connect(&self, events: SessionEvents, channel: &Arc<MockProbeChannel>) {
        *self.remote() = Some(RemoteEnd {
            events,
            channel: Arc::downgrade(channel),
        });
    }

    fn mark_open(&self) {
        self.open.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl ProbeChannel for MockProbeChannel {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let Some(events) = self.remote().as_ref().map(|r| r.events.clone()) else {
            return Err(TransportError::NotConnected);
        };
        let Some(delay) = self.network.frame_delay(&self.local_uid, &self.remote_uid) else {
            return Ok(());
        };
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            events.channel_message(text);
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::Relaxed) {
            return;
        }
        let Some(remote) = self.remote().take() else {
            return;
        };
        if let Some(peer) = remote.channel.upgrade() {
            peer.open.store(false, Ordering::Relaxed);
            peer.remote().take();
        }
        let delay = self.network.base_delay(&self.local_uid, &self.remote_uid);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            remote.events.channel_closed();
        });
    }
}

/// Peer connection backed by the mock network
pub struct MockConnection {
    id: u64,
    network: Arc<MockNetwork>,
    request: ConnectionRequest,
    events: SessionEvents,
    link: Mutex<Option<u64>>,
    channel: Mutex<Option<Arc<MockProbeChannel>>>,
    closed: AtomicBool,
}

impl MockConnection {
    fn link(&self) -> Option<u64> {
        *self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_link(&self, link: u64) {
        *self.link.lock().unwrap_or_else(|e| e.into_inner()) = Some(link);
    }

    fn channel(&self) -> Option<Arc<MockProbeChannel>> {
        self.channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_channel(&self, channel: Arc<MockProbeChannel>) {
        *self.channel.lock().unwrap_or_else(|e| e.into_inner()) = Some(channel);
    }

    fn emit_local_candidate(&self, link: u64) {
        self.events.local_candidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                link,
                50_000 + link % 10_000
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        });
    }

    /// Answerer side: pair with the offerer's link
    fn accept_offer(&self, link: u64) -> Result<(), TransportError> {
        let local = self.request.local_uid.as_str();
        let channel = MockProbeChannel::new(self.network.clone(), local, &self.request.target_uid);
        {
            let mut state = self.network.lock();
            let entry = state
                .links
                .get_mut(&link)
                .ok_or_else(|| TransportError::Negotiation(format!("unknown mock link {}", link)))?;
            let offerer_channel = entry
                .offerer_channel
                .clone()
                .ok_or_else(|| TransportError::Negotiation("offer without channel".to_string()))?;
            channel.connect(entry.offerer_events.clone(), &offerer_channel);
            offerer_channel.connect(self.events.clone(), &channel);
            entry.answerer = Some((self.events.clone(), channel.clone()));
            tracing::trace!(
                "[MockNetwork] {} joined link {} from {}",
                local,
                link,
                entry.offerer_uid
            );
        }
        self.set_link(link);
        self.set_channel(channel.clone());
        self.events.channel_accepted(channel);
        Ok(())
    }

    /// Offerer side: the answer arrived, open both ends
    fn complete_link(&self) {
        let Some(link) = self.link() else {
            return;
        };
        let paired = {
            let state = self.network.lock();
            state.links.get(&link).and_then(|l| {
                l.answerer
                    .clone()
                    .map(|(events, channel)| (events, channel, l.offerer_channel.clone()))
            })
        };
        // Answer for a link nobody joined: negotiation never completes
        let Some((answerer_events, answerer_channel, offerer_channel)) = paired else {
            return;
        };
        answerer_channel.mark_open();
        if let Some(channel) = offerer_channel {
            channel.mark_open();
        }
        self.events.channel_open();
        answerer_events.channel_open();
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let uid = &self.request.local_uid;
        let link = {
            let mut state = self.network.lock();
            if state.failing_offers.contains(uid) {
                return Err(TransportError::Negotiation("offer creation failed".to_string()));
            }
            state.next_link += 1;
            let link = state.next_link;
            state.links.insert(
                link,
                MockLink {
                    offerer_events: self.events.clone(),
                    offerer_uid: uid.clone(),
                    offerer_channel: self.channel(),
                    answerer: None,
                },
            );
            link
        };
        self.set_link(link);
        self.emit_local_candidate(link);
        Ok(SessionDescription::offer(link_sdp(link)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let link = self
            .link()
            .ok_or_else(|| TransportError::Negotiation("no remote offer".to_string()))?;
        self.emit_local_candidate(link);
        Ok(SessionDescription::answer(link_sdp(link)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let link = parse_link(&desc.sdp)
            .ok_or_else(|| TransportError::Negotiation("malformed mock sdp".to_string()))?;
        match desc.kind {
            SdpKind::Offer => self.accept_offer(link),
            SdpKind::Answer if self.link() == Some(link) => {
                self.complete_link();
                Ok(())
            }
            SdpKind::Answer => Err(TransportError::Negotiation(format!(
                "answer for foreign link {}",
                link
            ))),
            other => Err(TransportError::Negotiation(format!(
                "unsupported description {:?}",
                other
            ))),
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.network
            .lock()
            .applied_candidates
            .entry(self.request.local_uid.clone())
            .or_default()
            .push(candidate);
        Ok(())
    }

    async fn create_probe_channel(&self) -> Result<Arc<dyn ProbeChannel>, TransportError> {
        let channel = MockProbeChannel::new(
            self.network.clone(),
            &self.request.local_uid,
            &self.request.target_uid,
        );
        self.set_channel(channel.clone());
        Ok(channel)
    }

    async fn network_path_type(&self) -> Option<String> {
        Some("host".to_string())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let channel = self.channel();
        {
            let mut state = self.network.lock();
            state.connections.remove(&self.id);
            if let Some(link) = self.link() {
                state.links.remove(&link);
            }
        }
        if let Some(channel) = channel {
            channel.close().await;
        }
    }
}

/// Connection factory producing [`MockConnection`]s
pub struct MockConnectionFactory {
    network: Arc<MockNetwork>,
}

#[async_trait]
impl PeerConnectionFactory for MockConnectionFactory {
    async fn create(
        &self,
        request: ConnectionRequest,
        events: SessionEvents,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        let id = {
            let mut state = self.network.lock();
            state.next_connection += 1;
            let id = state.next_connection;
            state
                .connections
                .insert(id, (request.local_uid.clone(), events.clone()));
            id
        };
        Ok(Box::new(MockConnection {
            id,
            network: self.network.clone(),
            request,
            events,
            link: Mutex::new(None),
            channel: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_sdp_round_trip() {
        assert_eq!(parse_link(&link_sdp(42)), Some(42));
        assert_eq!(parse_link("v=0"), None);
    }

    #[test]
    fn test_frame_delay_pattern_and_loss() {
        let network = MockNetwork::new();
        network.set_default_latency(Duration::from_millis(7));
        network.set_latency_pattern(
            "a",
            "b",
            vec![Duration::from_millis(1), Duration::from_millis(2)],
        );
        assert_eq!(network.frame_delay("a", "b"), Some(Duration::from_millis(1)));
        assert_eq!(network.frame_delay("a", "b"), Some(Duration::from_millis(2)));
        assert_eq!(network.frame_delay("a", "b"), Some(Duration::from_millis(1)));
        assert_eq!(network.frame_delay("b", "a"), Some(Duration::from_millis(7)));

        network.set_loss("b", "a", true);
        assert_eq!(network.frame_delay("b", "a"), None);
        assert_eq!(network.frames_sent("b", "a"), 2);
    }

    #[tokio::test]
    async fn test_silent_peer_drops_envelopes() {
        let network = MockNetwork::new();
        let transport = network.transport("alice");
        let env = SignalEnvelope::from_json(
            r#"{"type":"peer-latency-decline","measurementId":"m","to":"ghost","from":"alice"}"#,
        )
        .unwrap()
        .unwrap();
        transport.send(env.clone()).await.unwrap();
        assert_eq!(network.sent_envelopes(), vec![env.clone()]);

        transport.set_open(false);
        assert!(matches!(
            transport.send(env).await,
            Err(TransportError::NotConnected)
        ));
        assert_eq!(network.sent_count(), 1);
    }
}
