//! Peer-to-peer latency measurement
//!
//! Periodically measures round-trip latency and stability between the local
//! user and other users visible in a shared lobby, over short-lived
//! NAT-traversing peer connections, and publishes the results for ping
//! display and peer selection.
//!
//! # Overview
//!
//! - **Scheduling**: every tick, pick the best stale peer (same country first)
//! - **Signaling**: offer/answer/candidate/decline envelopes over a shared relay
//! - **Measurement**: numbered pings over a probe data channel, mean RTT and jitter
//! - **Publication**: whole-snapshot replacement of the user's latency records
//!
//! All state is owned by a single [`LatencyManager`] task; the host drives it
//! through a cloneable [`LatencyHandle`].
//!
//! # Example
//!
//! ```rust,no_run
//! use peer_latency::{
//!     LatencyBook, LatencyConfig, LatencyManager, LocalIdentity, PeerInfo,
//!     WebRtcConnectionFactory, WsSignalingTransport,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LatencyConfig::default();
//!     let factory = Arc::new(WebRtcConnectionFactory::from_config(&config));
//!     let handle = LatencyManager::new(config, factory, LatencyBook::new()).spawn();
//!
//!     WsSignalingTransport::connect("wss://signal.example.org", handle.clone(), None).await?;
//!     handle.set_local_identity(Some(LocalIdentity::new("alice").with_country("SE")))?;
//!     handle.set_peers(vec![PeerInfo::new("bob").with_country("SE")])?;
//!
//!     // Results show up in the book as measurements complete
//!     let mut updates = handle.book().subscribe();
//!     updates.changed().await?;
//!     println!("{:?}", handle.book().get("bob"));
//!     Ok(())
//! }
//! ```

pub mod connector;
pub mod manager;
pub mod measurement;
pub mod mock;
pub mod protocol;
pub mod publisher;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod types;
pub mod webrtc_factory;
pub mod ws;

pub use connector::ConnectError;
pub use manager::{
    Command, LatencyError, LatencyHandle, LatencyManager, ManagerSnapshot, SessionSummary,
};
pub use measurement::{compute_jitter, summarize, MeasurementSummary, ProbeState};
pub use mock::{MockConnectionFactory, MockNetwork, MockProbeChannel, MockSignalingTransport};
pub use protocol::{
    DeclineReason, IceCandidate, ProbeMessage, ProtocolError, Route, SdpKind, SessionDescription,
    SignalEnvelope, MSG_TYPE_ANSWER, MSG_TYPE_CANDIDATE, MSG_TYPE_DECLINE, MSG_TYPE_OFFER,
};
pub use publisher::{
    resolve_ping_between, KnownPing, LatencyBook, LatencyRecord, LatencyRecordSet, PeerProfile,
    ResolvedPing,
};
pub use registry::{RegistryError, SessionRegistry};
pub use scheduler::PeerScheduler;
pub use session::{FailureReason, Session, SessionOutcome, SessionState, TimerKind};
pub use transport::{
    ConnectionRequest, IceConnectionState, PeerConnection, PeerConnectionFactory, ProbeChannel,
    SessionEvent, SessionEvents, SignalingTransport, TransportError,
};
pub use types::{
    unix_millis, Direction, LatencyConfig, LocalIdentity, PeerInfo, SessionHandle, SessionId,
    DEFAULT_ICE_SERVERS, MOCK_UID_PREFIX, PROBE_CHANNEL_LABEL,
};
pub use webrtc_factory::WebRtcConnectionFactory;
pub use ws::WsSignalingTransport;
