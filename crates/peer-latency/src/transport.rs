//! Transport abstractions
//!
//! Defines traits for the signaling relay and for peer connections so the
//! measurement logic can run over real WebRTC or the in-memory mock.
//!
//! Backends never touch session state. Everything they observe (local ICE
//! candidates, connection state, channel open/message/close) is reported as a
//! [`SessionEvent`] through the [`SessionEvents`] sink handed to them at
//! creation, and the manager applies it on its own task.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{IceCandidate, SessionDescription, SignalEnvelope};
use crate::session::LoopEvent;
use crate::types::{Direction, SessionHandle, SessionId};

/// Errors from signaling and peer connection operations
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Closed")]
    Closed,
}

/// Signaling relay connection
///
/// Only ever carries connection-setup envelopes, never probe traffic.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send an envelope to the relay
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), TransportError>;

    /// Whether the relay connection is currently usable
    fn is_open(&self) -> bool;
}

/// Byte-stream channel used for ping/pong frames
#[async_trait]
pub trait ProbeChannel: Send + Sync {
    /// Send a text frame to the remote peer
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Check if the channel is open
    fn is_open(&self) -> bool;

    /// Close the channel
    async fn close(&self);
}

/// A NAT-traversing connection to one remote peer
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create an answer and install it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Create the local probe channel (initiator side)
    async fn create_probe_channel(&self) -> Result<Arc<dyn ProbeChannel>, TransportError>;

    /// Best-effort label of the active network path (e.g. "host", "relay")
    async fn network_path_type(&self) -> Option<String>;

    /// Tear down the connection
    async fn close(&self);
}

/// Parameters for a new peer connection
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub session_id: SessionId,
    pub local_uid: String,
    pub target_uid: String,
    pub direction: Direction,
}

/// Factory for creating peer connections
///
/// Implementations must wire the connection's local ICE candidates,
/// connection state changes and (for inbound requests) remotely created data
/// channels into `events`.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        request: ConnectionRequest,
        events: SessionEvents,
    ) -> Result<Box<dyn PeerConnection>, TransportError>;
}

/// ICE connection state as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// States that end a measurement session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IceConnectionState::Failed | IceConnectionState::Disconnected
        )
    }
}

/// Observation reported by a backend for one session
pub enum SessionEvent {
    /// A local network candidate to forward to the remote peer
    LocalCandidate(IceCandidate),
    IceState(IceConnectionState),
    /// The remote peer created the probe channel (responder side)
    ChannelAccepted(Arc<dyn ProbeChannel>),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            SessionEvent::IceState(s) => f.debug_tuple("IceState").field(s).finish(),
            SessionEvent::ChannelAccepted(_) => f.write_str("ChannelAccepted"),
            SessionEvent::ChannelOpen => f.write_str("ChannelOpen"),
            SessionEvent::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(m).finish(),
            SessionEvent::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

/// Event sink bound to one session handle
#[derive(Clone)]
pub struct SessionEvents {
    handle: SessionHandle,
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl SessionEvents {
    pub(crate) fn new(handle: SessionHandle, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self { handle, tx }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Report an event; returns false once the manager has shut down
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.tx
            .send(LoopEvent::Session(self.handle, event))
            .is_ok()
    }

    pub fn local_candidate(&self, candidate: IceCandidate) -> bool {
        self.emit(SessionEvent::LocalCandidate(candidate))
    }

    pub fn ice_state(&self, state: IceConnectionState) -> bool {
        self.emit(SessionEvent::IceState(state))
    }

    pub fn channel_accepted(&self, channel: Arc<dyn ProbeChannel>) -> bool {
        self.emit(SessionEvent::ChannelAccepted(channel))
    }

    pub fn channel_open(&self) -> bool {
        self.emit(SessionEvent::ChannelOpen)
    }

    pub fn channel_message(&self, text: String) -> bool {
        self.emit(SessionEvent::ChannelMessage(text))
    }

    pub fn channel_closed(&self) -> bool {
        self.emit(SessionEvent::ChannelClosed)
    }
}

// Blanket implementation so Arc-wrapped transports can be shared with the host

#[async_trait]
impl<T: SignalingTransport + ?Sized> SignalingTransport for Arc<T> {
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), TransportError> {
        (**self).send(envelope).await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

#[async_trait]
impl<T: PeerConnectionFactory + ?Sized> PeerConnectionFactory for Arc<T> {
    async fn create(
        &self,
        request: ConnectionRequest,
        events: SessionEvents,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        (**self).create(request, events).await
    }
}
