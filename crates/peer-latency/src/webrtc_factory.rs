//! Production WebRTC backend
//!
//! Wraps the webrtc crate to implement [`PeerConnectionFactory`]. Every
//! callback the crate exposes (ICE candidates, ICE state, incoming data
//! channels, channel open/message/close) is turned into a session event; no
//! measurement state lives here.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::transport::{
    ConnectionRequest, IceConnectionState, PeerConnection, PeerConnectionFactory, ProbeChannel,
    SessionEvents, TransportError,
};
use crate::types::{LatencyConfig, DEFAULT_ICE_SERVERS, PROBE_CHANNEL_LABEL};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::candidate::CandidatePairState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

fn negotiation<E: std::fmt::Display>(e: E) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

impl From<RTCIceConnectionState> for IceConnectionState {
    fn from(s: RTCIceConnectionState) -> Self {
        match s {
            RTCIceConnectionState::Checking => IceConnectionState::Checking,
            RTCIceConnectionState::Connected => IceConnectionState::Connected,
            RTCIceConnectionState::Completed => IceConnectionState::Completed,
            RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
            RTCIceConnectionState::Failed => IceConnectionState::Failed,
            RTCIceConnectionState::Closed => IceConnectionState::Closed,
            _ => IceConnectionState::New,
        }
    }
}

/// Probe channel over an `RTCDataChannel`
struct WebRtcProbeChannel {
    dc: Arc<RTCDataChannel>,
}

impl WebRtcProbeChannel {
    /// Route the channel's callbacks into `events`
    fn bind(dc: Arc<RTCDataChannel>, events: SessionEvents) -> Arc<Self> {
        let ev = events.clone();
        dc.on_open(Box::new(move || {
            let ev = ev.clone();
            Box::pin(async move {
                ev.channel_open();
            })
        }));

        let ev = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let ev = ev.clone();
            Box::pin(async move {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        ev.channel_message(text);
                    }
                    Err(_) => debug!("[WebRTC] Ignoring non-text probe frame"),
                }
            })
        }));

        let ev = events;
        dc.on_close(Box::new(move || {
            let ev = ev.clone();
            Box::pin(async move {
                ev.channel_closed();
            })
        }));

        Arc::new(Self { dc })
    }
}

#[async_trait]
impl ProbeChannel for WebRtcProbeChannel {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}

/// One `RTCPeerConnection` bound to a session
struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events: SessionEvents,
}

impl WebRtcConnection {
    fn wire(pc: &Arc<RTCPeerConnection>, events: &SessionEvents) {
        let ev = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ev = ev.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        ev.local_candidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        });
                    }
                    Err(e) => debug!("[WebRTC] Could not serialize candidate: {}", e),
                }
            })
        }));

        let ev = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            let ev = ev.clone();
            Box::pin(async move {
                debug!("[WebRTC] ICE connection state: {}", s);
                ev.ice_state(s.into());
            })
        }));

        // Responder side: capture the initiator's probe channel
        let ev = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let ev = ev.clone();
            Box::pin(async move {
                if dc.label() != PROBE_CHANNEL_LABEL {
                    debug!("[WebRTC] Ignoring data channel {}", dc.label());
                    return;
                }
                let already_open = dc.ready_state() == RTCDataChannelState::Open;
                let channel = WebRtcProbeChannel::bind(dc, ev.clone());
                ev.channel_accepted(channel);
                if already_open {
                    ev.channel_open();
                }
            })
        }));
    }

    /// Candidate type of the nominated, succeeded pair (remote side first)
    async fn selected_path_type(&self) -> Option<String> {
        let stats = self.pc.get_stats().await;
        let pair = stats.reports.values().find_map(|report| match report {
            StatsReportType::CandidatePair(pair)
                if pair.nominated && pair.state == CandidatePairState::Succeeded =>
            {
                Some(pair)
            }
            _ => None,
        })?;

        let candidate_type = |id: &str| match stats.reports.get(id) {
            Some(StatsReportType::RemoteCandidate(c))
            | Some(StatsReportType::LocalCandidate(c)) => Some(c.candidate_type.to_string()),
            _ => None,
        };
        candidate_type(&pair.remote_candidate_id)
            .or_else(|| candidate_type(&pair.local_candidate_id))
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let rtc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpKind::Rollback => {
                return Err(TransportError::Negotiation(
                    "rollback is not supported".to_string(),
                ))
            }
        }
        .map_err(negotiation)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(negotiation)
    }

    async fn create_probe_channel(&self) -> Result<Arc<dyn ProbeChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(PROBE_CHANNEL_LABEL, Some(init))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(WebRtcProbeChannel::bind(dc, self.events.clone()))
    }

    async fn network_path_type(&self) -> Option<String> {
        self.selected_path_type().await
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("[WebRTC] Error closing connection: {}", e);
        }
    }
}

/// Real WebRTC peer connection factory
pub struct WebRtcConnectionFactory {
    ice_servers: Vec<String>,
}

impl WebRtcConnectionFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    pub fn from_config(config: &LatencyConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }

    async fn create_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        api.new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }
}

impl Default for WebRtcConnectionFactory {
    fn default() -> Self {
        Self::new(DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect())
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcConnectionFactory {
    async fn create(
        &self,
        request: ConnectionRequest,
        events: SessionEvents,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        let pc = self.create_connection().await?;
        WebRtcConnection::wire(&pc, &events);
        debug!(
            "[WebRTC] Created {} connection {} -> {}",
            request.direction, request.local_uid, request.target_uid
        );
        Ok(Box::new(WebRtcConnection { pc, events }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_state_mapping() {
        let failed: IceConnectionState = RTCIceConnectionState::Failed.into();
        assert!(failed.is_fatal());
        let disconnected: IceConnectionState = RTCIceConnectionState::Disconnected.into();
        assert!(disconnected.is_fatal());
        let connected: IceConnectionState = RTCIceConnectionState::Connected.into();
        assert!(!connected.is_fatal());
        let unspecified: IceConnectionState = RTCIceConnectionState::Unspecified.into();
        assert_eq!(unspecified, IceConnectionState::New);
    }

    #[test]
    fn test_factory_uses_configured_servers() {
        let mut config = LatencyConfig::default();
        config.ice_servers = vec!["stun:stun.example.org:3478".to_string()];
        let factory = WebRtcConnectionFactory::from_config(&config);
        assert_eq!(factory.ice_servers, vec!["stun:stun.example.org:3478"]);
    }
}
