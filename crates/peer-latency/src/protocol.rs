//! Wire formats for latency measurement
//!
//! Two JSON protocols are spoken:
//! - Signaling envelopes on the shared relay socket:
//!   `{"type":"peer-latency-offer","measurementId":..,"to":..,"from":..,"offer":{..}}`
//! - Probe frames on the ephemeral data channel:
//!   `{"type":"latency-ping","seq":1,"time":12.5}`, `latency-pong`, `latency-complete`
//!
//! Field names follow the browser `RTCSessionDescriptionInit` and
//! `RTCIceCandidateInit` shapes so both ends can be JS or Rust clients.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::SessionId;

pub const MSG_TYPE_OFFER: &str = "peer-latency-offer";
pub const MSG_TYPE_ANSWER: &str = "peer-latency-answer";
pub const MSG_TYPE_CANDIDATE: &str = "peer-latency-candidate";
pub const MSG_TYPE_DECLINE: &str = "peer-latency-decline";

const SIGNAL_TYPES: [&str; 4] = [
    MSG_TYPE_OFFER,
    MSG_TYPE_ANSWER,
    MSG_TYPE_CANDIDATE,
    MSG_TYPE_DECLINE,
];

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Connection-setup description exchanged via signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network path hint discovered by ICE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Why a responder refused an offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeclineReason {
    /// Responder is in a live match
    Busy,
    /// Responder already answers its maximum of inbound sessions
    AtCapacity,
    /// Responder could not build an answer
    AnswerError,
    Other(String),
}

impl DeclineReason {
    pub fn as_str(&self) -> &str {
        match self {
            DeclineReason::Busy => "busy",
            DeclineReason::AtCapacity => "at-capacity",
            DeclineReason::AnswerError => "answer-error",
            DeclineReason::Other(s) => s,
        }
    }
}

impl From<String> for DeclineReason {
    fn from(s: String) -> Self {
        match s.as_str() {
            "busy" => DeclineReason::Busy,
            "at-capacity" => DeclineReason::AtCapacity,
            "answer-error" => DeclineReason::AnswerError,
            _ => DeclineReason::Other(s),
        }
    }
}

impl From<DeclineReason> for String {
    fn from(r: DeclineReason) -> Self {
        r.as_str().to_string()
    }
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addressing shared by every outgoing envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub measurement_id: SessionId,
    pub to: String,
    pub from: String,
}

/// Signaling envelope on the shared relay socket
///
/// Every field is optional on the wire; handlers drop envelopes that lack
/// what they need instead of failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalEnvelope {
    #[serde(rename = "peer-latency-offer")]
    Offer {
        #[serde(rename = "measurementId", default, skip_serializing_if = "Option::is_none")]
        measurement_id: Option<SessionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offer: Option<SessionDescription>,
    },

    #[serde(rename = "peer-latency-answer")]
    Answer {
        #[serde(rename = "measurementId", default, skip_serializing_if = "Option::is_none")]
        measurement_id: Option<SessionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<SessionDescription>,
    },

    #[serde(rename = "peer-latency-candidate")]
    Candidate {
        #[serde(rename = "measurementId", default, skip_serializing_if = "Option::is_none")]
        measurement_id: Option<SessionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        candidate: Option<IceCandidate>,
    },

    #[serde(rename = "peer-latency-decline")]
    Decline {
        #[serde(rename = "measurementId", default, skip_serializing_if = "Option::is_none")]
        measurement_id: Option<SessionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<DeclineReason>,
    },
}

impl SignalEnvelope {
    pub fn offer(route: Route, offer: SessionDescription) -> Self {
        SignalEnvelope::Offer {
            measurement_id: Some(route.measurement_id),
            to: Some(route.to),
            from: Some(route.from),
            offer: Some(offer),
        }
    }

    pub fn answer(route: Route, answer: SessionDescription) -> Self {
        SignalEnvelope::Answer {
            measurement_id: Some(route.measurement_id),
            to: Some(route.to),
            from: Some(route.from),
            answer: Some(answer),
        }
    }

    pub fn candidate(route: Route, candidate: IceCandidate) -> Self {
        SignalEnvelope::Candidate {
            measurement_id: Some(route.measurement_id),
            to: Some(route.to),
            from: Some(route.from),
            candidate: Some(candidate),
        }
    }

    pub fn decline(route: Route, reason: DeclineReason) -> Self {
        SignalEnvelope::Decline {
            measurement_id: Some(route.measurement_id),
            to: Some(route.to),
            from: Some(route.from),
            reason: Some(reason),
        }
    }

    /// Parse a raw relay frame
    ///
    /// Returns `Ok(None)` when the frame is a JSON object of some other
    /// message type, so the host can route it elsewhere.
    pub fn from_json(raw: &str) -> Result<Option<Self>, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let known = value
            .get("type")
            .and_then(|t| t.as_str())
            .map(|t| SIGNAL_TYPES.contains(&t))
            .unwrap_or(false);
        if !known {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of this envelope's type
    pub fn msg_type(&self) -> &'static str {
        match self {
            SignalEnvelope::Offer { .. } => MSG_TYPE_OFFER,
            SignalEnvelope::Answer { .. } => MSG_TYPE_ANSWER,
            SignalEnvelope::Candidate { .. } => MSG_TYPE_CANDIDATE,
            SignalEnvelope::Decline { .. } => MSG_TYPE_DECLINE,
        }
    }

    pub fn measurement_id(&self) -> Option<&SessionId> {
        match self {
            SignalEnvelope::Offer { measurement_id, .. }
            | SignalEnvelope::Answer { measurement_id, .. }
            | SignalEnvelope::Candidate { measurement_id, .. }
            | SignalEnvelope::Decline { measurement_id, .. } => measurement_id.as_ref(),
        }
    }

    pub fn to_uid(&self) -> Option<&str> {
        match self {
            SignalEnvelope::Offer { to, .. }
            | SignalEnvelope::Answer { to, .. }
            | SignalEnvelope::Candidate { to, .. }
            | SignalEnvelope::Decline { to, .. } => to.as_deref(),
        }
    }

    pub fn from_uid(&self) -> Option<&str> {
        match self {
            SignalEnvelope::Offer { from, .. }
            | SignalEnvelope::Answer { from, .. }
            | SignalEnvelope::Candidate { from, .. }
            | SignalEnvelope::Decline { from, .. } => from.as_deref(),
        }
    }

    /// Check if this envelope is addressed to a peer (unaddressed counts)
    pub fn is_for(&self, uid: &str) -> bool {
        self.to_uid().map(|to| to == uid).unwrap_or(true)
    }
}

/// Frames exchanged on the probe channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProbeMessage {
    #[serde(rename = "latency-ping")]
    Ping { seq: u32, time: f64 },

    /// Echo of a ping; `time` is copied back unchanged
    #[serde(rename = "latency-pong")]
    Pong {
        seq: u32,
        #[serde(default)]
        time: f64,
    },

    /// Initiator is done; responder tears down
    #[serde(rename = "latency-complete")]
    Complete,
}

impl ProbeMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a probe frame, `None` for anything we don't understand
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> Route {
        Route {
            measurement_id: SessionId::from("a-b-1"),
            to: "b".to_string(),
            from: "a".to_string(),
        }
    }

    #[test]
    fn test_offer_wire_shape() {
        let env = SignalEnvelope::offer(route(), SessionDescription::offer("v=0"));
        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "peer-latency-offer");
        assert_eq!(json["measurementId"], "a-b-1");
        assert_eq!(json["to"], "b");
        assert_eq!(json["from"], "a");
        assert_eq!(json["offer"]["type"], "offer");
        assert_eq!(json["offer"]["sdp"], "v=0");
    }

    #[test]
    fn test_parse_browser_candidate() {
        let raw = r#"{
            "type": "peer-latency-candidate",
            "measurementId": "a-b-1",
            "to": "b",
            "from": "a",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "abcd"
            }
        }"#;
        let env = SignalEnvelope::from_json(raw).unwrap().unwrap();
        match env {
            SignalEnvelope::Candidate { candidate, .. } => {
                let c = candidate.unwrap();
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_m_line_index, Some(0));
                assert_eq!(c.username_fragment.as_deref(), Some("abcd"));
            }
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_unhandled() {
        let raw = r#"{"type":"webrtc-ping-offer","from":"x"}"#;
        assert!(SignalEnvelope::from_json(raw).unwrap().is_none());

        let raw = r#"{"from":"x"}"#;
        assert!(SignalEnvelope::from_json(raw).unwrap().is_none());
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(SignalEnvelope::from_json("{not json").is_err());
    }

    #[test]
    fn test_missing_fields_still_parse() {
        let env = SignalEnvelope::from_json(r#"{"type":"peer-latency-decline"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(env.msg_type(), MSG_TYPE_DECLINE);
        assert!(env.measurement_id().is_none());
        assert!(env.is_for("anyone"));
    }

    #[test]
    fn test_decline_reason_tags() {
        let env = SignalEnvelope::decline(route(), DeclineReason::AtCapacity);
        let json = env.to_json().unwrap();
        assert!(json.contains("\"reason\":\"at-capacity\""));

        let parsed = SignalEnvelope::from_json(
            r#"{"type":"peer-latency-decline","measurementId":"m","reason":"shutting-down"}"#,
        )
        .unwrap()
        .unwrap();
        match parsed {
            SignalEnvelope::Decline { reason, .. } => {
                assert_eq!(reason, Some(DeclineReason::Other("shutting-down".to_string())));
            }
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[test]
    fn test_probe_frames() {
        let ping = ProbeMessage::Ping { seq: 3, time: 12.5 };
        assert_eq!(
            ping.encode().unwrap(),
            r#"{"type":"latency-ping","seq":3,"time":12.5}"#
        );
        assert_eq!(
            ProbeMessage::Complete.encode().unwrap(),
            r#"{"type":"latency-complete"}"#
        );
        assert_eq!(
            ProbeMessage::parse(r#"{"type":"latency-pong","seq":3,"time":12.5}"#),
            Some(ProbeMessage::Pong { seq: 3, time: 12.5 })
        );
        assert_eq!(ProbeMessage::parse(r#"{"type":"latency-pong"}"#), None);
        assert_eq!(ProbeMessage::parse("garbage"), None);
    }
}
