//! Core types for peer latency measurement
//!
//! Identities, roster entries, session identifiers and the runtime
//! configuration shared by the scheduler, sessions and manager.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Data channel label used for the ping/pong probe
pub const PROBE_CHANNEL_LABEL: &str = "latency-probe";

/// Default STUN server used for NAT traversal
pub const DEFAULT_ICE_SERVERS: &[&str] = &["stun:stun.l.google.com:19302"];

/// Prefix of synthetic lobby users that must never be measured
pub const MOCK_UID_PREFIX: &str = "mock-";

/// A user visible in the shared lobby
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub uid: String,
    #[serde(rename = "countryCode", default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    /// Self-reported network metric (ms), if the peer publishes one
    #[serde(rename = "ping", default, skip_serializing_if = "Option::is_none")]
    pub reported_ping: Option<f64>,
}

impl PeerInfo {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            country_code: None,
            reported_ping: None,
        }
    }

    pub fn with_country(mut self, country_code: impl Into<String>) -> Self {
        self.country_code = Some(country_code.into());
        self
    }
}

/// The local user on whose behalf measurements are taken
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub uid: String,
    pub country_code: Option<String>,
}

impl LocalIdentity {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            country_code: None,
        }
    }

    pub fn with_country(mut self, country_code: impl Into<String>) -> Self {
        self.country_code = Some(country_code.into());
        self
    }
}

/// Which side initiated a measurement session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// We sent the offer
    Outbound,
    /// The remote peer sent the offer
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

/// Measurement identifier carried in every signaling envelope
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint the id for a session we initiate
    pub fn outbound(local_uid: &str, target_uid: &str, unix_millis: u128) -> Self {
        Self(format!("{}-{}-{}", local_uid, target_uid, unix_millis))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Arena handle for a live session
///
/// Handles are minted from a counter and never reused, so events addressed to
/// a torn-down session can never reach a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub(crate) u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Milliseconds since the Unix epoch
pub fn unix_millis(at: SystemTime) -> u128 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Runtime configuration for the latency subsystem
#[derive(Debug, Clone)]
pub struct LatencyConfig {
    /// How often the scheduler considers starting a measurement
    pub tick_interval: Duration,
    /// A peer measured more recently than this is not re-measured
    pub measurement_ttl: Duration,
    /// Session must open its probe channel within this window
    pub setup_timeout: Duration,
    /// Session must finish within this window once the channel is open
    pub measurement_timeout: Duration,
    /// Delay between channel open and the first ping
    pub warmup_delay: Duration,
    /// Spacing between consecutive pings
    pub ping_interval: Duration,
    /// Number of pings sent per session
    pub ping_sample_target: u32,
    /// Finalize early once this many samples are in and nothing is outstanding
    pub early_finalize_samples: usize,
    /// Completion timer fires this many ping intervals after the last ping
    pub completion_grace_factor: u32,
    /// Jitter (ms) at or above which a link is flagged unstable
    pub unstable_jitter_ms: f64,
    /// Concurrent inbound sessions we answer
    pub max_inbound_sessions: usize,
    /// Uids starting with this prefix are synthetic and skipped
    pub mock_uid_prefix: String,
    /// Additional uids that are never measured
    pub excluded_uids: HashSet<String>,
    /// STUN/TURN urls for the production backend
    pub ice_servers: Vec<String>,
}

impl LatencyConfig {
    /// Delay before the completion timer forces finalization
    pub fn completion_grace(&self) -> Duration {
        self.ping_interval * self.completion_grace_factor
    }

    /// Whether a uid belongs to a synthetic/test user
    pub fn is_synthetic_uid(&self, uid: &str) -> bool {
        (!self.mock_uid_prefix.is_empty() && uid.starts_with(&self.mock_uid_prefix))
            || self.excluded_uids.contains(uid)
    }
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            measurement_ttl: Duration::from_secs(2 * 60),
            setup_timeout: Duration::from_secs(10),
            measurement_timeout: Duration::from_secs(10),
            warmup_delay: Duration::from_millis(100),
            ping_interval: Duration::from_millis(180),
            ping_sample_target: 5,
            early_finalize_samples: 3,
            completion_grace_factor: 4,
            unstable_jitter_ms: 6.0,
            max_inbound_sessions: 1,
            mock_uid_prefix: MOCK_UID_PREFIX.to_string(),
            excluded_uids: HashSet::new(),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}
