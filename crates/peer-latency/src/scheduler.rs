//! Measurement target selection
//!
//! Picks which lobby peer to measure next. Lower score wins:
//! - +5 when either side's country is unknown
//! - +10 when the countries differ (case-insensitive)
//! - + remaining freshness (seconds) of the last measurement, if any
//! - + up to 0.01 of random noise to break ties
//!
//! Peers measured or unsuccessfully negotiated with inside the TTL are not
//! candidates at all, so the freshness term only matters for peers whose TTL
//! was shortened or for callers scoring peers directly.

use rand::Rng;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{LatencyConfig, LocalIdentity, PeerInfo};

/// Penalty when either country code is unknown
const UNKNOWN_COUNTRY_PENALTY: f64 = 5.0;
/// Penalty when country codes differ
const COUNTRY_MISMATCH_PENALTY: f64 = 10.0;
/// Scale of the random tie-breaker
const TIE_BREAK_NOISE: f64 = 0.01;

/// Freshness tracker and selector
#[derive(Debug, Clone)]
pub struct PeerScheduler {
    /// How long a measurement (or failed negotiation) keeps a peer out
    ttl: Duration,
    /// Last successful measurement per peer
    last_measured: HashMap<String, Instant>,
    /// Last declined or timed-out negotiation per peer
    last_attempted: HashMap<String, Instant>,
}

impl PeerScheduler {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            last_measured: HashMap::new(),
            last_attempted: HashMap::new(),
        }
    }

    pub fn mark_measured(&mut self, uid: &str, at: Instant) {
        self.last_measured.insert(uid.to_string(), at);
    }

    pub fn mark_attempted(&mut self, uid: &str, at: Instant) {
        self.last_attempted.insert(uid.to_string(), at);
    }

    pub fn last_measured(&self, uid: &str) -> Option<Instant> {
        self.last_measured.get(uid).copied()
    }

    /// Forget all freshness (identity switched to another user)
    pub fn clear(&mut self) {
        self.last_measured.clear();
        self.last_attempted.clear();
    }

    fn within_ttl(&self, at: Option<&Instant>, now: Instant) -> bool {
        at.map(|t| now.saturating_duration_since(*t) < self.ttl)
            .unwrap_or(false)
    }

    /// Whether a peer may be measured again
    pub fn is_due(&self, uid: &str, now: Instant) -> bool {
        !self.within_ttl(self.last_measured.get(uid), now)
            && !self.within_ttl(self.last_attempted.get(uid), now)
    }

    /// Peers that may be measured right now
    pub fn candidates<'a>(
        &self,
        local: &LocalIdentity,
        peers: &'a [PeerInfo],
        config: &LatencyConfig,
        now: Instant,
    ) -> Vec<&'a PeerInfo> {
        peers
            .iter()
            .filter(|p| !p.uid.is_empty())
            .filter(|p| p.uid != local.uid)
            .filter(|p| !config.is_synthetic_uid(&p.uid))
            .filter(|p| self.is_due(&p.uid, now))
            .collect()
    }

    /// Priority score of one peer (lower is measured sooner)
    pub fn priority_score<R: Rng + ?Sized>(
        &self,
        peer: &PeerInfo,
        local_country: Option<&str>,
        now: Instant,
        rng: &mut R,
    ) -> f64 {
        let mut score = 0.0;

        let local = local_country.filter(|c| !c.is_empty());
        let remote = peer.country_code.as_deref().filter(|c| !c.is_empty());
        match (local, remote) {
            (Some(a), Some(b)) => {
                if !a.eq_ignore_ascii_case(b) {
                    score += COUNTRY_MISMATCH_PENALTY;
                }
            }
            _ => score += UNKNOWN_COUNTRY_PENALTY,
        }

        if let Some(at) = self.last_measured.get(&peer.uid) {
            let age = now.saturating_duration_since(*at);
            score += self.ttl.saturating_sub(age).as_secs_f64();
        }

        score + rng.gen::<f64>() * TIE_BREAK_NOISE
    }

    /// Choose the next peer to measure, if any is eligible
    pub fn select_next<'a, R: Rng + ?Sized>(
        &self,
        local: &LocalIdentity,
        peers: &'a [PeerInfo],
        config: &LatencyConfig,
        now: Instant,
        rng: &mut R,
    ) -> Option<&'a PeerInfo> {
        let local_country = local.country_code.as_deref();
        self.candidates(local, peers, config, now)
            .into_iter()
            .map(|p| (p, self.priority_score(p, local_country, now, rng)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
            .map(|(p, _)| p)
    }
}
