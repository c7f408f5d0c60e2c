//! Published latency results
//!
//! [`LatencyBook`] is the shared read model: the owning user's list of
//! "last known pings", one entry per peer. Writes replace the whole snapshot
//! so readers never see a half-updated list, and a write is dropped when the
//! book no longer belongs to the user who started the measurement.
//!
//! [`resolve_ping_between`] is the lookup used when rendering a ping between
//! two arbitrary lobby users.

use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::debug;

use crate::measurement::MeasurementSummary;
use crate::types::unix_millis;

/// One peer's last measured latency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyRecord {
    /// Peer uid
    pub id: String,
    pub ping: u32,
    #[serde(default)]
    pub jitter: u32,
    #[serde(rename = "isUnstable", default)]
    pub is_unstable: bool,
    #[serde(rename = "networkType", default, skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,
    /// Unix milliseconds
    #[serde(rename = "measuredAt", default)]
    pub measured_at: u64,
}

impl LatencyRecord {
    pub fn from_summary(
        peer_uid: &str,
        summary: &MeasurementSummary,
        network_type: Option<String>,
        measured_at: SystemTime,
    ) -> Self {
        Self {
            id: peer_uid.to_string(),
            ping: summary.ping,
            jitter: summary.jitter,
            is_unstable: summary.is_unstable,
            network_type,
            measured_at: unix_millis(measured_at) as u64,
        }
    }
}

/// Snapshot of one user's published results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyRecordSet {
    /// Uid the records belong to
    pub owner: Option<String>,
    /// At most one record per peer, most recent last
    pub records: Vec<LatencyRecord>,
}

impl LatencyRecordSet {
    pub fn get(&self, peer_uid: &str) -> Option<&LatencyRecord> {
        self.records.iter().find(|r| r.id == peer_uid)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Copy with `record` replacing any earlier entry for the same peer
    fn with_record(&self, record: LatencyRecord) -> Self {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.id != record.id)
            .cloned()
            .collect();
        records.push(record);
        Self {
            owner: self.owner.clone(),
            records,
        }
    }
}

/// Shared, atomically replaced result store
#[derive(Clone)]
pub struct LatencyBook {
    tx: Arc<watch::Sender<Arc<LatencyRecordSet>>>,
}

impl Default for LatencyBook {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyBook {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(LatencyRecordSet::default()));
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<LatencyRecordSet> {
        self.tx.borrow().clone()
    }

    /// Change notifications for UI consumers
    pub fn subscribe(&self) -> watch::Receiver<Arc<LatencyRecordSet>> {
        self.tx.subscribe()
    }

    /// Seed with records loaded by the host (e.g. from the user profile)
    pub fn load(&self, owner: &str, records: Vec<LatencyRecord>) {
        self.tx.send_replace(Arc::new(LatencyRecordSet {
            owner: Some(owner.to_string()),
            records,
        }));
    }

    /// Point the book at a user; another user's records are discarded
    pub fn bind_owner(&self, owner: Option<&str>) {
        self.tx.send_if_modified(|set| {
            if set.owner.as_deref() == owner {
                return false;
            }
            *set = Arc::new(LatencyRecordSet {
                owner: owner.map(str::to_string),
                records: Vec::new(),
            });
            true
        });
    }

    /// Publish a result taken on behalf of `started_by`
    ///
    /// Returns false, leaving the book untouched, when the book belongs to
    /// someone else by now.
    pub fn publish(&self, started_by: &str, record: LatencyRecord) -> bool {
        let peer = record.id.clone();
        let written = self.tx.send_if_modified(|set| {
            if set.owner.as_deref() != Some(started_by) {
                return false;
            }
            *set = Arc::new(set.with_record(record));
            true
        });
        if !written {
            debug!(
                "[Latency] Dropping result for {} taken as {}: identity changed",
                peer, started_by
            );
        }
        written
    }

    pub fn get(&self, peer_uid: &str) -> Option<LatencyRecord> {
        self.tx.borrow().get(peer_uid).cloned()
    }
}

/// Entry of a profile's "last known pings" as stored by other clients
///
/// Older clients wrote `ping` as a string, so it is parsed leniently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnownPing {
    pub id: String,
    #[serde(default, deserialize_with = "lenient_ms")]
    pub ping: Option<f64>,
    #[serde(rename = "isUnstable", default)]
    pub is_unstable: Option<bool>,
}

impl From<&LatencyRecord> for KnownPing {
    fn from(r: &LatencyRecord) -> Self {
        Self {
            id: r.id.clone(),
            ping: Some(r.ping as f64),
            is_unstable: Some(r.is_unstable),
        }
    }
}

fn lenient_ms<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

/// A lobby user's profile as far as ping display is concerned
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerProfile {
    pub uid: String,
    #[serde(rename = "lastKnownPings", default)]
    pub last_known_pings: Vec<KnownPing>,
    /// Self-reported ping, used when nobody measured the pair
    #[serde(default, deserialize_with = "lenient_ms")]
    pub ping: Option<f64>,
}

/// Ping shown between two users
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResolvedPing {
    pub ping: Option<f64>,
    pub is_unstable: Option<bool>,
}

/// Resolve the ping to show for `user` as seen by `viewer`
///
/// Prefers the viewer's own measurement of the user, then the user's
/// measurement of the viewer, then the user's self-reported ping.
pub fn resolve_ping_between(
    user: Option<&PeerProfile>,
    viewer: Option<&PeerProfile>,
) -> ResolvedPing {
    let Some(user) = user else {
        return ResolvedPing::default();
    };
    if let Some(viewer) = viewer {
        if viewer.uid == user.uid {
            return ResolvedPing {
                ping: Some(0.0),
                is_unstable: None,
            };
        }
    }

    let measured = viewer
        .and_then(|v| v.last_known_pings.iter().find(|p| p.id == user.uid))
        .or_else(|| {
            viewer.and_then(|v| user.last_known_pings.iter().find(|p| p.id == v.uid))
        });

    match measured {
        Some(entry) => ResolvedPing {
            ping: entry.ping,
            is_unstable: entry.is_unstable,
        },
        None => ResolvedPing {
            ping: user.ping,
            is_unstable: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, ping: u32) -> LatencyRecord {
        LatencyRecord {
            id: id.to_string(),
            ping,
            jitter: 0,
            is_unstable: false,
            network_type: None,
            measured_at: 0,
        }
    }

    #[test]
    fn test_publish_replaces_existing_entry() {
        let book = LatencyBook::new();
        book.load("alice", vec![record("bob", 80), record("carol", 30)]);

        assert!(book.publish("alice", record("bob", 40)));
        let snapshot = book.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("bob").unwrap().ping, 40);
        // Replaced entry moves to the end
        assert_eq!(snapshot.records.last().unwrap().id, "bob");
    }

    #[test]
    fn test_publish_requires_matching_owner() {
        let book = LatencyBook::new();
        book.bind_owner(Some("alice"));
        book.bind_owner(Some("dave"));
        assert!(!book.publish("alice", record("bob", 40)));
        assert!(book.snapshot().is_empty());

        book.bind_owner(None);
        assert!(!book.publish("dave", record("bob", 40)));
    }

    #[test]
    fn test_bind_same_owner_keeps_records() {
        let book = LatencyBook::new();
        book.load("alice", vec![record("bob", 80)]);
        book.bind_owner(Some("alice"));
        assert_eq!(book.get("bob").map(|r| r.ping), Some(80));
    }

    #[tokio::test]
    async fn test_subscribers_see_whole_snapshots() {
        let book = LatencyBook::new();
        book.bind_owner(Some("alice"));
        let mut rx = book.subscribe();
        rx.borrow_and_update();

        book.publish("alice", record("bob", 12));
        rx.changed().await.unwrap();
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.owner.as_deref(), Some("alice"));
        assert_eq!(seen.get("bob").unwrap().ping, 12);
    }

    #[test]
    fn test_record_wire_shape() {
        let mut r = record("bob", 42);
        r.is_unstable = true;
        r.network_type = Some("relay".to_string());
        let json: serde_json::Value = serde_json::to_value(&r).unwrap();
        assert_eq!(json["id"], "bob");
        assert_eq!(json["ping"], 42);
        assert_eq!(json["isUnstable"], true);
        assert_eq!(json["networkType"], "relay");
    }

    fn profile(uid: &str, pings: &[(&str, f64)], own: Option<f64>) -> PeerProfile {
        PeerProfile {
            uid: uid.to_string(),
            last_known_pings: pings
                .iter()
                .map(|(id, ping)| KnownPing {
                    id: id.to_string(),
                    ping: Some(*ping),
                    is_unstable: Some(false),
                })
                .collect(),
            ping: own,
        }
    }

    #[test]
    fn test_resolve_prefers_viewer_measurement() {
        let user = profile("bob", &[("alice", 55.0)], Some(90.0));
        let viewer = profile("alice", &[("bob", 40.0)], None);
        let resolved = resolve_ping_between(Some(&user), Some(&viewer));
        assert_eq!(resolved.ping, Some(40.0));
        assert_eq!(resolved.is_unstable, Some(false));
    }

    #[test]
    fn test_resolve_falls_back_to_user_measurement() {
        let user = profile("bob", &[("alice", 55.0)], Some(90.0));
        let viewer = profile("alice", &[], None);
        assert_eq!(
            resolve_ping_between(Some(&user), Some(&viewer)).ping,
            Some(55.0)
        );
    }

    #[test]
    fn test_resolve_falls_back_to_reported_ping() {
        let user = profile("bob", &[], Some(90.0));
        let viewer = profile("alice", &[], None);
        let resolved = resolve_ping_between(Some(&user), Some(&viewer));
        assert_eq!(resolved.ping, Some(90.0));
        assert_eq!(resolved.is_unstable, None);
        assert_eq!(resolve_ping_between(Some(&user), None).ping, Some(90.0));
    }

    #[test]
    fn test_resolve_edge_cases() {
        let alice = profile("alice", &[], Some(10.0));
        assert_eq!(resolve_ping_between(None, Some(&alice)), ResolvedPing::default());
        assert_eq!(
            resolve_ping_between(Some(&alice), Some(&alice)).ping,
            Some(0.0)
        );
    }

    #[test]
    fn test_known_ping_accepts_string_values() {
        let raw = concat!(
            r#"{"uid":"bob","ping":"75","#,
            r#""lastKnownPings":[{"id":"alice","ping":"31","isUnstable":true}]}"#,
        );
        let profile: PeerProfile = serde_json::from_str(raw).unwrap();
        assert_eq!(profile.ping, Some(75.0));
        assert_eq!(profile.last_known_pings[0].ping, Some(31.0));
        assert_eq!(profile.last_known_pings[0].is_unstable, Some(true));
    }
}
