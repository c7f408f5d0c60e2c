//! Shared helpers for mock-network tests

#![allow(dead_code)]

use peer_latency::{
    LatencyConfig, LatencyHandle, LatencyRecord, LocalIdentity, MockNetwork, PeerInfo,
};
use std::sync::Arc;
use std::time::Duration;

/// Log to stderr when RUST_LOG is set
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Let every task run to idle; under a paused clock this advances 1 ms
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Network with a fixed 20 ms one-way latency
pub fn network() -> Arc<MockNetwork> {
    init_tracing();
    let network = MockNetwork::new();
    network.set_default_latency(Duration::from_millis(20));
    network
}

pub fn peer(network: &Arc<MockNetwork>, uid: &str, country: &str) -> LatencyHandle {
    network.spawn_peer(
        LocalIdentity::new(uid).with_country(country),
        LatencyConfig::default(),
    )
}

/// `alice` with `bob` in her roster, both in the same country
pub async fn alice_and_bob(network: &Arc<MockNetwork>) -> (LatencyHandle, LatencyHandle) {
    let alice = peer(network, "alice", "SE");
    let bob = peer(network, "bob", "SE");
    alice
        .set_peers(vec![PeerInfo::new("bob").with_country("SE")])
        .unwrap();
    settle().await;
    (alice, bob)
}

pub fn record(id: &str, ping: u32) -> LatencyRecord {
    LatencyRecord {
        id: id.to_string(),
        ping,
        jitter: 0,
        is_unstable: false,
        network_type: None,
        measured_at: 0,
    }
}
