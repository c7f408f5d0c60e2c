//! End-to-end measurements between managers on a mock network
//!
//! Every test runs on a paused clock, so mock latencies translate into
//! exact round-trip times.

mod common;

use common::{advance, alice_and_bob, network, peer, record, settle};
use peer_latency::{
    Direction, IceConnectionState, LatencyConfig, LocalIdentity, PeerInfo, SessionState,
    MSG_TYPE_OFFER,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_round_trip_is_twice_one_way_latency() {
    let network = network();
    let (alice, bob) = alice_and_bob(&network).await;

    alice.tick_now().unwrap();
    advance(1000).await;

    let record = alice.book().get("bob").expect("bob should be measured");
    assert_eq!(record.ping, 40);
    assert_eq!(record.jitter, 0);
    assert!(!record.is_unstable);
    assert_eq!(record.network_type.as_deref(), Some("host"));
    assert!(record.measured_at > 0);

    // Responder never publishes
    assert!(bob.book().get("alice").is_none());

    assert_eq!(alice.snapshot().await.unwrap().live_sessions, 0);
    assert_eq!(bob.snapshot().await.unwrap().live_sessions, 0);
    assert_eq!(network.live_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_finalizes_early_after_three_pongs() {
    let network = network();
    let (alice, _bob) = alice_and_bob(&network).await;

    alice.tick_now().unwrap();
    // Pings at 100, 280, 460 ms; the third pong lands at 500 ms
    advance(505).await;

    assert_eq!(alice.book().get("bob").map(|r| r.ping), Some(40));
    // Three pings and the completion frame, no fourth ping
    assert_eq!(network.frames_sent("alice", "bob"), 4);
    assert_eq!(network.frames_sent("bob", "alice"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_session_states_while_measuring() {
    let network = network();
    let (alice, bob) = alice_and_bob(&network).await;

    alice.tick_now().unwrap();
    settle().await;

    let snapshot = alice.snapshot().await.unwrap();
    assert_eq!(snapshot.live_sessions, 1);
    assert_eq!(snapshot.outbound_target(), Some("bob"));
    assert_eq!(snapshot.sessions[0].direction, Direction::Outbound);
    assert_eq!(snapshot.sessions[0].state, SessionState::Open);

    let remote = bob.snapshot().await.unwrap();
    assert_eq!(remote.inbound_sessions, 1);
    assert!(remote.outbound.is_none());
    assert_eq!(remote.sessions[0].target_uid, "alice");
    assert_eq!(remote.sessions[0].id, snapshot.sessions[0].id);

    // First ping leaves at 100 ms and reaches bob at 120 ms
    advance(150).await;
    let snapshot = alice.snapshot().await.unwrap();
    assert_eq!(snapshot.sessions[0].state, SessionState::Measuring);
    let remote = bob.snapshot().await.unwrap();
    assert_eq!(remote.sessions[0].state, SessionState::Measuring);
}

#[tokio::test(start_paused = true)]
async fn test_alternating_delays_are_unstable() {
    let network = network();
    network.set_default_latency(Duration::ZERO);
    network.set_latency_pattern(
        "alice",
        "bob",
        vec![Duration::from_millis(10), Duration::from_millis(30)],
    );
    let (alice, _bob) = alice_and_bob(&network).await;

    alice.tick_now().unwrap();
    advance(1000).await;

    // Samples 10, 30, 10
    let record = alice.book().get("bob").expect("bob should be measured");
    assert_eq!(record.ping, 17);
    assert_eq!(record.jitter, 20);
    assert!(record.is_unstable);
}

#[tokio::test(start_paused = true)]
async fn test_no_pongs_keeps_previous_record() {
    let network = network();
    network.set_loss("bob", "alice", true);
    let (alice, _bob) = alice_and_bob(&network).await;
    alice.book().load("alice", vec![record("bob", 55)]);

    alice.tick_now().unwrap();
    // Five pings, then the completion grace of 720 ms
    advance(2000).await;

    assert_eq!(network.frames_sent("alice", "bob"), 5);
    assert_eq!(alice.book().get("bob").map(|r| r.ping), Some(55));
    assert_eq!(alice.snapshot().await.unwrap().live_sessions, 0);
    assert_eq!(network.live_connections(), 0);

    // A sample-less run does not count as a measurement
    alice.tick_now().unwrap();
    settle().await;
    assert_eq!(network.sent_by("alice", MSG_TYPE_OFFER).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_peer_is_not_remeasured_within_ttl() {
    let network = network();
    let (alice, _bob) = alice_and_bob(&network).await;

    alice.tick_now().unwrap();
    advance(1000).await;
    assert!(alice.book().get("bob").is_some());

    alice.tick_now().unwrap();
    settle().await;
    assert_eq!(network.sent_by("alice", MSG_TYPE_OFFER).len(), 1);

    // Interval ticks pick bob again once the two-minute window has passed
    advance(120_000).await;
    assert_eq!(network.sent_by("alice", MSG_TYPE_OFFER).len(), 1);
    advance(15_000).await;
    assert_eq!(network.sent_by("alice", MSG_TYPE_OFFER).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_same_country_peer_is_preferred() {
    let network = network();
    let alice = peer(&network, "alice", "SE");
    let _bob = peer(&network, "bob", "BR");
    let _carol = peer(&network, "carol", "se");
    alice
        .set_peers(vec![
            PeerInfo::new("bob").with_country("BR"),
            PeerInfo::new("carol").with_country("se"),
            PeerInfo::new("mock-dave").with_country("SE"),
        ])
        .unwrap();
    settle().await;

    alice.tick_now().unwrap();
    settle().await;
    assert_eq!(
        alice.snapshot().await.unwrap().outbound_target(),
        Some("carol")
    );

    advance(1000).await;
    alice.tick_now().unwrap();
    settle().await;
    assert_eq!(alice.snapshot().await.unwrap().outbound_target(), Some("bob"));

    // Synthetic uids are never measured
    advance(1000).await;
    alice.tick_now().unwrap();
    settle().await;
    assert!(alice.snapshot().await.unwrap().outbound.is_none());
    assert_eq!(network.sent_by("alice", MSG_TYPE_OFFER).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_result_dropped_after_identity_switch() {
    let network = network();
    let (alice, _bob) = alice_and_bob(&network).await;

    alice.tick_now().unwrap();
    settle().await;
    alice
        .set_local_identity(Some(LocalIdentity::new("alice-2")))
        .unwrap();
    advance(1000).await;

    let book = alice.book().snapshot();
    assert_eq!(book.owner.as_deref(), Some("alice-2"));
    assert!(book.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_only_one_outbound_session_at_a_time() {
    let network = network();
    let alice = peer(&network, "alice", "SE");
    let _bob = peer(&network, "bob", "SE");
    let _carol = peer(&network, "carol", "SE");
    alice
        .set_peers(vec![
            PeerInfo::new("bob").with_country("SE"),
            PeerInfo::new("carol").with_country("SE"),
        ])
        .unwrap();
    settle().await;

    alice.tick_now().unwrap();
    alice.tick_now().unwrap();
    settle().await;

    let snapshot = alice.snapshot().await.unwrap();
    assert_eq!(snapshot.live_sessions, 1);
    assert_eq!(network.sent_by("alice", MSG_TYPE_OFFER).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_interval_tick_starts_measurement() {
    let network = network();
    let config = LatencyConfig {
        tick_interval: Duration::from_secs(2),
        ..LatencyConfig::default()
    };
    let alice = network.spawn_peer(LocalIdentity::new("alice"), config);
    let _bob = peer(&network, "bob", "SE");
    alice.set_peers(vec![PeerInfo::new("bob")]).unwrap();

    advance(1500).await;
    assert!(network.sent_by("alice", MSG_TYPE_OFFER).is_empty());
    advance(1500).await;
    assert_eq!(network.sent_by("alice", MSG_TYPE_OFFER).len(), 1);
    advance(1000).await;
    assert_eq!(alice.book().get("bob").map(|r| r.ping), Some(40));
}

#[tokio::test(start_paused = true)]
async fn test_ice_disconnect_while_measuring_drops_session() {
    let network = network();
    let (alice, bob) = alice_and_bob(&network).await;

    alice.tick_now().unwrap();
    advance(150).await;
    let snapshot = alice.snapshot().await.unwrap();
    assert_eq!(snapshot.sessions[0].state, SessionState::Measuring);

    assert_eq!(
        network.set_ice_state("alice", IceConnectionState::Disconnected),
        1
    );
    settle().await;
    assert_eq!(alice.snapshot().await.unwrap().live_sessions, 0);

    // bob hears the channel go away one link latency later
    advance(100).await;
    assert_eq!(bob.snapshot().await.unwrap().live_sessions, 0);
    assert_eq!(network.live_connections(), 0);
    assert_eq!(network.frames_sent("alice", "bob"), 1);
    assert!(alice.book().get("bob").is_none());

    // Losing connectivity is not a refusal, so bob is tried again
    alice.tick_now().unwrap();
    settle().await;
    assert_eq!(network.sent_by("alice", MSG_TYPE_OFFER).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_remote_closing_channel_fails_outbound() {
    let network = network();
    let (alice, bob) = alice_and_bob(&network).await;

    alice.tick_now().unwrap();
    advance(150).await;
    assert_eq!(alice.snapshot().await.unwrap().live_sessions, 1);

    // bob logs out mid-measurement and closes his end
    bob.set_local_identity(None).unwrap();
    settle().await;
    assert_eq!(bob.snapshot().await.unwrap().live_sessions, 0);

    // The close reaches alice at ~171 ms, before her second ping is due
    advance(30).await;
    assert_eq!(alice.snapshot().await.unwrap().live_sessions, 0);
    assert_eq!(network.frames_sent("alice", "bob"), 1);
    assert!(alice.book().get("bob").is_none());
    assert_eq!(network.live_connections(), 0);

    bob.set_local_identity(Some(LocalIdentity::new("bob").with_country("SE")))
        .unwrap();
    alice.tick_now().unwrap();
    settle().await;
    assert_eq!(network.sent_by("alice", MSG_TYPE_OFFER).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_measurement_deadline_keeps_partial_samples() {
    let network = network();
    // The third pong is held back far past every deadline
    network.set_latency_pattern(
        "bob",
        "alice",
        vec![
            Duration::from_millis(20),
            Duration::from_millis(20),
            Duration::from_secs(20),
            Duration::from_millis(20),
            Duration::from_millis(20),
        ],
    );
    let config = LatencyConfig {
        completion_grace_factor: 100,
        ..Default::default()
    };
    let alice = network.spawn_peer(LocalIdentity::new("alice").with_country("SE"), config);
    let _bob = peer(&network, "bob", "SE");
    alice
        .set_peers(vec![PeerInfo::new("bob").with_country("SE")])
        .unwrap();
    settle().await;

    alice.tick_now().unwrap();
    // All five pings are out and four pongs are back, but one is still
    // outstanding and the 18 s completion grace has not run out
    advance(5_000).await;
    assert_eq!(network.frames_sent("alice", "bob"), 5);
    assert_eq!(network.frames_sent("bob", "alice"), 5);
    assert!(alice.book().get("bob").is_none());
    let snapshot = alice.snapshot().await.unwrap();
    assert_eq!(snapshot.sessions[0].state, SessionState::Measuring);

    // The measurement deadline, 10 s after the channel opened, finalizes
    advance(5_500).await;
    let record = alice.book().get("bob").expect("partial samples should publish");
    assert_eq!(record.ping, 40);
    assert_eq!(record.jitter, 0);
    assert_eq!(alice.snapshot().await.unwrap().live_sessions, 0);
    // Five pings plus the completion frame
    assert_eq!(network.frames_sent("alice", "bob"), 6);
}
