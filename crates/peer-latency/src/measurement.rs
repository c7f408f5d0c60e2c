//! Ping/pong bookkeeping and round-trip aggregation
//!
//! A [`ProbeState`] lives inside a measuring session. It hands out strictly
//! increasing sequence numbers, remembers when each ping left, and turns
//! matching pongs into round-trip samples. Pongs are matched by sequence
//! number only, so reordering on the channel is harmless.

use std::collections::HashMap;
use tokio::time::Instant;

use crate::protocol::ProbeMessage;

/// Aggregate of one finished measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementSummary {
    /// Mean round trip, rounded, never below 1 ms
    pub ping: u32,
    /// Mean absolute difference between consecutive samples, rounded
    pub jitter: u32,
    /// Unrounded jitter, used for the stability verdict
    pub jitter_ms: f64,
    pub is_unstable: bool,
    pub sample_count: usize,
}

/// Mean absolute difference of consecutive samples (0 for fewer than two)
pub fn compute_jitter(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let total: f64 = samples.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    total / (samples.len() - 1) as f64
}

/// Aggregate samples; `None` when there are none (a failure, not 0 ms)
pub fn summarize(samples: &[f64], unstable_jitter_ms: f64) -> Option<MeasurementSummary> {
    if samples.is_empty() {
        return None;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let jitter_ms = compute_jitter(samples);
    Some(MeasurementSummary {
        ping: (mean.round() as u32).max(1),
        jitter: jitter_ms.round() as u32,
        jitter_ms,
        is_unstable: jitter_ms >= unstable_jitter_ms,
        sample_count: samples.len(),
    })
}

/// In-flight ping/pong exchange for one session
#[derive(Debug)]
pub struct ProbeState {
    /// Reference point for the `time` field carried in pings
    origin: Instant,
    sent: u32,
    awaiting: HashMap<u32, Instant>,
    samples: Vec<f64>,
}

impl ProbeState {
    pub fn new(origin: Instant) -> Self {
        Self {
            origin,
            sent: 0,
            awaiting: HashMap::new(),
            samples: Vec::new(),
        }
    }

    /// Allocate the next ping and remember its send time
    pub fn next_ping(&mut self, now: Instant) -> ProbeMessage {
        self.sent += 1;
        let seq = self.sent;
        self.awaiting.insert(seq, now);
        ProbeMessage::Ping {
            seq,
            time: now.duration_since(self.origin).as_secs_f64() * 1000.0,
        }
    }

    /// Match a pong; unknown or duplicate sequence numbers yield `None`
    pub fn record_pong(&mut self, seq: u32, now: Instant) -> Option<f64> {
        let sent_at = self.awaiting.remove(&seq)?;
        let rtt = now.duration_since(sent_at).as_secs_f64() * 1000.0;
        if !rtt.is_finite() {
            return None;
        }
        self.samples.push(rtt);
        Some(rtt)
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    pub fn outstanding(&self) -> usize {
        self.awaiting.len()
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Enough samples are in and nothing is still in flight
    pub fn can_finalize_early(&self, min_samples: usize) -> bool {
        self.samples.len() >= min_samples && self.awaiting.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_summary_of_steady_link() {
        let summary = summarize(&[10.0, 12.0, 11.0], 6.0).unwrap();
        assert_eq!(summary.ping, 11);
        assert!((summary.jitter_ms - 1.5).abs() < f64::EPSILON);
        assert_eq!(summary.jitter, 2);
        assert!(!summary.is_unstable);
        assert_eq!(summary.sample_count, 3);
    }

    #[test]
    fn test_summary_of_unstable_link() {
        let summary = summarize(&[5.0, 40.0, 6.0], 6.0).unwrap();
        assert!((summary.jitter_ms - 34.5).abs() < f64::EPSILON);
        assert!(summary.is_unstable);
        assert_eq!(summary.ping, 17);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let summary = summarize(&[10.0, 16.0], 6.0).unwrap();
        assert!(summary.is_unstable);
    }

    #[test]
    fn test_ping_floor_is_one() {
        let summary = summarize(&[0.2, 0.3], 6.0).unwrap();
        assert_eq!(summary.ping, 1);
    }

    #[test]
    fn test_no_samples_is_no_summary() {
        assert!(summarize(&[], 6.0).is_none());
    }

    #[test]
    fn test_single_sample_has_zero_jitter() {
        assert_eq!(compute_jitter(&[42.0]), 0.0);
        let summary = summarize(&[42.0], 6.0).unwrap();
        assert_eq!(summary.jitter, 0);
        assert!(!summary.is_unstable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_matching() {
        let origin = Instant::now();
        let mut probe = ProbeState::new(origin);

        let first = probe.next_ping(Instant::now());
        assert!(matches!(first, ProbeMessage::Ping { seq: 1, .. }));
        tokio::time::advance(Duration::from_millis(5)).await;
        let second = probe.next_ping(Instant::now());
        assert!(matches!(second, ProbeMessage::Ping { seq: 2, .. }));
        assert_eq!(probe.outstanding(), 2);

        tokio::time::advance(Duration::from_millis(20)).await;
        // Out of order delivery
        let rtt2 = probe.record_pong(2, Instant::now()).unwrap();
        let rtt1 = probe.record_pong(1, Instant::now()).unwrap();
        assert!((rtt2 - 20.0).abs() < 1e-6);
        assert!((rtt1 - 25.0).abs() < 1e-6);

        // Duplicate and unknown
        assert!(probe.record_pong(1, Instant::now()).is_none());
        assert!(probe.record_pong(99, Instant::now()).is_none());
        assert_eq!(probe.samples().len(), 2);
        assert_eq!(probe.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_finalize_needs_quiet_channel() {
        let mut probe = ProbeState::new(Instant::now());
        for _ in 0..3 {
            probe.next_ping(Instant::now());
        }
        probe.next_ping(Instant::now());
        for seq in 1..=3 {
            probe.record_pong(seq, Instant::now());
        }
        assert!(!probe.can_finalize_early(3));
        probe.record_pong(4, Instant::now());
        assert!(probe.can_finalize_early(3));
    }
}
