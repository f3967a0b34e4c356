//! Lease-duration estimation from observed processing latency.

use std::sync::Mutex;
use std::time::Duration;

use crate::subscriber::{MAX_LEASE, MIN_LEASE};

const SAMPLE_CAPACITY: usize = 256;
const WARMUP_SAMPLES: usize = 10;
const PERCENTILE: f64 = 0.99;

/// Rolling estimate of how long callers take between receiving a message
/// and asking for its acknowledgement. Proposals are the 99th percentile of
/// the last [`SAMPLE_CAPACITY`] observations, clamped to the valid lease
/// range; until enough samples exist the minimum lease is proposed.
pub(crate) struct DeadlineEstimator {
    ring: Mutex<SampleRing>,
}

struct SampleRing {
    samples: Vec<Duration>,
    next: usize,
}

impl DeadlineEstimator {
    pub(crate) fn new() -> Self {
        Self {
            ring: Mutex::new(SampleRing {
                samples: Vec::with_capacity(SAMPLE_CAPACITY),
                next: 0,
            }),
        }
    }

    /// Record one admit-to-ack latency.
    pub(crate) fn observe(&self, latency: Duration) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.samples.len() < SAMPLE_CAPACITY {
            ring.samples.push(latency);
        } else {
            let slot = ring.next;
            ring.samples[slot] = latency;
        }
        ring.next = (ring.next + 1) % SAMPLE_CAPACITY;
    }

    /// Propose the next lease duration.
    pub(crate) fn propose(&self) -> Duration {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.samples.len() < WARMUP_SAMPLES {
            return MIN_LEASE;
        }
        let mut sorted = ring.samples.clone();
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64) * PERCENTILE).ceil() as usize;
        let proposal = sorted[rank.saturating_sub(1).min(sorted.len() - 1)];
        proposal.clamp(MIN_LEASE, MAX_LEASE)
    }
}
