//! The outstanding-message table.
//!
//! Every message pulled from the server lives here from admission until it
//! reaches a terminal state: drained for acknowledgement, drained for nack,
//! or expired past the maximum extension period. All mutation happens under
//! the owning subscriber's single mutex; none of these operations perform
//! I/O.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ConsumerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageState {
    Outstanding,
    AckPending,
    NackPending,
}

#[derive(Debug)]
struct Envelope {
    offset: i64,
    admitted_at: Instant,
    deadline_at: Instant,
    state: MessageState,
}

/// Ack ids transitioned by a commit-style request, with the latency between
/// admission and the request for the estimator to chew on.
#[derive(Debug, Default)]
pub(crate) struct AckRequests {
    pub count: usize,
    pub latencies: Vec<Duration>,
}

/// Result of one lease sweep.
#[derive(Debug, Default)]
pub(crate) struct ExtensionSweep {
    /// Ack ids to extend, with the granted deadline in whole seconds.
    pub extend: Vec<(String, i32)>,
    /// Ack ids dropped because they reached the maximum extension period.
    pub expired: Vec<String>,
}

/// Ack ids removed in a terminal drain, ready for dispatch.
#[derive(Debug, Default)]
pub(crate) struct Terminals {
    pub ack: Vec<String>,
    pub nack: Vec<String>,
}

pub(crate) struct PendingLedger {
    entries: HashMap<String, Envelope>,
    capacity: usize,
    max_extension: Duration,
}

impl PendingLedger {
    pub(crate) fn new(capacity: usize, max_extension: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            max_extension,
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn has_capacity_for(&self, additional: usize) -> bool {
        self.entries.len() + additional <= self.capacity
    }

    /// Store a freshly pulled batch, returning the ack ids actually
    /// admitted. Redelivered ack ids already present are skipped so a
    /// message is never surfaced twice.
    pub(crate) fn admit(
        &mut self,
        batch: Vec<(String, i64)>,
        now: Instant,
        initial_lease: Duration,
    ) -> Result<Vec<String>, ConsumerError> {
        if self.entries.len() + batch.len() > self.capacity {
            return Err(ConsumerError::CapacityExceeded {
                limit: self.capacity,
            });
        }
        let mut admitted = Vec::with_capacity(batch.len());
        for (ack_id, offset) in batch {
            if self.entries.contains_key(&ack_id) {
                log::warn!("ack id {ack_id} already outstanding, skipping admit");
                continue;
            }
            self.entries.insert(
                ack_id.clone(),
                Envelope {
                    offset,
                    admitted_at: now,
                    deadline_at: now + initial_lease,
                    state: MessageState::Outstanding,
                },
            );
            admitted.push(ack_id);
        }
        Ok(admitted)
    }

    /// Mark specific messages for acknowledgement. Unknown ids were already
    /// drained or expired; that is recovery, not failure.
    pub(crate) fn request_ack(&mut self, ack_ids: &[String], now: Instant) -> AckRequests {
        let mut result = AckRequests::default();
        for ack_id in ack_ids {
            match self.entries.get_mut(ack_id) {
                Some(envelope) if envelope.state == MessageState::Outstanding => {
                    envelope.state = MessageState::AckPending;
                    result.count += 1;
                    result
                        .latencies
                        .push(now.saturating_duration_since(envelope.admitted_at));
                }
                Some(_) => {}
                None => log::debug!("ack requested for unknown id {ack_id}, skipping"),
            }
        }
        result
    }

    /// Mark every outstanding message for acknowledgement.
    pub(crate) fn request_ack_all(&mut self, now: Instant) -> AckRequests {
        let mut result = AckRequests::default();
        for envelope in self.entries.values_mut() {
            if envelope.state == MessageState::Outstanding {
                envelope.state = MessageState::AckPending;
                result.count += 1;
                result
                    .latencies
                    .push(now.saturating_duration_since(envelope.admitted_at));
            }
        }
        result
    }

    /// Mark every outstanding message with offset at or below `offset`.
    /// Offsets are producer-assigned and unordered, so this is a full scan.
    pub(crate) fn request_ack_before(&mut self, offset: i64, now: Instant) -> AckRequests {
        let mut result = AckRequests::default();
        for envelope in self.entries.values_mut() {
            if envelope.state == MessageState::Outstanding && envelope.offset <= offset {
                envelope.state = MessageState::AckPending;
                result.count += 1;
                result
                    .latencies
                    .push(now.saturating_duration_since(envelope.admitted_at));
            }
        }
        result
    }

    /// Mark specific messages for immediate redelivery.
    pub(crate) fn request_nack(&mut self, ack_ids: &[String]) -> usize {
        let mut count = 0;
        for ack_id in ack_ids {
            match self.entries.get_mut(ack_id) {
                Some(envelope) if envelope.state == MessageState::Outstanding => {
                    envelope.state = MessageState::NackPending;
                    count += 1;
                }
                Some(_) => {}
                None => log::debug!("nack requested for unknown id {ack_id}, skipping"),
            }
        }
        count
    }

    /// Mark every outstanding message for immediate redelivery.
    pub(crate) fn request_nack_all(&mut self) -> usize {
        let mut count = 0;
        for envelope in self.entries.values_mut() {
            if envelope.state == MessageState::Outstanding {
                envelope.state = MessageState::NackPending;
                count += 1;
            }
        }
        count
    }

    /// One lease pass: messages past the maximum extension period are
    /// removed (the server will redeliver them on its own schedule), and
    /// messages whose deadline falls within `margin` get a new lease. The
    /// grant never extends a message past the maximum extension period.
    pub(crate) fn sweep_extensions(
        &mut self,
        now: Instant,
        margin: Duration,
        lease: Duration,
    ) -> ExtensionSweep {
        let mut sweep = ExtensionSweep::default();
        for (ack_id, envelope) in &mut self.entries {
            if envelope.state != MessageState::Outstanding {
                continue;
            }
            let alive = now.saturating_duration_since(envelope.admitted_at);
            if alive >= self.max_extension {
                sweep.expired.push(ack_id.clone());
            } else if envelope.deadline_at.saturating_duration_since(now) < margin {
                let grant = lease.min(self.max_extension - alive);
                envelope.deadline_at = now + grant;
                sweep.extend.push((ack_id.clone(), grant.as_secs().max(1) as i32));
            }
        }
        for ack_id in &sweep.expired {
            self.entries.remove(ack_id);
        }
        sweep
    }

    /// Remove everything in a terminal state and hand it to the dispatcher.
    pub(crate) fn drain_terminals(&mut self) -> Terminals {
        let mut terminals = Terminals::default();
        self.entries.retain(|ack_id, envelope| match envelope.state {
            MessageState::Outstanding => true,
            MessageState::AckPending => {
                terminals.ack.push(ack_id.clone());
                false
            }
            MessageState::NackPending => {
                terminals.nack.push(ack_id.clone());
                false
            }
        });
        terminals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(10);
    const MARGIN: Duration = Duration::from_secs(60);

    fn ledger(capacity: usize) -> PendingLedger {
        PendingLedger::new(capacity, Duration::from_secs(300))
    }

    fn ids(entries: &[(&str, i64)]) -> Vec<(String, i64)> {
        entries
            .iter()
            .map(|(id, offset)| (id.to_string(), *offset))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn admit_enforces_capacity() {
        let mut ledger = ledger(2);
        let now = Instant::now();
        ledger.admit(ids(&[("a", 1), ("b", 2)]), now, LEASE).unwrap();
        let err = ledger.admit(ids(&[("c", 3)]), now, LEASE).unwrap_err();
        assert!(matches!(err, ConsumerError::CapacityExceeded { limit: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_admits_are_skipped() {
        let mut ledger = ledger(8);
        let now = Instant::now();
        assert_eq!(ledger.admit(ids(&[("a", 1)]), now, LEASE).unwrap(), vec!["a"]);
        assert!(ledger.admit(ids(&[("a", 1)]), now, LEASE).unwrap().is_empty());
        assert_eq!(ledger.outstanding(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_before_selects_by_offset() {
        let mut ledger = ledger(8);
        let now = Instant::now();
        ledger
            .admit(ids(&[("a", 5), ("b", 7), ("c", 9), ("d", 12)]), now, LEASE)
            .unwrap();
        let requests = ledger.request_ack_before(9, now);
        assert_eq!(requests.count, 3);
        let terminals = ledger.drain_terminals();
        let mut acked = terminals.ack;
        acked.sort();
        assert_eq!(acked, vec!["a", "b", "c"]);
        assert_eq!(ledger.outstanding(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_ids_are_skipped() {
        let mut ledger = ledger(8);
        let now = Instant::now();
        ledger.admit(ids(&[("a", 1)]), now, LEASE).unwrap();
        let requests = ledger.request_ack(&["a".into(), "ghost".into()], now);
        assert_eq!(requests.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_transitions_are_not_reversed_by_nack() {
        let mut ledger = ledger(8);
        let now = Instant::now();
        ledger.admit(ids(&[("a", 1)]), now, LEASE).unwrap();
        ledger.request_ack(&["a".into()], now);
        assert_eq!(ledger.request_nack(&["a".into()]), 0);
        let terminals = ledger.drain_terminals();
        assert_eq!(terminals.ack, vec!["a"]);
        assert!(terminals.nack.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_extends_near_deadline_messages() {
        let mut ledger = ledger(8);
        let start = Instant::now();
        ledger.admit(ids(&[("a", 1)]), start, LEASE).unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        let sweep = ledger.sweep_extensions(Instant::now(), MARGIN, LEASE);
        assert_eq!(sweep.extend.len(), 1);
        assert_eq!(sweep.extend[0].0, "a");
        assert_eq!(sweep.extend[0].1, 10);
        assert!(sweep.expired.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_leaves_far_deadlines_alone() {
        let mut ledger = ledger(8);
        let now = Instant::now();
        ledger
            .admit(ids(&[("a", 1)]), now, Duration::from_secs(600))
            .unwrap();
        let sweep = ledger.sweep_extensions(now, MARGIN, LEASE);
        assert!(sweep.extend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_messages_past_the_extension_cap() {
        let mut ledger = ledger(8);
        ledger.admit(ids(&[("a", 1)]), Instant::now(), LEASE).unwrap();

        tokio::time::advance(Duration::from_secs(300)).await;
        let sweep = ledger.sweep_extensions(Instant::now(), MARGIN, LEASE);
        assert_eq!(sweep.expired, vec!["a"]);
        assert_eq!(ledger.outstanding(), 0);
        // Expired messages must never surface in a terminal drain.
        assert!(ledger.drain_terminals().ack.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_grant_never_exceeds_the_cap() {
        let mut ledger = ledger(8);
        ledger.admit(ids(&[("a", 1)]), Instant::now(), LEASE).unwrap();

        tokio::time::advance(Duration::from_secs(295)).await;
        let sweep = ledger.sweep_extensions(Instant::now(), MARGIN, LEASE);
        assert_eq!(sweep.extend.len(), 1);
        // Only five seconds of lifetime remain.
        assert_eq!(sweep.extend[0].1, 5);
    }
}
