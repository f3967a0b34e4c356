//! Background timers: lease renewal and auto-commit.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::metrics;
use crate::subscriber::pump::{Intent, IntentKind};
use crate::subscriber::{commit_scope, CommitScope, Shared, SubscriberState, LEASE_MARGIN};

/// Periodically extend the leases of outstanding messages before the server
/// gives up on us. Messages that hit the maximum extension period are
/// dropped without an ack; the server redelivers them on its own schedule.
pub(crate) fn spawn_lease_renewer(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = LEASE_MARGIN / 2;
        let mut state_rx = shared.state_tx.subscribe();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let lease = shared.estimator.propose();
                    let sweep = {
                        let mut ledger = shared.ledger.lock().unwrap_or_else(|e| e.into_inner());
                        ledger.sweep_extensions(Instant::now(), LEASE_MARGIN, lease)
                    };
                    if !sweep.expired.is_empty() {
                        metrics::EXPIRED_MESSAGES
                            .fetch_add(sweep.expired.len() as u64, Ordering::Relaxed);
                        log::warn!(
                            "dropping {} messages that reached the maximum extension period on {}",
                            sweep.expired.len(),
                            shared.subscription
                        );
                        shared.capacity_freed.notify_waiters();
                    }
                    if !sweep.extend.is_empty() {
                        log::debug!(
                            "extending {} leases on {} by ~{:?}",
                            sweep.extend.len(),
                            shared.subscription,
                            lease
                        );
                        let intents = sweep
                            .extend
                            .into_iter()
                            .map(|(ack_id, deadline_seconds)| Intent {
                                kind: IntentKind::Modify { deadline_seconds },
                                ack_id,
                                barrier: None,
                            })
                            .collect();
                        if shared.pump.submit(intents).await.is_err() {
                            break;
                        }
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow() != SubscriberState::Running {
                        break;
                    }
                }
            }
        }
    })
}

/// Periodically acknowledge everything admitted so far. Callers running in
/// auto-commit mode are expected to finish a pulled batch before pulling
/// again, so each firing commits the previous batch en masse. Manual
/// commits push the next firing out by a full interval.
pub(crate) fn spawn_auto_committer(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = shared.options.auto_commit_interval;
        let mut state_rx = shared.state_tx.subscribe();
        loop {
            let due = {
                let last = shared.last_commit.lock().unwrap_or_else(|e| e.into_inner());
                *last + interval
            };
            tokio::select! {
                _ = tokio::time::sleep_until(due) => {
                    let still_due = {
                        let last = shared.last_commit.lock().unwrap_or_else(|e| e.into_inner());
                        Instant::now() >= *last + interval
                    };
                    if still_due {
                        if let Err(err) = commit_scope(&shared, CommitScope::All, false).await {
                            log::warn!("auto-commit on {} failed: {err}", shared.subscription);
                            break;
                        }
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow() != SubscriberState::Running {
                        break;
                    }
                }
            }
        }
    })
}
