//! The pull loop: replenishes the caller-visible record buffer.
//!
//! One task per subscriber issues pull RPCs, admits what arrives to the
//! ledger, and pushes decoded records into a bounded channel the `pull`
//! call drains. The channel plus the ledger capacity gate provide the
//! back-pressure: when the caller stops draining, pulling stops.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{classify, ConsumerError, ErrorClass};
use crate::metrics;
use crate::record::{decode_record, LogRecord};
use crate::subscriber::pump::jittered;
use crate::subscriber::{Shared, SubscriberState};

const PAUSE_POLL: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub(crate) fn spawn_pull_loop(
    shared: Arc<Shared>,
    records_tx: mpsc::Sender<LogRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let max_records = shared.options.max_pull_records;
        let base_backoff = shared.options.retry_backoff.max(Duration::from_millis(1));
        let mut backoff = base_backoff;
        let mut state_rx = shared.state_tx.subscribe();

        loop {
            let state = *state_rx.borrow();
            match state {
                SubscriberState::Running => {}
                SubscriberState::New | SubscriberState::Starting => {
                    if state_rx.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                _ => break,
            }

            if shared.paused.load(Ordering::Acquire) {
                tokio::select! {
                    _ = tokio::time::sleep(PAUSE_POLL) => {}
                    _ = state_rx.changed() => {}
                }
                continue;
            }

            // Admission gate: never pull more than the ledger can hold.
            let room = {
                let ledger = shared.ledger.lock().unwrap_or_else(|e| e.into_inner());
                ledger.has_capacity_for(max_records)
            };
            if !room {
                tokio::select! {
                    _ = shared.capacity_freed.notified() => {}
                    _ = state_rx.changed() => {}
                }
                continue;
            }

            match shared
                .service
                .pull(&shared.subscription, max_records as i32)
                .await
            {
                Ok(received) => {
                    backoff = base_backoff;
                    if received.is_empty() {
                        continue;
                    }
                    // Shutdown started while the RPC was in flight: the
                    // admission path is closed, the server will redeliver.
                    if *state_rx.borrow() != SubscriberState::Running {
                        break;
                    }

                    let mut batch: Vec<(String, LogRecord)> = Vec::with_capacity(received.len());
                    let mut poisoned = false;
                    for delivery in &received {
                        let Some(message) = delivery.message.as_ref() else {
                            log::warn!("pull returned an empty delivery, skipping");
                            continue;
                        };
                        match decode_record(&shared.topic, message) {
                            Ok(record) => batch.push((delivery.ack_id.clone(), record)),
                            Err(err) => {
                                // Reject the whole batch: nothing from it is
                                // surfaced or acked, so the server redelivers.
                                log::error!("rejecting pull batch from {}: {err}", shared.subscription);
                                shared.record_pull_error(err);
                                poisoned = true;
                                break;
                            }
                        }
                    }
                    if poisoned {
                        tokio::select! {
                            _ = tokio::time::sleep(jittered(backoff)) => {}
                            _ = state_rx.changed() => {}
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        continue;
                    }

                    let initial_lease = shared.estimator.propose();
                    let admitted = {
                        let mut ledger = shared.ledger.lock().unwrap_or_else(|e| e.into_inner());
                        ledger.admit(
                            batch
                                .iter()
                                .map(|(ack_id, record)| (ack_id.clone(), record.offset))
                                .collect(),
                            Instant::now(),
                            initial_lease,
                        )
                    };
                    let admitted: std::collections::HashSet<String> = match admitted {
                        Ok(ids) => ids.into_iter().collect(),
                        Err(err) => {
                            // Capacity raced away; wait for the caller to
                            // drain and let the server redeliver this batch.
                            log::warn!("admission refused on {}: {err}", shared.subscription);
                            tokio::select! {
                                _ = shared.capacity_freed.notified() => {}
                                _ = state_rx.changed() => {}
                            }
                            continue;
                        }
                    };

                    let mut pulled_bytes = 0u64;
                    let mut surfaced = 0u64;
                    for (ack_id, record) in batch {
                        if !admitted.contains(&ack_id) {
                            continue;
                        }
                        pulled_bytes += record.value.len() as u64;
                        surfaced += 1;
                        if records_tx.send(record).await.is_err() {
                            // Subscriber dropped; nothing left to feed.
                            return;
                        }
                    }
                    metrics::PULLED_MESSAGES.fetch_add(surfaced, Ordering::Relaxed);
                    metrics::PULLED_BYTES.fetch_add(pulled_bytes, Ordering::Relaxed);
                }
                Err(status) => match classify(&status) {
                    ErrorClass::Retriable => {
                        metrics::RPC_RETRIES.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "pull on {} failed transiently ({status}), retrying in {backoff:?}",
                            shared.subscription
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(jittered(backoff)) => {}
                            _ = state_rx.changed() => {}
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                    ErrorClass::Fatal => {
                        shared.record_fatal(ConsumerError::rpc("pull", status));
                        break;
                    }
                },
            }
        }
        log::debug!("pull loop for {} stopped", shared.subscription);
    })
}
