//! Batched dispatch of acknowledge / modify-deadline intents.
//!
//! Intents queue onto a channel and are coalesced until either the
//! per-request cap is reached or a short window elapses, then dispatched as
//! one RPC per kind. Up to [`MAX_INFLIGHT_BATCHES`] RPCs run concurrently;
//! transient failures retry with full-jitter exponential backoff, fatal
//! failures drop the batch and rely on the server redelivering.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{classify, ConsumerError, ErrorClass};
use crate::metrics;
use crate::service::SubscriberService;
use crate::subscriber::SubscriberState;

const MAX_INFLIGHT_BATCHES: usize = 4;
const COALESCE_WINDOW: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Transient retries on one batch are abandoned after this long.
const RETRY_WINDOW: Duration = Duration::from_secs(300);
const INBOUND_QUEUE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IntentKind {
    Ack,
    Nack,
    Modify { deadline_seconds: i32 },
}

/// One queued change for a single ack id.
pub(crate) struct Intent {
    pub kind: IntentKind,
    pub ack_id: String,
    pub barrier: Option<Arc<CommitBarrier>>,
}

/// Completion barrier for synchronous commits: counts down as the RPCs
/// covering its intents succeed or are declared unrecoverable.
pub(crate) struct CommitBarrier {
    remaining: AtomicUsize,
    failure: Mutex<Option<ConsumerError>>,
    notify: Notify,
}

impl CommitBarrier {
    pub(crate) fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(count),
            failure: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    fn complete(&self, result: Result<(), ConsumerError>) {
        if let Err(err) = result {
            let mut failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
            failure.get_or_insert(err);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Wait until every counted intent has been resolved. Returns the first
    /// failure observed, if any.
    pub(crate) async fn wait(&self) -> Result<(), ConsumerError> {
        loop {
            let notified = self.notify.notified();
            if self.remaining.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
        let failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
        match &*failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

pub(crate) struct DispatchPump {
    tx: mpsc::Sender<Intent>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchPump {
    /// Spawn the pump task. It runs until the subscriber reaches a terminal
    /// state, then flushes whatever is queued and waits out in-flight RPCs.
    pub(crate) fn spawn(
        service: Arc<dyn SubscriberService>,
        subscription: String,
        max_per_request: usize,
        retry_backoff: Duration,
        mut state_rx: watch::Receiver<SubscriberState>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Intent>(INBOUND_QUEUE);
        let handle = tokio::spawn(async move {
            let inflight = Arc::new(Semaphore::new(MAX_INFLIGHT_BATCHES));
            let mut pending: Vec<Intent> = Vec::new();
            let mut flush_at: Option<Instant> = None;

            loop {
                let window = flush_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(intent) => {
                            if pending.is_empty() {
                                flush_at = Some(Instant::now() + COALESCE_WINDOW);
                            }
                            pending.push(intent);
                            if pending.len() >= max_per_request {
                                flush(&service, &subscription, &mut pending, max_per_request,
                                      retry_backoff, &inflight).await;
                                flush_at = None;
                            }
                        }
                        None => break,
                    },
                    _ = tokio::time::sleep_until(window), if flush_at.is_some() => {
                        flush(&service, &subscription, &mut pending, max_per_request,
                              retry_backoff, &inflight).await;
                        flush_at = None;
                    }
                    result = state_rx.changed() => {
                        if result.is_err() || state_rx.borrow().is_terminal() {
                            break;
                        }
                    }
                }
            }

            // Final drain: everything still queued goes out, then wait for
            // in-flight batches by taking every permit.
            while let Ok(intent) = rx.try_recv() {
                pending.push(intent);
            }
            flush(&service, &subscription, &mut pending, max_per_request, retry_backoff, &inflight)
                .await;
            let _all = inflight
                .acquire_many(MAX_INFLIGHT_BATCHES as u32)
                .await
                .expect("pump semaphore closed");
            log::debug!("dispatch pump for {subscription} stopped");
        });
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue intents for dispatch. Fails only when the pump has stopped.
    pub(crate) async fn submit(&self, intents: Vec<Intent>) -> Result<(), ConsumerError> {
        for intent in intents {
            self.tx.send(intent).await.map_err(|_| ConsumerError::InvalidState {
                current: "terminated",
                required: "running",
            })?;
        }
        Ok(())
    }

    pub(crate) fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Split the queued intents by kind, chunk to the per-request cap, and
/// dispatch each chunk on its own task. The semaphore bounds concurrency;
/// acquiring here (not in the task) also throttles flushing itself.
async fn flush(
    service: &Arc<dyn SubscriberService>,
    subscription: &str,
    pending: &mut Vec<Intent>,
    max_per_request: usize,
    retry_backoff: Duration,
    inflight: &Arc<Semaphore>,
) {
    if pending.is_empty() {
        return;
    }

    let mut acks: Vec<Intent> = Vec::new();
    let mut nacks: Vec<Intent> = Vec::new();
    let mut modifies: BTreeMap<i32, Vec<Intent>> = BTreeMap::new();
    for intent in pending.drain(..) {
        match intent.kind {
            IntentKind::Ack => acks.push(intent),
            IntentKind::Nack => nacks.push(intent),
            IntentKind::Modify { deadline_seconds } => {
                modifies.entry(deadline_seconds).or_default().push(intent)
            }
        }
    }

    let mut batches: Vec<(IntentKind, Vec<Intent>)> = Vec::new();
    chunk_into(&mut batches, IntentKind::Ack, acks, max_per_request);
    chunk_into(&mut batches, IntentKind::Nack, nacks, max_per_request);
    for (seconds, group) in modifies {
        chunk_into(
            &mut batches,
            IntentKind::Modify {
                deadline_seconds: seconds,
            },
            group,
            max_per_request,
        );
    }

    for (kind, batch) in batches {
        let permit = inflight
            .clone()
            .acquire_owned()
            .await
            .expect("pump semaphore closed");
        let service = Arc::clone(service);
        let subscription = subscription.to_string();
        tokio::spawn(async move {
            dispatch_batch(&service, &subscription, kind, batch, retry_backoff).await;
            drop(permit);
        });
    }
}

fn chunk_into(
    batches: &mut Vec<(IntentKind, Vec<Intent>)>,
    kind: IntentKind,
    mut intents: Vec<Intent>,
    max_per_request: usize,
) {
    while intents.len() > max_per_request {
        let rest = intents.split_off(max_per_request);
        batches.push((kind, std::mem::replace(&mut intents, rest)));
    }
    if !intents.is_empty() {
        batches.push((kind, intents));
    }
}

/// Issue one RPC for the batch, retrying transient failures until the retry
/// window closes. Completion (success or abandonment) is reported to every
/// barrier attached to the batch.
async fn dispatch_batch(
    service: &Arc<dyn SubscriberService>,
    subscription: &str,
    kind: IntentKind,
    batch: Vec<Intent>,
    retry_backoff: Duration,
) {
    let ack_ids: Vec<String> = batch.iter().map(|intent| intent.ack_id.clone()).collect();
    let started = Instant::now();
    let mut backoff = retry_backoff.max(Duration::from_millis(1));

    let outcome = loop {
        let (operation, result) = match kind {
            IntentKind::Ack => (
                "acknowledge",
                service.acknowledge(subscription, ack_ids.clone()).await,
            ),
            IntentKind::Nack => (
                "modify_ack_deadline",
                service
                    .modify_ack_deadline(subscription, ack_ids.clone(), 0)
                    .await,
            ),
            IntentKind::Modify { deadline_seconds } => (
                "modify_ack_deadline",
                service
                    .modify_ack_deadline(subscription, ack_ids.clone(), deadline_seconds)
                    .await,
            ),
        };

        match result {
            Ok(()) => {
                match kind {
                    IntentKind::Ack => {
                        metrics::ACKED_MESSAGES.fetch_add(ack_ids.len() as u64, Ordering::Relaxed)
                    }
                    _ => metrics::MODIFIED_MESSAGES
                        .fetch_add(ack_ids.len() as u64, Ordering::Relaxed),
                };
                break Ok(());
            }
            Err(status) => match classify(&status) {
                ErrorClass::Retriable if started.elapsed() < RETRY_WINDOW => {
                    metrics::RPC_RETRIES.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "{operation} for {} ids failed transiently ({status}), retrying in {:?}",
                        ack_ids.len(),
                        backoff
                    );
                    tokio::time::sleep(jittered(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                class => {
                    if class == ErrorClass::Retriable {
                        log::error!(
                            "{operation} for {} ids still failing after {:?}, dropping batch: {status}",
                            ack_ids.len(),
                            RETRY_WINDOW
                        );
                    } else {
                        log::error!(
                            "{operation} for {} ids failed fatally, dropping batch: {status}",
                            ack_ids.len()
                        );
                    }
                    break Err(ConsumerError::rpc(operation, status));
                }
            },
        }
    };

    for intent in batch {
        if let Some(barrier) = intent.barrier {
            barrier.complete(outcome.clone());
        }
    }
}

/// Full jitter: a uniform draw from zero to the current backoff.
pub(crate) fn jittered(backoff: Duration) -> Duration {
    let max_ms = backoff.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
