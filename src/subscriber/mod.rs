//! # Subscriber Runtime
//!
//! The per-subscription machinery: a pull loop feeding a bounded record
//! buffer, a ledger tracking every outstanding message, a dispatch pump
//! batching acknowledge/modify RPCs, and two timers (lease renewal,
//! auto-commit). The `Subscriber` façade owns all of it and serializes
//! every state transition through the ledger's single mutex; no RPC is ever
//! issued while that lock is held.

mod estimator;
mod ledger;
mod lease;
mod pull;
pub(crate) mod pump;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ConsumerOptions;
use crate::error::{ConsumerError, Result};
use crate::record::LogRecord;
use crate::service::SubscriberService;
use estimator::DeadlineEstimator;
use ledger::PendingLedger;
use pump::{CommitBarrier, DispatchPump, Intent, IntentKind};

/// Shortest lease the estimator will propose.
pub(crate) const MIN_LEASE: Duration = Duration::from_secs(10);
/// Longest lease the server accepts.
pub(crate) const MAX_LEASE: Duration = Duration::from_secs(600);
/// Leases expiring within this window get extended on the next sweep.
pub(crate) const LEASE_MARGIN: Duration = Duration::from_secs(60);
/// How long shutdown waits for queued acknowledgements to flush.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);
/// How long shutdown waits for background tasks before aborting them.
const JOIN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl SubscriberState {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

/// State shared between the façade and its background tasks.
pub(crate) struct Shared {
    pub(crate) service: Arc<dyn SubscriberService>,
    pub(crate) options: ConsumerOptions,
    /// Full subscription resource name.
    pub(crate) subscription: String,
    /// Short topic name stamped on surfaced records.
    pub(crate) topic: String,
    pub(crate) ledger: Mutex<PendingLedger>,
    pub(crate) estimator: DeadlineEstimator,
    pub(crate) pump: DispatchPump,
    pub(crate) state_tx: watch::Sender<SubscriberState>,
    /// Terminal failure recorded by a background task, surfaced on the next
    /// caller operation.
    fatal: Mutex<Option<ConsumerError>>,
    /// Non-terminal pull-path failure, surfaced once on the next `pull`.
    pull_error: Mutex<Option<ConsumerError>>,
    pub(crate) paused: AtomicBool,
    /// Signalled whenever ledger entries are removed.
    pub(crate) capacity_freed: Notify,
    pub(crate) last_commit: Mutex<Instant>,
}

impl Shared {
    pub(crate) fn state(&self) -> SubscriberState {
        *self.state_tx.borrow()
    }

    pub(crate) fn record_fatal(&self, err: ConsumerError) {
        log::error!("subscriber for {} failed: {err}", self.subscription);
        {
            let mut slot = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
            slot.get_or_insert(err);
        }
        self.state_tx.send_if_modified(|state| {
            if matches!(state, SubscriberState::Starting | SubscriberState::Running) {
                *state = SubscriberState::Failed;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn record_pull_error(&self, err: ConsumerError) {
        let mut slot = self.pull_error.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(err);
    }

    fn fatal(&self) -> Option<ConsumerError> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub(crate) enum CommitScope {
    All,
    UpTo(i64),
}

/// Mark the scoped messages for acknowledgement, drain every terminal entry
/// and hand the result to the pump. With `sync` the call resolves only when
/// each dispatched RPC has succeeded or been declared unrecoverable.
pub(crate) async fn commit_scope(
    shared: &Arc<Shared>,
    scope: CommitScope,
    sync: bool,
) -> Result<()> {
    if let Some(err) = shared.fatal() {
        return Err(err);
    }
    let state = shared.state();
    if !matches!(state, SubscriberState::Running | SubscriberState::Stopping) {
        return Err(ConsumerError::InvalidState {
            current: state.as_str(),
            required: "running",
        });
    }

    let now = Instant::now();
    let (terminals, requests) = {
        let mut ledger = shared.ledger.lock().unwrap_or_else(|e| e.into_inner());
        let requests = match scope {
            CommitScope::All => ledger.request_ack_all(now),
            CommitScope::UpTo(offset) => ledger.request_ack_before(offset, now),
        };
        (ledger.drain_terminals(), requests)
    };
    log::debug!(
        "commit marked {} messages on {}",
        requests.count,
        shared.subscription
    );
    for latency in requests.latencies {
        shared.estimator.observe(latency);
    }
    shared.capacity_freed.notify_waiters();
    {
        let mut last = shared.last_commit.lock().unwrap_or_else(|e| e.into_inner());
        *last = now;
    }

    let total = terminals.ack.len() + terminals.nack.len();
    let barrier = if sync { Some(CommitBarrier::new(total)) } else { None };
    let mut intents = Vec::with_capacity(total);
    for ack_id in terminals.ack {
        intents.push(Intent {
            kind: IntentKind::Ack,
            ack_id,
            barrier: barrier.clone(),
        });
    }
    for ack_id in terminals.nack {
        intents.push(Intent {
            kind: IntentKind::Nack,
            ack_id,
            barrier: barrier.clone(),
        });
    }
    shared.pump.submit(intents).await?;

    if let Some(barrier) = barrier {
        barrier.wait().await?;
    }
    Ok(())
}

/// Streaming-pull consumer runtime for a single subscription.
///
/// Create it, `start_async`, then `pull` and `commit` from one caller task;
/// `stop_async` drains queued acknowledgements before terminating. All
/// background failure is reported through the next caller operation, never
/// out of the background tasks themselves.
pub struct Subscriber {
    shared: Arc<Shared>,
    records_rx: AsyncMutex<mpsc::Receiver<LogRecord>>,
    records_tx: Mutex<Option<mpsc::Sender<LogRecord>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Subscriber {
    /// Build the runtime for `subscription` (full resource name), surfacing
    /// records under the short `topic` name. Must be called from within a
    /// Tokio runtime; the dispatch pump starts immediately, the rest on
    /// `start_async`.
    pub fn new(
        service: Arc<dyn SubscriberService>,
        options: ConsumerOptions,
        topic: impl Into<String>,
        subscription: impl Into<String>,
    ) -> Result<Self> {
        options.validate()?;
        let subscription = subscription.into();
        let (state_tx, _) = watch::channel(SubscriberState::New);
        let pump = DispatchPump::spawn(
            Arc::clone(&service),
            subscription.clone(),
            options.max_per_request_changes,
            options.retry_backoff,
            state_tx.subscribe(),
        );
        let (records_tx, records_rx) = mpsc::channel(options.max_pull_records);
        let ledger = PendingLedger::new(options.ledger_capacity(), options.max_ack_extension_period);
        let shared = Arc::new(Shared {
            service,
            subscription,
            topic: topic.into(),
            ledger: Mutex::new(ledger),
            estimator: DeadlineEstimator::new(),
            pump,
            state_tx,
            fatal: Mutex::new(None),
            pull_error: Mutex::new(None),
            paused: AtomicBool::new(false),
            capacity_freed: Notify::new(),
            last_commit: Mutex::new(Instant::now()),
            options,
        });
        Ok(Self {
            shared,
            records_rx: AsyncMutex::new(records_rx),
            records_tx: Mutex::new(Some(records_tx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Full subscription resource name.
    pub fn subscription(&self) -> &str {
        &self.shared.subscription
    }

    /// Short topic name records are surfaced under.
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn state(&self) -> SubscriberState {
        self.shared.state()
    }

    /// Spawn the background tasks and transition to `Running`.
    pub async fn start_async(&self) -> Result<()> {
        let started = self.shared.state_tx.send_if_modified(|state| {
            if *state == SubscriberState::New {
                *state = SubscriberState::Starting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ConsumerError::InvalidState {
                current: self.shared.state().as_str(),
                required: "new",
            });
        }

        let records_tx = self
            .records_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("record channel consumed twice");

        let mut handles = vec![
            pull::spawn_pull_loop(Arc::clone(&self.shared), records_tx),
            lease::spawn_lease_renewer(Arc::clone(&self.shared)),
        ];
        if self.shared.options.auto_commit {
            handles.push(lease::spawn_auto_committer(Arc::clone(&self.shared)));
        }
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);

        self.shared.state_tx.send_if_modified(|state| {
            if *state == SubscriberState::Starting {
                *state = SubscriberState::Running;
                true
            } else {
                false
            }
        });
        log::debug!("subscriber for {} running", self.shared.subscription);
        Ok(())
    }

    /// Stop the timers, close the admission path, flush queued
    /// acknowledgements (bounded by a 30 s deadline) and terminate.
    pub async fn stop_async(&self) -> Result<()> {
        let stopping = self.shared.state_tx.send_if_modified(|state| {
            if matches!(state, SubscriberState::Starting | SubscriberState::Running) {
                *state = SubscriberState::Stopping;
                true
            } else {
                false
            }
        });
        if !stopping {
            let state = self.shared.state();
            if state == SubscriberState::Failed {
                self.abort_tasks();
                return match self.shared.fatal() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
            return Err(ConsumerError::InvalidState {
                current: state.as_str(),
                required: "running",
            });
        }

        // Everything admitted and not yet committed goes out as one final
        // commit; whatever cannot be flushed in time is abandoned and will
        // be redelivered by the server.
        let drain = commit_scope(&self.shared, CommitScope::All, true);
        match tokio::time::timeout(DRAIN_DEADLINE, drain).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log::warn!(
                    "drain on {} failed, relying on redelivery: {err}",
                    self.shared.subscription
                );
            }
            Err(_) => {
                log::warn!(
                    "drain on {} did not finish within {DRAIN_DEADLINE:?}, abandoning",
                    self.shared.subscription
                );
            }
        }

        self.shared
            .state_tx
            .send_replace(SubscriberState::Terminated);
        self.join_tasks().await;
        log::debug!("subscriber for {} terminated", self.shared.subscription);
        Ok(())
    }

    /// Return the next batch of records, waiting up to `timeout` for the
    /// pull loop to produce something. An empty batch on timeout is normal.
    /// Records stay outstanding until committed.
    pub async fn pull(&self, timeout: Duration) -> Result<Vec<LogRecord>> {
        let state = self.shared.state();
        if state != SubscriberState::Running {
            return Err(match self.shared.fatal() {
                Some(err) => err,
                None => ConsumerError::InvalidState {
                    current: state.as_str(),
                    required: "running",
                },
            });
        }
        if let Some(err) = {
            let mut slot = self
                .shared
                .pull_error
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            slot.take()
        } {
            return Err(err);
        }

        let mut rx = self.records_rx.lock().await;
        let mut batch = Vec::new();
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(first)) => {
                batch.push(first);
                while batch.len() < self.shared.options.max_pull_records {
                    match rx.try_recv() {
                        Ok(record) => batch.push(record),
                        Err(_) => break,
                    }
                }
            }
            Ok(None) => {
                return Err(self.shared.fatal().unwrap_or(ConsumerError::InvalidState {
                    current: "stopped",
                    required: "running",
                }));
            }
            Err(_) => {}
        }
        Ok(batch)
    }

    /// Acknowledge everything admitted so far. With `sync` the call returns
    /// only after every acknowledgement RPC in scope has been resolved.
    pub async fn commit(&self, sync: bool) -> Result<()> {
        commit_scope(&self.shared, CommitScope::All, sync).await
    }

    /// Acknowledge admitted messages whose offset is at or below `offset`.
    pub async fn commit_before(&self, sync: bool, offset: i64) -> Result<()> {
        commit_scope(&self.shared, CommitScope::UpTo(offset), sync).await
    }

    /// Hand every outstanding message back for immediate redelivery.
    pub async fn nack_all(&self) -> Result<usize> {
        let state = self.shared.state();
        if state != SubscriberState::Running {
            return Err(ConsumerError::InvalidState {
                current: state.as_str(),
                required: "running",
            });
        }
        let terminals = {
            let mut ledger = self.shared.ledger.lock().unwrap_or_else(|e| e.into_inner());
            ledger.request_nack_all();
            ledger.drain_terminals()
        };
        self.shared.capacity_freed.notify_waiters();
        let count = terminals.nack.len();
        let mut intents: Vec<Intent> = terminals
            .nack
            .into_iter()
            .map(|ack_id| Intent {
                kind: IntentKind::Nack,
                ack_id,
                barrier: None,
            })
            .collect();
        // Entries a prior commit marked but had not drained yet still go
        // out as acknowledgements.
        intents.extend(terminals.ack.into_iter().map(|ack_id| Intent {
            kind: IntentKind::Ack,
            ack_id,
            barrier: None,
        }));
        self.shared.pump.submit(intents).await?;
        Ok(count)
    }

    /// Server-side seek to a publish-time instant. Everything before it is
    /// marked acknowledged by the server, everything after redelivered.
    pub async fn seek_to_time(&self, time_ms: i64) -> Result<()> {
        if let Some(err) = self.shared.fatal() {
            return Err(err);
        }
        self.shared
            .service
            .seek_to_time(&self.shared.subscription, time_ms)
            .await
            .map_err(|status| ConsumerError::rpc("seek", status))
    }

    /// Stop issuing pull RPCs. Records already buffered are still returned.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    /// Resume issuing pull RPCs.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    async fn join_tasks(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let mut handles: Vec<_> = tasks.drain(..).collect();
            if let Some(pump) = self.shared.pump.take_handle() {
                handles.push(pump);
            }
            handles
        };
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(JOIN_GRACE, handle).await.is_err() {
                log::warn!(
                    "background task of {} ignored shutdown, aborting",
                    self.shared.subscription
                );
                abort.abort();
            }
        }
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for handle in tasks.drain(..) {
            handle.abort();
        }
        if let Some(pump) = self.shared.pump.take_handle() {
            pump.abort();
        }
    }
}
