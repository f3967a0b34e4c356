//! Consumer configuration.
//!
//! `ConsumerOptions` carries every recognized option together with the
//! project/group identity the subscription names are derived from. Values
//! are plain fields with builder-style setters; `validate` runs once when a
//! consumer or subscriber is constructed.

use std::time::Duration;

use crate::error::{ConsumerError, Result};

/// Options recognized by the consumer and its per-subscription runtime.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Google Cloud project the topics and subscriptions live in.
    pub project: String,
    /// Consumer group id; subscription names are `<topic>_<group_id>`.
    pub group_id: String,
    /// Periodically acknowledge everything admitted so far.
    pub auto_commit: bool,
    /// Period of the auto-commit task. Manual commits reset the timer.
    pub auto_commit_interval: Duration,
    /// Maximum messages requested per pull RPC and returned per `pull` call.
    pub max_pull_records: usize,
    /// Hard upper bound on how long a message is kept leased by this client.
    pub max_ack_extension_period: Duration,
    /// Maximum ack ids carried by a single acknowledge / modify RPC.
    pub max_per_request_changes: usize,
    /// Base delay for exponential backoff after a transient RPC failure.
    pub retry_backoff: Duration,
    /// Per-RPC deadline for pull, acknowledge and modify calls.
    pub ack_request_timeout: Duration,
    /// Initial server-side ack deadline when auto-creating a subscription.
    pub created_subscription_deadline_seconds: i32,
    /// Create missing subscriptions on subscribe.
    pub allow_subscription_creation: bool,
    /// Delete subscriptions on unsubscribe (best effort).
    pub allow_subscription_deletion: bool,
}

impl ConsumerOptions {
    /// Options with defaults mirroring the usual log-consumer client:
    /// auto-commit every 5 s, 500-record pulls, one hour maximum extension.
    pub fn new(project: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            group_id: group_id.into(),
            auto_commit: true,
            auto_commit_interval: Duration::from_secs(5),
            max_pull_records: 500,
            max_ack_extension_period: Duration::from_secs(3600),
            max_per_request_changes: 1000,
            retry_backoff: Duration::from_millis(100),
            ack_request_timeout: Duration::from_secs(30),
            created_subscription_deadline_seconds: 10,
            allow_subscription_creation: true,
            allow_subscription_deletion: false,
        }
    }

    pub fn auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit = enabled;
        self
    }

    pub fn auto_commit_interval(mut self, interval: Duration) -> Self {
        self.auto_commit_interval = interval;
        self
    }

    pub fn max_pull_records(mut self, max: usize) -> Self {
        self.max_pull_records = max;
        self
    }

    pub fn max_ack_extension_period(mut self, period: Duration) -> Self {
        self.max_ack_extension_period = period;
        self
    }

    pub fn max_per_request_changes(mut self, max: usize) -> Self {
        self.max_per_request_changes = max;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn ack_request_timeout(mut self, timeout: Duration) -> Self {
        self.ack_request_timeout = timeout;
        self
    }

    pub fn created_subscription_deadline_seconds(mut self, seconds: i32) -> Self {
        self.created_subscription_deadline_seconds = seconds;
        self
    }

    pub fn allow_subscription_creation(mut self, allow: bool) -> Self {
        self.allow_subscription_creation = allow;
        self
    }

    pub fn allow_subscription_deletion(mut self, allow: bool) -> Self {
        self.allow_subscription_deletion = allow;
        self
    }

    /// Total outstanding messages the ledger will hold before the pull loop
    /// pauses admission.
    pub(crate) fn ledger_capacity(&self) -> usize {
        self.max_pull_records * 2
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(ConsumerError::InvalidOption {
                name: "project",
                reason: "must not be empty",
            });
        }
        if self.group_id.trim().is_empty() {
            return Err(ConsumerError::InvalidOption {
                name: "group_id",
                reason: "must not be empty",
            });
        }
        if self.max_pull_records == 0 {
            return Err(ConsumerError::InvalidOption {
                name: "max_pull_records",
                reason: "must be at least 1",
            });
        }
        if self.max_per_request_changes == 0 {
            return Err(ConsumerError::InvalidOption {
                name: "max_per_request_changes",
                reason: "must be at least 1",
            });
        }
        if self.max_ack_extension_period.is_zero() {
            return Err(ConsumerError::InvalidOption {
                name: "max_ack_extension_period",
                reason: "must be positive",
            });
        }
        if self.auto_commit && self.auto_commit_interval.is_zero() {
            return Err(ConsumerError::InvalidOption {
                name: "auto_commit_interval",
                reason: "must be positive when auto_commit is enabled",
            });
        }
        // The service rejects ack deadlines outside [10, 600].
        if !(10..=600).contains(&self.created_subscription_deadline_seconds) {
            return Err(ConsumerError::InvalidOption {
                name: "created_subscription_deadline_seconds",
                reason: "must be within 10..=600",
            });
        }
        Ok(())
    }
}
