//! Error types for the consumer adapter.
//!
//! RPC failures carry the raw gRPC status so callers (and the retry loops)
//! can distinguish transient outages from configuration mistakes.

use thiserror::Error;
use tonic::{Code, Status};

/// Result type for consumer operations.
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Errors surfaced by the consumer and its subscriber runtime.
#[derive(Debug, Clone, Error)]
pub enum ConsumerError {
    /// A gRPC call failed and was not (or could no longer be) retried.
    #[error("{operation} failed: {status}")]
    Rpc {
        operation: &'static str,
        status: Status,
    },

    /// The gRPC channel could not be established.
    #[error("transport error: {0}")]
    Transport(String),

    /// Credentials could not be obtained or attached.
    #[error("authentication error: {0}")]
    Auth(String),

    /// The `offset` attribute of a received message is not a non-negative
    /// base-10 integer. The producing side is misbehaving; the message is
    /// never surfaced.
    #[error("message {message_id}: offset attribute {raw:?} is not a non-negative integer")]
    UnparsableOffset { raw: String, message_id: String },

    /// The `key` attribute of a received message is not valid Base64.
    #[error("message {message_id}: key attribute is not valid base64")]
    UnparsableKey { message_id: String },

    /// Admitting more messages would exceed the outstanding-message limit.
    #[error("outstanding message limit reached ({limit})")]
    CapacityExceeded { limit: usize },

    /// The subscription does not exist and auto-creation is disabled.
    #[error("subscription {name} does not exist and creation is disabled")]
    SubscriptionMissing { name: String },

    /// The operation is not permitted in the subscriber's current state.
    #[error("subscriber is {current}, operation requires {required}")]
    InvalidState {
        current: &'static str,
        required: &'static str,
    },

    /// A configuration option failed validation.
    #[error("invalid option {name}: {reason}")]
    InvalidOption {
        name: &'static str,
        reason: &'static str,
    },

    /// The consumer is not subscribed to the named topic.
    #[error("not subscribed to topic {topic}")]
    UnknownTopic { topic: String },

    /// An operation requires an active subscription set.
    #[error("consumer is not subscribed to any topics")]
    NotSubscribed,
}

impl ConsumerError {
    pub(crate) fn rpc(operation: &'static str, status: Status) -> Self {
        Self::Rpc { operation, status }
    }
}

/// Coarse classification of a failed RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff.
    Retriable,
    /// Retrying cannot help; drop or surface.
    Fatal,
}

/// Classify a gRPC status.
///
/// The retriable set follows the Pub/Sub service guidance: flow-control and
/// availability failures resolve themselves, everything else is a caller or
/// configuration problem.
pub fn classify(status: &Status) -> ErrorClass {
    match status.code() {
        Code::Unavailable
        | Code::DeadlineExceeded
        | Code::ResourceExhausted
        | Code::Aborted
        | Code::Internal
        | Code::Unknown => ErrorClass::Retriable,
        _ => ErrorClass::Fatal,
    }
}
