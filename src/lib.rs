//! # pubsub-log-consumer
//!
//! A partitioned-log consumer API (topics, offsets, commits, seeks,
//! pause/resume, round-robin polling) on top of Google Cloud Pub/Sub, which
//! natively speaks per-message acknowledgement, server-managed ack
//! deadlines, and seek-by-time.
//!
//! The heart of the crate is the per-subscription [`Subscriber`] runtime:
//! a pull loop replenishing a bounded record buffer, a ledger tracking
//! every outstanding message, a dispatch pump coalescing thousands of
//! per-message acknowledge/modify operations into size-capped RPCs with
//! retry, and timers that keep server-side leases alive until the caller
//! commits, bounded by a maximum extension period so nothing is kept
//! alive forever. [`LogConsumer`] layers the multi-topic façade on top:
//! subscription management, round-robin polling, offset-bounded commits,
//! pause/resume and lazy seeks.
//!
//! Offsets do not exist in Pub/Sub; the producing side is expected to stamp
//! an `offset` attribute on every message, and the record key rides
//! Base64-encoded in a `key` attribute. See [`record`] for the exact
//! conventions.
//!
//! ```no_run
//! use std::time::Duration;
//! use pubsub_log_consumer::{ConsumerOptions, LogConsumer};
//!
//! # async fn run() -> pubsub_log_consumer::Result<()> {
//! let options = ConsumerOptions::new("my-project", "my-group").auto_commit(false);
//! let mut consumer = LogConsumer::connect(options).await?;
//! consumer.subscribe(&["events"]).await?;
//! loop {
//!     let records = consumer.poll(Duration::from_secs(1)).await?;
//!     for record in &records {
//!         println!("offset {} value {} bytes", record.offset, record.value.len());
//!     }
//!     consumer.commit_sync().await?;
//! }
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod record;
pub mod service;
pub mod subscriber;

pub use config::ConsumerOptions;
pub use consumer::LogConsumer;
pub use error::{classify, ConsumerError, ErrorClass, Result};
pub use record::{LogRecord, KEY_ATTRIBUTE, OFFSET_ATTRIBUTE};
pub use service::{GrpcSubscriberService, RpcResult, SubscriberService, SubscriptionInfo};
pub use subscriber::{Subscriber, SubscriberState};
