//! # Consumer Runtime Metrics
//!
//! Atomic counters tracking throughput and error behavior of the pull and
//! acknowledge paths. Exposed as plain getters so an embedding library can
//! surface them however it likes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Total messages received from pull RPCs since process start.
pub static PULLED_MESSAGES: AtomicU64 = AtomicU64::new(0);

/// Total payload bytes received from pull RPCs since process start.
pub static PULLED_BYTES: AtomicU64 = AtomicU64::new(0);

/// Total ack ids carried by successful acknowledge RPCs.
pub static ACKED_MESSAGES: AtomicU64 = AtomicU64::new(0);

/// Total ack ids carried by successful modify-deadline RPCs (extensions and nacks).
pub static MODIFIED_MESSAGES: AtomicU64 = AtomicU64::new(0);

/// Messages dropped after reaching the maximum extension period.
pub static EXPIRED_MESSAGES: AtomicU64 = AtomicU64::new(0);

/// Retries performed across all RPC kinds.
pub static RPC_RETRIES: AtomicU64 = AtomicU64::new(0);

pub fn get_pulled_messages() -> u64 { PULLED_MESSAGES.load(Ordering::Relaxed) }
pub fn get_pulled_bytes() -> u64 { PULLED_BYTES.load(Ordering::Relaxed) }
pub fn get_acked_messages() -> u64 { ACKED_MESSAGES.load(Ordering::Relaxed) }
pub fn get_modified_messages() -> u64 { MODIFIED_MESSAGES.load(Ordering::Relaxed) }
pub fn get_expired_messages() -> u64 { EXPIRED_MESSAGES.load(Ordering::Relaxed) }
pub fn get_rpc_retries() -> u64 { RPC_RETRIES.load(Ordering::Relaxed) }
