//! Caller-visible records and the wire conventions they are decoded from.
//!
//! The remote service has no native offset or key concepts, so both ride in
//! message attributes put there by the producing side: `offset` is a decimal
//! integer string, `key` is Base64-encoded key bytes. The record timestamp
//! is the server publish time in milliseconds.

use base64::Engine as _;
use google_cloud_googleapis::pubsub::v1::PubsubMessage;
use prost_types::Timestamp;

use crate::error::{ConsumerError, Result};

/// Attribute holding the Base64-encoded record key.
pub const KEY_ATTRIBUTE: &str = "key";
/// Attribute holding the producer-assigned offset.
pub const OFFSET_ATTRIBUTE: &str = "offset";

/// A consumed record.
///
/// Offsets are producer-assigned and are not guaranteed monotone or unique;
/// they exist so offset-bounded commits have something to compare against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Short topic name this record was pulled from.
    pub topic: String,
    /// Producer-assigned offset; 0 when the producer did not set one.
    pub offset: i64,
    /// Server publish time in milliseconds since the epoch.
    pub timestamp_ms: i64,
    /// Record key, or `None` when the producer sent no key.
    pub key: Option<Vec<u8>>,
    /// Record payload.
    pub value: Vec<u8>,
}

/// Decode one received message into a record.
///
/// A missing `offset` attribute maps to offset 0; anything that is not a
/// non-negative decimal integer is a producer bug and fails the whole pull
/// batch so nothing from it is surfaced or acknowledged.
pub(crate) fn decode_record(topic: &str, message: &PubsubMessage) -> Result<LogRecord> {
    let offset = parse_offset(message)?;

    let key = match message.attributes.get(KEY_ATTRIBUTE) {
        Some(encoded) => Some(
            base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|_| ConsumerError::UnparsableKey {
                    message_id: message.message_id.clone(),
                })?,
        ),
        None => None,
    };

    Ok(LogRecord {
        topic: topic.to_string(),
        offset,
        timestamp_ms: publish_time_millis(message.publish_time.as_ref()),
        key,
        value: message.data.clone(),
    })
}

pub(crate) fn parse_offset(message: &PubsubMessage) -> Result<i64> {
    let raw = match message.attributes.get(OFFSET_ATTRIBUTE) {
        Some(raw) => raw,
        None => return Ok(0),
    };
    match raw.parse::<i64>() {
        Ok(offset) if offset >= 0 => Ok(offset),
        _ => Err(ConsumerError::UnparsableOffset {
            raw: raw.clone(),
            message_id: message.message_id.clone(),
        }),
    }
}

fn publish_time_millis(publish_time: Option<&Timestamp>) -> i64 {
    match publish_time {
        Some(ts) => ts.seconds * 1000 + i64::from(ts.nanos) / 1_000_000,
        None => 0,
    }
}
