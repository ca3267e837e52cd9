//! Wire format: how an envelope travels as a broker record.
//!
//! - **key**: the aggregate id, so every event of one aggregate lands on the
//!   same partition and keeps its order.
//! - **value**: the JSON-serialized envelope.
//! - **headers**: `eventType`, `version`, `source`, `timestamp` as plain
//!   strings, duplicating envelope fields so routing and observability tools
//!   never have to deserialize the body.

use crate::event::{EventEnvelope, EventError};

/// Header carrying the envelope's event type.
pub const HEADER_EVENT_TYPE: &str = "eventType";
/// Header carrying the envelope's schema version.
pub const HEADER_VERSION: &str = "version";
/// Header carrying the producing service name.
pub const HEADER_SOURCE: &str = "source";
/// Header carrying the envelope's timestamp.
pub const HEADER_TIMESTAMP: &str = "timestamp";
/// Header carrying how many times processing of this record was retried.
pub const HEADER_RETRY_COUNT: &str = "retryCount";

/// A record ready to hand to a producer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireMessage {
    /// Partition key (the aggregate id)
    pub key: String,
    /// JSON body
    pub value: Vec<u8>,
    /// String headers, in insertion order
    pub headers: Vec<(String, String)>,
}

impl WireMessage {
    /// Look up a header value by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Encode an envelope into a record produced by `source`.
///
/// # Errors
///
/// Returns [`EventError::SerializationError`] if the payload cannot be
/// serialized.
pub fn encode(envelope: &EventEnvelope, source: &str) -> Result<WireMessage, EventError> {
    let value =
        serde_json::to_vec(envelope).map_err(|e| EventError::SerializationError(e.to_string()))?;

    Ok(WireMessage {
        key: envelope.aggregate_id.clone(),
        value,
        headers: vec![
            (HEADER_EVENT_TYPE.to_string(), envelope.event_type.clone()),
            (HEADER_VERSION.to_string(), envelope.version.clone()),
            (HEADER_SOURCE.to_string(), source.to_string()),
            (HEADER_TIMESTAMP.to_string(), envelope.timestamp.clone()),
        ],
    })
}

/// Parse a record body back into an envelope.
///
/// # Errors
///
/// Returns [`EventError::Malformed`] when the bytes are not JSON, do not have
/// the envelope shape, or lack `eventType`/`aggregateId`.
pub fn decode(bytes: &[u8]) -> Result<EventEnvelope, EventError> {
    let envelope: EventEnvelope =
        serde_json::from_slice(bytes).map_err(|e| EventError::Malformed(e.to_string()))?;
    envelope.validate()?;
    Ok(envelope)
}

/// Find a header in a header list.
#[must_use]
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// Read the retry counter from a header list; absent or garbled means zero.
#[must_use]
pub fn retry_count(headers: &[(String, String)]) -> u32 {
    find_header(headers, HEADER_RETRY_COUNT)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Set the retry counter, replacing any previous value.
pub fn set_retry_count(headers: &mut Vec<(String, String)>, count: u32) {
    headers.retain(|(key, _)| key != HEADER_RETRY_COUNT);
    headers.push((HEADER_RETRY_COUNT.to_string(), count.to_string()));
}
