//! Dead-letter envelopes.
//!
//! When a message exhausts its retries, a *derived* envelope is published to
//! the dead-letter topic. It is a brand-new record: fresh id, `eventType`
//! prefixed with `DeadLetter_`, and the original payload copied alongside a
//! reserved `_deadLetter` block of diagnostics. The original envelope is only
//! read, never modified, so the two can't alias.

use crate::environment::{Clock, IdGenerator};
use crate::event::{DEAD_LETTER_PREFIX, EventEnvelope, format_timestamp};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;

/// Reserved payload key holding the diagnostics block.
pub const DEAD_LETTER_KEY: &str = "_deadLetter";

/// Payload key wrapping an original payload that was not a JSON object.
pub const ORIGINAL_PAYLOAD_KEY: &str = "originalPayload";

/// What went wrong, in a form that survives serialization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// One-line error message
    pub message: String,
    /// Full error chain
    pub detail: String,
}

impl FailureReport {
    /// Create a report from explicit text.
    #[must_use]
    pub fn new(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: detail.into(),
        }
    }

    /// Create a report from an error and its `source()` chain.
    #[must_use]
    pub fn from_error(error: &(dyn StdError + 'static)) -> Self {
        let mut detail = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            detail.push_str("\n  caused by: ");
            detail.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            message: error.to_string(),
            detail,
        }
    }
}

/// Diagnostics embedded under [`DEAD_LETTER_KEY`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterInfo {
    /// Id of the envelope that failed
    pub original_event_id: String,
    /// Type of the envelope that failed
    pub original_event_type: String,
    /// Timestamp of the envelope that failed
    pub original_timestamp: String,
    /// One-line error message
    pub error_message: String,
    /// Full error chain
    pub error_stack: String,
    /// Retries attempted before giving up
    pub retry_count: u32,
    /// When the message was given up on
    pub failed_at: String,
    /// Service that gave up on it
    pub source_service: String,
}

/// Build the dead-letter copy of `original`.
///
/// Every call yields a fresh `event_id`; the diagnostics always point back at
/// the original's id and timestamp.
#[must_use]
pub fn dead_letter_envelope(
    original: &EventEnvelope,
    failure: &FailureReport,
    retry_count: u32,
    source_service: &str,
    clock: &dyn Clock,
    ids: &dyn IdGenerator,
) -> EventEnvelope {
    let failed_at = format_timestamp(clock.now());
    let info = DeadLetterInfo {
        original_event_id: original.event_id.clone(),
        original_event_type: original.event_type.clone(),
        original_timestamp: original.timestamp.clone(),
        error_message: failure.message.clone(),
        error_stack: failure.detail.clone(),
        retry_count,
        failed_at: failed_at.clone(),
        source_service: source_service.to_string(),
    };

    let mut payload = match &original.payload {
        serde_json::Value::Object(map) => map.clone(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert(ORIGINAL_PAYLOAD_KEY.to_string(), other.clone());
            map
        },
    };
    payload.insert(DEAD_LETTER_KEY.to_string(), info_value(&info));

    let correlation_id = if original.correlation_id.is_empty() {
        ids.next_id()
    } else {
        original.correlation_id.clone()
    };

    EventEnvelope {
        event_type: format!("{DEAD_LETTER_PREFIX}{}", original.event_type),
        version: original.version.clone(),
        event_id: ids.next_id(),
        aggregate_id: original.aggregate_id.clone(),
        timestamp: failed_at,
        correlation_id,
        causation_id: Some(original.event_id.clone()).filter(|id| !id.is_empty()),
        payload: serde_json::Value::Object(payload),
    }
}

/// Read the diagnostics block back out of a dead-letter envelope.
#[must_use]
pub fn dead_letter_info(envelope: &EventEnvelope) -> Option<DeadLetterInfo> {
    envelope
        .payload
        .get(DEAD_LETTER_KEY)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

fn info_value(info: &DeadLetterInfo) -> serde_json::Value {
    serde_json::json!({
        "originalEventId": info.original_event_id,
        "originalEventType": info.original_event_type,
        "originalTimestamp": info.original_timestamp,
        "errorMessage": info.error_message,
        "errorStack": info.error_stack,
        "retryCount": info.retry_count,
        "failedAt": info.failed_at,
        "sourceService": info.source_service,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test assertions
mod tests {
    use super::*;
    use crate::environment::{SystemClock, UuidGenerator};
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("inventory service timed out")]
    struct Timeout {
        #[source]
        source: std::io::Error,
    }

    fn original() -> EventEnvelope {
        EventEnvelope {
            event_type: "OrderCreated".to_string(),
            version: "1.0.0".to_string(),
            event_id: "evt-1".to_string(),
            aggregate_id: "order-42".to_string(),
            timestamp: "2025-01-01T00:00:00.000Z".to_string(),
            correlation_id: "corr-1".to_string(),
            causation_id: None,
            payload: serde_json::json!({"orderId": "order-42", "totalAmount": 15000}),
        }
    }

    #[test]
    fn derived_envelope_shape() {
        let original = original();
        let failure = FailureReport::new("boom", "boom at handler");
        let dlq = dead_letter_envelope(
            &original,
            &failure,
            3,
            "notification-service",
            &SystemClock,
            &UuidGenerator,
        );

        assert_eq!(dlq.event_type, "DeadLetter_OrderCreated");
        assert!(dlq.is_dead_letter());
        assert_ne!(dlq.event_id, original.event_id);
        assert_eq!(dlq.aggregate_id, "order-42");
        assert_eq!(dlq.correlation_id, "corr-1");
        assert_eq!(dlq.causation_id.as_deref(), Some("evt-1"));
        assert_eq!(dlq.payload["totalAmount"], 15000);

        let info = dead_letter_info(&dlq).unwrap();
        assert_eq!(info.original_event_id, "evt-1");
        assert_eq!(info.original_timestamp, "2025-01-01T00:00:00.000Z");
        assert_eq!(info.error_message, "boom");
        assert_eq!(info.error_stack, "boom at handler");
        assert_eq!(info.retry_count, 3);
        assert_eq!(info.source_service, "notification-service");
        assert_eq!(info.failed_at, dlq.timestamp);
    }

    #[test]
    fn repeated_dead_lettering_keeps_shape_with_fresh_ids() {
        let original = original();
        let failure = FailureReport::new("boom", "");
        let first =
            dead_letter_envelope(&original, &failure, 1, "svc", &SystemClock, &UuidGenerator);
        let second =
            dead_letter_envelope(&original, &failure, 1, "svc", &SystemClock, &UuidGenerator);

        assert_eq!(first.event_type, second.event_type);
        assert_ne!(first.event_id, second.event_id);
        assert_eq!(
            dead_letter_info(&first).unwrap().original_event_id,
            dead_letter_info(&second).unwrap().original_event_id
        );
    }

    #[test]
    fn original_is_untouched() {
        let original = original();
        let snapshot = original.clone();
        let _ = dead_letter_envelope(
            &original,
            &FailureReport::new("x", "y"),
            0,
            "svc",
            &SystemClock,
            &UuidGenerator,
        );
        assert_eq!(original, snapshot);
    }

    #[test]
    fn scalar_payload_is_nested() {
        let mut original = original();
        original.payload = serde_json::json!("raw");
        let dlq = dead_letter_envelope(
            &original,
            &FailureReport::new("x", "y"),
            0,
            "svc",
            &SystemClock,
            &UuidGenerator,
        );
        assert_eq!(dlq.payload[ORIGINAL_PAYLOAD_KEY], "raw");
        assert!(dlq.payload.get(DEAD_LETTER_KEY).is_some());
    }

    #[test]
    fn failure_report_walks_source_chain() {
        let err = Timeout {
            source: std::io::Error::other("connection reset"),
        };
        let report = FailureReport::from_error(&err);
        assert_eq!(report.message, "inventory service timed out");
        assert!(report.detail.contains("caused by: connection reset"));
    }
}
