//! Domain event envelope and the event catalog.
//!
//! An [`EventEnvelope`] is the unit of transport: a business payload wrapped in
//! the metadata needed to route it, order it, and reconstruct its causal chain.
//! Envelopes are immutable facts once published.
//!
//! # Design
//!
//! The catalog of event types is closed: [`EventType`] has one variant per
//! business event, and [`DomainEvent`] pairs each variant with its typed
//! payload. The envelope itself keeps `event_type` as a plain string so that
//! messages from newer producers (or dead-letter copies) still parse; callers
//! that want the typed view use [`EventEnvelope::kind`] or
//! [`EventEnvelope::decode`].
//!
//! # Wire shape
//!
//! Envelopes serialize to camelCase JSON:
//!
//! ```json
//! {
//!   "eventType": "OrderCreated",
//!   "version": "1.0.0",
//!   "eventId": "0b9f...",
//!   "aggregateId": "order-42",
//!   "timestamp": "2025-01-01T00:00:00.000Z",
//!   "correlationId": "6c1e...",
//!   "causationId": "a71d...",
//!   "payload": { "orderId": "order-42", "totalAmount": 15000 }
//! }
//! ```
//!
//! `eventId`, `timestamp`, and `correlationId` default to empty strings when a
//! message omits them; empty means "absent" and the publisher backfills it.

use crate::payload;
use crate::topic::Topic;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error types for event construction and parsing.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize an envelope or payload.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Inbound bytes could not be turned into a valid envelope.
    ///
    /// Malformed messages are permanent failures and are never retried.
    #[error("Malformed event message: {0}")]
    Malformed(String),

    /// An envelope was requested for an empty aggregate id.
    #[error("Aggregate id must not be empty for {0}")]
    EmptyAggregateId(&'static str),

    /// The event type string is not part of the catalog.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The payload does not match the shape declared for its event type.
    #[error("Payload of {event_type} does not match its schema: {reason}")]
    PayloadMismatch {
        /// The envelope's event type
        event_type: String,
        /// The deserializer's complaint
        reason: String,
    },
}

macro_rules! event_catalog {
    ($( $(#[$doc:meta])* $name:ident => $topic:ident ),+ $(,)?) => {
        /// The closed set of business events carried by the backbone.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum EventType {
            $( $(#[$doc])* $name, )+
        }

        impl EventType {
            /// Every catalogued event type.
            pub const ALL: &'static [Self] = &[ $( Self::$name, )+ ];

            /// The wire name of this event type (e.g. `"OrderCreated"`).
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( Self::$name => stringify!($name), )+
                }
            }

            /// The logical topic this event type is published to.
            ///
            /// Agrees with [`topic_for_event_type`](crate::topic::topic_for_event_type)
            /// for every catalogued name.
            #[must_use]
            pub const fn topic(self) -> Topic {
                match self {
                    $( Self::$name => Topic::$topic, )+
                }
            }
        }

        impl FromStr for EventType {
            type Err = EventError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( stringify!($name) => Ok(Self::$name), )+
                    other => Err(EventError::UnknownEventType(other.to_string())),
                }
            }
        }

        /// A decoded event: the catalogued type together with its typed payload.
        #[derive(Clone, Debug, PartialEq)]
        pub enum DomainEvent {
            $( $(#[$doc])* $name(payload::$name), )+
        }

        impl DomainEvent {
            /// The catalogued type of this event.
            #[must_use]
            pub const fn event_type(&self) -> EventType {
                match self {
                    $( Self::$name(_) => EventType::$name, )+
                }
            }

            /// Decode an envelope's payload according to its event type.
            ///
            /// # Errors
            ///
            /// Returns [`EventError::UnknownEventType`] for names outside the
            /// catalog and [`EventError::PayloadMismatch`] when the payload does
            /// not fit the declared shape.
            pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, EventError> {
                match envelope.event_type.parse::<EventType>()? {
                    $( EventType::$name => envelope.payload_as().map(Self::$name), )+
                }
            }
        }
    };
}

event_catalog! {
    /// A customer account was created.
    UserRegistered => UserEvents,
    /// Profile fields of a customer account changed.
    UserUpdated => UserEvents,
    /// A customer account was deactivated.
    UserDeactivated => UserEvents,
    /// A product was added to the catalog.
    ProductAdded => ProductEvents,
    /// Catalog fields of a product changed.
    ProductUpdated => ProductEvents,
    /// On-hand stock of a product changed.
    StockUpdated => ProductEvents,
    /// Stock fell to or below the reorder threshold.
    LowStockAlert => ProductEvents,
    /// An order was placed.
    OrderCreated => OrderEvents,
    /// Payment for an order was approved.
    OrderPaymentCompleted => OrderEvents,
    /// An order moved to a new fulfilment status.
    OrderStatusUpdated => OrderEvents,
    /// An order was cancelled.
    OrderCancelled => OrderEvents,
    /// An item was added to a cart.
    CartItemAdded => CartEvents,
    /// A cart was left inactive past the abandonment window.
    CartAbandoned => CartEvents,
    /// A service instance started.
    ServiceStarted => SystemEvents,
    /// A service instance stopped.
    ServiceStopped => SystemEvents,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prefix marking an envelope derived by the dead-letter path.
pub const DEAD_LETTER_PREFIX: &str = "DeadLetter_";

/// The transport wrapper around a business payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Business event name, used for routing and dispatch.
    pub event_type: String,

    /// Schema version of the envelope and payload shape.
    #[serde(default)]
    pub version: String,

    /// Unique identifier of this occurrence.
    #[serde(default)]
    pub event_id: String,

    /// The business entity this event is about; the partition key.
    pub aggregate_id: String,

    /// Creation time, RFC 3339 in UTC.
    #[serde(default)]
    pub timestamp: String,

    /// Shared by every event of one logical operation.
    #[serde(default)]
    pub correlation_id: String,

    /// The event or command that directly caused this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Business data, one shape per event type.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// The catalogued type, or `None` for names outside the catalog.
    #[must_use]
    pub fn kind(&self) -> Option<EventType> {
        self.event_type.parse().ok()
    }

    /// Whether this envelope was produced by the dead-letter path.
    #[must_use]
    pub fn is_dead_letter(&self) -> bool {
        self.event_type.starts_with(DEAD_LETTER_PREFIX)
    }

    /// Deserialize the payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::PayloadMismatch`] if the payload does not fit `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| EventError::PayloadMismatch {
            event_type: self.event_type.clone(),
            reason: e.to_string(),
        })
    }

    /// Decode into the typed [`DomainEvent`] view.
    ///
    /// # Errors
    ///
    /// See [`DomainEvent::from_envelope`].
    pub fn decode(&self) -> Result<DomainEvent, EventError> {
        DomainEvent::from_envelope(self)
    }

    /// Check the fields every envelope must carry to be routable.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Malformed`] when `event_type` or `aggregate_id`
    /// is empty.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.event_type.trim().is_empty() {
            return Err(EventError::Malformed("missing eventType".to_string()));
        }
        if self.aggregate_id.trim().is_empty() {
            return Err(EventError::Malformed("missing aggregateId".to_string()));
        }
        Ok(())
    }

    /// Whether every always-present field is populated.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.event_type.is_empty()
            && !self.event_id.is_empty()
            && !self.aggregate_id.is_empty()
            && !self.timestamp.is_empty()
            && !self.correlation_id.is_empty()
    }

    /// The timestamp parsed as a UTC instant, if it is well formed.
    #[must_use]
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

impl fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventEnvelope {{ type: {}, id: {}, aggregate: {} }}",
            self.event_type, self.event_id, self.aggregate_id
        )
    }
}

/// Format an instant the way envelopes carry it.
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Test assertions
mod tests {
    use super::*;
    use crate::topic::topic_for_event_type;

    fn envelope(event_type: &str, payload: serde_json::Value) -> EventEnvelope {
        EventEnvelope {
            event_type: event_type.to_string(),
            version: "1.0.0".to_string(),
            event_id: "evt-1".to_string(),
            aggregate_id: "order-42".to_string(),
            timestamp: "2025-01-01T00:00:00.000Z".to_string(),
            correlation_id: "corr-1".to_string(),
            causation_id: None,
            payload,
        }
    }

    #[test]
    fn event_type_names_round_trip() {
        for kind in EventType::ALL {
            assert_eq!(kind.as_str().parse::<EventType>().ok(), Some(*kind));
        }
        assert_eq!(EventType::ALL.len(), 15);
    }

    #[test]
    fn catalog_topics_agree_with_prefix_rule() {
        for kind in EventType::ALL {
            assert_eq!(kind.topic(), topic_for_event_type(kind.as_str()));
        }
    }

    #[test]
    fn unknown_event_type_does_not_parse() {
        assert!(matches!(
            "FooBarEvent".parse::<EventType>(),
            Err(EventError::UnknownEventType(name)) if name == "FooBarEvent"
        ));
    }

    #[test]
    fn validate_rejects_missing_routing_fields() {
        let mut e = envelope("OrderCreated", serde_json::json!({}));
        assert!(e.validate().is_ok());

        e.aggregate_id = String::new();
        assert!(matches!(e.validate(), Err(EventError::Malformed(_))));

        e.aggregate_id = "order-42".to_string();
        e.event_type = "  ".to_string();
        assert!(matches!(e.validate(), Err(EventError::Malformed(_))));
    }

    #[test]
    fn missing_optional_fields_deserialize_as_absent() {
        let json = r#"{"eventType":"CartAbandoned","aggregateId":"cart-1","payload":{}}"#;
        let e: EventEnvelope = serde_json::from_str(json).unwrap();
        assert!(e.event_id.is_empty());
        assert!(e.timestamp.is_empty());
        assert!(e.correlation_id.is_empty());
        assert!(e.causation_id.is_none());
        assert!(!e.is_complete());
    }

    #[test]
    fn camel_case_field_names_on_the_wire() {
        let mut e = envelope("OrderCreated", serde_json::json!({"orderId": "order-42"}));
        e.causation_id = Some("cause-1".to_string());
        let value = serde_json::to_value(&e).unwrap();
        for key in [
            "eventType",
            "version",
            "eventId",
            "aggregateId",
            "timestamp",
            "correlationId",
            "causationId",
            "payload",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn decode_typed_payload() {
        let e = envelope(
            "OrderCancelled",
            serde_json::json!({
                "orderId": "order-42",
                "reason": "customer request",
                "cancelledBy": "user-7",
                "refundAmount": 15000
            }),
        );
        let decoded = e.decode().unwrap();
        assert_eq!(decoded.event_type(), EventType::OrderCancelled);
        match decoded {
            DomainEvent::OrderCancelled(p) => assert_eq!(p.refund_amount, 15000),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn decode_reports_payload_mismatch() {
        let e = envelope("OrderCancelled", serde_json::json!({"orderId": 5}));
        assert!(matches!(e.decode(), Err(EventError::PayloadMismatch { .. })));
    }

    #[test]
    fn timestamp_parses_back() {
        let at = DateTime::parse_from_rfc3339("2025-03-04T05:06:07.089Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut e = envelope("OrderCreated", serde_json::Value::Null);
        e.timestamp = format_timestamp(at);
        assert_eq!(e.timestamp, "2025-03-04T05:06:07.089Z");
        assert_eq!(e.timestamp_utc(), Some(at));
    }
}
