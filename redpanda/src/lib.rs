//! Redpanda transports for the commerce event backbone.
//!
//! [`RedpandaProducer`] and [`RedpandaConsumer`] implement the
//! [`EventProducer`](commerce_events_core::event_bus::EventProducer) and
//! [`EventSubscriber`](commerce_events_core::event_bus::EventSubscriber)
//! traits from `commerce-events-core` with rdkafka, so they work against any
//! Kafka-compatible broker (Redpanda, Apache Kafka, MSK, ...).
//!
//! # Delivery Semantics
//!
//! **Producer**: idempotent, `acks=all`, one request in flight per
//! connection by default. Each record is keyed by its aggregate id, which
//! pins an aggregate to one partition and preserves its order. With a
//! transactional id, groups of records across topics commit atomically.
//!
//! **Consumer**: `enable.auto.commit=false` and
//! `isolation.level=read_committed`. Records are handed to the runtime as they
//! arrive; the runtime commits after processing, so a crash in between
//! redelivers.
//!
//! # Example
//!
//! ```no_run
//! use commerce_events_core::config::BackboneConfig;
//! use commerce_events_redpanda::{RedpandaConsumer, RedpandaProducer};
//! use commerce_events_runtime::{EventConsumer, EventPublisher};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BackboneConfig::from_env()?;
//!
//! let publisher = Arc::new(EventPublisher::from_config(
//!     Arc::new(RedpandaProducer::from_config(&config)),
//!     &config,
//! ));
//! publisher.connect().await?;
//!
//! let consumer = EventConsumer::from_config(Arc::new(RedpandaConsumer::from_config(&config)), &config)
//!     .dead_letter_publisher(Arc::clone(&publisher))
//!     .build();
//! # Ok(())
//! # }
//! ```

mod consumer;
mod producer;

pub use consumer::{ConsumerSettings, RedpandaConsumer, RedpandaConsumerBuilder};
pub use producer::{ProducerSettings, RedpandaProducer, RedpandaProducerBuilder};

use commerce_events_core::event_bus::InboundMessage;
use rdkafka::error::KafkaResult;
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};

/// Run a blocking librdkafka call off the async workers.
async fn blocking<T, F>(call: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce() -> KafkaResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(e) => Err(format!("blocking task failed: {e}")),
    }
}

fn kafka_headers(headers: &[(String, String)]) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        })
}

/// Copy a received record out of the client's buffers.
///
/// Keys and header values are read as UTF-8, replacing invalid bytes.
fn inbound_message<M: Message>(message: &M) -> InboundMessage {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    let value = header
                        .value
                        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                        .unwrap_or_default();
                    (header.key.to_string(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec),
        headers,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test assertions
mod tests {
    use super::*;
    use commerce_events_core::wire::{self, HEADER_EVENT_TYPE, HEADER_RETRY_COUNT};
    use rdkafka::message::{OwnedMessage, Timestamp};

    #[test]
    fn received_records_keep_key_payload_and_headers() {
        let mut wire_headers = vec![(HEADER_EVENT_TYPE.to_string(), "OrderCreated".to_string())];
        wire::set_retry_count(&mut wire_headers, 2);

        let record = OwnedMessage::new(
            Some(br#"{"eventType":"OrderCreated","aggregateId":"order-42"}"#.to_vec()),
            Some(b"order-42".to_vec()),
            "order-events".to_string(),
            Timestamp::NotAvailable,
            2,
            17,
            Some(kafka_headers(&wire_headers)),
        );

        let inbound = inbound_message(&record);
        assert_eq!(inbound.topic, "order-events");
        assert_eq!(inbound.partition, 2);
        assert_eq!(inbound.offset, 17);
        assert_eq!(inbound.key.as_deref(), Some("order-42"));
        assert_eq!(inbound.header(HEADER_EVENT_TYPE), Some("OrderCreated"));
        assert_eq!(inbound.header(HEADER_RETRY_COUNT), Some("2"));
        assert_eq!(inbound.retry_count(), 2);
        assert_eq!(inbound.next_offset().offset, 18);
    }

    #[test]
    fn records_without_key_or_headers_convert() {
        let record = OwnedMessage::new(
            None,
            None,
            "cart-events".to_string(),
            Timestamp::NotAvailable,
            0,
            0,
            None,
        );

        let inbound = inbound_message(&record);
        assert!(inbound.key.is_none());
        assert!(inbound.payload.is_none());
        assert!(inbound.headers.is_empty());
        assert_eq!(inbound.retry_count(), 0);
    }

    #[tokio::test]
    async fn blocking_surfaces_client_errors() {
        let ok = blocking(|| Ok(7)).await;
        assert_eq!(ok, Ok(7));

        let err = blocking(|| -> KafkaResult<()> {
            Err(rdkafka::error::KafkaError::Canceled)
        })
        .await;
        assert!(err.is_err());
    }
}
