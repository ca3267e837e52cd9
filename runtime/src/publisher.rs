//! Event publisher: routes, enriches, and sends envelopes.
//!
//! # Delivery
//!
//! - Each record is keyed by its aggregate id, so one aggregate's events keep
//!   their order within a partition.
//! - A failed send is logged with the event's identity and returned; publish
//!   never fails silently.
//! - [`EventPublisher::publish_transaction`] makes a heterogeneous group of
//!   events visible atomically.
//! - [`EventPublisher::send_to_dead_letter_queue`] is the last-resort sink and
//!   never returns an error.
//!
//! # Example
//!
//! ```
//! use commerce_events_runtime::EventPublisher;
//! use commerce_events_testing::{InMemoryBroker, fixtures, test_factory};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! let publisher = EventPublisher::new(Arc::new(broker.clone()), "order-service");
//! publisher.connect().await?;
//!
//! let factory = test_factory("order-service");
//! let event = factory.order_created("order-42", fixtures::order_created(15000), None)?;
//! publisher.publish(&event, None).await?;
//!
//! assert_eq!(broker.envelopes("order-events").len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::metrics::PublisherMetrics;
use commerce_events_core::config::BackboneConfig;
use commerce_events_core::dead_letter::{FailureReport, dead_letter_envelope};
use commerce_events_core::environment::{Clock, IdGenerator, SystemClock, UuidGenerator};
use commerce_events_core::event::{EventEnvelope, EventError, format_timestamp};
use commerce_events_core::event_bus::{BrokerError, DeliveryReceipt, EventProducer};
use commerce_events_core::topic::{Topic, TopicRegistry};
use commerce_events_core::wire::{self, WireMessage};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Errors returned by [`EventPublisher`].
#[derive(Error, Debug)]
pub enum PublishError {
    /// `connect` has not been called, or `disconnect` already was.
    #[error("Publisher is not connected")]
    NotConnected,

    /// The producer connection could not be opened.
    #[error("Failed to connect publisher: {0}")]
    Connection(#[source] BrokerError),

    /// The envelope cannot be routed or encoded.
    #[error("Invalid event: {0}")]
    InvalidEvent(#[from] EventError),

    /// The broker rejected the send.
    #[error("Failed to publish to '{topic}': {source}")]
    Broker {
        /// Target topic
        topic: String,
        /// Transport error
        #[source]
        source: BrokerError,
    },

    /// The transaction was aborted; none of its events are visible.
    #[error("Transaction aborted: {0}")]
    Transaction(#[source] BrokerError),

    /// A transaction needs at least one event.
    #[error("Cannot publish an empty transaction")]
    EmptyBatch,
}

/// Publishes envelopes through an [`EventProducer`].
///
/// One publisher owns one producer connection. It is `Send + Sync`; share it
/// behind an `Arc` rather than opening several connections.
pub struct EventPublisher {
    producer: Arc<dyn EventProducer>,
    topics: TopicRegistry,
    source: String,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    connected: AtomicBool,
}

impl EventPublisher {
    /// Create a publisher stamping records with `source` as the producing
    /// service, using the default topic names.
    #[must_use]
    pub fn new(producer: Arc<dyn EventProducer>, source: impl Into<String>) -> Self {
        Self {
            producer,
            topics: TopicRegistry::new(),
            source: source.into(),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGenerator),
            connected: AtomicBool::new(false),
        }
    }

    /// Create a publisher for the service and topic prefix of `config`.
    #[must_use]
    pub fn from_config(producer: Arc<dyn EventProducer>, config: &BackboneConfig) -> Self {
        Self::new(producer, config.service.service_name.clone()).with_topics(config.topics())
    }

    /// Use a different topic registry (e.g. a prefixed one).
    #[must_use]
    pub fn with_topics(mut self, topics: TopicRegistry) -> Self {
        self.topics = topics;
        self
    }

    /// Use a different clock and id generator for enrichment and dead letters.
    #[must_use]
    pub fn with_environment(mut self, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        self.clock = clock;
        self.ids = ids;
        self
    }

    /// The producing service name written to the `source` header.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The topic registry used for routing.
    #[must_use]
    pub const fn topics(&self) -> &TopicRegistry {
        &self.topics
    }

    /// Open the producer connection.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Connection`] if the broker cannot be reached.
    pub async fn connect(&self) -> Result<(), PublishError> {
        if let Err(e) = self.producer.connect().await {
            tracing::error!(source_service = %self.source, error = %e, "Failed to connect publisher");
            return Err(PublishError::Connection(e));
        }
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(source_service = %self.source, "Event publisher connected");
        Ok(())
    }

    /// Flush and release the producer connection.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Connection`] if the flush fails; the publisher
    /// is marked disconnected either way.
    pub async fn disconnect(&self) -> Result<(), PublishError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.producer
            .disconnect()
            .await
            .map_err(PublishError::Connection)?;
        tracing::info!(source_service = %self.source, "Event publisher disconnected");
        Ok(())
    }

    /// Backfill missing identity fields without touching present ones.
    ///
    /// - empty `event_id` / `correlation_id`: fresh ids
    /// - empty `timestamp`: now
    /// - absent `causation_id`: the correlation id
    ///
    /// An envelope with every field present comes back unchanged.
    #[must_use]
    pub fn enrich(&self, mut envelope: EventEnvelope) -> EventEnvelope {
        if envelope.event_id.is_empty() {
            envelope.event_id = self.ids.next_id();
        }
        if envelope.timestamp.is_empty() {
            envelope.timestamp = format_timestamp(self.clock.now());
        }
        if envelope.correlation_id.is_empty() {
            envelope.correlation_id = self.ids.next_id();
        }
        if envelope.causation_id.is_none() {
            envelope.causation_id = Some(envelope.correlation_id.clone());
        }
        envelope
    }

    /// Publish one envelope.
    ///
    /// The topic is resolved from the event type unless given.
    ///
    /// # Errors
    ///
    /// - [`PublishError::NotConnected`] before `connect`
    /// - [`PublishError::InvalidEvent`] for envelopes without type or aggregate
    /// - [`PublishError::Broker`] when the send fails
    pub async fn publish(
        &self,
        envelope: &EventEnvelope,
        topic: Option<&str>,
    ) -> Result<DeliveryReceipt, PublishError> {
        self.ensure_connected()?;
        let (envelope, message) = self.prepare(envelope)?;
        let topic = topic.map_or_else(
            || self.topics.resolve(&envelope.event_type).to_string(),
            ToString::to_string,
        );

        match self.producer.send(&topic, vec![message]).await {
            Ok(mut receipts) => {
                PublisherMetrics::record_published(&topic, &envelope.event_type, 1);
                let receipt = receipts.pop().ok_or_else(|| PublishError::Broker {
                    topic: topic.clone(),
                    source: BrokerError::SendFailed {
                        topic: topic.clone(),
                        reason: "no delivery receipt".to_string(),
                    },
                })?;
                tracing::debug!(
                    topic = %topic,
                    partition = receipt.partition,
                    offset = receipt.offset,
                    event_type = %envelope.event_type,
                    event_id = %envelope.event_id,
                    aggregate_id = %envelope.aggregate_id,
                    "Event published"
                );
                Ok(receipt)
            },
            Err(e) => {
                PublisherMetrics::record_publish_error(&topic);
                tracing::error!(
                    topic = %topic,
                    event_type = %envelope.event_type,
                    event_id = %envelope.event_id,
                    aggregate_id = %envelope.aggregate_id,
                    error = %e,
                    "Failed to publish event"
                );
                Err(PublishError::Broker { topic, source: e })
            },
        }
    }

    /// Publish several envelopes to one topic as a single batch.
    ///
    /// The topic is resolved from the first envelope unless given; keeping
    /// the batch homogeneous is the caller's job. An empty batch is a no-op.
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish); any failure fails the whole batch
    /// and none of it is appended. A producer without a transactional id
    /// refuses batches of more than one event with
    /// [`BrokerError::BatchNeedsTransaction`].
    pub async fn publish_batch(
        &self,
        envelopes: &[EventEnvelope],
        topic: Option<&str>,
    ) -> Result<Vec<DeliveryReceipt>, PublishError> {
        self.ensure_connected()?;
        let Some(first) = envelopes.first() else {
            return Ok(Vec::new());
        };
        let topic = topic.map_or_else(
            || self.topics.resolve(&first.event_type).to_string(),
            ToString::to_string,
        );

        let prepared = envelopes
            .iter()
            .map(|envelope| self.prepare(envelope))
            .collect::<Result<Vec<_>, _>>()?;
        let (envelopes, messages): (Vec<EventEnvelope>, Vec<WireMessage>) =
            prepared.into_iter().unzip();

        match self.producer.send(&topic, messages).await {
            Ok(receipts) => {
                for envelope in &envelopes {
                    PublisherMetrics::record_published(&topic, &envelope.event_type, 1);
                }
                tracing::debug!(topic = %topic, count = envelopes.len(), "Batch published");
                Ok(receipts)
            },
            Err(e) => {
                PublisherMetrics::record_publish_error(&topic);
                let event_ids: Vec<&str> = envelopes.iter().map(|e| e.event_id.as_str()).collect();
                tracing::error!(
                    topic = %topic,
                    count = envelopes.len(),
                    event_ids = ?event_ids,
                    error = %e,
                    "Failed to publish batch"
                );
                Err(PublishError::Broker { topic, source: e })
            },
        }
    }

    /// Publish envelopes atomically, each to its own resolved topic.
    ///
    /// Either all of them become visible to consumers or none does.
    ///
    /// # Errors
    ///
    /// - [`PublishError::EmptyBatch`] for an empty slice
    /// - [`PublishError::Transaction`] when the broker aborts; treat every
    ///   event of the group as undelivered
    pub async fn publish_transaction(
        &self,
        envelopes: &[EventEnvelope],
    ) -> Result<Vec<DeliveryReceipt>, PublishError> {
        self.ensure_connected()?;
        if envelopes.is_empty() {
            return Err(PublishError::EmptyBatch);
        }

        let mut records = Vec::with_capacity(envelopes.len());
        let mut published = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let (envelope, message) = self.prepare(envelope)?;
            let topic = self.topics.resolve(&envelope.event_type).to_string();
            published.push((topic.clone(), envelope.event_type));
            records.push((topic, message));
        }

        match self.producer.send_transaction(records).await {
            Ok(receipts) => {
                for (topic, event_type) in &published {
                    PublisherMetrics::record_published(topic, event_type, 1);
                }
                tracing::debug!(count = receipts.len(), "Transaction committed");
                Ok(receipts)
            },
            Err(e) => {
                for (topic, _) in &published {
                    PublisherMetrics::record_publish_error(topic);
                }
                tracing::error!(
                    events = ?published,
                    error = %e,
                    "Transaction aborted, no events published"
                );
                Err(PublishError::Transaction(e))
            },
        }
    }

    /// Best-effort liveness probe; never errors.
    ///
    /// Fetches metadata for the system topic. An unreachable broker and a
    /// missing probe topic both yield `false` but are logged differently.
    pub async fn is_connected(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let probe_topic = self.topics.name(Topic::SystemEvents);
        match self.producer.probe(probe_topic).await {
            Ok(()) => true,
            Err(BrokerError::TopicNotFound(topic)) => {
                tracing::warn!(topic = %topic, "Broker reachable but probe topic is missing");
                false
            },
            Err(BrokerError::Unreachable(reason)) => {
                tracing::warn!(reason = %reason, "Broker unreachable");
                false
            },
            Err(e) => {
                tracing::warn!(error = %e, "Liveness probe failed");
                false
            },
        }
    }

    /// Publish a dead-letter copy of `original` to the DLQ topic.
    ///
    /// Failures are logged and counted, never returned: this is the terminal
    /// sink. Returns the receipt when the copy was delivered.
    pub async fn send_to_dead_letter_queue(
        &self,
        original: &EventEnvelope,
        failure: &FailureReport,
        retry_count: u32,
    ) -> Option<DeliveryReceipt> {
        let dead_letter = dead_letter_envelope(
            original,
            failure,
            retry_count,
            &self.source,
            &*self.clock,
            &*self.ids,
        );

        match self
            .publish(&dead_letter, Some(self.topics.dead_letter()))
            .await
        {
            Ok(receipt) => {
                PublisherMetrics::record_dead_lettered(&original.event_type);
                tracing::warn!(
                    original_event_id = %original.event_id,
                    event_type = %original.event_type,
                    dead_letter_id = %dead_letter.event_id,
                    retry_count,
                    "Event sent to dead-letter queue"
                );
                Some(receipt)
            },
            Err(e) => {
                PublisherMetrics::record_dead_letter_error();
                tracing::error!(
                    original_event_id = %original.event_id,
                    event_type = %original.event_type,
                    error = %e,
                    "Failed to send event to dead-letter queue"
                );
                None
            },
        }
    }

    fn ensure_connected(&self) -> Result<(), PublishError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PublishError::NotConnected)
        }
    }

    fn prepare(&self, envelope: &EventEnvelope) -> Result<(EventEnvelope, WireMessage), PublishError> {
        envelope.validate()?;
        let envelope = self.enrich(envelope.clone());
        let message = wire::encode(&envelope, &self.source)?;
        Ok((envelope, message))
    }
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("source", &self.source)
            .field("topics", &self.topics)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Test assertions
mod tests {
    use super::*;
    use commerce_events_testing::{InMemoryBroker, SequentialIdGenerator, test_clock};

    fn publisher(broker: &InMemoryBroker) -> EventPublisher {
        EventPublisher::new(Arc::new(broker.clone()), "test-service").with_environment(
            Arc::new(test_clock()),
            Arc::new(SequentialIdGenerator::new("pub")),
        )
    }

    fn complete() -> EventEnvelope {
        EventEnvelope {
            event_type: "OrderCreated".to_string(),
            version: "1.0.0".to_string(),
            event_id: "evt-1".to_string(),
            aggregate_id: "order-1".to_string(),
            timestamp: "2024-06-01T12:00:00.000Z".to_string(),
            correlation_id: "corr-1".to_string(),
            causation_id: Some("cmd-1".to_string()),
            payload: serde_json::json!({"orderId": "order-1"}),
        }
    }

    #[test]
    fn enrich_leaves_complete_envelope_unchanged() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        let envelope = complete();
        assert_eq!(publisher.enrich(envelope.clone()), envelope);
    }

    #[test]
    fn enrich_backfills_only_missing_fields() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        let envelope = EventEnvelope {
            event_id: String::new(),
            timestamp: String::new(),
            correlation_id: String::new(),
            causation_id: None,
            ..complete()
        };

        let enriched = publisher.enrich(envelope);
        assert_eq!(enriched.event_id, "pub-1");
        assert_eq!(enriched.timestamp, "2025-01-01T00:00:00.000Z");
        assert_eq!(enriched.correlation_id, "pub-2");
        assert_eq!(enriched.causation_id.as_deref(), Some("pub-2"));
        assert_eq!(enriched.aggregate_id, "order-1");

        // Enriching twice is a no-op
        assert_eq!(publisher.enrich(enriched.clone()), enriched);
    }

    #[tokio::test]
    async fn publish_before_connect_fails() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        let result = publisher.publish(&complete(), None).await;
        assert!(matches!(result, Err(PublishError::NotConnected)));
        assert_eq!(broker.total_messages(), 0);
    }

    #[tokio::test]
    async fn connect_failure_is_returned() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let publisher = publisher(&broker);
        assert!(matches!(
            publisher.connect().await,
            Err(PublishError::Connection(BrokerError::ConnectionFailed(_)))
        ));
    }

    #[tokio::test]
    async fn publish_routes_keys_and_sets_headers() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        publisher.connect().await.unwrap();

        let receipt = publisher.publish(&complete(), None).await.unwrap();
        assert_eq!(receipt.topic, "order-events");
        assert_eq!(receipt.partition, broker.partition_for("order-1"));

        let messages = broker.messages("order-events");
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.key, "order-1");
        assert_eq!(message.header(wire::HEADER_EVENT_TYPE), Some("OrderCreated"));
        assert_eq!(message.header(wire::HEADER_VERSION), Some("1.0.0"));
        assert_eq!(message.header(wire::HEADER_SOURCE), Some("test-service"));
        assert_eq!(
            message.header(wire::HEADER_TIMESTAMP),
            Some("2024-06-01T12:00:00.000Z")
        );
        assert_eq!(wire::decode(&message.value).unwrap(), complete());
    }

    #[tokio::test]
    async fn explicit_topic_wins() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        publisher.connect().await.unwrap();

        publisher.publish(&complete(), Some("audit")).await.unwrap();
        assert_eq!(broker.messages("audit").len(), 1);
        assert!(broker.messages("order-events").is_empty());
    }

    #[tokio::test]
    async fn invalid_envelope_is_rejected() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        publisher.connect().await.unwrap();

        let envelope = EventEnvelope {
            aggregate_id: String::new(),
            ..complete()
        };
        assert!(matches!(
            publisher.publish(&envelope, None).await,
            Err(PublishError::InvalidEvent(EventError::Malformed(_)))
        ));
    }

    #[tokio::test]
    async fn send_failure_is_returned_with_topic() {
        let broker = InMemoryBroker::new();
        broker.fail_topic("order-events");
        let publisher = publisher(&broker);
        publisher.connect().await.unwrap();

        match publisher.publish(&complete(), None).await {
            Err(PublishError::Broker { topic, .. }) => assert_eq!(topic, "order-events"),
            other => panic!("expected broker error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        publisher.connect().await.unwrap();

        assert!(publisher.publish_batch(&[], None).await.unwrap().is_empty());
        assert!(matches!(
            publisher.publish_transaction(&[]).await,
            Err(PublishError::EmptyBatch)
        ));
    }

    #[tokio::test]
    async fn batch_goes_to_first_event_topic() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        publisher.connect().await.unwrap();

        let second = EventEnvelope {
            event_id: "evt-2".to_string(),
            event_type: "OrderCancelled".to_string(),
            ..complete()
        };
        let receipts = publisher
            .publish_batch(&[complete(), second], None)
            .await
            .unwrap();

        assert_eq!(receipts.len(), 2);
        assert!(receipts.iter().all(|r| r.topic == "order-events"));
        assert_eq!(receipts[0].offset + 1, receipts[1].offset);
    }

    #[tokio::test]
    async fn failed_batch_publishes_nothing() {
        let broker = InMemoryBroker::new();
        broker.fail_topic("order-events");
        let publisher = publisher(&broker);
        publisher.connect().await.unwrap();

        let second = EventEnvelope {
            event_id: "evt-2".to_string(),
            ..complete()
        };
        match publisher.publish_batch(&[complete(), second], None).await {
            Err(PublishError::Broker { topic, source: BrokerError::SendFailed { .. } }) => {
                assert_eq!(topic, "order-events");
            },
            other => panic!("expected broker error, got {other:?}"),
        }
        assert!(broker.messages("order-events").is_empty());
    }

    #[tokio::test]
    async fn multi_event_batch_needs_transactional_producer() {
        let broker = InMemoryBroker::new();
        broker.disable_transactions();
        let publisher = publisher(&broker);
        publisher.connect().await.unwrap();

        let second = EventEnvelope {
            event_id: "evt-2".to_string(),
            ..complete()
        };
        assert!(matches!(
            publisher.publish_batch(&[complete(), second], None).await,
            Err(PublishError::Broker {
                source: BrokerError::BatchNeedsTransaction { records: 2, .. },
                ..
            })
        ));
        assert!(broker.messages("order-events").is_empty());

        // A single-event batch is one record and needs no transaction
        assert_eq!(publisher.publish_batch(&[complete()], None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn liveness_probe_never_errors() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        assert!(!publisher.is_connected().await);

        publisher.connect().await.unwrap();
        assert!(publisher.is_connected().await);

        broker.set_reachable(false);
        assert!(!publisher.is_connected().await);

        let prefixed = EventPublisher::new(Arc::new(InMemoryBroker::new()), "svc")
            .with_topics(TopicRegistry::with_prefix("staging"));
        prefixed.connect().await.unwrap();
        assert!(!prefixed.is_connected().await);
    }

    #[tokio::test]
    async fn dead_letter_failure_is_swallowed() {
        let broker = InMemoryBroker::new();
        broker.fail_topic("dead-letter-queue");
        let publisher = publisher(&broker);
        publisher.connect().await.unwrap();

        let receipt = publisher
            .send_to_dead_letter_queue(&complete(), &FailureReport::new("boom", "boom"), 3)
            .await;
        assert!(receipt.is_none());
    }

    #[tokio::test]
    async fn dead_letter_goes_to_dlq_topic() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        publisher.connect().await.unwrap();

        publisher
            .send_to_dead_letter_queue(&complete(), &FailureReport::new("boom", "detail"), 3)
            .await
            .unwrap();

        let dead = broker.envelopes("dead-letter-queue");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].event_type, "DeadLetter_OrderCreated");
        assert_eq!(dead[0].aggregate_id, "order-1");
        assert_eq!(dead[0].payload["_deadLetter"]["originalEventId"], "evt-1");
        assert_eq!(dead[0].payload["_deadLetter"]["sourceService"], "test-service");
        assert_eq!(broker.messages("dead-letter-queue")[0].key, "order-1");
    }
}
