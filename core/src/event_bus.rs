//! Broker transport abstraction.
//!
//! The publisher and consumer never talk to Kafka directly; they drive these
//! two traits. Production uses the rdkafka-backed transports from
//! `commerce-events-redpanda`, tests use the in-memory broker from
//! `commerce-events-testing`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    EventEnvelope    ┌──────────────────┐
//! │ EventFactory │ ──────────────────► │  EventPublisher  │
//! └──────────────┘                     └────────┬─────────┘
//!                                               │ WireMessage
//!                                               ▼
//!                                      ┌──────────────────┐
//!                                      │  EventProducer   │◄─── Redpanda / in-memory
//!                                      └────────┬─────────┘
//!                                               │
//!                                         ══ broker ══
//!                                               │
//!                                               ▼
//!                                      ┌──────────────────┐
//!                                      │ EventSubscriber  │◄─── Redpanda / in-memory
//!                                      └────────┬─────────┘
//!                                               │ InboundMessage
//!                                               ▼
//!                                      ┌──────────────────┐
//!                                      │  EventConsumer   │──► handlers / retry / DLQ
//!                                      └──────────────────┘
//! ```
//!
//! # Delivery semantics
//!
//! - **At-least-once**: offsets are committed after processing, so a crash in
//!   between redelivers rather than loses.
//! - **Ordered within partition**: records are keyed by aggregate id.
//! - **Atomic groups**: [`EventProducer::send_transaction`] makes every record
//!   visible or none of them.
//!
//! # Dyn Compatibility
//!
//! Both traits return boxed futures instead of using `async fn` so they can be
//! held as `Arc<dyn EventProducer>` / `Arc<dyn EventSubscriber>`.

use crate::wire::{self, WireMessage};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed, sendable future returned by transport operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors raised by broker transports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The client could not be created or could not reach any broker.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An operation was attempted before `connect` or after `disconnect`.
    #[error("Not connected to broker")]
    NotConnected,

    /// The broker did not answer a metadata request.
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// The broker answered but does not know the topic.
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Records could not be delivered to a topic.
    #[error("Send failed for topic '{topic}': {reason}")]
    SendFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// A multi-record send was refused before anything was sent because the
    /// producer cannot deliver it atomically.
    #[error("A batch of {records} records to '{topic}' needs a transactional producer")]
    BatchNeedsTransaction {
        /// The target topic
        topic: String,
        /// Records in the refused batch
        records: usize,
    },

    /// A transactional send was aborted; none of its records are visible.
    #[error("Transaction aborted: {0}")]
    TransactionFailed(String),

    /// Subscribing to topics failed.
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Offsets could not be committed.
    #[error("Offset commit failed: {0}")]
    CommitFailed(String),

    /// Pausing or resuming partitions failed.
    #[error("Flow control failed: {0}")]
    FlowControl(String),

    /// Any other network or client error.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Where a record landed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Topic written to
    pub topic: String,
    /// Partition written to
    pub partition: i32,
    /// Offset assigned by the broker
    pub offset: i64,
}

/// A topic-partition pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
}

/// An offset to commit: the position of the *next* record to consume.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TopicPartitionOffset {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
    /// Next offset to consume
    pub offset: i64,
}

/// A record received from the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Partition key, if any
    pub key: Option<String>,
    /// Record body, if any
    pub payload: Option<Vec<u8>>,
    /// String headers
    pub headers: Vec<(String, String)>,
}

impl InboundMessage {
    /// Look up a header value by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        wire::find_header(&self.headers, name)
    }

    /// Retries already spent on this record, from its `retryCount` header.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        wire::retry_count(&self.headers)
    }

    /// The partition this record came from.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition {
            topic: self.topic.clone(),
            partition: self.partition,
        }
    }

    /// The offset to commit once this record is processed.
    #[must_use]
    pub fn next_offset(&self) -> TopicPartitionOffset {
        TopicPartitionOffset {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset + 1,
        }
    }

    /// Build an inbound record from an outbound one (in-memory delivery).
    #[must_use]
    pub fn from_wire(topic: &str, partition: i32, offset: i64, message: WireMessage) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            offset,
            key: Some(message.key),
            payload: Some(message.value),
            headers: message.headers,
        }
    }
}

/// Stream of inbound records from a subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<InboundMessage, BrokerError>> + Send>>;

/// Producer side of a broker connection.
///
/// One producer connection is owned per publisher.
pub trait EventProducer: Send + Sync {
    /// Open the producer connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if no broker can be reached.
    fn connect(&self) -> BoxFuture<'_, Result<(), BrokerError>>;

    /// Flush pending records and release the connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the flush fails.
    fn disconnect(&self) -> BoxFuture<'_, Result<(), BrokerError>>;

    /// Send records to one topic, waiting for every acknowledgement.
    ///
    /// All or nothing: a failed send leaves none of the records visible. A
    /// transport that cannot guarantee this for several records refuses the
    /// batch up front.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::SendFailed`] when delivery fails
    /// - [`BrokerError::BatchNeedsTransaction`] for a multi-record batch on a
    ///   non-transactional producer
    fn send<'a>(
        &'a self,
        topic: &'a str,
        messages: Vec<WireMessage>,
    ) -> BoxFuture<'a, Result<Vec<DeliveryReceipt>, BrokerError>>;

    /// Send records to their own topics inside one broker transaction.
    ///
    /// Either every record becomes visible to `read_committed` consumers or
    /// none does.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TransactionFailed`] after aborting.
    fn send_transaction(
        &self,
        records: Vec<(String, WireMessage)>,
    ) -> BoxFuture<'_, Result<Vec<DeliveryReceipt>, BrokerError>>;

    /// Fetch metadata for a topic as a liveness check.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Unreachable`] when the broker does not answer and
    /// [`BrokerError::TopicNotFound`] when it answers without the topic.
    fn probe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<(), BrokerError>>;
}

/// Consumer side of a broker connection, bound to one consumer group.
pub trait EventSubscriber: Send + Sync {
    /// Open the consumer connection and join the group.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if no broker can be reached.
    fn connect(&self) -> BoxFuture<'_, Result<(), BrokerError>>;

    /// Subscribe to topics and stream their records.
    ///
    /// `from_beginning` decides where a group without committed offsets
    /// starts: the earliest retained record, or the tail.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if the subscription is
    /// rejected.
    fn subscribe(
        &self,
        topics: &[String],
        from_beginning: bool,
    ) -> BoxFuture<'_, Result<MessageStream, BrokerError>>;

    /// Commit offsets for the group.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CommitFailed`] if the broker rejects the commit.
    fn commit(&self, offsets: &[TopicPartitionOffset]) -> BoxFuture<'_, Result<(), BrokerError>>;

    /// Stop fetching from every assigned partition of `topics`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::FlowControl`] if the client refuses.
    fn pause(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Restart fetching from every assigned partition of `topics`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::FlowControl`] if the client refuses.
    fn resume(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Stop fetching from individual partitions.
    ///
    /// Used by the runtime to hold back a partition whose worker has fallen
    /// behind. Independent of [`pause`](Self::pause): a partition fetches
    /// only while neither its topic is paused nor the partition is held.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::FlowControl`] if the client refuses.
    fn pause_partitions(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    /// Release partitions held by [`pause_partitions`](Self::pause_partitions).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::FlowControl`] if the client refuses.
    fn resume_partitions(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    /// Leave the group and release the connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error if leaving fails.
    fn disconnect(&self) -> BoxFuture<'_, Result<(), BrokerError>>;

    /// The consumer group this subscriber belongs to.
    fn group_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_message_offsets_and_headers() {
        let message = InboundMessage::from_wire(
            "order-events",
            2,
            41,
            WireMessage {
                key: "order-42".to_string(),
                value: b"{}".to_vec(),
                headers: vec![(wire::HEADER_RETRY_COUNT.to_string(), "2".to_string())],
            },
        );

        assert_eq!(message.retry_count(), 2);
        assert_eq!(message.key.as_deref(), Some("order-42"));
        assert_eq!(
            message.next_offset(),
            TopicPartitionOffset {
                topic: "order-events".to_string(),
                partition: 2,
                offset: 42,
            }
        );
        assert_eq!(message.topic_partition().partition, 2);
    }

    #[test]
    fn broker_error_messages() {
        let err = BrokerError::SendFailed {
            topic: "order-events".to_string(),
            reason: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "Send failed for topic 'order-events': timeout");
    }

    fn assert_dyn_compatible(_: Option<&dyn EventProducer>, _: Option<&dyn EventSubscriber>) {}

    #[test]
    fn traits_are_dyn_compatible() {
        assert_dyn_compatible(None, None);
    }
}
