//! rdkafka-backed [`EventSubscriber`].

use crate::{blocking, inbound_message};
use commerce_events_core::config::BackboneConfig;
use commerce_events_core::event_bus::{
    BoxFuture, BrokerError, EventSubscriber, MessageStream, TopicPartition, TopicPartitionOffset,
};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Consumer connection settings.
///
/// # Default Values
///
/// - `brokers`: `localhost:9092`
/// - `client_id`: `commerce-events`
/// - `group_id`: `commerce-events-group`
/// - `session_timeout`: 30 seconds
/// - `heartbeat_interval`: 3 seconds
/// - `buffer_size`: 1000 records between the client and the runtime
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Comma-separated bootstrap servers
    pub brokers: String,
    /// Client id reported to the broker
    pub client_id: String,
    /// Consumer group id
    pub group_id: String,
    /// `session.timeout.ms`
    pub session_timeout: Duration,
    /// `heartbeat.interval.ms`
    pub heartbeat_interval: Duration,
    /// Records buffered between the forwarding task and the subscriber stream
    /// (zero is treated as one)
    pub buffer_size: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "commerce-events".to_string(),
            group_id: "commerce-events-group".to_string(),
            session_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(3),
            buffer_size: 1000,
        }
    }
}

impl ConsumerSettings {
    /// The librdkafka configuration these settings produce.
    ///
    /// Offsets are never auto-committed and only committed transactional
    /// records are read.
    #[must_use]
    pub fn client_config(&self, from_beginning: bool) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", &self.client_id)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("isolation.level", "read_committed")
            .set(
                "auto.offset.reset",
                if from_beginning { "earliest" } else { "latest" },
            )
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
            .set(
                "heartbeat.interval.ms",
                self.heartbeat_interval.as_millis().to_string(),
            )
            .set("enable.partition.eof", "false");
        config
    }
}

struct Forwarder {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Why partitions are not fetching.
///
/// Topic pauses come from callers, held partitions from the runtime's
/// backpressure; a partition fetches only when neither applies.
#[derive(Debug, Default)]
struct FlowState {
    paused_topics: HashSet<String>,
    held: HashSet<TopicPartition>,
}

/// Kafka/Redpanda consumer transport for one consumer group.
///
/// A forwarding task owns the rdkafka stream and hands each record to the
/// runtime as an [`InboundMessage`](commerce_events_core::event_bus::InboundMessage).
/// Nothing is committed here; the runtime commits after processing.
///
/// # Example
///
/// ```no_run
/// use commerce_events_core::event_bus::EventSubscriber;
/// use commerce_events_redpanda::RedpandaConsumer;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let consumer = RedpandaConsumer::builder()
///     .brokers("localhost:9092")
///     .group_id("inventory-service")
///     .build();
/// consumer.connect().await?;
/// let stream = consumer.subscribe(&["order-events".to_string()], true).await?;
/// # drop(stream);
/// # Ok(())
/// # }
/// ```
pub struct RedpandaConsumer {
    settings: ConsumerSettings,
    client: RwLock<Option<Arc<StreamConsumer>>>,
    forwarder: Mutex<Option<Forwarder>>,
    flow: Mutex<FlowState>,
}

impl RedpandaConsumer {
    /// Consumer with the given settings (not yet connected).
    #[must_use]
    pub fn new(settings: ConsumerSettings) -> Self {
        Self {
            settings,
            client: RwLock::new(None),
            forwarder: Mutex::new(None),
            flow: Mutex::new(FlowState::default()),
        }
    }

    /// Start configuring a consumer.
    #[must_use]
    pub fn builder() -> RedpandaConsumerBuilder {
        RedpandaConsumerBuilder::default()
    }

    /// Consumer configured from the backbone settings.
    #[must_use]
    pub fn from_config(config: &BackboneConfig) -> Self {
        Self::builder()
            .brokers(&config.brokers)
            .client_id(&config.client_id)
            .group_id(&config.group_id)
            .build()
    }

    /// Connection settings.
    #[must_use]
    pub const fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    fn handle(&self) -> Result<Arc<StreamConsumer>, BrokerError> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    fn create_client(&self, from_beginning: bool) -> Result<Arc<StreamConsumer>, BrokerError> {
        self.settings
            .client_config(from_beginning)
            .create::<StreamConsumer>()
            .map(Arc::new)
            .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to create consumer: {e}")))
    }

    /// Stop the forwarding task, if any, and wait for it.
    async fn stop_forwarder(&self) {
        let taken = self.forwarder.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(Forwarder { shutdown, task }) = taken {
            // A closed receiver means the task already exited
            let _ = shutdown.send(true);
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Consumer forwarding task failed");
            }
        }
    }

    /// Slots in the forwarding channel; `mpsc` needs at least one.
    fn channel_capacity(&self) -> usize {
        self.settings.buffer_size.max(1)
    }

    fn clear_flow(&self) {
        let mut flow = self.flow.lock().unwrap_or_else(PoisonError::into_inner);
        flow.paused_topics.clear();
        flow.held.clear();
    }

    /// Partitions of `topics` currently assigned to this member.
    fn assigned(
        client: &StreamConsumer,
        topics: &[String],
    ) -> Result<TopicPartitionList, BrokerError> {
        let assignment = client
            .assignment()
            .map_err(|e| BrokerError::FlowControl(format!("Failed to read assignment: {e}")))?;
        let mut selected = TopicPartitionList::new();
        for element in assignment.elements() {
            if topics.iter().any(|topic| topic == element.topic()) {
                selected.add_partition(element.topic(), element.partition());
            }
        }
        Ok(selected)
    }

    fn partition_list(partitions: &[TopicPartition]) -> TopicPartitionList {
        let mut list = TopicPartitionList::new();
        for partition in partitions {
            list.add_partition(&partition.topic, partition.partition);
        }
        list
    }
}

impl std::fmt::Debug for RedpandaConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaConsumer")
            .field("settings", &self.settings)
            .field(
                "connected",
                &self.client.read().unwrap_or_else(PoisonError::into_inner).is_some(),
            )
            .finish_non_exhaustive()
    }
}

impl EventSubscriber for RedpandaConsumer {
    fn connect(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            let client = self.create_client(false)?;

            let probe = Arc::clone(&client);
            let timeout = Timeout::After(self.settings.session_timeout);
            blocking(move || probe.fetch_metadata(None, timeout).map(|_| ()))
                .await
                .map_err(|e| BrokerError::ConnectionFailed(format!("No broker answered: {e}")))?;

            *self.client.write().unwrap_or_else(PoisonError::into_inner) = Some(client);
            tracing::info!(
                brokers = %self.settings.brokers,
                group_id = %self.settings.group_id,
                "Redpanda consumer connected"
            );
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[String],
        from_beginning: bool,
    ) -> BoxFuture<'_, Result<MessageStream, BrokerError>> {
        let topics = topics.to_vec();
        Box::pin(async move {
            self.handle()?;
            let subscription_error = |reason: String| BrokerError::SubscriptionFailed {
                topics: topics.clone(),
                reason,
            };

            // The start position of a new group is fixed at client creation
            self.stop_forwarder().await;
            let client = self.create_client(from_beginning)?;
            let names: Vec<&str> = topics.iter().map(String::as_str).collect();
            client
                .subscribe(&names)
                .map_err(|e| subscription_error(e.to_string()))?;
            *self.client.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&client));
            self.clear_flow();

            let (tx, mut rx) = mpsc::channel(self.channel_capacity());
            let (shutdown, mut shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(async move {
                let mut stream = client.stream();
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => break,
                        next = stream.next() => next,
                    };
                    let Some(result) = next else {
                        break;
                    };
                    let item = result
                        .map(|message| inbound_message(&message))
                        .map_err(|e| BrokerError::Transport(format!("Failed to receive message: {e}")));
                    if tx.send(item).await.is_err() {
                        tracing::debug!("Subscription stream dropped, exiting forwarding task");
                        break;
                    }
                }
                tracing::debug!("Consumer forwarding task exiting");
            });
            *self.forwarder.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(Forwarder { shutdown, task });

            tracing::info!(
                topics = ?topics,
                group_id = %self.settings.group_id,
                from_beginning,
                buffer_size = self.settings.buffer_size,
                "Subscribed to topics"
            );

            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(stream) as MessageStream)
        })
    }

    fn commit(&self, offsets: &[TopicPartitionOffset]) -> BoxFuture<'_, Result<(), BrokerError>> {
        let offsets = offsets.to_vec();
        Box::pin(async move {
            let client = self.handle()?;
            let mut list = TopicPartitionList::new();
            for offset in &offsets {
                list.add_partition_offset(&offset.topic, offset.partition, Offset::Offset(offset.offset))
                    .map_err(|e| BrokerError::CommitFailed(e.to_string()))?;
            }
            blocking(move || client.commit(&list, CommitMode::Sync))
                .await
                .map_err(BrokerError::CommitFailed)?;
            tracing::trace!(count = offsets.len(), "Offsets committed");
            Ok(())
        })
    }

    fn pause(&self, topics: &[String]) -> Result<(), BrokerError> {
        let client = self.handle()?;
        let partitions = Self::assigned(&client, topics)?;
        client
            .pause(&partitions)
            .map_err(|e| BrokerError::FlowControl(format!("Failed to pause: {e}")))?;
        self.flow
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .paused_topics
            .extend(topics.iter().cloned());
        Ok(())
    }

    fn resume(&self, topics: &[String]) -> Result<(), BrokerError> {
        let client = self.handle()?;
        let mut flow = self.flow.lock().unwrap_or_else(PoisonError::into_inner);
        for topic in topics {
            flow.paused_topics.remove(topic);
        }
        let assigned = Self::assigned(&client, topics)?;
        let mut partitions = TopicPartitionList::new();
        for element in assigned.elements() {
            let partition = TopicPartition {
                topic: element.topic().to_string(),
                partition: element.partition(),
            };
            if !flow.held.contains(&partition) {
                partitions.add_partition(element.topic(), element.partition());
            }
        }
        client
            .resume(&partitions)
            .map_err(|e| BrokerError::FlowControl(format!("Failed to resume: {e}")))
    }

    fn pause_partitions(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        let client = self.handle()?;
        client
            .pause(&Self::partition_list(partitions))
            .map_err(|e| BrokerError::FlowControl(format!("Failed to hold partitions: {e}")))?;
        self.flow
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .held
            .extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume_partitions(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        let client = self.handle()?;
        let mut flow = self.flow.lock().unwrap_or_else(PoisonError::into_inner);
        for partition in partitions {
            flow.held.remove(partition);
        }
        let releasable: Vec<TopicPartition> = partitions
            .iter()
            .filter(|partition| !flow.paused_topics.contains(&partition.topic))
            .cloned()
            .collect();
        if releasable.is_empty() {
            return Ok(());
        }
        client
            .resume(&Self::partition_list(&releasable))
            .map_err(|e| BrokerError::FlowControl(format!("Failed to release partitions: {e}")))
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            self.stop_forwarder().await;
            self.clear_flow();
            let taken = self.client.write().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(client) = taken {
                client.unsubscribe();
                tracing::info!(group_id = %self.settings.group_id, "Redpanda consumer disconnected");
            }
            Ok(())
        })
    }

    fn group_id(&self) -> &str {
        &self.settings.group_id
    }
}

/// Builder for [`RedpandaConsumer`].
#[derive(Debug, Default)]
pub struct RedpandaConsumerBuilder {
    settings: ConsumerSettings,
}

impl RedpandaConsumerBuilder {
    /// Set the bootstrap servers (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.settings.brokers = brokers.into();
        self
    }

    /// Set the client id.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.settings.client_id = client_id.into();
        self
    }

    /// Set the consumer group id.
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.settings.group_id = group_id.into();
        self
    }

    /// Set `session.timeout.ms`.
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.settings.session_timeout = timeout;
        self
    }

    /// Set `heartbeat.interval.ms`.
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.settings.heartbeat_interval = interval;
        self
    }

    /// Set how many records may wait between the client and the runtime.
    ///
    /// A zero size is raised to 1.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.settings.buffer_size = buffer_size.max(1);
        self
    }

    /// Build the consumer (not yet connected).
    #[must_use]
    pub fn build(self) -> RedpandaConsumer {
        RedpandaConsumer::new(self.settings)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Test assertions
mod tests {
    use super::*;

    #[test]
    fn consumer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RedpandaConsumer>();
    }

    #[test]
    fn client_config_disables_auto_commit_and_reads_committed() {
        let settings = RedpandaConsumer::builder()
            .brokers("redpanda:9092")
            .group_id("inventory-service")
            .session_timeout(Duration::from_secs(10))
            .heartbeat_interval(Duration::from_secs(1))
            .build()
            .settings()
            .clone();

        let config = settings.client_config(true);
        assert_eq!(config.get("group.id"), Some("inventory-service"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("isolation.level"), Some("read_committed"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("session.timeout.ms"), Some("10000"));
        assert_eq!(config.get("heartbeat.interval.ms"), Some("1000"));

        assert_eq!(settings.client_config(false).get("auto.offset.reset"), Some("latest"));
    }

    #[test]
    fn from_config_takes_group_from_backbone() {
        let backbone = BackboneConfig {
            group_id: "notifications-group".to_string(),
            ..BackboneConfig::default()
        };
        let consumer = RedpandaConsumer::from_config(&backbone);
        assert_eq!(consumer.group_id(), "notifications-group");
        assert_eq!(consumer.settings().brokers, "localhost:9092");
    }

    #[test]
    fn zero_buffer_is_raised() {
        let consumer = RedpandaConsumer::builder().buffer_size(0).build();
        assert_eq!(consumer.settings().buffer_size, 1);
    }

    #[test]
    fn zero_buffer_from_settings_literal_still_gets_a_channel_slot() {
        let consumer = RedpandaConsumer::new(ConsumerSettings {
            buffer_size: 0,
            ..ConsumerSettings::default()
        });
        assert_eq!(consumer.channel_capacity(), 1);

        let roomy = RedpandaConsumer::builder().buffer_size(250).build();
        assert_eq!(roomy.channel_capacity(), 250);
    }

    #[tokio::test]
    async fn operations_before_connect_are_rejected() {
        let consumer = RedpandaConsumer::builder().build();
        let topics = vec!["order-events".to_string()];

        assert!(matches!(
            consumer.subscribe(&topics, false).await,
            Err(BrokerError::NotConnected)
        ));
        assert_eq!(consumer.pause(&topics), Err(BrokerError::NotConnected));
        let partition = TopicPartition {
            topic: "order-events".to_string(),
            partition: 0,
        };
        assert_eq!(
            consumer.pause_partitions(std::slice::from_ref(&partition)),
            Err(BrokerError::NotConnected)
        );
        assert_eq!(
            consumer.resume_partitions(&[partition]),
            Err(BrokerError::NotConnected)
        );
        assert_eq!(
            consumer
                .commit(&[TopicPartitionOffset {
                    topic: "order-events".to_string(),
                    partition: 0,
                    offset: 1,
                }])
                .await,
            Err(BrokerError::NotConnected)
        );
        assert_eq!(consumer.disconnect().await, Ok(()));
    }
}
