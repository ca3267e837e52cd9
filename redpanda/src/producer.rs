//! rdkafka-backed [`EventProducer`].

use crate::{blocking, kafka_headers};
use commerce_events_core::config::BackboneConfig;
use commerce_events_core::event_bus::{BoxFuture, BrokerError, DeliveryReceipt, EventProducer};
use commerce_events_core::wire::WireMessage;
use futures::future::join_all;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Producer connection settings.
///
/// # Default Values
///
/// - `brokers`: `localhost:9092`
/// - `client_id`: `commerce-events`
/// - `max_in_flight`: 1 (strict ordering per partition)
/// - `retries`: 5
/// - `retry_backoff`: 100 ms
/// - `request_timeout`: 30 seconds
/// - `transactional_id`: none
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProducerSettings {
    /// Comma-separated bootstrap servers
    pub brokers: String,
    /// Client id reported to the broker
    pub client_id: String,
    /// `max.in.flight.requests.per.connection`
    pub max_in_flight: u32,
    /// Bounded send retries inside the client
    pub retries: u32,
    /// Wait between client-side send retries
    pub retry_backoff: Duration,
    /// Per-request timeout, also used for delivery and transaction calls
    pub request_timeout: Duration,
    /// Enables transactional sends when set
    pub transactional_id: Option<String>,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "commerce-events".to_string(),
            max_in_flight: 1,
            retries: 5,
            retry_backoff: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
            transactional_id: None,
        }
    }
}

impl ProducerSettings {
    /// The librdkafka configuration these settings produce.
    ///
    /// Idempotence and `acks=all` are always on.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", &self.client_id)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set(
                "max.in.flight.requests.per.connection",
                self.max_in_flight.to_string(),
            )
            .set("retries", self.retries.to_string())
            .set("retry.backoff.ms", self.retry_backoff.as_millis().to_string())
            .set("request.timeout.ms", self.request_timeout.as_millis().to_string())
            .set("message.timeout.ms", self.request_timeout.as_millis().to_string());
        if let Some(transactional_id) = &self.transactional_id {
            config.set("transactional.id", transactional_id);
        }
        config
    }
}

/// Kafka/Redpanda producer transport.
///
/// Records are keyed by aggregate id, so one aggregate always lands on one
/// partition. With a `transactional_id`, every send runs in a broker
/// transaction, including single-topic batches. Without one, only
/// single-record sends are accepted: librdkafka enqueues records one at a
/// time, so a multi-record send could fail halfway with earlier records
/// already durable.
///
/// # Example
///
/// ```no_run
/// use commerce_events_core::event_bus::EventProducer;
/// use commerce_events_redpanda::RedpandaProducer;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let producer = RedpandaProducer::builder()
///     .brokers("localhost:9092")
///     .client_id("order-service")
///     .request_timeout(Duration::from_secs(10))
///     .build();
/// producer.connect().await?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaProducer {
    settings: ProducerSettings,
    producer: RwLock<Option<FutureProducer>>,
    /// Serializes transactions on the shared client
    transactions: tokio::sync::Mutex<()>,
}

impl RedpandaProducer {
    /// Producer with the given settings (not yet connected).
    #[must_use]
    pub fn new(settings: ProducerSettings) -> Self {
        Self {
            settings,
            producer: RwLock::new(None),
            transactions: tokio::sync::Mutex::new(()),
        }
    }

    /// Start configuring a producer.
    #[must_use]
    pub fn builder() -> RedpandaProducerBuilder {
        RedpandaProducerBuilder::default()
    }

    /// Producer configured from the backbone settings.
    #[must_use]
    pub fn from_config(config: &BackboneConfig) -> Self {
        Self::builder()
            .brokers(&config.brokers)
            .client_id(&config.client_id)
            .transactional_id(config.transactional_id.clone())
            .build()
    }

    /// Connection settings.
    #[must_use]
    pub const fn settings(&self) -> &ProducerSettings {
        &self.settings
    }

    fn timeout(&self) -> Timeout {
        Timeout::After(self.settings.request_timeout)
    }

    fn handle(&self) -> Result<FutureProducer, BrokerError> {
        self.producer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    /// Enqueue every record in order, then wait for all acknowledgements.
    async fn deliver(
        producer: &FutureProducer,
        records: Vec<(String, WireMessage)>,
    ) -> Result<Vec<DeliveryReceipt>, BrokerError> {
        let mut pending: Vec<(String, DeliveryFuture)> = Vec::with_capacity(records.len());
        for (topic, message) in &records {
            let record = FutureRecord::to(topic)
                .key(message.key.as_str())
                .payload(message.value.as_slice())
                .headers(kafka_headers(&message.headers));
            let delivery = producer.send_result(record).map_err(|(e, _)| BrokerError::SendFailed {
                topic: topic.clone(),
                reason: e.to_string(),
            })?;
            pending.push((topic.clone(), delivery));
        }

        let (topics, deliveries): (Vec<String>, Vec<DeliveryFuture>) = pending.into_iter().unzip();
        let results = join_all(deliveries).await;

        topics
            .into_iter()
            .zip(results)
            .map(|(topic, result)| match result {
                Ok(Ok((partition, offset))) => Ok(DeliveryReceipt {
                    topic,
                    partition,
                    offset,
                }),
                Ok(Err((e, _))) => Err(BrokerError::SendFailed {
                    topic,
                    reason: e.to_string(),
                }),
                Err(_canceled) => Err(BrokerError::SendFailed {
                    topic,
                    reason: "delivery canceled (producer closed)".to_string(),
                }),
            })
            .collect()
    }

    async fn transact(
        &self,
        producer: FutureProducer,
        records: Vec<(String, WireMessage)>,
    ) -> Result<Vec<DeliveryReceipt>, BrokerError> {
        if self.settings.transactional_id.is_none() {
            return Err(BrokerError::TransactionFailed(
                "producer has no transactional id".to_string(),
            ));
        }
        let _serialized = self.transactions.lock().await;
        let timeout = self.timeout();

        let client = producer.clone();
        blocking(move || client.begin_transaction())
            .await
            .map_err(|e| BrokerError::TransactionFailed(format!("begin: {e}")))?;

        let outcome = match Self::deliver(&producer, records).await {
            Ok(receipts) => {
                let client = producer.clone();
                blocking(move || client.commit_transaction(timeout))
                    .await
                    .map(|()| receipts)
                    .map_err(|e| format!("commit: {e}"))
            },
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(receipts) => {
                tracing::debug!(records = receipts.len(), "Transaction committed");
                Ok(receipts)
            },
            Err(reason) => {
                let client = producer.clone();
                if let Err(abort_error) = blocking(move || client.abort_transaction(timeout)).await {
                    tracing::error!(error = %abort_error, "Failed to abort transaction");
                }
                tracing::warn!(reason = %reason, "Transaction aborted");
                Err(BrokerError::TransactionFailed(reason))
            },
        }
    }
}

impl std::fmt::Debug for RedpandaProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaProducer")
            .field("settings", &self.settings)
            .field(
                "connected",
                &self.producer.read().unwrap_or_else(PoisonError::into_inner).is_some(),
            )
            .finish_non_exhaustive()
    }
}

impl EventProducer for RedpandaProducer {
    fn connect(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            let producer: FutureProducer = self.settings.client_config().create().map_err(
                |e: KafkaError| BrokerError::ConnectionFailed(format!("Failed to create producer: {e}")),
            )?;

            let client = producer.clone();
            let timeout = self.timeout();
            blocking(move || client.client().fetch_metadata(None, timeout).map(|_| ()))
                .await
                .map_err(|e| BrokerError::ConnectionFailed(format!("No broker answered: {e}")))?;

            if self.settings.transactional_id.is_some() {
                let client = producer.clone();
                blocking(move || client.init_transactions(timeout))
                    .await
                    .map_err(|e| BrokerError::ConnectionFailed(format!("init_transactions: {e}")))?;
            }

            *self.producer.write().unwrap_or_else(PoisonError::into_inner) = Some(producer);
            tracing::info!(
                brokers = %self.settings.brokers,
                client_id = %self.settings.client_id,
                max_in_flight = self.settings.max_in_flight,
                transactional = self.settings.transactional_id.is_some(),
                "Redpanda producer connected"
            );
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            let taken = self.producer.write().unwrap_or_else(PoisonError::into_inner).take();
            let Some(producer) = taken else {
                return Ok(());
            };
            let timeout = self.timeout();
            blocking(move || producer.flush(timeout))
                .await
                .map_err(|e| BrokerError::Transport(format!("Flush on disconnect failed: {e}")))?;
            tracing::info!(brokers = %self.settings.brokers, "Redpanda producer disconnected");
            Ok(())
        })
    }

    fn send<'a>(
        &'a self,
        topic: &'a str,
        messages: Vec<WireMessage>,
    ) -> BoxFuture<'a, Result<Vec<DeliveryReceipt>, BrokerError>> {
        Box::pin(async move {
            if self.settings.transactional_id.is_none() && messages.len() > 1 {
                return Err(BrokerError::BatchNeedsTransaction {
                    topic: topic.to_string(),
                    records: messages.len(),
                });
            }
            let producer = self.handle()?;
            let records = messages
                .into_iter()
                .map(|message| (topic.to_string(), message))
                .collect();

            // A transactional client rejects sends outside a transaction
            if self.settings.transactional_id.is_some() {
                return self.transact(producer, records).await.map_err(|e| {
                    BrokerError::SendFailed {
                        topic: topic.to_string(),
                        reason: e.to_string(),
                    }
                });
            }
            Self::deliver(&producer, records).await
        })
    }

    fn send_transaction(
        &self,
        records: Vec<(String, WireMessage)>,
    ) -> BoxFuture<'_, Result<Vec<DeliveryReceipt>, BrokerError>> {
        Box::pin(async move {
            let producer = self.handle()?;
            self.transact(producer, records).await
        })
    }

    fn probe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let producer = self.handle()?;
            let timeout = self.timeout();
            let name = topic.to_string();
            let lookup = blocking(move || {
                let metadata = producer.client().fetch_metadata(Some(name.as_str()), timeout)?;
                Ok(metadata
                    .topics()
                    .iter()
                    .any(|t| t.name() == name && t.error().is_none() && !t.partitions().is_empty()))
            })
            .await;

            match lookup {
                Ok(true) => Ok(()),
                Ok(false) => Err(BrokerError::TopicNotFound(topic.to_string())),
                Err(e) => Err(BrokerError::Unreachable(e)),
            }
        })
    }
}

/// Builder for [`RedpandaProducer`].
#[derive(Debug, Default)]
pub struct RedpandaProducerBuilder {
    settings: ProducerSettings,
}

impl RedpandaProducerBuilder {
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

    /// Set `max.in.flight.requests.per.connection`.
    ///
    /// Values above 1 raise throughput; idempotence still keeps per-partition
    /// order for up to 5.
    #[must_use]
    pub const fn max_in_flight(mut self, max_in_flight: u32) -> Self {
        self.settings.max_in_flight = max_in_flight;
        self
    }

    /// Set the client-side send retry bound.
    #[must_use]
    pub const fn retries(mut self, retries: u32) -> Self {
        self.settings.retries = retries;
        self
    }

    /// Set the wait between client-side send retries.
    #[must_use]
    pub const fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.settings.retry_backoff = backoff;
        self
    }

    /// Set the request, delivery, and transaction timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.settings.request_timeout = timeout;
        self
    }

    /// Enable transactions under this id (`None` disables them).
    #[must_use]
    pub fn transactional_id(mut self, transactional_id: Option<String>) -> Self {
        self.settings.transactional_id = transactional_id;
        self
    }

    /// Build the producer (not yet connected).
    #[must_use]
    pub fn build(self) -> RedpandaProducer {
        RedpandaProducer::new(self.settings)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Test assertions
mod tests {
    use super::*;

    #[test]
    fn producer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RedpandaProducer>();
    }

    #[test]
    fn client_config_enforces_idempotent_delivery() {
        let config = RedpandaProducer::builder()
            .brokers("kafka-1:9092,kafka-2:9092")
            .client_id("order-service")
            .request_timeout(Duration::from_secs(10))
            .build()
            .settings()
            .client_config();

        assert_eq!(config.get("bootstrap.servers"), Some("kafka-1:9092,kafka-2:9092"));
        assert_eq!(config.get("client.id"), Some("order-service"));
        assert_eq!(config.get("enable.idempotence"), Some("true"));
        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("max.in.flight.requests.per.connection"), Some("1"));
        assert_eq!(config.get("request.timeout.ms"), Some("10000"));
        assert_eq!(config.get("transactional.id"), None);
    }

    #[test]
    fn transactional_id_is_passed_through() {
        let config = RedpandaProducer::builder()
            .transactional_id(Some("checkout-tx-1".to_string()))
            .max_in_flight(5)
            .retries(10)
            .retry_backoff(Duration::from_millis(250))
            .build()
            .settings()
            .client_config();

        assert_eq!(config.get("transactional.id"), Some("checkout-tx-1"));
        assert_eq!(config.get("max.in.flight.requests.per.connection"), Some("5"));
        assert_eq!(config.get("retries"), Some("10"));
        assert_eq!(config.get("retry.backoff.ms"), Some("250"));
    }

    #[test]
    fn from_config_uses_backbone_settings() {
        let backbone = BackboneConfig {
            brokers: "redpanda:9092".to_string(),
            client_id: "inventory".to_string(),
            transactional_id: Some("inventory-tx".to_string()),
            ..BackboneConfig::default()
        };
        let producer = RedpandaProducer::from_config(&backbone);
        assert_eq!(producer.settings().brokers, "redpanda:9092");
        assert_eq!(producer.settings().client_id, "inventory");
        assert_eq!(producer.settings().transactional_id.as_deref(), Some("inventory-tx"));
    }

    #[tokio::test]
    async fn operations_before_connect_are_rejected() {
        let producer = RedpandaProducer::builder().build();
        let message = WireMessage {
            key: "order-1".to_string(),
            value: b"{}".to_vec(),
            headers: vec![],
        };

        assert_eq!(
            producer.send("order-events", vec![message.clone()]).await,
            Err(BrokerError::NotConnected)
        );
        assert_eq!(
            producer
                .send_transaction(vec![("order-events".to_string(), message)])
                .await,
            Err(BrokerError::NotConnected)
        );
        assert_eq!(producer.probe("system-events").await, Err(BrokerError::NotConnected));
        assert_eq!(producer.disconnect().await, Ok(()));
    }

    fn records(count: usize) -> Vec<WireMessage> {
        (0..count)
            .map(|i| WireMessage {
                key: format!("order-{i}"),
                value: b"{}".to_vec(),
                headers: vec![],
            })
            .collect()
    }

    #[tokio::test]
    async fn multi_record_batch_needs_transactional_producer() {
        let producer = RedpandaProducer::builder().build();

        // Refused before any record could be enqueued
        assert_eq!(
            producer.send("order-events", records(3)).await,
            Err(BrokerError::BatchNeedsTransaction {
                topic: "order-events".to_string(),
                records: 3,
            })
        );
        // A single record is atomic on its own
        assert_eq!(
            producer.send("order-events", records(1)).await,
            Err(BrokerError::NotConnected)
        );

        let transactional = RedpandaProducer::builder()
            .transactional_id(Some("order-tx".to_string()))
            .build();
        assert_eq!(
            transactional.send("order-events", records(3)).await,
            Err(BrokerError::NotConnected)
        );
    }
}
