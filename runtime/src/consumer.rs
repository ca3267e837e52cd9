//! Event consumer: subscribes, dispatches, retries, and dead-letters.
//!
//! # Processing model
//!
//! ```text
//! subscription stream ──► dispatcher ──► worker(order-events/0) ──► handler
//!                                   ├──► worker(order-events/1) ──► handler
//!                                   └──► worker(cart-events/2)  ──► handler
//! ```
//!
//! - One worker task per topic-partition: sequential within a partition,
//!   concurrent across partitions. The dispatcher never waits on a worker;
//!   a partition whose worker falls behind (for example while a retry
//!   backs off) is held at the broker until its queue drains.
//! - Malformed messages (invalid JSON, missing `eventType`/`aggregateId`) are
//!   logged and dropped; retrying them can never succeed.
//! - Events without a registered handler are logged and skipped.
//! - A failing handler is retried in place on its worker after a backoff
//!   delay, carrying an incremented `retryCount` header. Once the policy's
//!   retries are spent the event goes to the dead-letter queue.
//! - Offsets are committed after processing (auto-commit) or left for the
//!   caller (`commit_offsets`), so a crash redelivers instead of losing.
//!
//! # Example
//!
//! ```
//! use commerce_events_core::EventType;
//! use commerce_events_runtime::EventConsumer;
//! use commerce_events_testing::InMemoryBroker;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! let consumer = EventConsumer::builder(Arc::new(broker.subscriber("notifications"))).build();
//!
//! consumer.on(EventType::OrderCreated, |event: commerce_events_core::EventEnvelope| async move {
//!     tracing::info!(order = %event.aggregate_id, "Sending confirmation");
//!     Ok::<(), anyhow::Error>(())
//! });
//!
//! consumer.connect(&["order-events".to_string()], true).await?;
//! // ...
//! consumer.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use crate::metrics::ConsumerMetrics;
use crate::publisher::EventPublisher;
use crate::retry::RetryPolicy;
use commerce_events_core::config::BackboneConfig;
use commerce_events_core::dead_letter::FailureReport;
use commerce_events_core::event::{EventEnvelope, EventType};
use commerce_events_core::event_bus::{
    BoxFuture, BrokerError, EventSubscriber, InboundMessage, MessageStream, TopicPartition,
    TopicPartitionOffset,
};
use commerce_events_core::wire;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Queued messages at which a partition stops fetching.
const HIGH_WATER: usize = 64;

/// Queued messages at which a held partition fetches again.
const LOW_WATER: usize = HIGH_WATER / 4;

/// Business reaction to one event type.
///
/// Handlers must be idempotent: at-least-once delivery plus retries can
/// invoke a handler several times for the same event.
///
/// Any async closure `Fn(EventEnvelope) -> impl Future<Output =
/// anyhow::Result<()>>` is a handler.
pub trait EventHandler: Send + Sync {
    /// Handle one event; an error triggers the retry path.
    fn handle(&self, event: EventEnvelope) -> BoxFuture<'_, anyhow::Result<()>>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, event: EventEnvelope) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(self(event))
    }
}

/// Lifecycle of a consumer instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    /// No broker connection
    Disconnected,
    /// Connected and subscribed, loop not yet started
    Connected,
    /// Processing messages
    Running,
    /// The subscription ended on its own; still connected until
    /// `disconnect`
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Errors returned by [`EventConsumer`].
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The broker could not be reached.
    #[error("Failed to connect consumer: {0}")]
    Connection(#[source] BrokerError),

    /// The subscription was rejected.
    #[error("Failed to subscribe: {0}")]
    Subscription(#[source] BrokerError),

    /// Offsets could not be committed.
    #[error("Failed to commit offsets: {0}")]
    Commit(#[source] BrokerError),

    /// Pause or resume was refused.
    #[error("Flow control failed: {0}")]
    FlowControl(#[source] BrokerError),

    /// The operation is not valid in the current state.
    #[error("Cannot {operation} while consumer is {state}")]
    InvalidState {
        /// The rejected operation
        operation: &'static str,
        /// The state it was attempted in
        state: ConsumerState,
    },
}

/// What happened to one inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    /// A handler succeeded after `attempts` invocations.
    Handled {
        /// Invocations including the successful one
        attempts: u32,
    },
    /// The message could not be parsed and was dropped.
    Malformed,
    /// No handler is registered for the event type.
    Unhandled,
    /// Retries were exhausted and the event was dead-lettered.
    DeadLettered {
        /// Invocations made before giving up
        attempts: u32,
    },
    /// Shutdown interrupted a retry wait; the message is not marked processed
    /// and will be redelivered.
    Abandoned {
        /// Invocations made before shutdown
        attempts: u32,
    },
}

impl MessageOutcome {
    /// Whether the message's offset may be committed.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        !matches!(self, Self::Abandoned { .. })
    }
}

/// Snapshot of a consumer's group membership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerGroupInfo {
    /// Consumer group id
    pub group_id: String,
    /// Subscribed topics
    pub topics: Vec<String>,
    /// Lifecycle state
    pub state: ConsumerState,
    /// Whether offsets are committed after each message
    pub auto_commit: bool,
    /// Event types with a handler
    pub handlers: Vec<EventType>,
}

type HandlerMap = HashMap<EventType, Arc<dyn EventHandler>>;

/// Queue depth of one partition worker and whether its partition is held.
#[derive(Default)]
struct Backlog {
    queued: AtomicUsize,
    held: Mutex<bool>,
}

struct Worker {
    sender: mpsc::UnboundedSender<InboundMessage>,
    backlog: Arc<Backlog>,
}

/// Shared between the consumer, its dispatcher, and its partition workers.
struct Processor {
    subscriber: Arc<dyn EventSubscriber>,
    state: RwLock<ConsumerState>,
    handlers: RwLock<HandlerMap>,
    policy: RetryPolicy,
    auto_commit: bool,
    dead_letters: Option<Arc<EventPublisher>>,
    processed: Mutex<HashMap<TopicPartition, i64>>,
}

impl Processor {
    fn handler(&self, event_type: EventType) -> Option<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_type)
            .cloned()
    }

    #[allow(clippy::too_many_lines)] // One linear pass: parse, dispatch, retry, dead-letter
    async fn process(
        &self,
        message: &InboundMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> MessageOutcome {
        let parsed = message.payload.as_deref().map(wire::decode);
        let envelope = match parsed {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => {
                ConsumerMetrics::record_malformed();
                tracing::error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Dropping malformed message"
                );
                return MessageOutcome::Malformed;
            },
            None => {
                ConsumerMetrics::record_malformed();
                tracing::error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Dropping message without payload"
                );
                return MessageOutcome::Malformed;
            },
        };

        let Some(handler) = envelope.kind().and_then(|kind| self.handler(kind)) else {
            ConsumerMetrics::record_unhandled(&envelope.event_type);
            tracing::warn!(
                event_type = %envelope.event_type,
                event_id = %envelope.event_id,
                topic = %message.topic,
                "No handler registered for event type, skipping"
            );
            return MessageOutcome::Unhandled;
        };

        // The retry counter travels with this attempt's copy of the record
        let mut attempt = message.clone();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let started = Instant::now();
            let result = AssertUnwindSafe(handler.handle(envelope.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("handler panicked")));
            let elapsed = started.elapsed();

            let error = match result {
                Ok(()) => {
                    ConsumerMetrics::record_handled(&envelope.event_type, elapsed);
                    tracing::debug!(
                        event_type = %envelope.event_type,
                        event_id = %envelope.event_id,
                        aggregate_id = %envelope.aggregate_id,
                        attempt = attempts,
                        duration_ms = elapsed.as_millis(),
                        "Event handled"
                    );
                    return MessageOutcome::Handled { attempts };
                },
                Err(error) => error,
            };
            ConsumerMetrics::record_duration(&envelope.event_type, elapsed);

            let retries = attempt.retry_count();
            if !self.policy.should_retry(retries) {
                tracing::error!(
                    event_type = %envelope.event_type,
                    event_id = %envelope.event_id,
                    aggregate_id = %envelope.aggregate_id,
                    attempt = attempts,
                    retry_count = retries,
                    error = %error,
                    "Handler retries exhausted"
                );
                let failure = FailureReport::new(error.to_string(), format!("{error:?}"));
                self.dead_letter(&envelope, &failure, retries).await;
                return MessageOutcome::DeadLettered { attempts };
            }

            let delay = self.policy.delay_for_attempt(retries);
            wire::set_retry_count(&mut attempt.headers, retries + 1);
            ConsumerMetrics::record_retry(&envelope.event_type);
            tracing::warn!(
                event_type = %envelope.event_type,
                event_id = %envelope.event_id,
                attempt = attempts,
                retry_count = retries + 1,
                delay_ms = delay.as_millis(),
                duration_ms = elapsed.as_millis(),
                error = %error,
                "Handler failed, scheduling retry"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {},
                () = stopped(shutdown) => {
                    tracing::info!(
                        event_id = %envelope.event_id,
                        "Shutdown during retry wait, leaving event for redelivery"
                    );
                    return MessageOutcome::Abandoned { attempts };
                },
            }
        }
    }

    async fn dead_letter(&self, envelope: &EventEnvelope, failure: &FailureReport, retries: u32) {
        match &self.dead_letters {
            Some(publisher) => {
                publisher
                    .send_to_dead_letter_queue(envelope, failure, retries)
                    .await;
            },
            None => {
                tracing::error!(
                    event_type = %envelope.event_type,
                    event_id = %envelope.event_id,
                    error = %failure.message,
                    "No dead-letter publisher attached, dropping failed event"
                );
            },
        }
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Hold `partition` at the broker once its worker is `HIGH_WATER` behind.
    fn hold_if_backed_up(&self, partition: &TopicPartition, backlog: &Backlog) {
        let mut held = backlog.held.lock().unwrap_or_else(PoisonError::into_inner);
        if *held || backlog.queued.load(Ordering::SeqCst) < HIGH_WATER {
            return;
        }
        match self.subscriber.pause_partitions(std::slice::from_ref(partition)) {
            Ok(()) => {
                *held = true;
                tracing::debug!(
                    topic = %partition.topic,
                    partition = partition.partition,
                    queued = backlog.queued.load(Ordering::SeqCst),
                    "Partition worker behind, holding partition"
                );
            },
            Err(e) => tracing::warn!(
                topic = %partition.topic,
                partition = partition.partition,
                error = %e,
                "Failed to hold partition"
            ),
        }
    }

    /// Release a held partition once its worker is down to `LOW_WATER`.
    fn release_if_drained(&self, partition: &TopicPartition, backlog: &Backlog) {
        let mut held = backlog.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !*held || backlog.queued.load(Ordering::SeqCst) > LOW_WATER {
            return;
        }
        match self.subscriber.resume_partitions(std::slice::from_ref(partition)) {
            Ok(()) => {
                *held = false;
                tracing::debug!(
                    topic = %partition.topic,
                    partition = partition.partition,
                    "Partition worker caught up, releasing partition"
                );
            },
            Err(e) => tracing::warn!(
                topic = %partition.topic,
                partition = partition.partition,
                error = %e,
                "Failed to release partition"
            ),
        }
    }

    async fn settle(&self, message: &InboundMessage, outcome: MessageOutcome) {
        if !outcome.is_settled() {
            return;
        }
        let next = message.next_offset();
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message.topic_partition(), next.offset);

        if self.auto_commit {
            if let Err(e) = self.subscriber.commit(std::slice::from_ref(&next)).await {
                tracing::warn!(
                    topic = %next.topic,
                    partition = next.partition,
                    offset = next.offset,
                    error = %e,
                    "Failed to commit offset (message may be redelivered)"
                );
            }
        }
    }
}

/// Resolves once shutdown is signalled; never resolves if the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

async fn partition_worker(
    processor: Arc<Processor>,
    partition: TopicPartition,
    backlog: Arc<Backlog>,
    mut messages: mpsc::UnboundedReceiver<InboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(topic = %partition.topic, partition = partition.partition, "Partition worker started");
    while let Some(message) = messages.recv().await {
        if *shutdown.borrow() {
            break;
        }
        let outcome = processor.process(&message, &mut shutdown).await;
        processor.settle(&message, outcome).await;
        backlog.queued.fetch_sub(1, Ordering::SeqCst);
        processor.release_if_drained(&partition, &backlog);
    }
    tracing::debug!(topic = %partition.topic, partition = partition.partition, "Partition worker stopped");
}

async fn dispatch(
    processor: Arc<Processor>,
    mut stream: MessageStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut workers: HashMap<TopicPartition, Worker> = HashMap::new();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    loop {
        let next = tokio::select! {
            biased;
            () = stopped(&mut shutdown) => break,
            next = stream.next() => next,
        };

        match next {
            None => {
                tracing::warn!("Subscription stream ended, consumer stopped");
                processor.set_state(ConsumerState::Stopped);
                break;
            },
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Error receiving message");
            },
            Some(Ok(message)) => {
                let partition = message.topic_partition();
                let worker = workers.entry(partition.clone()).or_insert_with(|| {
                    let (sender, rx) = mpsc::unbounded_channel();
                    let backlog = Arc::new(Backlog::default());
                    handles.push(tokio::spawn(partition_worker(
                        Arc::clone(&processor),
                        partition.clone(),
                        Arc::clone(&backlog),
                        rx,
                        shutdown.clone(),
                    )));
                    Worker { sender, backlog }
                });

                // Never awaits: a slow partition is held at the broker instead
                worker.backlog.queued.fetch_add(1, Ordering::SeqCst);
                if worker.sender.send(message).is_err() {
                    worker.backlog.queued.fetch_sub(1, Ordering::SeqCst);
                    tracing::debug!("Partition worker gone, message left for redelivery");
                } else {
                    processor.hold_if_backed_up(&partition, &worker.backlog);
                }
            },
        }
    }

    drop(workers);
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Partition worker failed");
        }
    }
    tracing::debug!("Dispatcher exiting");
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Consumes events from a consumer group and dispatches them to handlers.
pub struct EventConsumer {
    processor: Arc<Processor>,
    topics: RwLock<Vec<String>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl EventConsumer {
    /// Start configuring a consumer over `subscriber`.
    #[must_use]
    pub fn builder(subscriber: Arc<dyn EventSubscriber>) -> EventConsumerBuilder {
        EventConsumerBuilder {
            subscriber,
            policy: RetryPolicy::default(),
            auto_commit: true,
            dead_letters: None,
        }
    }

    /// A consumer using the retry and commit settings of `config`.
    #[must_use]
    pub fn from_config(
        subscriber: Arc<dyn EventSubscriber>,
        config: &BackboneConfig,
    ) -> EventConsumerBuilder {
        Self::builder(subscriber)
            .retry_policy(RetryPolicy::from(&config.retry))
            .auto_commit(config.auto_commit)
    }

    /// Register the handler for `event_type`.
    ///
    /// A later registration for the same type replaces the earlier one and
    /// logs a warning.
    pub fn on<H>(&self, event_type: EventType, handler: H) -> &Self
    where
        H: EventHandler + 'static,
    {
        self.register(event_type, Arc::new(handler));
        self
    }

    /// Register several handlers at once; same replacement rule as [`on`](Self::on).
    pub fn register_handlers<I>(&self, handlers: I) -> &Self
    where
        I: IntoIterator<Item = (EventType, Arc<dyn EventHandler>)>,
    {
        for (event_type, handler) in handlers {
            self.register(event_type, handler);
        }
        self
    }

    fn register(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        let replaced = self
            .processor
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_type, handler)
            .is_some();
        if replaced {
            tracing::warn!(event_type = %event_type, "Replacing previously registered handler");
        } else {
            tracing::debug!(event_type = %event_type, "Handler registered");
        }
    }

    /// Connect, subscribe to `topics`, and start processing.
    ///
    /// `from_beginning` decides where a group without committed offsets
    /// starts.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::InvalidState`] unless disconnected; a `Stopped`
    ///   consumer must be disconnected before it can connect again
    /// - [`ConsumerError::Connection`] / [`ConsumerError::Subscription`] when
    ///   the broker refuses; the consumer is left disconnected
    pub async fn connect(&self, topics: &[String], from_beginning: bool) -> Result<(), ConsumerError> {
        let mut running = self.running.lock().await;
        let state = self.state();
        if state != ConsumerState::Disconnected {
            return Err(ConsumerError::InvalidState {
                operation: "connect",
                state,
            });
        }

        let subscriber = &self.processor.subscriber;
        if let Err(e) = subscriber.connect().await {
            tracing::error!(group_id = %subscriber.group_id(), error = %e, "Failed to connect consumer");
            return Err(ConsumerError::Connection(e));
        }
        self.set_state(ConsumerState::Connected);

        let stream = match subscriber.subscribe(topics, from_beginning).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(topics = ?topics, error = %e, "Failed to subscribe");
                if let Err(disconnect_error) = subscriber.disconnect().await {
                    tracing::warn!(error = %disconnect_error, "Failed to disconnect after subscribe error");
                }
                self.set_state(ConsumerState::Disconnected);
                return Err(ConsumerError::Subscription(e));
            },
        };
        *self.topics.write().unwrap_or_else(PoisonError::into_inner) = topics.to_vec();

        // Running before the loop starts, so a stream that ends at once
        // leaves the consumer Stopped
        self.set_state(ConsumerState::Running);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(dispatch(Arc::clone(&self.processor), stream, shutdown_rx));
        *running = Some(Running { shutdown, task });

        tracing::info!(
            group_id = %subscriber.group_id(),
            topics = ?topics,
            from_beginning,
            auto_commit = self.processor.auto_commit,
            handlers = self.registered_handlers().len(),
            "Event consumer running"
        );
        Ok(())
    }

    /// Stop processing and leave the group.
    ///
    /// In-flight handlers finish; retry waits are cut short and their
    /// messages left uncommitted. Calling this when already disconnected is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Connection`] if the transport fails to leave.
    pub async fn disconnect(&self) -> Result<(), ConsumerError> {
        let mut running = self.running.lock().await;
        if self.state() == ConsumerState::Disconnected {
            return Ok(());
        }

        if let Some(Running { shutdown, task }) = running.take() {
            // A closed receiver means the loop already exited
            let _ = shutdown.send(true);
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Consumer loop failed");
            }
        }

        let result = self.processor.subscriber.disconnect().await;
        self.set_state(ConsumerState::Disconnected);
        result.map_err(ConsumerError::Connection)?;
        tracing::info!(group_id = %self.processor.subscriber.group_id(), "Event consumer disconnected");
        Ok(())
    }

    /// Process one inbound message through the handler and retry path.
    ///
    /// This is what every partition worker runs; it does not commit.
    pub async fn process(&self, message: &InboundMessage) -> MessageOutcome {
        let (_keep_open, mut shutdown) = watch::channel(false);
        self.processor.process(message, &mut shutdown).await
    }

    /// Commit offsets explicitly (for consumers without auto-commit).
    ///
    /// Each offset is the position of the next record to consume.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::InvalidState`] when disconnected
    /// - [`ConsumerError::Commit`] when the broker rejects the commit
    pub async fn commit_offsets(&self, offsets: &[TopicPartitionOffset]) -> Result<(), ConsumerError> {
        self.require_connected("commit offsets")?;
        self.processor
            .subscriber
            .commit(offsets)
            .await
            .map_err(|e| {
                tracing::error!(offsets = ?offsets, error = %e, "Failed to commit offsets");
                ConsumerError::Commit(e)
            })?;
        tracing::debug!(count = offsets.len(), "Offsets committed");
        Ok(())
    }

    /// Next offset to commit for every partition processed so far.
    #[must_use]
    pub fn processed_offsets(&self) -> Vec<TopicPartitionOffset> {
        let processed = self
            .processor
            .processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut offsets: Vec<TopicPartitionOffset> = processed
            .iter()
            .map(|(partition, offset)| TopicPartitionOffset {
                topic: partition.topic.clone(),
                partition: partition.partition,
                offset: *offset,
            })
            .collect();
        offsets.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        offsets
    }

    /// Stop fetching from `topics` without leaving the group.
    ///
    /// # Errors
    ///
    /// [`ConsumerError::InvalidState`] unless running, or
    /// [`ConsumerError::FlowControl`] if the transport refuses.
    pub fn pause(&self, topics: &[String]) -> Result<(), ConsumerError> {
        self.require_running("pause")?;
        self.processor
            .subscriber
            .pause(topics)
            .map_err(ConsumerError::FlowControl)?;
        tracing::info!(topics = ?topics, "Consumption paused");
        Ok(())
    }

    /// Restart fetching from `topics`.
    ///
    /// # Errors
    ///
    /// Same as [`pause`](Self::pause).
    pub fn resume(&self, topics: &[String]) -> Result<(), ConsumerError> {
        self.require_running("resume")?;
        self.processor
            .subscriber
            .resume(topics)
            .map_err(ConsumerError::FlowControl)?;
        tracing::info!(topics = ?topics, "Consumption resumed");
        Ok(())
    }

    /// Event types with a registered handler, sorted.
    #[must_use]
    pub fn registered_handlers(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = self
            .processor
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        types.sort();
        types
    }

    /// Group id, topics, and state of this consumer.
    #[must_use]
    pub fn consumer_group_info(&self) -> ConsumerGroupInfo {
        ConsumerGroupInfo {
            group_id: self.processor.subscriber.group_id().to_string(),
            topics: self.topics.read().unwrap_or_else(PoisonError::into_inner).clone(),
            state: self.state(),
            auto_commit: self.processor.auto_commit,
            handlers: self.registered_handlers(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        *self.processor.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConsumerState) {
        self.processor.set_state(state);
    }

    fn require_running(&self, operation: &'static str) -> Result<(), ConsumerError> {
        match self.state() {
            ConsumerState::Running => Ok(()),
            state => Err(ConsumerError::InvalidState { operation, state }),
        }
    }

    fn require_connected(&self, operation: &'static str) -> Result<(), ConsumerError> {
        match self.state() {
            ConsumerState::Disconnected => Err(ConsumerError::InvalidState {
                operation,
                state: ConsumerState::Disconnected,
            }),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for EventConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventConsumer")
            .field("group_id", &self.processor.subscriber.group_id())
            .field("state", &self.state())
            .field("handlers", &self.registered_handlers())
            .finish_non_exhaustive()
    }
}

/// Builder for [`EventConsumer`].
pub struct EventConsumerBuilder {
    subscriber: Arc<dyn EventSubscriber>,
    policy: RetryPolicy,
    auto_commit: bool,
    dead_letters: Option<Arc<EventPublisher>>,
}

impl EventConsumerBuilder {
    /// Set the handler retry policy (default: 3 retries, exponential).
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Commit after each processed message (default) or leave commits to
    /// [`EventConsumer::commit_offsets`].
    #[must_use]
    pub const fn auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    /// Publisher used to dead-letter events whose retries are exhausted.
    ///
    /// Without one, exhausted events are logged and dropped.
    #[must_use]
    pub fn dead_letter_publisher(mut self, publisher: Arc<EventPublisher>) -> Self {
        self.dead_letters = Some(publisher);
        self
    }

    /// Build the consumer (disconnected, no handlers).
    #[must_use]
    pub fn build(self) -> EventConsumer {
        EventConsumer {
            processor: Arc::new(Processor {
                subscriber: self.subscriber,
                state: RwLock::new(ConsumerState::Disconnected),
                handlers: RwLock::new(HashMap::new()),
                policy: self.policy,
                auto_commit: self.auto_commit,
                dead_letters: self.dead_letters,
                processed: Mutex::new(HashMap::new()),
            }),
            topics: RwLock::new(Vec::new()),
            running: tokio::sync::Mutex::new(None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Test assertions
mod tests {
    use super::*;
    use commerce_events_core::wire::WireMessage;
    use commerce_events_testing::{InMemoryBroker, fixtures, test_factory};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build()
    }

    fn inbound(envelope: &EventEnvelope) -> InboundMessage {
        InboundMessage::from_wire("order-events", 0, 7, wire::encode(envelope, "test").unwrap())
    }

    fn order_event() -> EventEnvelope {
        test_factory("order-service")
            .order_created("order-42", fixtures::order_created(15000), None)
            .unwrap()
    }

    fn counting_handler(calls: &Arc<AtomicU32>, fail: bool) -> impl EventHandler + 'static {
        let calls = Arc::clone(calls);
        move |_event: EventEnvelope| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    anyhow::bail!("inventory service unavailable");
                }
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn registered_handler_runs_once() {
        let broker = InMemoryBroker::new();
        let consumer = EventConsumer::builder(Arc::new(broker.subscriber("g"))).build();
        let calls = Arc::new(AtomicU32::new(0));
        consumer.on(EventType::OrderCreated, counting_handler(&calls, false));

        let outcome = consumer.process(&inbound(&order_event())).await;
        assert_eq!(outcome, MessageOutcome::Handled { attempts: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unhandled_type_is_skipped() {
        let broker = InMemoryBroker::new();
        let consumer = EventConsumer::builder(Arc::new(broker.subscriber("g"))).build();
        let calls = Arc::new(AtomicU32::new(0));
        consumer.on(EventType::CartAbandoned, counting_handler(&calls, false));

        assert_eq!(
            consumer.process(&inbound(&order_event())).await,
            MessageOutcome::Unhandled
        );

        let mut unknown = order_event();
        unknown.event_type = "FooBarEvent".to_string();
        assert_eq!(consumer.process(&inbound(&unknown)).await, MessageOutcome::Unhandled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped_without_retry() {
        let broker = InMemoryBroker::new();
        let consumer = EventConsumer::builder(Arc::new(broker.subscriber("g")))
            .retry_policy(fast_policy(3))
            .build();
        let calls = Arc::new(AtomicU32::new(0));
        consumer.on(EventType::OrderCreated, counting_handler(&calls, true));

        let garbage = InboundMessage::from_wire(
            "order-events",
            0,
            1,
            WireMessage {
                key: "x".to_string(),
                value: b"not json".to_vec(),
                headers: vec![],
            },
        );
        assert_eq!(consumer.process(&garbage).await, MessageOutcome::Malformed);

        let missing_aggregate = InboundMessage::from_wire(
            "order-events",
            0,
            2,
            WireMessage {
                key: "x".to_string(),
                value: br#"{"eventType":"OrderCreated","payload":{}}"#.to_vec(),
                headers: vec![],
            },
        );
        assert_eq!(consumer.process(&missing_aggregate).await, MessageOutcome::Malformed);

        let mut empty = garbage.clone();
        empty.payload = None;
        assert_eq!(consumer.process(&empty).await, MessageOutcome::Malformed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn always_failing_handler_is_invoked_max_retries_plus_one_times() {
        let broker = InMemoryBroker::new();
        let consumer = EventConsumer::builder(Arc::new(broker.subscriber("g")))
            .retry_policy(fast_policy(3))
            .build();
        let calls = Arc::new(AtomicU32::new(0));
        consumer.on(EventType::OrderCreated, counting_handler(&calls, true));

        let outcome = consumer.process(&inbound(&order_event())).await;
        assert_eq!(outcome, MessageOutcome::DeadLettered { attempts: 4 });
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_count_header_seeds_the_budget() {
        let broker = InMemoryBroker::new();
        let consumer = EventConsumer::builder(Arc::new(broker.subscriber("g")))
            .retry_policy(fast_policy(3))
            .build();
        let calls = Arc::new(AtomicU32::new(0));
        consumer.on(EventType::OrderCreated, counting_handler(&calls, true));

        let mut message = inbound(&order_event());
        wire::set_retry_count(&mut message.headers, 2);
        let outcome = consumer.process(&message).await;

        assert_eq!(outcome, MessageOutcome::DeadLettered { attempts: 2 });
        // The caller's record is never modified
        assert_eq!(message.retry_count(), 2);
    }

    #[tokio::test]
    async fn handler_recovering_on_retry_is_handled() {
        let broker = InMemoryBroker::new();
        let consumer = EventConsumer::builder(Arc::new(broker.subscriber("g")))
            .retry_policy(fast_policy(3))
            .build();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        consumer.on(EventType::OrderCreated, move |_event: EventEnvelope| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("transient");
                }
                Ok(())
            }
        });

        assert_eq!(
            consumer.process(&inbound(&order_event())).await,
            MessageOutcome::Handled { attempts: 3 }
        );
    }

    #[tokio::test]
    async fn panicking_handler_is_treated_as_failure() {
        let broker = InMemoryBroker::new();
        let consumer = EventConsumer::builder(Arc::new(broker.subscriber("g")))
            .retry_policy(RetryPolicy::no_retry())
            .build();
        consumer.on(EventType::OrderCreated, |event: EventEnvelope| async move {
            assert!(event.aggregate_id.is_empty(), "handler bug");
            Ok::<(), anyhow::Error>(())
        });

        assert_eq!(
            consumer.process(&inbound(&order_event())).await,
            MessageOutcome::DeadLettered { attempts: 1 }
        );
    }

    #[tokio::test]
    async fn later_registration_wins() {
        let broker = InMemoryBroker::new();
        let consumer = EventConsumer::builder(Arc::new(broker.subscriber("g"))).build();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        consumer
            .on(EventType::OrderCreated, counting_handler(&first, false))
            .on(EventType::OrderCreated, counting_handler(&second, false));

        consumer.process(&inbound(&order_event())).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.registered_handlers(), vec![EventType::OrderCreated]);
    }

    #[tokio::test]
    async fn register_handlers_accepts_a_map() {
        let broker = InMemoryBroker::new();
        let consumer = EventConsumer::builder(Arc::new(broker.subscriber("g"))).build();
        let calls = Arc::new(AtomicU32::new(0));
        let handlers: Vec<(EventType, Arc<dyn EventHandler>)> = vec![
            (EventType::CartItemAdded, Arc::new(counting_handler(&calls, false))),
            (EventType::UserRegistered, Arc::new(counting_handler(&calls, false))),
        ];
        consumer.register_handlers(handlers);

        assert_eq!(
            consumer.registered_handlers(),
            vec![EventType::UserRegistered, EventType::CartItemAdded]
        );
    }

    #[tokio::test]
    async fn lifecycle_and_introspection() {
        let broker = InMemoryBroker::new();
        let consumer = EventConsumer::builder(Arc::new(broker.subscriber("billing")))
            .auto_commit(false)
            .build();

        assert!(matches!(
            consumer.pause(&["order-events".to_string()]),
            Err(ConsumerError::InvalidState { state: ConsumerState::Disconnected, .. })
        ));

        consumer.connect(&["order-events".to_string()], true).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Running);
        assert!(matches!(
            consumer.connect(&["order-events".to_string()], true).await,
            Err(ConsumerError::InvalidState { operation: "connect", .. })
        ));

        let info = consumer.consumer_group_info();
        assert_eq!(info.group_id, "billing");
        assert_eq!(info.topics, vec!["order-events".to_string()]);
        assert!(!info.auto_commit);

        consumer.pause(&["order-events".to_string()]).unwrap();
        consumer.resume(&["order-events".to_string()]).unwrap();

        consumer.disconnect().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Disconnected);
        consumer.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_leaves_consumer_disconnected() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let consumer = EventConsumer::builder(Arc::new(broker.subscriber("g"))).build();

        assert!(matches!(
            consumer.connect(&["order-events".to_string()], true).await,
            Err(ConsumerError::Connection(_))
        ));
        assert_eq!(consumer.state(), ConsumerState::Disconnected);
    }

    #[tokio::test]
    async fn commit_offsets_requires_connection() {
        let broker = InMemoryBroker::new();
        let consumer = EventConsumer::builder(Arc::new(broker.subscriber("g"))).build();
        let offsets = [TopicPartitionOffset {
            topic: "order-events".to_string(),
            partition: 0,
            offset: 1,
        }];
        assert!(matches!(
            consumer.commit_offsets(&offsets).await,
            Err(ConsumerError::InvalidState { .. })
        ));
    }
}
