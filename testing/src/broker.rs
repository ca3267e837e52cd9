//! In-memory broker for fast, deterministic backbone tests
//!
//! [`InMemoryBroker`] stands in for Kafka/Redpanda behind the
//! [`EventProducer`] / [`EventSubscriber`] traits:
//! - Topics are split into partitions; records are placed by hashing their
//!   key, so one aggregate always lands on one partition
//! - Consumer groups keep committed offsets; a new subscriber in a group
//!   resumes from them
//! - Transactions append all of their records or none of them
//! - Failure injection: [`InMemoryBroker::fail_topic`] and
//!   [`InMemoryBroker::set_reachable`]
//! - [`InMemoryBroker::disable_transactions`] mirrors a producer without a
//!   transactional id, which refuses multi-record batches

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use commerce_events_core::event::EventEnvelope;
use commerce_events_core::event_bus::{
    BoxFuture, BrokerError, DeliveryReceipt, EventProducer, EventSubscriber, InboundMessage,
    MessageStream, TopicPartition, TopicPartitionOffset,
};
use commerce_events_core::topic::TopicRegistry;
use commerce_events_core::wire::{self, WireMessage};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Partitions per topic unless configured otherwise.
pub const DEFAULT_PARTITIONS: i32 = 3;

#[derive(Debug, Default)]
struct BrokerState {
    /// topic -> partition -> records (offset = index)
    logs: HashMap<String, Vec<Vec<WireMessage>>>,
    /// (group, topic, partition) -> next offset to consume
    committed: HashMap<(String, String, i32), i64>,
    failing: HashSet<String>,
    unreachable: bool,
    transactions_disabled: bool,
    aborted_transactions: usize,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
    partitions: i32,
}

/// In-memory, partitioned, transactional broker.
///
/// Cloning is cheap and every clone sees the same topics.
///
/// # Example
///
/// ```
/// use commerce_events_testing::InMemoryBroker;
/// use commerce_events_core::event_bus::EventProducer;
/// use commerce_events_core::wire::WireMessage;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// broker.connect().await?;
///
/// let record = WireMessage { key: "order-42".into(), value: b"{}".to_vec(), headers: vec![] };
/// let receipts = broker.send("order-events", vec![record]).await?;
///
/// assert_eq!(receipts[0].partition, broker.partition_for("order-42"));
/// assert_eq!(broker.messages("order-events").len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Broker with the default topics and [`DEFAULT_PARTITIONS`] partitions.
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Broker with the default topics and `partitions` partitions per topic.
    #[must_use]
    pub fn with_partitions(partitions: i32) -> Self {
        let broker = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                partitions: partitions.max(1),
            }),
        };
        broker.create_topics(&TopicRegistry::new());
        broker
    }

    /// Create every topic of a registry (including its DLQ).
    pub fn create_topics(&self, registry: &TopicRegistry) {
        for topic in registry.event_topics() {
            self.create_topic(&topic);
        }
        self.create_topic(registry.dead_letter());
    }

    /// Create a topic if it does not exist yet.
    pub fn create_topic(&self, topic: &str) {
        let mut state = self.shared.state.lock().unwrap();
        self.ensure_topic(&mut state, topic);
    }

    /// Whether a topic exists.
    #[must_use]
    pub fn has_topic(&self, topic: &str) -> bool {
        self.shared.state.lock().unwrap().logs.contains_key(topic)
    }

    /// Make every send touching `topic` fail until [`heal_topic`](Self::heal_topic).
    pub fn fail_topic(&self, topic: &str) {
        self.shared
            .state
            .lock()
            .unwrap()
            .failing
            .insert(topic.to_string());
    }

    /// Undo [`fail_topic`](Self::fail_topic).
    pub fn heal_topic(&self, topic: &str) {
        self.shared.state.lock().unwrap().failing.remove(topic);
    }

    /// Simulate the broker going away (`false`) or coming back (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.state.lock().unwrap().unreachable = !reachable;
    }

    /// Behave like a producer without a transactional id: multi-record
    /// sends and transactions are refused and nothing is appended.
    pub fn disable_transactions(&self) {
        self.shared.state.lock().unwrap().transactions_disabled = true;
    }

    /// Partition a key is placed on.
    #[must_use]
    pub fn partition_for(&self, key: &str) -> i32 {
        // FNV-1a keeps placement stable across runs
        let hash = key.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
            (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
        });
        let partitions = u32::try_from(self.shared.partitions).unwrap_or(1);
        i32::try_from(hash % partitions).unwrap_or(0)
    }

    /// Every record on a topic, partition by partition, in offset order.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<WireMessage> {
        let state = self.shared.state.lock().unwrap();
        state
            .logs
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Records of one partition, in offset order.
    #[must_use]
    pub fn partition_messages(&self, topic: &str, partition: i32) -> Vec<WireMessage> {
        let state = self.shared.state.lock().unwrap();
        state
            .logs
            .get(topic)
            .and_then(|partitions| partitions.get(usize::try_from(partition).ok()?))
            .cloned()
            .unwrap_or_default()
    }

    /// Every record on a topic decoded as an envelope; undecodable records
    /// are skipped.
    #[must_use]
    pub fn envelopes(&self, topic: &str) -> Vec<EventEnvelope> {
        self.messages(topic)
            .iter()
            .filter_map(|message| wire::decode(&message.value).ok())
            .collect()
    }

    /// Number of records across every topic.
    #[must_use]
    pub fn total_messages(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.logs.values().flatten().map(Vec::len).sum()
    }

    /// Committed offset of a group on one partition.
    #[must_use]
    pub fn committed(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.shared
            .state
            .lock()
            .unwrap()
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Transactions aborted so far.
    #[must_use]
    pub fn aborted_transactions(&self) -> usize {
        self.shared.state.lock().unwrap().aborted_transactions
    }

    /// Append a raw record, bypassing the producer API (for malformed input).
    pub fn inject(&self, topic: &str, message: WireMessage) -> DeliveryReceipt {
        let receipt = {
            let mut state = self.shared.state.lock().unwrap();
            self.append(&mut state, topic, message)
        };
        self.shared.notify.notify_waiters();
        receipt
    }

    /// A subscriber bound to a consumer group.
    #[must_use]
    pub fn subscriber(&self, group_id: impl Into<String>) -> InMemorySubscriber {
        InMemorySubscriber {
            broker: self.clone(),
            group_id: group_id.into(),
            session: Arc::new(Session::default()),
        }
    }

    fn ensure_topic(&self, state: &mut BrokerState, topic: &str) {
        let partitions = usize::try_from(self.shared.partitions).unwrap_or(1);
        state
            .logs
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions]);
    }

    fn append(&self, state: &mut BrokerState, topic: &str, message: WireMessage) -> DeliveryReceipt {
        self.ensure_topic(state, topic);
        let partition = self.partition_for(&message.key);
        let log = state
            .logs
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(usize::try_from(partition).ok()?))
            .unwrap();
        let offset = i64::try_from(log.len()).unwrap();
        log.push(message);
        DeliveryReceipt {
            topic: topic.to_string(),
            partition,
            offset,
        }
    }

    fn check_sendable(state: &BrokerState, topic: &str) -> Result<(), BrokerError> {
        if state.unreachable {
            return Err(BrokerError::SendFailed {
                topic: topic.to_string(),
                reason: "broker unreachable".to_string(),
            });
        }
        if state.failing.contains(topic) {
            return Err(BrokerError::SendFailed {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn partition_count(&self) -> i32 {
        self.shared.partitions
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl EventProducer for InMemoryBroker {
    fn connect(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            if self.shared.state.lock().unwrap().unreachable {
                return Err(BrokerError::ConnectionFailed(
                    "in-memory broker unreachable".to_string(),
                ));
            }
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async { Ok(()) })
    }

    fn send<'a>(
        &'a self,
        topic: &'a str,
        messages: Vec<WireMessage>,
    ) -> BoxFuture<'a, Result<Vec<DeliveryReceipt>, BrokerError>> {
        Box::pin(async move {
            let receipts = {
                let mut state = self.shared.state.lock().unwrap();
                if state.transactions_disabled && messages.len() > 1 {
                    return Err(BrokerError::BatchNeedsTransaction {
                        topic: topic.to_string(),
                        records: messages.len(),
                    });
                }
                Self::check_sendable(&state, topic)?;
                messages
                    .into_iter()
                    .map(|message| self.append(&mut state, topic, message))
                    .collect()
            };
            self.shared.notify.notify_waiters();
            Ok(receipts)
        })
    }

    fn send_transaction(
        &self,
        records: Vec<(String, WireMessage)>,
    ) -> BoxFuture<'_, Result<Vec<DeliveryReceipt>, BrokerError>> {
        Box::pin(async move {
            let receipts = {
                let mut state = self.shared.state.lock().unwrap();
                if state.transactions_disabled {
                    return Err(BrokerError::TransactionFailed(
                        "producer has no transactional id".to_string(),
                    ));
                }
                // Stage: every record must be sendable before any is appended
                for (topic, _) in &records {
                    if let Err(e) = Self::check_sendable(&state, topic) {
                        state.aborted_transactions += 1;
                        return Err(BrokerError::TransactionFailed(e.to_string()));
                    }
                }
                records
                    .into_iter()
                    .map(|(topic, message)| self.append(&mut state, &topic, message))
                    .collect()
            };
            self.shared.notify.notify_waiters();
            Ok(receipts)
        })
    }

    fn probe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let state = self.shared.state.lock().unwrap();
            if state.unreachable {
                return Err(BrokerError::Unreachable("in-memory broker".to_string()));
            }
            if !state.logs.contains_key(topic) {
                return Err(BrokerError::TopicNotFound(topic.to_string()));
            }
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
struct Session {
    connected: AtomicBool,
    closed: AtomicBool,
    paused: Mutex<HashSet<String>>,
    held: Mutex<HashSet<TopicPartition>>,
}

/// Consumer-group member of an [`InMemoryBroker`].
///
/// Partitions are not balanced between members of one group: every
/// subscriber reads every partition of its topics.
#[derive(Clone, Debug)]
pub struct InMemorySubscriber {
    broker: InMemoryBroker,
    group_id: String,
    session: Arc<Session>,
}

impl InMemorySubscriber {
    /// Topics currently paused.
    #[must_use]
    pub fn paused_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.session.paused.lock().unwrap().iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Partitions currently held back by `pause_partitions`.
    #[must_use]
    pub fn held_partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<TopicPartition> =
            self.session.held.lock().unwrap().iter().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Whether the subscriber is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.connected.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Position {
    topic: String,
    partition: i32,
    offset: i64,
}

fn next_record(
    broker: &InMemoryBroker,
    session: &Session,
    positions: &mut [Position],
    cursor: &mut usize,
) -> Option<InboundMessage> {
    let state = broker.shared.state.lock().unwrap();
    let paused = session.paused.lock().unwrap();
    let held = session.held.lock().unwrap();
    let len = positions.len();

    for step in 0..len {
        let index = (*cursor + step) % len;
        let position = &mut positions[index];
        let partition = TopicPartition {
            topic: position.topic.clone(),
            partition: position.partition,
        };
        if paused.contains(&position.topic) || held.contains(&partition) {
            continue;
        }
        let record = state
            .logs
            .get(&position.topic)
            .and_then(|partitions| partitions.get(usize::try_from(position.partition).ok()?))
            .and_then(|log| log.get(usize::try_from(position.offset).ok()?));
        if let Some(record) = record {
            let message = InboundMessage::from_wire(
                &position.topic,
                position.partition,
                position.offset,
                record.clone(),
            );
            position.offset += 1;
            *cursor = (index + 1) % len;
            return Some(message);
        }
    }
    None
}

impl EventSubscriber for InMemorySubscriber {
    fn connect(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            if self.broker.shared.state.lock().unwrap().unreachable {
                return Err(BrokerError::ConnectionFailed(
                    "in-memory broker unreachable".to_string(),
                ));
            }
            self.session.closed.store(false, Ordering::SeqCst);
            self.session.connected.store(true, Ordering::SeqCst);
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
            if !self.session.connected.load(Ordering::SeqCst) {
                return Err(BrokerError::NotConnected);
            }
            if topics.is_empty() {
                return Err(BrokerError::SubscriptionFailed {
                    topics,
                    reason: "no topics given".to_string(),
                });
            }

            let mut positions = Vec::new();
            {
                let mut state = self.broker.shared.state.lock().unwrap();
                for topic in &topics {
                    self.broker.ensure_topic(&mut state, topic);
                    for partition in 0..self.broker.partition_count() {
                        let key = (self.group_id.clone(), topic.clone(), partition);
                        let offset = match state.committed.get(&key) {
                            Some(committed) => *committed,
                            None if from_beginning => 0,
                            None => state
                                .logs
                                .get(topic)
                                .and_then(|p| p.get(usize::try_from(partition).ok()?))
                                .map_or(0, |log| i64::try_from(log.len()).unwrap_or(i64::MAX)),
                        };
                        positions.push(Position {
                            topic: topic.clone(),
                            partition,
                            offset,
                        });
                    }
                }
            }

            let broker = self.broker.clone();
            let session = Arc::clone(&self.session);
            let stream = async_stream::stream! {
                let mut positions = positions;
                let mut cursor = 0;
                loop {
                    let notified = broker.shared.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    if session.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    match next_record(&broker, &session, &mut positions, &mut cursor) {
                        Some(message) => yield Ok(message),
                        None => notified.await,
                    }
                }
            };
            Ok(Box::pin(stream) as MessageStream)
        })
    }

    fn commit(&self, offsets: &[TopicPartitionOffset]) -> BoxFuture<'_, Result<(), BrokerError>> {
        let offsets = offsets.to_vec();
        Box::pin(async move {
            if !self.session.connected.load(Ordering::SeqCst) {
                return Err(BrokerError::CommitFailed("not connected".to_string()));
            }
            let mut state = self.broker.shared.state.lock().unwrap();
            for offset in offsets {
                state.committed.insert(
                    (self.group_id.clone(), offset.topic, offset.partition),
                    offset.offset,
                );
            }
            Ok(())
        })
    }

    fn pause(&self, topics: &[String]) -> Result<(), BrokerError> {
        if !self.session.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::FlowControl("not connected".to_string()));
        }
        self.session
            .paused
            .lock()
            .unwrap()
            .extend(topics.iter().cloned());
        Ok(())
    }

    fn resume(&self, topics: &[String]) -> Result<(), BrokerError> {
        if !self.session.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::FlowControl("not connected".to_string()));
        }
        {
            let mut paused = self.session.paused.lock().unwrap();
            for topic in topics {
                paused.remove(topic);
            }
        }
        self.broker.shared.notify.notify_waiters();
        Ok(())
    }

    fn pause_partitions(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        if !self.session.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::FlowControl("not connected".to_string()));
        }
        self.session
            .held
            .lock()
            .unwrap()
            .extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume_partitions(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        if !self.session.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::FlowControl("not connected".to_string()));
        }
        {
            let mut held = self.session.held.lock().unwrap();
            for partition in partitions {
                held.remove(partition);
            }
        }
        self.broker.shared.notify.notify_waiters();
        Ok(())
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            self.session.held.lock().unwrap().clear();
            self.session.connected.store(false, Ordering::SeqCst);
            self.session.closed.store(true, Ordering::SeqCst);
            self.broker.shared.notify.notify_waiters();
            Ok(())
        })
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }
}
