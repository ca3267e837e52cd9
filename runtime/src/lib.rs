//! # Commerce Events Runtime
//!
//! Publishing and consumption on top of the transport seam in
//! `commerce-events-core`.
//!
//! ## Core Components
//!
//! - **[`EventPublisher`]**: enriches, validates, encodes, and routes
//!   envelopes to their topics; batches, transactions, and the dead-letter
//!   sink
//! - **[`EventConsumer`]**: handler registry, per-partition processing,
//!   delayed retries, dead-lettering, and offset commits
//! - **[`RetryPolicy`]**: how many times and how long to wait before a
//!   failing handler is retried
//! - **[`metrics`]**: Prometheus counters and histograms for both sides
//!
//! ## Example
//!
//! ```
//! use commerce_events_core::EventType;
//! use commerce_events_runtime::{EventConsumer, EventPublisher};
//! use commerce_events_testing::{InMemoryBroker, fixtures, test_factory};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//!
//! let publisher = Arc::new(EventPublisher::new(Arc::new(broker.clone()), "order-service"));
//! publisher.connect().await?;
//!
//! let consumer = EventConsumer::builder(Arc::new(broker.subscriber("inventory")))
//!     .dead_letter_publisher(Arc::clone(&publisher))
//!     .build();
//! consumer.on(EventType::OrderCreated, |event: commerce_events_core::EventEnvelope| async move {
//!     tracing::info!(order = %event.aggregate_id, "Reserving stock");
//!     Ok::<(), anyhow::Error>(())
//! });
//! consumer.connect(&["order-events".to_string()], true).await?;
//!
//! let event = test_factory("order-service")
//!     .order_created("order-42", fixtures::order_created(15000), None)?;
//! publisher.publish(&event, None).await?;
//!
//! consumer.disconnect().await?;
//! publisher.disconnect().await?;
//! # Ok(())
//! # }
//! ```

/// Handler registry and the consume, retry, and dead-letter loop
pub mod consumer;

/// Prometheus metrics for observability
pub mod metrics;

/// Topic routing, batches, transactions, and the dead-letter sink
pub mod publisher;

/// Retry timing for failing handlers
pub mod retry;

pub use consumer::{
    ConsumerError, ConsumerGroupInfo, ConsumerState, EventConsumer, EventConsumerBuilder,
    EventHandler, MessageOutcome,
};
pub use publisher::{EventPublisher, PublishError};
pub use retry::{Backoff, RetryPolicy};
