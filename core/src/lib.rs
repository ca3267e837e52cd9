//! # Commerce Events Core
//!
//! Core types for the commerce domain event backbone.
//!
//! This crate turns internal state changes (user registered, order created,
//! stock updated, cart abandoned, ...) into durable, ordered facts that other
//! services consume. It holds everything that does not need a network:
//!
//! - **Event model**: [`event::EventEnvelope`], the closed [`event::EventType`]
//!   catalog, typed payloads, and topic routing
//! - **Event factory**: [`factory::EventFactory`] stamps payloads into
//!   complete envelopes
//! - **Wire format**: [`wire`] encodes envelopes as keyed records with headers
//! - **Dead letters**: [`dead_letter`] derives diagnostic copies of failed
//!   messages
//! - **Transport seam**: [`event_bus`] traits implemented by the Redpanda and
//!   in-memory brokers
//! - **Configuration**: [`config::BackboneConfig`]
//!
//! ## Example
//!
//! ```
//! use commerce_events_core::factory::{EventFactory, FactoryConfig};
//! use commerce_events_core::payload::CartItemAdded;
//! use commerce_events_core::topic::TopicRegistry;
//! use commerce_events_core::wire;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = EventFactory::new(FactoryConfig::new("cart-service", "1.0.0"));
//! let envelope = factory.cart_item_added(
//!     "cart-9",
//!     CartItemAdded {
//!         product_id: "prod-1".to_string(),
//!         quantity: 2,
//!         unit_price: 4500,
//!         ..CartItemAdded::default()
//!     },
//!     None,
//! )?;
//!
//! let topic = TopicRegistry::new().resolve(&envelope.event_type).to_string();
//! let record = wire::encode(&envelope, factory.service_name())?;
//!
//! assert_eq!(topic, "cart-events");
//! assert_eq!(record.key, "cart-9");
//! assert_eq!(wire::decode(&record.value)?, envelope);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dead_letter;
pub mod event;
pub mod event_bus;
pub mod factory;
pub mod payload;
pub mod topic;
pub mod wire;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use event::{DomainEvent, EventEnvelope, EventError, EventType};
pub use topic::{Topic, TopicRegistry};

/// Environment module - Dependency injection traits
///
/// Time and identifier generation are abstracted so envelope construction is
/// deterministic under test.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use commerce_events_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Source of globally unique identifiers for events and correlations.
    pub trait IdGenerator: Send + Sync {
        /// Produce an identifier never returned before
        fn next_id(&self) -> String;
    }

    /// Production id generator: random v4 UUIDs.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct UuidGenerator;

    impl IdGenerator for UuidGenerator {
        fn next_id(&self) -> String {
            uuid::Uuid::new_v4().to_string()
        }
    }
}
