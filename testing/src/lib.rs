//! # Commerce Events Testing
//!
//! Testing utilities for the commerce event backbone.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: a partitioned, transactional broker behind the
//!   producer/subscriber traits, with failure injection
//! - Mock implementations of the environment traits ([`FixedClock`],
//!   [`SequentialIdGenerator`])
//! - Payload fixtures for the common scenarios
//!
//! ## Example
//!
//! ```
//! use commerce_events_testing::{InMemoryBroker, fixtures, test_factory};
//! use commerce_events_core::event_bus::EventProducer;
//! use commerce_events_core::wire;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! let factory = test_factory("order-service");
//! let event = factory.order_created("order-42", fixtures::order_created(15000), None)?;
//!
//! broker.send("order-events", vec![wire::encode(&event, "order-service")?]).await?;
//! assert_eq!(broker.envelopes("order-events"), vec![event]);
//! # Ok(())
//! # }
//! ```

pub mod broker;

use chrono::{DateTime, Utc};
use commerce_events_core::environment::{Clock, IdGenerator};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, IdGenerator, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use commerce_events_testing::mocks::FixedClock;
    /// use commerce_events_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Predictable ids: `{prefix}-1`, `{prefix}-2`, ...
    ///
    /// # Example
    ///
    /// ```
    /// use commerce_events_testing::mocks::SequentialIdGenerator;
    /// use commerce_events_core::environment::IdGenerator;
    ///
    /// let ids = SequentialIdGenerator::new("evt");
    /// assert_eq!(ids.next_id(), "evt-1");
    /// assert_eq!(ids.next_id(), "evt-2");
    /// ```
    #[derive(Debug)]
    pub struct SequentialIdGenerator {
        prefix: String,
        next: AtomicU64,
    }

    impl SequentialIdGenerator {
        /// Create a generator whose ids start at `{prefix}-1`
        #[must_use]
        pub fn new(prefix: impl Into<String>) -> Self {
            Self {
                prefix: prefix.into(),
                next: AtomicU64::new(1),
            }
        }
    }

    impl IdGenerator for SequentialIdGenerator {
        fn next_id(&self) -> String {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            format!("{}-{n}", self.prefix)
        }
    }
}

/// Payload fixtures for common scenarios.
pub mod fixtures {
    use chrono::{DateTime, Utc};
    use commerce_events_core::payload::{
        CartAbandoned, CartItemAdded, OrderCreated, OrderLineItem, ShippingAddress,
        StockUpdated, UserRegistered,
    };

    /// A two-line order whose amounts add up to `total_amount`.
    #[must_use]
    pub fn order_created(total_amount: i64) -> OrderCreated {
        let shipping_fee = 3000.min(total_amount);
        let subtotal = total_amount - shipping_fee;
        let first = subtotal / 2;
        OrderCreated {
            order_number: "ORD-20250101-0001".to_string(),
            user_id: "user-1".to_string(),
            subtotal,
            shipping_fee,
            discount_amount: 0,
            total_amount,
            items: vec![
                OrderLineItem {
                    product_id: "prod-1".to_string(),
                    product_name: "Ceramic mug".to_string(),
                    quantity: 1,
                    unit_price: first,
                    total_price: first,
                },
                OrderLineItem {
                    product_id: "prod-2".to_string(),
                    product_name: "Tea sampler".to_string(),
                    quantity: 1,
                    unit_price: subtotal - first,
                    total_price: subtotal - first,
                },
            ],
            shipping_address: ShippingAddress {
                recipient: "Kim Minsu".to_string(),
                phone: "010-0000-0000".to_string(),
                postal_code: "04524".to_string(),
                address: "1 Main Street".to_string(),
                address_detail: Some("Apt 101".to_string()),
            },
            payment_method: "card".to_string(),
            ..OrderCreated::default()
        }
    }

    /// A customer signing up through the web.
    #[must_use]
    pub fn user_registered(email: &str) -> UserRegistered {
        UserRegistered {
            email: email.to_string(),
            name: "Test User".to_string(),
            ..UserRegistered::default()
        }
    }

    /// Stock moving from `previous` to `current`.
    #[must_use]
    pub fn stock_updated(previous: i64, current: i64) -> StockUpdated {
        StockUpdated {
            previous_stock: previous,
            new_stock: current,
            reason: "order".to_string(),
            ..StockUpdated::default()
        }
    }

    /// One item added to a cart.
    #[must_use]
    pub fn cart_item_added(product_id: &str, quantity: u32) -> CartItemAdded {
        CartItemAdded {
            product_id: product_id.to_string(),
            quantity,
            unit_price: 4500,
            ..CartItemAdded::default()
        }
    }

    /// A cart left alone since `last_activity_at`.
    #[must_use]
    pub fn cart_abandoned(last_activity_at: DateTime<Utc>) -> CartAbandoned {
        CartAbandoned {
            cart_id: String::new(),
            user_id: Some("user-1".to_string()),
            item_count: 2,
            total_value: 9000,
            last_activity_at,
        }
    }
}

/// Event factory stamped with `service_name`, the fixed test clock and
/// sequential `evt-N` ids.
#[must_use]
pub fn test_factory(service_name: &str) -> commerce_events_core::factory::EventFactory {
    use commerce_events_core::factory::{EventFactory, FactoryConfig};
    use std::sync::Arc;

    EventFactory::with_environment(
        FactoryConfig::new(service_name, "1.0.0"),
        Arc::new(mocks::test_clock()),
        Arc::new(mocks::SequentialIdGenerator::new("evt")),
    )
}

// Re-export commonly used items
pub use broker::{InMemoryBroker, InMemorySubscriber};
pub use mocks::{FixedClock, SequentialIdGenerator, test_clock};

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test assertions
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn order_fixture_amounts_add_up() {
        let order = fixtures::order_created(15000);
        let lines: i64 = order.items.iter().map(|item| item.total_price).sum();
        assert_eq!(lines, order.subtotal);
        assert_eq!(order.subtotal + order.shipping_fee - order.discount_amount, 15000);
    }

    #[test]
    fn test_factory_is_deterministic() {
        let factory = test_factory("svc");
        let event = factory
            .user_registered("user-1", fixtures::user_registered("a@b.c"), Some("corr"))
            .unwrap();
        assert_eq!(event.event_id, "evt-1");
        assert_eq!(event.timestamp, "2025-01-01T00:00:00.000Z");
        assert_eq!(event.correlation_id, "corr");
    }
}
