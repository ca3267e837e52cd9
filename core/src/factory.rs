//! Event factory: stamps business payloads into complete envelopes.
//!
//! The factory is pure construction. It never touches the network; it only
//! reads the clock and draws fresh identifiers. Each producing component owns
//! one factory, configured once at startup with the service name and schema
//! version that every envelope it builds is stamped with.
//!
//! # Example
//!
//! ```
//! use commerce_events_core::factory::{EventFactory, FactoryConfig};
//! use commerce_events_core::payload::OrderCancelled;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = EventFactory::new(FactoryConfig::new("order-service", "1.2.0"));
//!
//! let envelope = factory.order_cancelled(
//!     "order-42",
//!     OrderCancelled {
//!         reason: "customer request".to_string(),
//!         cancelled_by: "user-7".to_string(),
//!         ..OrderCancelled::default()
//!     },
//!     None,
//! )?;
//!
//! assert_eq!(envelope.event_type, "OrderCancelled");
//! assert_eq!(envelope.version, "1.2.0");
//! assert_eq!(envelope.payload["orderId"], "order-42");
//! assert!(!envelope.correlation_id.is_empty());
//! # Ok(())
//! # }
//! ```

use crate::environment::{Clock, IdGenerator, SystemClock, UuidGenerator};
use crate::event::{EventEnvelope, EventError, format_timestamp};
use crate::payload::{
    CartAbandoned, CartItemAdded, EventPayload, LowStockAlert, OrderCancelled, OrderCreated,
    OrderPaymentCompleted, OrderStatusUpdated, ProductAdded, ProductUpdated, ServiceStarted,
    ServiceStopped, StockUpdated, UserDeactivated, UserRegistered, UserUpdated,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identity stamped into every envelope a factory builds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryConfig {
    /// Name of the producing service
    pub service_name: String,
    /// Schema version of the envelopes it produces
    pub version: String,
}

impl FactoryConfig {
    /// Create a config from a service name and version.
    #[must_use]
    pub fn new(service_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            version: version.into(),
        }
    }
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self::new("unknown-service", "1.0.0")
    }
}

/// Builds fully-formed envelopes from business payloads.
#[derive(Clone)]
pub struct EventFactory {
    config: FactoryConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl EventFactory {
    /// Factory using the system clock and random v4 UUIDs.
    #[must_use]
    pub fn new(config: FactoryConfig) -> Self {
        Self::with_environment(config, Arc::new(SystemClock), Arc::new(UuidGenerator))
    }

    /// Factory with injected time and id sources (deterministic tests).
    #[must_use]
    pub fn with_environment(
        config: FactoryConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self { config, clock, ids }
    }

    /// Service name stamped into subsequent envelopes.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    /// Change the service name for envelopes built from now on.
    pub fn set_service_name(&mut self, service_name: impl Into<String>) {
        self.config.service_name = service_name.into();
    }

    /// Schema version stamped into subsequent envelopes.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.config.version
    }

    /// Change the schema version for envelopes built from now on.
    pub fn set_version(&mut self, version: impl Into<String>) {
        self.config.version = version.into();
    }

    /// The current configuration.
    #[must_use]
    pub const fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Build an envelope for any catalogued payload.
    ///
    /// The payload's aggregate id field is bound to `aggregate_id` and the
    /// event type's defaults are applied. A missing or empty
    /// `correlation_id` starts a new correlation chain.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::EmptyAggregateId`] for an empty aggregate id, or
    /// [`EventError::SerializationError`] if the payload cannot be encoded.
    pub fn create<P: EventPayload>(
        &self,
        aggregate_id: &str,
        mut payload: P,
        correlation_id: Option<&str>,
    ) -> Result<EventEnvelope, EventError> {
        if aggregate_id.trim().is_empty() {
            return Err(EventError::EmptyAggregateId(P::EVENT_TYPE.as_str()));
        }

        payload.bind_aggregate(aggregate_id);
        payload.apply_defaults();
        let payload = serde_json::to_value(&payload)
            .map_err(|e| EventError::SerializationError(e.to_string()))?;

        let correlation_id = match correlation_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => self.ids.next_id(),
        };

        Ok(EventEnvelope {
            event_type: P::EVENT_TYPE.as_str().to_string(),
            version: self.config.version.clone(),
            event_id: self.ids.next_id(),
            aggregate_id: aggregate_id.to_string(),
            timestamp: format_timestamp(self.clock.now()),
            correlation_id,
            causation_id: None,
            payload,
        })
    }

    /// Build a follow-up event caused by `parent`.
    ///
    /// The new envelope joins the parent's correlation chain and records the
    /// parent's id as its cause.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Self::create).
    pub fn caused_by<P: EventPayload>(
        &self,
        parent: &EventEnvelope,
        aggregate_id: &str,
        payload: P,
    ) -> Result<EventEnvelope, EventError> {
        let correlation = if parent.correlation_id.is_empty() {
            None
        } else {
            Some(parent.correlation_id.as_str())
        };
        let mut envelope = self.create(aggregate_id, payload, correlation)?;
        if !parent.event_id.is_empty() {
            envelope.causation_id = Some(parent.event_id.clone());
        }
        Ok(envelope)
    }
}

macro_rules! factory_helpers {
    ($( $(#[$doc:meta])* $method:ident($id:ident) -> $payload:ident ),+ $(,)?) => {
        impl EventFactory {
            $(
                $(#[$doc])*
                ///
                /// # Errors
                ///
                /// See [`EventFactory::create`].
                pub fn $method(
                    &self,
                    $id: &str,
                    payload: $payload,
                    correlation_id: Option<&str>,
                ) -> Result<EventEnvelope, EventError> {
                    self.create($id, payload, correlation_id)
                }
            )+
        }
    };
}

factory_helpers! {
    /// Build a `UserRegistered` envelope.
    user_registered(user_id) -> UserRegistered,
    /// Build a `UserUpdated` envelope.
    user_updated(user_id) -> UserUpdated,
    /// Build a `UserDeactivated` envelope.
    user_deactivated(user_id) -> UserDeactivated,
    /// Build a `ProductAdded` envelope.
    product_added(product_id) -> ProductAdded,
    /// Build a `ProductUpdated` envelope.
    product_updated(product_id) -> ProductUpdated,
    /// Build a `StockUpdated` envelope.
    stock_updated(product_id) -> StockUpdated,
    /// Build a `LowStockAlert` envelope.
    low_stock_alert(product_id) -> LowStockAlert,
    /// Build an `OrderCreated` envelope.
    order_created(order_id) -> OrderCreated,
    /// Build an `OrderPaymentCompleted` envelope.
    order_payment_completed(order_id) -> OrderPaymentCompleted,
    /// Build an `OrderStatusUpdated` envelope.
    order_status_updated(order_id) -> OrderStatusUpdated,
    /// Build an `OrderCancelled` envelope.
    order_cancelled(order_id) -> OrderCancelled,
    /// Build a `CartItemAdded` envelope.
    cart_item_added(cart_id) -> CartItemAdded,
    /// Build a `CartAbandoned` envelope.
    cart_abandoned(cart_id) -> CartAbandoned,
    /// Build a `ServiceStarted` envelope; the aggregate is the service instance.
    service_started(service_id) -> ServiceStarted,
    /// Build a `ServiceStopped` envelope; the aggregate is the service instance.
    service_stopped(service_id) -> ServiceStopped,
}

impl fmt::Debug for EventFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test assertions
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct StillClock;

    impl Clock for StillClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc)
        }
    }

    #[derive(Default)]
    struct Counter(AtomicU64);

    impl IdGenerator for Counter {
        fn next_id(&self) -> String {
            format!("id-{}", self.0.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    fn factory() -> EventFactory {
        EventFactory::with_environment(
            FactoryConfig::new("user-service", "2.0.0"),
            Arc::new(StillClock),
            Arc::new(Counter::default()),
        )
    }

    #[test]
    fn envelope_fields_are_stamped() {
        let e = factory()
            .user_registered(
                "user-1",
                UserRegistered {
                    email: "kim@example.com".to_string(),
                    name: "Kim".to_string(),
                    registration_source: String::new(),
                    ..UserRegistered::default()
                },
                None,
            )
            .unwrap();

        assert_eq!(e.event_type, "UserRegistered");
        assert_eq!(e.version, "2.0.0");
        assert_eq!(e.aggregate_id, "user-1");
        assert_eq!(e.timestamp, "2025-01-01T00:00:00.000Z");
        assert_eq!(e.correlation_id, "id-1");
        assert_eq!(e.event_id, "id-2");
        assert!(e.causation_id.is_none());
        assert!(e.is_complete());

        assert_eq!(e.payload["userId"], "user-1");
        assert_eq!(e.payload["isActive"], true);
        assert_eq!(e.payload["registrationSource"], "web");
    }

    #[test]
    fn supplied_correlation_is_propagated() {
        let e = factory()
            .cart_item_added("cart-1", CartItemAdded::default(), Some("corr-9"))
            .unwrap();
        assert_eq!(e.correlation_id, "corr-9");

        let e = factory()
            .cart_item_added("cart-1", CartItemAdded::default(), Some(""))
            .unwrap();
        assert!(!e.correlation_id.is_empty());
        assert_ne!(e.correlation_id, "");
    }

    #[test]
    fn empty_aggregate_is_rejected() {
        let err = factory()
            .order_cancelled(" ", OrderCancelled::default(), None)
            .unwrap_err();
        assert!(matches!(err, EventError::EmptyAggregateId("OrderCancelled")));
    }

    #[test]
    fn version_change_affects_only_later_envelopes() {
        let mut f = factory();
        let before = f
            .service_started("svc-1", ServiceStarted::default(), None)
            .unwrap();
        f.set_version("3.0.0");
        f.set_service_name("renamed");
        let after = f
            .service_started("svc-1", ServiceStarted::default(), None)
            .unwrap();

        assert_eq!(before.version, "2.0.0");
        assert_eq!(after.version, "3.0.0");
        assert_eq!(f.service_name(), "renamed");
    }

    #[test]
    fn caused_by_links_the_chain() {
        let f = factory();
        let parent = f
            .order_cancelled("order-1", OrderCancelled::default(), Some("corr-1"))
            .unwrap();
        let child = f
            .caused_by(&parent, "prod-1", StockUpdated::default())
            .unwrap();

        assert_eq!(child.correlation_id, "corr-1");
        assert_eq!(child.causation_id.as_deref(), Some(parent.event_id.as_str()));
        assert_ne!(child.event_id, parent.event_id);
    }
}
