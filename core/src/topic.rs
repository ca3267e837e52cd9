//! Logical topics and event-type routing.
//!
//! Every domain event lands on one of five logical topics, chosen by the prefix
//! of its event type name. A sixth topic, the dead-letter queue, receives
//! messages whose processing permanently failed; it is never chosen by the
//! prefix rule.
//!
//! | Prefix                               | Topic            |
//! |--------------------------------------|------------------|
//! | `User`                               | `user-events`    |
//! | `Product`, `Stock`, `LowStock`       | `product-events` |
//! | `Order`                              | `order-events`   |
//! | `Cart`                               | `cart-events`    |
//! | `Service`                            | `system-events`  |
//! | anything else                        | `system-events`  |
//!
//! Concrete topic names are looked up through a [`TopicRegistry`], which lets
//! a deployment isolate environments with a shared prefix
//! (`staging.order-events`) without touching call sites.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical topic on the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    /// User lifecycle events.
    UserEvents,
    /// Catalog and inventory events.
    ProductEvents,
    /// Order lifecycle events.
    OrderEvents,
    /// Shopping cart events.
    CartEvents,
    /// Service lifecycle events and anything unrecognized.
    SystemEvents,
    /// Terminal sink for messages that exhausted their retries.
    DeadLetterQueue,
}

impl Topic {
    /// All topics, in registry order.
    pub const ALL: [Self; 6] = [
        Self::UserEvents,
        Self::ProductEvents,
        Self::OrderEvents,
        Self::CartEvents,
        Self::SystemEvents,
        Self::DeadLetterQueue,
    ];

    /// The unprefixed topic name.
    #[must_use]
    pub const fn default_name(self) -> &'static str {
        match self {
            Self::UserEvents => "user-events",
            Self::ProductEvents => "product-events",
            Self::OrderEvents => "order-events",
            Self::CartEvents => "cart-events",
            Self::SystemEvents => "system-events",
            Self::DeadLetterQueue => "dead-letter-queue",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::UserEvents => 0,
            Self::ProductEvents => 1,
            Self::OrderEvents => 2,
            Self::CartEvents => 3,
            Self::SystemEvents => 4,
            Self::DeadLetterQueue => 5,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_name())
    }
}

/// Resolve the logical topic for an event type name using the prefix rule.
///
/// Unknown names resolve to [`Topic::SystemEvents`] and log a warning so
/// that a typo in an event type never silently drops out of routing.
///
/// # Examples
///
/// ```
/// use commerce_events_core::topic::{Topic, topic_for_event_type};
///
/// assert_eq!(topic_for_event_type("OrderCreated"), Topic::OrderEvents);
/// assert_eq!(topic_for_event_type("LowStockAlert"), Topic::ProductEvents);
/// assert_eq!(topic_for_event_type("FooBarEvent"), Topic::SystemEvents);
/// ```
#[must_use]
pub fn topic_for_event_type(event_type: &str) -> Topic {
    match classify(event_type) {
        Some(topic) => topic,
        None => {
            tracing::warn!(
                event_type = %event_type,
                fallback = Topic::SystemEvents.default_name(),
                "Unknown event type prefix, routing to system topic"
            );
            Topic::SystemEvents
        },
    }
}

fn classify(event_type: &str) -> Option<Topic> {
    const RULES: [(&str, Topic); 6] = [
        ("User", Topic::UserEvents),
        ("Product", Topic::ProductEvents),
        ("Stock", Topic::ProductEvents),
        ("LowStock", Topic::ProductEvents),
        ("Order", Topic::OrderEvents),
        ("Cart", Topic::CartEvents),
    ];

    if event_type.starts_with("Service") {
        return Some(Topic::SystemEvents);
    }

    RULES
        .iter()
        .find(|(prefix, _)| event_type.starts_with(prefix))
        .map(|(_, topic)| *topic)
}

/// Maps logical topics to the concrete names used on the broker.
///
/// # Example
///
/// ```
/// use commerce_events_core::topic::{Topic, TopicRegistry};
///
/// let registry = TopicRegistry::with_prefix("staging");
/// assert_eq!(registry.name(Topic::OrderEvents), "staging.order-events");
/// assert_eq!(registry.resolve("CartAbandoned"), "staging.cart-events");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicRegistry {
    names: [String; 6],
}

impl TopicRegistry {
    /// Registry using the default topic names.
    #[must_use]
    pub fn new() -> Self {
        Self {
            names: Topic::ALL.map(|topic| topic.default_name().to_string()),
        }
    }

    /// Registry whose names are `{prefix}.{default name}`.
    ///
    /// An empty prefix yields the default names.
    #[must_use]
    pub fn with_prefix(prefix: &str) -> Self {
        if prefix.is_empty() {
            return Self::new();
        }
        Self {
            names: Topic::ALL.map(|topic| format!("{prefix}.{}", topic.default_name())),
        }
    }

    /// Concrete name of a logical topic.
    #[must_use]
    pub fn name(&self, topic: Topic) -> &str {
        &self.names[topic.index()]
    }

    /// Concrete topic name for an event type, via [`topic_for_event_type`].
    #[must_use]
    pub fn resolve(&self, event_type: &str) -> &str {
        self.name(topic_for_event_type(event_type))
    }

    /// Reverse lookup from a concrete name.
    #[must_use]
    pub fn topic_for_name(&self, name: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|topic| self.name(*topic) == name)
    }

    /// Concrete name of the dead-letter topic.
    #[must_use]
    pub fn dead_letter(&self) -> &str {
        self.name(Topic::DeadLetterQueue)
    }

    /// Concrete names of the five event topics (everything except the DLQ).
    #[must_use]
    pub fn event_topics(&self) -> Vec<String> {
        Topic::ALL
            .into_iter()
            .filter(|topic| *topic != Topic::DeadLetterQueue)
            .map(|topic| self.name(topic).to_string())
            .collect()
    }
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}
