//! Typed payloads, one per catalogued event type.
//!
//! Every payload carries the id of the aggregate it is about under its natural
//! name (`userId`, `orderId`, ...). The factory binds that field to the
//! envelope's aggregate id so the two can never disagree.
//!
//! Amounts are integer minor units of the shop currency.

use crate::event::EventType;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A business payload that can be stamped into an envelope.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The event type this payload belongs to.
    const EVENT_TYPE: EventType;

    /// Overwrite the payload's aggregate id field.
    fn bind_aggregate(&mut self, aggregate_id: &str);

    /// Fill in values the event type defines when the caller left them blank.
    fn apply_defaults(&mut self) {}
}

macro_rules! aggregate_payload {
    ($($name:ident => $field:ident),+ $(,)?) => {
        $(
            impl EventPayload for $name {
                const EVENT_TYPE: EventType = EventType::$name;

                fn bind_aggregate(&mut self, aggregate_id: &str) {
                    aggregate_id.clone_into(&mut self.$field);
                }
            }
        )+
    };
}

/// Free-form field changes keyed by field name.
pub type FieldChanges = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// User events
// ---------------------------------------------------------------------------

/// Default channel recorded for a registration.
pub const DEFAULT_REGISTRATION_SOURCE: &str = "web";

/// Payload of [`EventType::UserRegistered`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistered {
    /// The new user's id
    #[serde(default)]
    pub user_id: String,
    /// Login email
    pub email: String,
    /// Display name
    pub name: String,
    /// Contact number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Account role (e.g. `customer`, `admin`)
    #[serde(default = "default_role")]
    pub role: String,
    /// Whether the account can sign in; defaults to `true`
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Channel the user signed up through; defaults to `"web"`
    #[serde(default)]
    pub registration_source: String,
}

fn default_role() -> String {
    "customer".to_string()
}

const fn default_true() -> bool {
    true
}

impl Default for UserRegistered {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            email: String::new(),
            name: String::new(),
            phone: None,
            role: default_role(),
            is_active: true,
            registration_source: DEFAULT_REGISTRATION_SOURCE.to_string(),
        }
    }
}

impl EventPayload for UserRegistered {
    const EVENT_TYPE: EventType = EventType::UserRegistered;

    fn bind_aggregate(&mut self, aggregate_id: &str) {
        aggregate_id.clone_into(&mut self.user_id);
    }

    fn apply_defaults(&mut self) {
        if self.registration_source.trim().is_empty() {
            DEFAULT_REGISTRATION_SOURCE.clone_into(&mut self.registration_source);
        }
        if self.role.trim().is_empty() {
            self.role = default_role();
        }
    }
}

/// Payload of [`EventType::UserUpdated`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdated {
    /// The updated user's id
    #[serde(default)]
    pub user_id: String,
    /// New values of the changed fields
    pub changes: FieldChanges,
}

/// Payload of [`EventType::UserDeactivated`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDeactivated {
    /// The deactivated user's id
    #[serde(default)]
    pub user_id: String,
    /// Why the account was deactivated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Who deactivated it (self or an admin id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivated_by: Option<String>,
}

// ---------------------------------------------------------------------------
// Product events
// ---------------------------------------------------------------------------

/// Payload of [`EventType::ProductAdded`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductAdded {
    /// The product's id
    #[serde(default)]
    pub product_id: String,
    /// Display name
    pub name: String,
    /// Category slug
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Unit price
    pub price: i64,
    /// Initial on-hand stock
    pub stock: i64,
}

/// Payload of [`EventType::ProductUpdated`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductUpdated {
    /// The product's id
    #[serde(default)]
    pub product_id: String,
    /// New values of the changed fields
    pub changes: FieldChanges,
}

/// Payload of [`EventType::StockUpdated`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockUpdated {
    /// The product's id
    #[serde(default)]
    pub product_id: String,
    /// Stock before the change
    pub previous_stock: i64,
    /// Stock after the change
    pub new_stock: i64,
    /// What moved the stock (`order`, `restock`, `adjustment`, ...)
    pub reason: String,
}

impl StockUpdated {
    /// Signed difference between the new and previous stock.
    #[must_use]
    pub const fn delta(&self) -> i64 {
        self.new_stock - self.previous_stock
    }
}

/// Payload of [`EventType::LowStockAlert`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LowStockAlert {
    /// The product's id
    #[serde(default)]
    pub product_id: String,
    /// Display name, so alert consumers need no catalog lookup
    pub product_name: String,
    /// Stock at the time of the alert
    pub current_stock: i64,
    /// Reorder threshold that was crossed
    pub threshold: i64,
}

// ---------------------------------------------------------------------------
// Order events
// ---------------------------------------------------------------------------

/// One line of an order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLineItem {
    /// Ordered product
    pub product_id: String,
    /// Product name at the time of ordering
    pub product_name: String,
    /// Units ordered
    pub quantity: u32,
    /// Price per unit
    pub unit_price: i64,
    /// `quantity * unit_price`
    pub total_price: i64,
}

/// Where an order ships to.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    /// Recipient name
    pub recipient: String,
    /// Recipient phone
    pub phone: String,
    /// Postal code
    pub postal_code: String,
    /// Street address
    pub address: String,
    /// Unit, floor, building
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_detail: Option<String>,
}

/// Payload of [`EventType::OrderCreated`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    /// The order's id
    #[serde(default)]
    pub order_id: String,
    /// Human-facing order number
    pub order_number: String,
    /// Buyer
    pub user_id: String,
    /// Sum of line totals
    pub subtotal: i64,
    /// Shipping fee
    #[serde(default)]
    pub shipping_fee: i64,
    /// Discount applied
    #[serde(default)]
    pub discount_amount: i64,
    /// Amount charged
    pub total_amount: i64,
    /// Ordered lines
    pub items: Vec<OrderLineItem>,
    /// Delivery address
    pub shipping_address: ShippingAddress,
    /// Payment method chosen at checkout
    pub payment_method: String,
}

/// Payload of [`EventType::OrderPaymentCompleted`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPaymentCompleted {
    /// The order's id
    #[serde(default)]
    pub order_id: String,
    /// Human-facing order number
    pub order_number: String,
    /// Payment provider's key for the approved payment
    pub payment_key: String,
    /// Approved amount
    pub amount: i64,
    /// Payment method used
    pub method: String,
    /// When the provider approved the payment
    pub approved_at: DateTime<Utc>,
}

/// Payload of [`EventType::OrderStatusUpdated`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusUpdated {
    /// The order's id
    #[serde(default)]
    pub order_id: String,
    /// Status before the transition
    pub previous_status: String,
    /// Status after the transition
    pub new_status: String,
    /// Optional note (e.g. tracking number on shipment)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Payload of [`EventType::OrderCancelled`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    /// The order's id
    #[serde(default)]
    pub order_id: String,
    /// Cancellation reason
    pub reason: String,
    /// Who cancelled the order
    pub cancelled_by: String,
    /// Amount to refund
    #[serde(default)]
    pub refund_amount: i64,
}

// ---------------------------------------------------------------------------
// Cart events
// ---------------------------------------------------------------------------

/// Payload of [`EventType::CartItemAdded`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItemAdded {
    /// The cart's id
    #[serde(default)]
    pub cart_id: String,
    /// Owner, absent for guest carts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Added product
    pub product_id: String,
    /// Units added
    pub quantity: u32,
    /// Price per unit at the time of adding
    pub unit_price: i64,
}

/// Payload of [`EventType::CartAbandoned`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartAbandoned {
    /// The cart's id
    #[serde(default)]
    pub cart_id: String,
    /// Owner, absent for guest carts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Distinct items left in the cart
    pub item_count: u32,
    /// Value of the abandoned cart
    pub total_value: i64,
    /// Last interaction with the cart
    pub last_activity_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// System events
// ---------------------------------------------------------------------------

/// Payload of [`EventType::ServiceStarted`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStarted {
    /// The service instance id
    #[serde(default)]
    pub service_id: String,
    /// Logical service name
    pub service_name: String,
    /// Deployed version
    pub version: String,
    /// Host the instance runs on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Payload of [`EventType::ServiceStopped`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStopped {
    /// The service instance id
    #[serde(default)]
    pub service_id: String,
    /// Logical service name
    pub service_name: String,
    /// Why the instance stopped (`shutdown`, `crash`, ...)
    pub reason: String,
    /// Seconds the instance was up
    #[serde(default)]
    pub uptime_seconds: u64,
}

aggregate_payload! {
    UserUpdated => user_id,
    UserDeactivated => user_id,
    ProductAdded => product_id,
    ProductUpdated => product_id,
    StockUpdated => product_id,
    LowStockAlert => product_id,
    OrderCreated => order_id,
    OrderPaymentCompleted => order_id,
    OrderStatusUpdated => order_id,
    OrderCancelled => order_id,
    CartItemAdded => cart_id,
    CartAbandoned => cart_id,
    ServiceStarted => service_id,
    ServiceStopped => service_id,
}
