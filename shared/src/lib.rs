use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod broker;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod shutdown;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::BrokerError;

/// Routing keys used on the order exchange. The routing key of a message is
/// always its event type.
pub mod event_types {
    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_PROCESSING: &str = "order.processing";
    pub const ORDER_COMPLETED: &str = "order.completed";
    pub const ORDER_FAILED: &str = "order.failed";

    pub const STATUS_EVENTS: [&str; 3] = [ORDER_PROCESSING, ORDER_COMPLETED, ORDER_FAILED];
}

/// Wire envelope: `{"type": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new<T: Serialize>(event_type: impl Into<String>, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type: event_type.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Processing,
    Completed,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            OrderStatus::Created => event_types::ORDER_CREATED,
            OrderStatus::Processing => event_types::ORDER_PROCESSING,
            OrderStatus::Completed => event_types::ORDER_COMPLETED,
            OrderStatus::Failed => event_types::ORDER_FAILED,
        }
    }

    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            event_types::ORDER_CREATED => Some(OrderStatus::Created),
            event_types::ORDER_PROCESSING => Some(OrderStatus::Processing),
            event_types::ORDER_COMPLETED => Some(OrderStatus::Completed),
            event_types::ORDER_FAILED => Some(OrderStatus::Failed),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            OrderStatus::Created => 0,
            OrderStatus::Processing => 1,
            OrderStatus::Completed | OrderStatus::Failed => 2,
        }
    }

    /// Status only moves forward. Re-applying the current status is allowed;
    /// one terminal status never replaces the other.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        *self == next || next.rank() > self.rank()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    /// Accepts both the stored form (`PROCESSING`) and the event form
    /// (`order.processing`), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let name = normalized.strip_prefix("order.").unwrap_or(&normalized);
        match name {
            "created" => Ok(OrderStatus::Created),
            "processing" => Ok(OrderStatus::Processing),
            "completed" => Ok(OrderStatus::Completed),
            "failed" => Ok(OrderStatus::Failed),
            _ => Err(format!("unknown order status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: String,
    #[serde(default)]
    pub name: String,
    pub quantity: i32,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub items: Vec<CartItem>,
    pub total: i64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(items: Vec<CartItem>, total: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            items,
            total,
            status: OrderStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the status and moves `updated_at` forward. The new timestamp is
    /// strictly greater than the previous one even if the wall clock has not
    /// advanced (or has stepped back).
    pub fn touch(&mut self, status: OrderStatus) {
        let now = Utc::now();
        let floor = self.updated_at + chrono::Duration::microseconds(1);
        self.status = status;
        self.updated_at = if now > floor { now } else { floor };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Processed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Processed => "processed",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn order_status(&self) -> OrderStatus {
        match self {
            PaymentStatus::Processed => OrderStatus::Completed,
            PaymentStatus::Failed => OrderStatus::Failed,
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processed" => Ok(PaymentStatus::Processed),
            "failed" => Ok(PaymentStatus::Failed),
            _ => Err(format!("unknown payment status: {}", s)),
        }
    }
}

/// One payment per order: the payment id is the order id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub amount: i64,
    pub status: PaymentStatus,
    pub processed_at: DateTime<Utc>,
}

impl Payment {
    pub fn new(order_id: Uuid, amount: i64, status: PaymentStatus) -> Self {
        Self {
            id: order_id,
            order_id,
            amount,
            status,
            processed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_envelope_uses_type_field() {
        let event = Event::new(event_types::ORDER_CREATED, &serde_json::json!({"id": "x"})).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "order.created");
        assert_eq!(json["payload"]["id"], "x");
    }

    #[test]
    fn decode_rejects_missing_type() {
        assert!(Event::decode(br#"{"payload": {}}"#).is_err());
        assert!(Event::decode(b"not json").is_err());
    }

    #[test]
    fn status_parses_stored_and_event_forms() {
        assert_eq!("PROCESSING".parse::<OrderStatus>().unwrap(), OrderStatus::Processing);
        assert_eq!("order.completed".parse::<OrderStatus>().unwrap(), OrderStatus::Completed);
        assert_eq!(" failed ".parse::<OrderStatus>().unwrap(), OrderStatus::Failed);
        assert!("shipped".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn status_maps_to_event_type() {
        for status in [OrderStatus::Created, OrderStatus::Processing, OrderStatus::Completed, OrderStatus::Failed] {
            assert_eq!(OrderStatus::from_event_type(status.event_type()), Some(status));
        }
        assert_eq!(OrderStatus::from_event_type("order.shipped"), None);
    }

    #[test]
    fn transitions_are_monotonic() {
        use OrderStatus::*;
        assert!(Created.can_transition_to(Processing));
        assert!(Created.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Created));
    }

    #[test]
    fn touch_strictly_advances_updated_at() {
        let mut order = Order::new(vec![], 0);
        let created_at = order.created_at;
        order.updated_at = Utc::now() + chrono::Duration::hours(1);
        let before = order.updated_at;

        order.touch(OrderStatus::Processing);

        assert!(order.updated_at > before);
        assert_eq!(order.created_at, created_at);
        assert_eq!(order.status, OrderStatus::Processing);
    }

    #[test]
    fn payment_id_is_order_id() {
        let order_id = Uuid::new_v4();
        let payment = Payment::new(order_id, 21, PaymentStatus::Processed);
        assert_eq!(payment.id, order_id);
        assert_eq!(payment.status.order_status(), OrderStatus::Completed);
        let json = serde_json::to_value(&payment).unwrap();
        assert_eq!(json["status"], "processed");
    }
}
