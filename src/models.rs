use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// 128-bit random order identity. Unique by construction, but collisions are
/// still handled by the storage layer's primary key.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct OrderId(pub Uuid);

impl OrderId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct UserId(pub u64);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SkuId(pub u64);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct WarehouseId(pub u64);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct DeliveryVariantId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for SkuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Domain Models
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Item {
    pub sku: SkuId,
    pub quantity: u32,
    pub warehouse_id: WarehouseId,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeliveryInfo {
    pub delivery_variant_id: DeliveryVariantId,
    pub delivery_date: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub items: Vec<Item>,
    pub delivery: DeliveryInfo,
}

/// Fractional-second digits a TIMESTAMPTZ column keeps.
pub(crate) const TIMESTAMP_PRECISION: u16 = 6;

impl Order {
    /// The delivery date is truncated to microseconds so the order reads
    /// back from storage exactly as it was created.
    pub fn new(user_id: UserId, items: Vec<Item>, mut delivery: DeliveryInfo) -> Self {
        delivery.delivery_date = delivery.delivery_date.trunc_subsecs(TIMESTAMP_PRECISION);
        Self {
            id: OrderId::generate(),
            user_id,
            items,
            delivery,
        }
    }
}

// ============================================================================
// Domain Events
// These are written to the outbox in the same unit of work as the entity
// ============================================================================

/// Base trait for events that end up in the outbox
pub trait DomainEvent: Serialize {
    fn event_type(&self) -> &'static str;
    fn aggregate_type(&self) -> &'static str;
    fn aggregate_id(&self) -> Uuid;
    fn timestamp(&self) -> DateTime<Utc>;
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderCreatedEvent {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub items: Vec<Item>,
    pub delivery: DeliveryInfo,
    pub timestamp: DateTime<Utc>,
}

impl OrderCreatedEvent {
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.id,
            user_id: order.user_id,
            items: order.items.clone(),
            delivery: order.delivery.clone(),
            timestamp: Utc::now(),
        }
    }
}

impl DomainEvent for OrderCreatedEvent {
    fn event_type(&self) -> &'static str {
        "OrderCreated"
    }

    fn aggregate_type(&self) -> &'static str {
        "Order"
    }

    fn aggregate_id(&self) -> Uuid {
        self.order_id.0
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// A pending outbox row as read back from the store.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub topic: String,
    pub partition_key: String,
    pub created_at: DateTime<Utc>,
    pub attempts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order() -> Order {
        Order::new(
            UserId(7),
            vec![Item {
                sku: SkuId(1001),
                quantity: 2,
                warehouse_id: WarehouseId(3),
            }],
            DeliveryInfo {
                delivery_variant_id: DeliveryVariantId(9),
                delivery_date: Utc::now(),
            },
        )
    }

    #[test]
    fn test_delivery_date_keeps_microseconds_only() {
        use chrono::TimeZone;

        let precise = Utc.timestamp_opt(1_790_000_000, 123_456_789).unwrap();
        let order = Order::new(
            UserId(7),
            Vec::new(),
            DeliveryInfo {
                delivery_variant_id: DeliveryVariantId(9),
                delivery_date: precise,
            },
        );

        assert_eq!(order.delivery.delivery_date.timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(order.delivery.delivery_date.timestamp(), 1_790_000_000);
    }

    #[test]
    fn test_generated_order_ids_differ() {
        assert_ne!(OrderId::generate(), OrderId::generate());
    }

    #[test]
    fn test_order_created_event_mirrors_order() {
        let order = sample_order();
        let event = OrderCreatedEvent::from_order(&order);

        assert_eq!(event.order_id, order.id);
        assert_eq!(event.aggregate_id(), order.id.0);
        assert_eq!(event.items, order.items);
        assert_eq!(event.event_type(), "OrderCreated");
        assert_eq!(event.aggregate_type(), "Order");
    }

    #[test]
    fn test_item_serializes_ids_as_plain_numbers() {
        let order = sample_order();
        let json = serde_json::to_value(&order.items).unwrap();

        assert_eq!(json[0]["sku"], 1001);
        assert_eq!(json[0]["warehouse_id"], 3);
        assert_eq!(json[0]["quantity"], 2);
    }
}
