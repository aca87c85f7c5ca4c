// ============================================================================
// Orders Storage
// ============================================================================
//
// Writes go through whatever query engine the context resolves to, so the
// same repository works inside a unit of work and against the bare pool.
// Callers that need the order and its outbox row to land together must wrap
// both calls in one `TransactionManager::run`.
//
// ============================================================================

mod orders;

pub use orders::OrdersRepository;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Error;
use crate::models::{Order, OrderId, OutboxMessage};

pub const ORDERS_TABLE: &str = "orders";
pub const OUTBOX_TABLE: &str = "outbox";

pub const ORDER_EVENTS_TOPIC: &str = "order-events";

#[async_trait]
pub trait OrdersStorage: Send + Sync {
    /// Fails with `Error::AlreadyExists` when the order id is taken.
    async fn create_order(&self, ctx: &Context, order: &Order) -> Result<(), Error>;

    /// Records the `OrderCreated` event for `order`.
    async fn create_outbox_message(&self, ctx: &Context, order: &Order) -> Result<(), Error>;

    async fn get_order(&self, ctx: &Context, id: OrderId) -> Result<Option<Order>, Error>;

    async fn outbox_messages(
        &self,
        ctx: &Context,
        order_id: OrderId,
    ) -> Result<Vec<OutboxMessage>, Error>;
}
