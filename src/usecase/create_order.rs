use std::sync::Arc;

use crate::context::Context;
use crate::db::{AccessMode, ConnectionProvider};
use crate::error::Error;
use crate::models::{DeliveryInfo, Item, Order, OrderId, UserId};
use crate::repository::OrdersStorage;
use crate::services::StockReservation;
use crate::transaction::TransactionManager;
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

// ============================================================================
// Create Order Workflow
// ============================================================================
//
// 1. validate the request
// 2. reserve stock (outside any transaction)
// 3. insert order + outbox message in one read-committed unit of work
// 4. on id collision, regenerate the id and run step 3 again
//
// Reservation is not compensated if persistence fails afterwards.
//
// ============================================================================

const OP: &str = "orders_usecase.create_order";

#[derive(Debug, Clone, PartialEq)]
pub struct CreateOrderInfo {
    pub items: Vec<Item>,
    pub delivery: DeliveryInfo,
}

impl CreateOrderInfo {
    pub fn validate(&self) -> Result<(), Error> {
        if self.items.is_empty() {
            return Err(Error::InvalidRequest {
                op: OP,
                reason: "order must contain at least one item".to_string(),
            });
        }
        if let Some(item) = self.items.iter().find(|item| item.quantity == 0) {
            return Err(Error::InvalidRequest {
                op: OP,
                reason: format!("item with sku {} has zero quantity", item.sku),
            });
        }
        Ok(())
    }
}

pub struct OrdersUsecase<P> {
    tm: Arc<TransactionManager<P>>,
    warehouse: Arc<dyn StockReservation>,
    storage: Arc<dyn OrdersStorage>,
    retry: RetryConfig,
}

impl<P: ConnectionProvider> OrdersUsecase<P> {
    pub fn new(
        tm: Arc<TransactionManager<P>>,
        warehouse: Arc<dyn StockReservation>,
        storage: Arc<dyn OrdersStorage>,
    ) -> Self {
        Self {
            tm,
            warehouse,
            storage,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the persisted order, carrying whichever id won.
    pub async fn create_order(
        &self,
        ctx: &Context,
        user_id: UserId,
        info: CreateOrderInfo,
    ) -> Result<Order, Error> {
        info.validate()?;

        self.warehouse
            .reserve_stocks(ctx, user_id, &info.items)
            .await
            .map_err(|source| {
                tracing::error!(user_id = %user_id, error = %source, "Stock reservation failed");
                Error::ReservationFailed {
                    op: "warehouse.reserve_stocks",
                    source,
                }
            })?;

        let mut order = Order::new(user_id, info.items, info.delivery);

        let result = retry_on_transient(ctx, self.retry.clone(), |attempt| {
            if attempt > 1 {
                let previous = order.id;
                order.id = OrderId::generate();
                tracing::info!(
                    attempt = attempt,
                    previous_id = %previous,
                    order_id = %order.id,
                    "Order id collided, regenerated"
                );
            }
            let order = order.clone();
            self.persist(ctx, order)
        })
        .await;

        match result {
            RetryResult::Success(order) => {
                tracing::info!(
                    order_id = %order.id,
                    user_id = %order.user_id,
                    item_count = order.items.len(),
                    "Order created"
                );
                Ok(order)
            }
            RetryResult::PermanentFailure(err) => Err(err),
            RetryResult::Failed {
                last_error,
                attempts,
            } => Err(Error::RetriesExhausted {
                op: OP,
                attempts,
                source: Box::new(last_error),
            }),
        }
    }

    /// Order row and outbox row, atomically.
    async fn persist(&self, ctx: &Context, order: Order) -> Result<Order, Error> {
        let storage = &self.storage;
        self.tm
            .run_read_committed(ctx, AccessMode::ReadWrite, |tx_ctx| async move {
                storage.create_order(&tx_ctx, &order).await?;
                storage.create_outbox_message(&tx_ctx, &order).await?;
                Ok::<_, Error>(order)
            })
            .await
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
