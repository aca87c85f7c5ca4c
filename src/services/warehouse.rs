use async_trait::async_trait;
use std::time::Duration;

use crate::context::{Context, DeadlineExceeded};
use crate::models::{Item, SkuId, UserId};

#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    #[error("stock declined for sku {sku}: {reason}")]
    Declined { sku: SkuId, reason: String },

    #[error("warehouse call aborted: {0}")]
    DeadlineExceeded(#[from] DeadlineExceeded),

    #[error("warehouse unavailable: {0}")]
    Unavailable(String),
}

/// Remote stock reservation. Runs before, and outside of, any unit of work.
#[async_trait]
pub trait StockReservation: Send + Sync {
    async fn reserve_stocks(
        &self,
        ctx: &Context,
        user_id: UserId,
        items: &[Item],
    ) -> Result<(), ReservationError>;
}

/// Stand-in for the warehouse management service: waits a fixed latency and
/// accepts every reservation.
#[derive(Debug, Clone)]
pub struct WarehouseClient {
    latency: Duration,
}

impl Default for WarehouseClient {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(50),
        }
    }
}

impl WarehouseClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl StockReservation for WarehouseClient {
    async fn reserve_stocks(
        &self,
        ctx: &Context,
        user_id: UserId,
        items: &[Item],
    ) -> Result<(), ReservationError> {
        ctx.guard(tokio::time::sleep(self.latency)).await?;

        tracing::info!(
            user_id = %user_id,
            item_count = items.len(),
            "Stock reserved"
        );
        Ok(())
    }
}
