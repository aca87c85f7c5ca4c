use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orders_outbox::db::{PgConnectionProvider, QueryEngine, Statement};
use orders_outbox::models::{DeliveryInfo, DeliveryVariantId, Item, SkuId, UserId, WarehouseId};
use orders_outbox::repository::{OrdersRepository, OrdersStorage};
use orders_outbox::services::WarehouseClient;
use orders_outbox::{AppConfig, Context, CreateOrderInfo, OrdersUsecase, TransactionManager};

const CREATE_ORDERS_TABLE: &str = "CREATE TABLE IF NOT EXISTS orders (\
     id UUID PRIMARY KEY, \
     user_id BIGINT NOT NULL, \
     items JSONB NOT NULL, \
     delivery_variant_id BIGINT NOT NULL, \
     delivery_date TIMESTAMPTZ NOT NULL)";

const CREATE_OUTBOX_TABLE: &str = "CREATE TABLE IF NOT EXISTS outbox (\
     id UUID PRIMARY KEY, \
     aggregate_id UUID NOT NULL, \
     aggregate_type TEXT NOT NULL, \
     event_type TEXT NOT NULL, \
     payload JSONB NOT NULL, \
     topic TEXT NOT NULL, \
     partition_key TEXT NOT NULL, \
     created_at TIMESTAMPTZ NOT NULL, \
     attempts BIGINT NOT NULL DEFAULT 0)";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    // RUST_LOG wins over the configured filter
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .init();

    tracing::info!("Starting orders outbox service");

    // === 1. Connection pool ===
    let provider = Arc::new(PgConnectionProvider::connect(&config.database).await?);
    let ctx = Context::background().with_timeout(config.orders.request_timeout());
    provider.ping(&ctx).await?;

    // Demo tables
    provider.execute(&ctx, &Statement::raw(CREATE_ORDERS_TABLE)).await?;
    provider.execute(&ctx, &Statement::raw(CREATE_OUTBOX_TABLE)).await?;

    // === 2. Wiring ===
    let tm = Arc::new(TransactionManager::new(provider.clone()));
    let repository = Arc::new(OrdersRepository::new(tm.clone()));
    let warehouse = Arc::new(WarehouseClient::new());
    let usecase = OrdersUsecase::new(tm, warehouse, repository.clone())
        .with_retry(config.orders.retry_config());

    // === 3. Create one order ===
    let request = CreateOrderInfo {
        items: vec![
            Item {
                sku: SkuId(1001),
                quantity: 2,
                warehouse_id: WarehouseId(1),
            },
            Item {
                sku: SkuId(2002),
                quantity: 1,
                warehouse_id: WarehouseId(1),
            },
        ],
        delivery: DeliveryInfo {
            delivery_variant_id: DeliveryVariantId(1),
            delivery_date: Utc::now() + ChronoDuration::days(2),
        },
    };

    let ctx = Context::background().with_timeout(config.orders.request_timeout());
    match usecase.create_order(&ctx, UserId(1), request).await {
        Ok(order) => {
            let messages = repository.outbox_messages(&ctx, order.id).await?;
            tracing::info!(
                order_id = %order.id,
                outbox_messages = messages.len(),
                "Demo order persisted"
            );
        }
        Err(e) => {
            tracing::error!(
                kind = %e.kind(),
                operation = e.operation(),
                error = %e,
                "Demo order failed"
            );
            provider.close().await;
            return Err(e.into());
        }
    }

    provider.close().await;
    tracing::info!("Done");
    Ok(())
}
