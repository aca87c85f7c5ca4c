use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::{OrdersStorage, ORDERS_TABLE, ORDER_EVENTS_TOPIC, OUTBOX_TABLE};
use crate::context::Context;
use crate::db::{Insert, Row, Select, StoreError};
use crate::error::Error;
use crate::models::{
    DeliveryInfo, DeliveryVariantId, DomainEvent, Order, OrderCreatedEvent, OrderId, OutboxMessage,
    UserId, TIMESTAMP_PRECISION,
};
use crate::transaction::QueryEngineProvider;

const ORDER_COLUMNS: &[&str] = &["id", "user_id", "items", "delivery_variant_id", "delivery_date"];

/// Orders and their outbox rows, stored through the ambient query engine.
#[derive(Clone)]
pub struct OrdersRepository {
    engines: Arc<dyn QueryEngineProvider>,
}

impl OrdersRepository {
    pub fn new(engines: Arc<dyn QueryEngineProvider>) -> Self {
        Self { engines }
    }
}

#[async_trait]
impl OrdersStorage for OrdersRepository {
    async fn create_order(&self, ctx: &Context, order: &Order) -> Result<(), Error> {
        const OP: &str = "orders_storage.create_order";

        let stmt = order_insert(order).map_err(|source| Error::StoreUnavailable { op: OP, source })?;
        self.engines
            .query_engine(ctx)
            .execute(ctx, &stmt.into())
            .await
            .map_err(|source| Error::from_store(OP, order.id, source))?;

        tracing::debug!(order_id = %order.id, user_id = %order.user_id, "Order row inserted");
        Ok(())
    }

    async fn create_outbox_message(&self, ctx: &Context, order: &Order) -> Result<(), Error> {
        const OP: &str = "orders_storage.create_outbox_message";

        let event = OrderCreatedEvent::from_order(order);
        let stmt = outbox_insert(&event).map_err(|source| Error::StoreUnavailable { op: OP, source })?;
        self.engines
            .query_engine(ctx)
            .execute(ctx, &stmt.into())
            .await
            .map_err(|source| Error::StoreUnavailable { op: OP, source })?;

        tracing::debug!(
            order_id = %order.id,
            event_type = event.event_type(),
            "Outbox message inserted"
        );
        Ok(())
    }

    async fn get_order(&self, ctx: &Context, id: OrderId) -> Result<Option<Order>, Error> {
        const OP: &str = "orders_storage.get_order";

        let stmt = Select::from_table(ORDERS_TABLE)
            .columns(ORDER_COLUMNS)
            .filter_eq("id", id.0);
        let row = match self.engines.query_engine(ctx).fetch_one(ctx, &stmt.into()).await {
            Ok(row) => row,
            Err(StoreError::NotFound) => return Ok(None),
            Err(source) => return Err(Error::StoreUnavailable { op: OP, source }),
        };

        order_from_row(&row)
            .map(Some)
            .map_err(|source| Error::StoreUnavailable { op: OP, source })
    }

    async fn outbox_messages(
        &self,
        ctx: &Context,
        order_id: OrderId,
    ) -> Result<Vec<OutboxMessage>, Error> {
        const OP: &str = "orders_storage.outbox_messages";

        let stmt = Select::from_table(OUTBOX_TABLE)
            .filter_eq("aggregate_id", order_id.0)
            .order_by("created_at");
        let rows = self
            .engines
            .query_engine(ctx)
            .fetch_many(ctx, &stmt.into())
            .await
            .map_err(|source| Error::StoreUnavailable { op: OP, source })?;

        rows.iter()
            .map(outbox_from_row)
            .collect::<Result<_, _>>()
            .map_err(|source| Error::StoreUnavailable { op: OP, source })
    }
}

// ============================================================================
// Row Mapping
// ============================================================================

fn order_insert(order: &Order) -> Result<Insert, StoreError> {
    let items = serde_json::to_value(&order.items).map_err(|e| StoreError::Encode {
        column: "items".to_string(),
        reason: e.to_string(),
    })?;

    Ok(Insert::into_table(ORDERS_TABLE)
        .value("id", order.id.0)
        .value("user_id", to_db_int("user_id", order.user_id.0)?)
        .value("items", items)
        .value(
            "delivery_variant_id",
            to_db_int("delivery_variant_id", order.delivery.delivery_variant_id.0)?,
        )
        .value("delivery_date", order.delivery.delivery_date))
}

fn outbox_insert(event: &OrderCreatedEvent) -> Result<Insert, StoreError> {
    let payload = serde_json::to_value(event).map_err(|e| StoreError::Encode {
        column: "payload".to_string(),
        reason: e.to_string(),
    })?;

    Ok(Insert::into_table(OUTBOX_TABLE)
        .value("id", Uuid::now_v7())
        .value("aggregate_id", event.aggregate_id())
        .value("aggregate_type", event.aggregate_type())
        .value("event_type", event.event_type())
        .value("payload", payload)
        .value("topic", ORDER_EVENTS_TOPIC)
        .value("partition_key", event.order_id.to_string())
        .value("created_at", Utc::now().trunc_subsecs(TIMESTAMP_PRECISION))
        .value("attempts", 0i64))
}

fn order_from_row(row: &Row) -> Result<Order, StoreError> {
    let items = serde_json::from_value(row.get::<serde_json::Value>("items")?).map_err(|e| {
        StoreError::Decode {
            column: "items".to_string(),
            reason: e.to_string(),
        }
    })?;

    Ok(Order {
        id: OrderId(row.get("id")?),
        user_id: UserId(from_db_int("user_id", row.get("user_id")?)?),
        items,
        delivery: DeliveryInfo {
            delivery_variant_id: DeliveryVariantId(from_db_int(
                "delivery_variant_id",
                row.get("delivery_variant_id")?,
            )?),
            delivery_date: row.get("delivery_date")?,
        },
    })
}

fn outbox_from_row(row: &Row) -> Result<OutboxMessage, StoreError> {
    Ok(OutboxMessage {
        id: row.get("id")?,
        aggregate_id: row.get("aggregate_id")?,
        aggregate_type: row.get("aggregate_type")?,
        event_type: row.get("event_type")?,
        payload: row.get("payload")?,
        topic: row.get("topic")?,
        partition_key: row.get("partition_key")?,
        created_at: row.get("created_at")?,
        attempts: row.get("attempts")?,
    })
}

/// Identifiers are unsigned in the domain and BIGINT in the schema.
fn to_db_int(column: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Encode {
        column: column.to_string(),
        reason: format!("{value} does not fit in BIGINT"),
    })
}

fn from_db_int(column: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Decode {
        column: column.to_string(),
        reason: format!("negative identifier {value}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AccessMode, MemoryStore};
    use crate::models::{Item, SkuId, WarehouseId};
    use crate::transaction::TransactionManager;
    use chrono::TimeZone;

    fn store() -> MemoryStore {
        MemoryStore::new()
            .with_table(ORDERS_TABLE, "id")
            .with_table(OUTBOX_TABLE, "id")
    }

    fn sample_order() -> Order {
        Order::new(
            UserId(42),
            vec![
                Item {
                    sku: SkuId(1001),
                    quantity: 2,
                    warehouse_id: WarehouseId(1),
                },
                Item {
                    sku: SkuId(2002),
                    quantity: 1,
                    warehouse_id: WarehouseId(2),
                },
            ],
            DeliveryInfo {
                delivery_variant_id: DeliveryVariantId(5),
                delivery_date: Utc.with_ymd_and_hms(2026, 11, 2, 10, 0, 0).unwrap(),
            },
        )
    }

    fn wire(store: &MemoryStore) -> (Arc<TransactionManager<MemoryStore>>, OrdersRepository) {
        let tm = Arc::new(TransactionManager::new(Arc::new(store.clone())));
        let repo = OrdersRepository::new(tm.clone());
        (tm, repo)
    }

    #[tokio::test]
    async fn test_create_and_get_order() {
        let store = store();
        let (_tm, repo) = wire(&store);
        let ctx = Context::background();
        let order = sample_order();

        repo.create_order(&ctx, &order).await.unwrap();

        let loaded = repo.get_order(&ctx, order.id).await.unwrap();
        assert_eq!(loaded, Some(order));
    }

    #[tokio::test]
    async fn test_missing_order_is_none() {
        let store = store();
        let (_tm, repo) = wire(&store);

        let loaded = repo
            .get_order(&Context::background(), OrderId::generate())
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_already_exists() {
        let store = store();
        let (_tm, repo) = wire(&store);
        let ctx = Context::background();
        let order = sample_order();

        repo.create_order(&ctx, &order).await.unwrap();
        let err = repo.create_order(&ctx, &order).await.unwrap_err();

        match err {
            Error::AlreadyExists { op, order_id } => {
                assert_eq!(op, "orders_storage.create_order");
                assert_eq!(order_id, order.id);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.row_count(ORDERS_TABLE), 1);
    }

    #[tokio::test]
    async fn test_other_store_errors_are_not_classified() {
        // No orders table registered: the store rejects the statement.
        let store = MemoryStore::new().with_table(OUTBOX_TABLE, "id");
        let (_tm, repo) = wire(&store);

        let err = repo
            .create_order(&Context::background(), &sample_order())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::StoreUnavailable {
                op: "orders_storage.create_order",
                source: StoreError::Unsupported(_),
            }
        ));
    }

    #[tokio::test]
    async fn test_outbox_message_describes_order() {
        let store = store();
        let (_tm, repo) = wire(&store);
        let ctx = Context::background();
        let order = sample_order();

        repo.create_outbox_message(&ctx, &order).await.unwrap();

        let messages = repo.outbox_messages(&ctx, order.id).await.unwrap();
        assert_eq!(messages.len(), 1);

        let message = &messages[0];
        assert_eq!(message.aggregate_id, order.id.0);
        assert_eq!(message.aggregate_type, "Order");
        assert_eq!(message.event_type, "OrderCreated");
        assert_eq!(message.topic, ORDER_EVENTS_TOPIC);
        assert_eq!(message.partition_key, order.id.to_string());
        assert_eq!(message.attempts, 0);

        let event: OrderCreatedEvent = serde_json::from_value(message.payload.clone()).unwrap();
        assert_eq!(event.order_id, order.id);
        assert_eq!(event.items, order.items);
    }

    #[tokio::test]
    async fn test_order_and_outbox_commit_together() {
        let store = store();
        let (tm, repo) = wire(&store);
        let ctx = Context::background();
        let order = sample_order();

        let repo_ref = &repo;
        let order_ref = &order;
        tm.run_read_committed(&ctx, AccessMode::ReadWrite, |tx_ctx| async move {
            repo_ref.create_order(&tx_ctx, order_ref).await?;
            repo_ref.create_outbox_message(&tx_ctx, order_ref).await?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap();

        assert!(repo.get_order(&ctx, order.id).await.unwrap().is_some());
        assert_eq!(repo.outbox_messages(&ctx, order.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_between_inserts_leaves_no_rows() {
        let store = store();
        let (tm, repo) = wire(&store);
        let ctx = Context::background();
        let order = sample_order();

        let repo_ref = &repo;
        let order_ref = &order;
        let result = tm
            .run_read_committed(&ctx, AccessMode::ReadWrite, |tx_ctx| async move {
                repo_ref.create_order(&tx_ctx, order_ref).await?;
                // Visible inside the unit of work.
                assert!(repo_ref.get_order(&tx_ctx, order_ref.id).await?.is_some());
                Err::<(), _>(Error::StoreUnavailable {
                    op: "test.between_inserts",
                    source: StoreError::ConnectionLost("forced".to_string()),
                })
            })
            .await;

        assert!(matches!(result, Err(Error::StoreUnavailable { .. })));
        assert!(repo.get_order(&ctx, order.id).await.unwrap().is_none());
        assert!(repo.outbox_messages(&ctx, order.id).await.unwrap().is_empty());
        assert_eq!(store.row_count(ORDERS_TABLE), 0);
        assert_eq!(store.row_count(OUTBOX_TABLE), 0);
    }

    #[test]
    fn test_identifier_out_of_range_is_encode_error() {
        let mut order = sample_order();
        order.user_id = UserId(u64::MAX);

        let err = order_insert(&order).unwrap_err();
        assert!(matches!(err, StoreError::Encode { column, .. } if column == "user_id"));
    }

    #[tokio::test]
    async fn test_concurrent_creates_of_same_order_id() {
        let store = store();
        let (tm, repo) = wire(&store);
        let ctx = Context::background();
        let order = sample_order();
        let barrier = tokio::sync::Barrier::new(2);

        let attempt = || {
            let (tm, repo, order, barrier, ctx) = (&tm, &repo, &order, &barrier, &ctx);
            async move {
                tm.run_read_committed(ctx, AccessMode::ReadWrite, |tx_ctx| async move {
                    barrier.wait().await;
                    repo.create_order(&tx_ctx, order).await?;
                    repo.create_outbox_message(&tx_ctx, order).await?;
                    Ok::<_, Error>(())
                })
                .await
            }
        };

        let (first, second) = tokio::join!(attempt(), attempt());
        let failures: Vec<Error> = [first, second].into_iter().filter_map(Result::err).collect();

        assert_eq!(failures.len(), 1);
        assert!(failures[0].is_already_exists(), "got {:?}", failures[0]);
        assert_eq!(store.row_count(ORDERS_TABLE), 1);
        assert_eq!(store.row_count(OUTBOX_TABLE), 1);
    }
}
