use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row as _, TypeInfo, ValueRef};
use std::time::Duration;

use super::{
    ConnectionProvider, ExecSummary, QueryEngine, Row, Statement, StoreError, Transaction,
    TxOptions, Value,
};
use crate::config::DatabaseConfig;
use crate::context::Context;

// ============================================================================
// PostgreSQL Connection Provider
// ============================================================================

#[derive(Clone)]
pub struct PgConnectionProvider {
    pool: PgPool,
}

impl PgConnectionProvider {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(config.max_lifetime_seconds))
            .connect(&config.url)
            .await?;

        tracing::info!(
            min_connections = config.min_connections,
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );

        Ok(Self { pool })
    }

    pub async fn ping(&self, ctx: &Context) -> Result<(), StoreError> {
        self.execute(ctx, &Statement::raw("SELECT 1")).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl QueryEngine for PgConnectionProvider {
    async fn execute(&self, ctx: &Context, stmt: &Statement) -> Result<ExecSummary, StoreError> {
        let (sql, args) = stmt.to_sql();
        tracing::debug!(sql = %sql, args = args.len(), "postgres.execute");

        let result = ctx.guard(bind_values(&sql, &args).execute(&self.pool)).await??;
        Ok(ExecSummary {
            rows_affected: result.rows_affected(),
        })
    }

    async fn fetch_one(&self, ctx: &Context, stmt: &Statement) -> Result<Row, StoreError> {
        let (sql, args) = stmt.to_sql();
        tracing::debug!(sql = %sql, args = args.len(), "postgres.fetch_one");

        let row = ctx.guard(bind_values(&sql, &args).fetch_one(&self.pool)).await??;
        decode_row(&row)
    }

    async fn fetch_many(&self, ctx: &Context, stmt: &Statement) -> Result<Vec<Row>, StoreError> {
        let (sql, args) = stmt.to_sql();
        tracing::debug!(sql = %sql, args = args.len(), "postgres.fetch_many");

        let rows = ctx.guard(bind_values(&sql, &args).fetch_all(&self.pool)).await??;
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl ConnectionProvider for PgConnectionProvider {
    type Tx = PgTransaction;

    async fn begin(&self, ctx: &Context, options: TxOptions) -> Result<PgTransaction, StoreError> {
        let mut tx = ctx.guard(self.pool.begin()).await??;
        let set_transaction = options.to_sql();
        ctx.guard(sqlx::query(&set_transaction).execute(&mut *tx))
            .await??;

        tracing::debug!(
            isolation = ?options.isolation,
            access_mode = ?options.access_mode,
            "postgres.begin"
        );

        Ok(PgTransaction { inner: tx })
    }
}

// ============================================================================
// PostgreSQL Transaction
// ============================================================================

/// Dropping without commit or rollback makes sqlx roll back on the
/// connection's next use, so an aborted request never leaks a transaction.
pub struct PgTransaction {
    inner: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn execute(&mut self, ctx: &Context, stmt: &Statement) -> Result<ExecSummary, StoreError> {
        let (sql, args) = stmt.to_sql();
        tracing::debug!(sql = %sql, args = args.len(), "postgres.tx.execute");

        let result = ctx
            .guard(bind_values(&sql, &args).execute(&mut *self.inner))
            .await??;
        Ok(ExecSummary {
            rows_affected: result.rows_affected(),
        })
    }

    async fn fetch_one(&mut self, ctx: &Context, stmt: &Statement) -> Result<Row, StoreError> {
        let (sql, args) = stmt.to_sql();
        tracing::debug!(sql = %sql, args = args.len(), "postgres.tx.fetch_one");

        let row = ctx
            .guard(bind_values(&sql, &args).fetch_one(&mut *self.inner))
            .await??;
        decode_row(&row)
    }

    async fn fetch_many(&mut self, ctx: &Context, stmt: &Statement) -> Result<Vec<Row>, StoreError> {
        let (sql, args) = stmt.to_sql();
        tracing::debug!(sql = %sql, args = args.len(), "postgres.tx.fetch_many");

        let rows = ctx
            .guard(bind_values(&sql, &args).fetch_all(&mut *self.inner))
            .await??;
        rows.iter().map(decode_row).collect()
    }

    async fn commit(self, ctx: &Context) -> Result<(), StoreError> {
        ctx.guard(self.inner.commit()).await??;
        Ok(())
    }

    async fn rollback(self, ctx: &Context) -> Result<(), StoreError> {
        ctx.guard(self.inner.rollback()).await??;
        Ok(())
    }
}

// ============================================================================
// Binding and decoding helpers
// ============================================================================

fn bind_values<'q>(sql: &'q str, args: &[Value]) -> Query<'q, Postgres, PgArguments> {
    let mut query = sqlx::query(sql);
    for arg in args {
        query = match arg.clone() {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(v),
            Value::Int(v) => query.bind(v),
            Value::Text(v) => query.bind(v),
            Value::Uuid(v) => query.bind(v),
            Value::Json(v) => query.bind(sqlx::types::Json(v)),
            Value::Timestamp(v) => query.bind(v),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<Row, StoreError> {
    let mut out = Row::new();

    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name();
        if row.try_get_raw(idx)?.is_null() {
            out.push(name, Value::Null);
            continue;
        }

        let value = match column.type_info().name() {
            "BOOL" => Value::Bool(row.try_get(idx)?),
            "INT2" => Value::Int(row.try_get::<i16, _>(idx)?.into()),
            "INT4" => Value::Int(row.try_get::<i32, _>(idx)?.into()),
            "INT8" => Value::Int(row.try_get(idx)?),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => Value::Text(row.try_get(idx)?),
            "UUID" => Value::Uuid(row.try_get(idx)?),
            "JSON" | "JSONB" => Value::Json(row.try_get(idx)?),
            "TIMESTAMPTZ" => Value::Timestamp(row.try_get(idx)?),
            other => {
                return Err(StoreError::Decode {
                    column: name.to_string(),
                    reason: format!("unsupported column type {other}"),
                })
            }
        };
        out.push(name, value);
    }

    Ok(out)
}
