// ============================================================================
// Database Layer - Query Engine Capability
// ============================================================================
//
// A pooled connection and an open transaction both satisfy `QueryEngine`.
// Repositories only ever see that trait, so they do not care whether they
// run inside a unit of work or straight against the pool.
//
// Providers:
// - postgres: sqlx `PgPool`
// - memory:   in-process tables, used by tests and local runs
//
// ============================================================================

pub mod memory;
pub mod postgres;
pub mod statement;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::{Context, DeadlineExceeded};

pub use memory::{Fault, MemoryStats, MemoryStore};
pub use postgres::{PgConnectionProvider, PgTransaction};
pub use statement::{ExecSummary, FromValue, Insert, Row, Select, Statement, Value};

const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";
const READ_ONLY_SQL_TRANSACTION: &str = "25006";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("could not serialize access: {0}")]
    SerializationFailure(String),

    #[error("no rows returned")]
    NotFound,

    #[error("store call aborted: {0}")]
    DeadlineExceeded(#[from] DeadlineExceeded),

    #[error("transaction is no longer active")]
    TransactionClosed,

    #[error("cannot write in a read-only transaction")]
    ReadOnlyTransaction,

    #[error("encode column `{column}`: {reason}")]
    Encode { column: String, reason: String },

    #[error("decode column `{column}`: {reason}")]
    Decode { column: String, reason: String },

    #[error("unsupported statement: {0}")]
    Unsupported(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some(UNIQUE_VIOLATION) => StoreError::UniqueViolation(
                    db_err
                        .constraint()
                        .map(str::to_string)
                        .unwrap_or_else(|| db_err.message().to_string()),
                ),
                Some(SERIALIZATION_FAILURE) => {
                    StoreError::SerializationFailure(db_err.message().to_string())
                }
                Some(READ_ONLY_SQL_TRANSACTION) => StoreError::ReadOnlyTransaction,
                _ => StoreError::Database(err),
            },
            _ => StoreError::Database(err),
        }
    }
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }
}

// ============================================================================
// Transaction Options
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub access_mode: AccessMode,
}

impl TxOptions {
    pub fn new(isolation: IsolationLevel, access_mode: AccessMode) -> Self {
        Self {
            isolation,
            access_mode,
        }
    }

    /// `SET TRANSACTION` statement applied right after `BEGIN`.
    pub fn to_sql(&self) -> String {
        let isolation = match self.isolation {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        };
        let access_mode = match self.access_mode {
            AccessMode::ReadWrite => "READ WRITE",
            AccessMode::ReadOnly => "READ ONLY",
        };
        format!("SET TRANSACTION ISOLATION LEVEL {isolation}, {access_mode}")
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Execute one statement, fetch one row, fetch many rows.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn execute(&self, ctx: &Context, stmt: &Statement) -> Result<ExecSummary, StoreError>;

    /// Fails with `StoreError::NotFound` when the statement yields no rows.
    async fn fetch_one(&self, ctx: &Context, stmt: &Statement) -> Result<Row, StoreError>;

    async fn fetch_many(&self, ctx: &Context, stmt: &Statement) -> Result<Vec<Row>, StoreError>;
}

/// A physical transaction. Owned by exactly one `TransactionManager::run`
/// call, which is the only code allowed to release it.
#[async_trait]
pub trait Transaction: Send + 'static {
    async fn execute(&mut self, ctx: &Context, stmt: &Statement) -> Result<ExecSummary, StoreError>;

    async fn fetch_one(&mut self, ctx: &Context, stmt: &Statement) -> Result<Row, StoreError>;

    async fn fetch_many(&mut self, ctx: &Context, stmt: &Statement) -> Result<Vec<Row>, StoreError>;

    async fn commit(self, ctx: &Context) -> Result<(), StoreError>;

    async fn rollback(self, ctx: &Context) -> Result<(), StoreError>;
}

/// Owns the pool. Queries issued directly on the provider run on a pooled
/// connection in autocommit mode.
#[async_trait]
pub trait ConnectionProvider: QueryEngine + 'static {
    type Tx: Transaction;

    async fn begin(&self, ctx: &Context, options: TxOptions) -> Result<Self::Tx, StoreError>;
}
