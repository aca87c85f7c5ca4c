use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::context::Context;
use crate::db::{ExecSummary, QueryEngine, Row, Statement, StoreError, Transaction, TxOptions};

/// Marker stored in a `Context` while a unit of work is open. Its fields are
/// private to this module, so only the manager can create or read one.
#[derive(Clone)]
pub(crate) struct Binding {
    manager: u64,
    options: TxOptions,
    engine: Arc<dyn QueryEngine>,
}

impl Binding {
    pub(super) fn new(manager: u64, options: TxOptions, engine: Arc<dyn QueryEngine>) -> Self {
        Self {
            manager,
            options,
            engine,
        }
    }

    pub(super) fn manager(&self) -> u64 {
        self.manager
    }

    pub(super) fn options(&self) -> TxOptions {
        self.options
    }

    pub(super) fn engine(&self) -> Arc<dyn QueryEngine> {
        self.engine.clone()
    }
}

/// The open transaction, shared between the context (query access) and the
/// owning `run` call (release rights). Once taken, every query fails with
/// `StoreError::TransactionClosed`.
pub(super) struct TxHandle<T> {
    inner: Mutex<Option<T>>,
}

impl<T: Transaction> TxHandle<T> {
    pub(super) fn new(tx: T) -> Self {
        Self {
            inner: Mutex::new(Some(tx)),
        }
    }

    pub(super) async fn take(&self) -> Option<T> {
        self.inner.lock().await.take()
    }
}

#[async_trait]
impl<T: Transaction> QueryEngine for TxHandle<T> {
    async fn execute(&self, ctx: &Context, stmt: &Statement) -> Result<ExecSummary, StoreError> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
        tx.execute(ctx, stmt).await
    }

    async fn fetch_one(&self, ctx: &Context, stmt: &Statement) -> Result<Row, StoreError> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
        tx.fetch_one(ctx, stmt).await
    }

    async fn fetch_many(&self, ctx: &Context, stmt: &Statement) -> Result<Vec<Row>, StoreError> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
        tx.fetch_many(ctx, stmt).await
    }
}
