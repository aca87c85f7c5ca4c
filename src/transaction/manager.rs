use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::handle::{Binding, TxHandle};
use super::TransactionError;
use crate::context::Context;
use crate::db::{
    AccessMode, ConnectionProvider, IsolationLevel, QueryEngine, StoreError, Transaction, TxOptions,
};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Upper bound for releasing a transaction whose request context already
/// expired.
const ROLLBACK_GRACE: Duration = Duration::from_secs(5);

/// Resolves the query engine for the current context.
pub trait QueryEngineProvider: Send + Sync {
    fn query_engine(&self, ctx: &Context) -> Arc<dyn QueryEngine>;
}

pub struct TransactionManager<P> {
    id: u64,
    provider: Arc<P>,
}

impl<P: ConnectionProvider> TransactionManager<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            provider,
        }
    }

    /// Whether `ctx` carries a unit of work opened by this manager.
    pub fn in_unit_of_work(&self, ctx: &Context) -> bool {
        self.binding(ctx).is_some()
    }

    fn binding<'a>(&self, ctx: &'a Context) -> Option<&'a Binding> {
        ctx.unit_of_work().filter(|b| b.manager() == self.id)
    }

    /// Run `body` inside a unit of work with the given options. If `ctx`
    /// already carries one, `body` joins it and nothing is released here.
    pub async fn run<T, E, F, Fut>(&self, ctx: &Context, options: TxOptions, body: F) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: From<TransactionError> + std::fmt::Display,
    {
        if let Some(outer) = self.binding(ctx) {
            if outer.options() != options {
                tracing::debug!(
                    outer = ?outer.options(),
                    requested = ?options,
                    "Joining outer unit of work with different options"
                );
            }
            return body(ctx.clone()).await;
        }

        let tx = self
            .provider
            .begin(ctx, options)
            .await
            .map_err(TransactionError::Begin)?;

        tracing::debug!(
            isolation = ?options.isolation,
            access_mode = ?options.access_mode,
            "Unit of work opened"
        );

        let handle = Arc::new(TxHandle::new(tx));
        let tx_ctx = ctx.bind(Binding::new(self.id, options, handle.clone()));

        let outcome = AssertUnwindSafe(body(tx_ctx)).catch_unwind().await;

        let Some(tx) = handle.take().await else {
            return Err(TransactionError::Commit(StoreError::TransactionClosed).into());
        };

        match outcome {
            Ok(Ok(value)) => match tx.commit(ctx).await {
                Ok(()) => {
                    tracing::debug!("Unit of work committed");
                    Ok(value)
                }
                Err(source) => {
                    tracing::error!(error = %source, "Commit failed");
                    Err(TransactionError::Commit(source).into())
                }
            },
            Ok(Err(err)) => {
                self.release(tx, &err).await?;
                Err(err)
            }
            Err(panic) => {
                let err: E = TransactionError::Panicked(panic_message(panic)).into();
                self.release(tx, &err).await?;
                Err(err)
            }
        }
    }

    async fn release<E>(&self, tx: P::Tx, cause: &E) -> Result<(), E>
    where
        E: From<TransactionError> + std::fmt::Display,
    {
        let release_ctx = Context::background().with_timeout(ROLLBACK_GRACE);
        match tx.rollback(&release_ctx).await {
            Ok(()) => {
                tracing::debug!(cause = %cause, "Unit of work rolled back");
                Ok(())
            }
            Err(source) => {
                tracing::error!(
                    error = %source,
                    cause = %cause,
                    "Rollback failed, transaction outcome unknown"
                );
                Err(TransactionError::Rollback {
                    source,
                    original: cause.to_string(),
                }
                .into())
            }
        }
    }

    pub async fn run_read_committed<T, E, F, Fut>(
        &self,
        ctx: &Context,
        access_mode: AccessMode,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: From<TransactionError> + std::fmt::Display,
    {
        self.run(ctx, TxOptions::new(IsolationLevel::ReadCommitted, access_mode), body)
            .await
    }

    pub async fn run_repeatable_read<T, E, F, Fut>(
        &self,
        ctx: &Context,
        access_mode: AccessMode,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: From<TransactionError> + std::fmt::Display,
    {
        self.run(ctx, TxOptions::new(IsolationLevel::RepeatableRead, access_mode), body)
            .await
    }

    pub async fn run_serializable<T, E, F, Fut>(
        &self,
        ctx: &Context,
        access_mode: AccessMode,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: From<TransactionError> + std::fmt::Display,
    {
        self.run(ctx, TxOptions::new(IsolationLevel::Serializable, access_mode), body)
            .await
    }
}

impl<P: ConnectionProvider> QueryEngineProvider for TransactionManager<P> {
    fn query_engine(&self, ctx: &Context) -> Arc<dyn QueryEngine> {
        match self.binding(ctx) {
            Some(binding) => binding.engine(),
            None => self.provider.clone() as Arc<dyn QueryEngine>,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
