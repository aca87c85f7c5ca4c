// ============================================================================
// Transaction Manager - Ambient Unit of Work
// ============================================================================
//
// `run` opens a transaction, binds it into a derived `Context` and hands that
// context to the body. Anything the body calls can ask the manager for a
// query engine and transparently receives the open transaction. Outside a
// unit of work the same call resolves to the pool.
//
// Release rules:
// - body Ok            -> commit (commit failure is surfaced)
// - body Err           -> rollback, body error returned untouched
// - rollback failure   -> rollback error supersedes the body error
// - body panics        -> converted to TransactionError::Panicked, rollback
// - nested `run`       -> joins the outer unit of work, releases nothing
//
// ============================================================================

mod handle;
mod manager;

pub use manager::{QueryEngineProvider, TransactionManager};

pub(crate) use handle::Binding;

use crate::db::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction_manager.begin: {0}")]
    Begin(#[source] StoreError),

    #[error("transaction_manager.commit: {0}")]
    Commit(#[source] StoreError),

    #[error("transaction_manager.rollback: {source} (rolling back after: {original})")]
    Rollback {
        #[source]
        source: StoreError,
        original: String,
    },

    #[error("transaction_manager.run: panic recovered: {0}")]
    Panicked(String),
}

impl TransactionError {
    pub fn operation(&self) -> &'static str {
        match self {
            TransactionError::Begin(_) => "transaction_manager.begin",
            TransactionError::Commit(_) => "transaction_manager.commit",
            TransactionError::Rollback { .. } => "transaction_manager.rollback",
            TransactionError::Panicked(_) => "transaction_manager.run",
        }
    }
}
