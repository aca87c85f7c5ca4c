use crate::db::StoreError;
use crate::models::OrderId;
use crate::services::warehouse::ReservationError;
use crate::transaction::TransactionError;
use crate::utils::IsTransient;

// ============================================================================
// Order Workflow Errors
// ============================================================================
//
// Every variant names the operation it originated from. Wrapping layers add
// context but never change the kind.
//
// ============================================================================

/// Stable failure kinds reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    AlreadyExists,
    ReservationFailed,
    TransactionFailed,
    StoreUnavailable,
    RetriesExhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::ReservationFailed => "reservation_failed",
            ErrorKind::TransactionFailed => "transaction_failed",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{op}: invalid request: {reason}")]
    InvalidRequest { op: &'static str, reason: String },

    #[error("{op}: order {order_id} already exists")]
    AlreadyExists { op: &'static str, order_id: OrderId },

    #[error("{op}: failed to reserve stock: {source}")]
    ReservationFailed {
        op: &'static str,
        #[source]
        source: ReservationError,
    },

    #[error(transparent)]
    TransactionFailed(#[from] TransactionError),

    #[error("{op}: {source}")]
    StoreUnavailable {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("{op}: gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::ReservationFailed { .. } => ErrorKind::ReservationFailed,
            Error::TransactionFailed(_) => ErrorKind::TransactionFailed,
            Error::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
            Error::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
        }
    }

    /// Name of the operation the failure originated in.
    pub fn operation(&self) -> &'static str {
        match self {
            Error::InvalidRequest { op, .. }
            | Error::AlreadyExists { op, .. }
            | Error::ReservationFailed { op, .. }
            | Error::StoreUnavailable { op, .. }
            | Error::RetriesExhausted { op, .. } => op,
            Error::TransactionFailed(err) => err.operation(),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// Wrap a store failure, classifying only the uniqueness violation.
    pub(crate) fn from_store(op: &'static str, order_id: OrderId, source: StoreError) -> Self {
        if source.is_unique_violation() {
            Error::AlreadyExists { op, order_id }
        } else {
            Error::StoreUnavailable { op, source }
        }
    }
}

/// Only identity collisions are worth another attempt; a fresh identity is
/// generated before retrying.
impl IsTransient for Error {
    fn is_transient(&self) -> bool {
        self.is_already_exists()
    }
}
