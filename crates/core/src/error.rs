//! Business error model.
//!
//! Keep this focused on deterministic business failures (validation, state
//! machine violations, stock exhaustion, concurrency conflicts). Storage and
//! infrastructure concerns belong elsewhere; they are translated into these
//! variants at the engine boundary so that callers always receive a stable
//! machine-readable code.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the domain layer.
pub type StockResult<T> = Result<T, StockError>;

/// Stable machine-readable code attached to every business failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidQuantity,
    ProductNotFound,
    StockNotFound,
    ReservationNotFound,
    InsufficientStock,
    OptimisticLockConflict,
    ConcurrentStockExhaustion,
    MaxRetryExceeded,
    PermissionDenied,
    InvalidReservationState,
    ReservationExpired,
    AlreadyCancelled,
    InvalidId,
    ReservationError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidQuantity => "INVALID_QUANTITY",
            ErrorCode::ProductNotFound => "PRODUCT_NOT_FOUND",
            ErrorCode::StockNotFound => "STOCK_NOT_FOUND",
            ErrorCode::ReservationNotFound => "RESERVATION_NOT_FOUND",
            ErrorCode::InsufficientStock => "INSUFFICIENT_STOCK",
            ErrorCode::OptimisticLockConflict => "OPTIMISTIC_LOCK_CONFLICT",
            ErrorCode::ConcurrentStockExhaustion => "CONCURRENT_STOCK_EXHAUSTION",
            ErrorCode::MaxRetryExceeded => "MAX_RETRY_EXCEEDED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::InvalidReservationState => "INVALID_RESERVATION_STATE",
            ErrorCode::ReservationExpired => "RESERVATION_EXPIRED",
            ErrorCode::AlreadyCancelled => "ALREADY_CANCELLED",
            ErrorCode::InvalidId => "INVALID_ID",
            ErrorCode::ReservationError => "RESERVATION_ERROR",
        }
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Business-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StockError {
    /// Requested quantity was zero or negative.
    #[error("quantity must be greater than zero")]
    InvalidQuantity,

    /// No product exists for the given id.
    #[error("product not found")]
    ProductNotFound,

    /// No stock ledger exists for the product.
    #[error("stock ledger not found")]
    StockNotFound,

    /// No reservation exists for the given id.
    #[error("reservation not found")]
    ReservationNotFound,

    /// Available stock cannot cover the requested quantity.
    #[error("insufficient stock (available: {available}, requested: {requested})")]
    InsufficientStock { available: i64, requested: i64 },

    /// The version-guarded update affected zero rows (concurrent writer won).
    #[error("concurrent update conflict detected")]
    OptimisticLockConflict,

    /// A concurrent writer exhausted stock despite a passed availability
    /// check; detected via constraint violation at commit time.
    #[error("stock exhausted by concurrent reservations")]
    ConcurrentStockExhaustion,

    /// The bounded retry budget was spent without a successful attempt.
    #[error("max retries exceeded ({attempts} attempts)")]
    MaxRetryExceeded { attempts: u32 },

    /// Caller lacks the privilege the operation requires.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The reservation is not in a state that allows the transition.
    #[error("invalid reservation state: {0}")]
    InvalidState(String),

    /// The reservation's expiry deadline has passed.
    #[error("reservation expired")]
    Expired,

    /// The reservation was already cancelled; releasing again is a no-op failure.
    #[error("reservation already cancelled")]
    AlreadyCancelled,

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Catch-all for unclassified storage failures surfaced to the caller.
    #[error("reservation processing error: {0}")]
    Internal(String),
}

impl StockError {
    pub fn insufficient(available: i64, requested: i64) -> Self {
        Self::InsufficientStock {
            available,
            requested,
        }
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable code for the caller-facing result payload.
    pub fn code(&self) -> ErrorCode {
        match self {
            StockError::InvalidQuantity => ErrorCode::InvalidQuantity,
            StockError::ProductNotFound => ErrorCode::ProductNotFound,
            StockError::StockNotFound => ErrorCode::StockNotFound,
            StockError::ReservationNotFound => ErrorCode::ReservationNotFound,
            StockError::InsufficientStock { .. } => ErrorCode::InsufficientStock,
            StockError::OptimisticLockConflict => ErrorCode::OptimisticLockConflict,
            StockError::ConcurrentStockExhaustion => ErrorCode::ConcurrentStockExhaustion,
            StockError::MaxRetryExceeded { .. } => ErrorCode::MaxRetryExceeded,
            StockError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            StockError::InvalidState(_) => ErrorCode::InvalidReservationState,
            StockError::Expired => ErrorCode::ReservationExpired,
            StockError::AlreadyCancelled => ErrorCode::AlreadyCancelled,
            StockError::InvalidId(_) => ErrorCode::InvalidId,
            StockError::Internal(_) => ErrorCode::ReservationError,
        }
    }

    /// Whether this failure came from losing a concurrency race (the caller
    /// may retry or fall back to a stricter locking strategy).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StockError::OptimisticLockConflict
                | StockError::ConcurrentStockExhaustion
                | StockError::MaxRetryExceeded { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(
            StockError::InvalidQuantity.code().as_str(),
            "INVALID_QUANTITY"
        );
        assert_eq!(
            StockError::insufficient(3, 5).code().as_str(),
            "INSUFFICIENT_STOCK"
        );
        assert_eq!(
            StockError::MaxRetryExceeded { attempts: 3 }.code().as_str(),
            "MAX_RETRY_EXCEEDED"
        );
    }

    #[test]
    fn conflict_classification() {
        assert!(StockError::OptimisticLockConflict.is_conflict());
        assert!(StockError::ConcurrentStockExhaustion.is_conflict());
        assert!(!StockError::insufficient(0, 1).is_conflict());
        assert!(!StockError::StockNotFound.is_conflict());
    }
}
