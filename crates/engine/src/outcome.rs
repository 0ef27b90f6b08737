//! Operation outcomes returned across the public service boundary.
//!
//! Services report expected business failures (insufficient stock, lost
//! races, permission checks) as data rather than `Err`, so callers can log
//! and branch without unwinding. Only programming errors escape as panics,
//! and none of the services have any.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use stocklock_core::{ErrorCode, StockError};
use stocklock_ledger::{LockingStrategy, Reservation};

use crate::store::IsolationLevel;

/// Result of an availability probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityOutcome {
    pub available: bool,
    pub requested: i64,
    pub include_reserved: bool,
    pub available_stock: i64,
    pub physical_stock: i64,
    pub reserved_stock: i64,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
}

impl AvailabilityOutcome {
    pub fn failed(err: &StockError, requested: i64, include_reserved: bool) -> Self {
        Self {
            available: false,
            requested,
            include_reserved,
            available_stock: 0,
            physical_stock: 0,
            reserved_stock: 0,
            error_code: Some(err.code()),
            error_message: Some(err.to_string()),
        }
    }
}

/// Result of a reservation attempt, successful or not, with enough
/// diagnostics to understand what the engine did: which strategy and
/// isolation level ran, how many retries it burned, and whether a
/// concurrent writer was detected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationOutcome {
    pub success: bool,
    pub reservation: Option<Reservation>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub conflict_detected: bool,
    pub strategy_used: Option<LockingStrategy>,
    pub isolation_used: Option<IsolationLevel>,
    pub execution_time: Duration,
}

impl ReservationOutcome {
    pub fn succeeded(reservation: Reservation) -> Self {
        Self {
            success: true,
            reservation: Some(reservation),
            error_code: None,
            error_message: None,
            retry_count: 0,
            conflict_detected: false,
            strategy_used: None,
            isolation_used: None,
            execution_time: Duration::ZERO,
        }
    }

    pub fn failed(err: &StockError) -> Self {
        Self {
            success: false,
            reservation: None,
            error_code: Some(err.code()),
            error_message: Some(err.to_string()),
            retry_count: 0,
            conflict_detected: err.is_conflict(),
            strategy_used: None,
            isolation_used: None,
            execution_time: Duration::ZERO,
        }
    }
}

/// Result of a confirm, cancel, inbound or other single-shot operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub success: bool,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
}

impl OperationOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_code: None,
            error_message: None,
        }
    }

    pub fn failed(err: &StockError) -> Self {
        Self {
            success: false,
            error_code: Some(err.code()),
            error_message: Some(err.to_string()),
        }
    }
}

impl From<Result<(), StockError>> for OperationOutcome {
    fn from(result: Result<(), StockError>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(err) => Self::failed(&err),
        }
    }
}
