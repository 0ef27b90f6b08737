//! `stocklock-ledger` — pure domain model for per-product stock.
//!
//! One product owns one [`StockLedger`] (physical/reserved/available counts),
//! N [`Reservation`]s (time-bounded holds with a small state machine), and an
//! append-only trail of [`TransactionLogEntry`] records. Everything here is
//! deterministic and storage-free; the engine crate drives these types inside
//! transactions.

pub mod contention;
pub mod ledger;
pub mod reservation;
pub mod strategy;
pub mod transaction;

pub use contention::ContentionSample;
pub use ledger::StockLedger;
pub use reservation::{Reservation, ReservationStatus, DEFAULT_RESERVATION_MINUTES};
pub use strategy::{
    choose_strategy, LockingStrategy, ReservationStrategy, CRITICAL_STOCK_THRESHOLD,
    HIGH_CONTENTION_THRESHOLD, MODERATE_CONTENTION_THRESHOLD,
};
pub use transaction::{StockTransactionKind, TransactionLogEntry};
