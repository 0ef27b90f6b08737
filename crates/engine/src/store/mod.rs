//! Storage abstraction for the stock engine.
//!
//! The engine delegates all mutual exclusion to the storage backend: row locks
//! on the pessimistic path, a version-guarded conditional update on the
//! optimistic path. Transaction isolation is a first-class capability of
//! [`StockStore::begin`] so the engine never issues vendor-specific SQL.
//!
//! Backends: [`memory::InMemoryStockStore`] (tests, demos) and the Postgres
//! implementation in `stocklock-infra`.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use stocklock_core::{ProductId, ReservationId};
use stocklock_ledger::{Reservation, StockLedger, TransactionLogEntry};

/// Transaction isolation level requested from the backend.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Standard-SQL spelling of the level.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Whether a row read should take an exclusive row lock (`SELECT ... FOR UPDATE`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockMode {
    None,
    Update,
}

/// Signed adjustment applied to a ledger's counters in one statement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LedgerDelta {
    pub physical: i64,
    pub reserved: i64,
    pub available: i64,
}

impl LedgerDelta {
    /// Hold `quantity` units: available → reserved.
    pub fn reserve(quantity: i64) -> Self {
        Self {
            physical: 0,
            reserved: quantity,
            available: -quantity,
        }
    }

    /// Release a hold: reserved → available.
    pub fn release(quantity: i64) -> Self {
        Self {
            physical: 0,
            reserved: -quantity,
            available: quantity,
        }
    }

    /// Ship a hold: physical and reserved both drop.
    pub fn outbound(quantity: i64) -> Self {
        Self {
            physical: -quantity,
            reserved: -quantity,
            available: 0,
        }
    }

    /// Receive stock: physical and available both grow.
    pub fn inbound(quantity: i64) -> Self {
        Self {
            physical: quantity,
            reserved: 0,
            available: quantity,
        }
    }
}

/// Conditions attached to an optimistic ledger update. The update affects
/// zero rows when the stored version differs from `expected_version` or
/// available stock has dropped below `min_available`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VersionGuard {
    pub expected_version: DateTime<Utc>,
    pub min_available: i64,
}

/// Storage-level failure.
///
/// The engine cares about two classifications: retryable transient conflicts
/// (deadlock, serialization failure) and check-constraint violations, which it
/// translates into `CONCURRENT_STOCK_EXHAUSTION`. Everything else surfaces as
/// an unclassified backend error.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// The backend could not serialize concurrent access; safe to retry.
    #[error("serialization conflict: {0}")]
    Serialization(String),

    /// The backend aborted this transaction to break a deadlock; safe to retry.
    #[error("deadlock detected: {0}")]
    Deadlock(String),

    /// A check constraint (non-negative stock) rejected the write.
    #[error("check constraint violated: {0}")]
    CheckViolation(String),

    /// Unclassified backend failure (connection loss, pool closed, ...).
    #[error("storage error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Serialization(_) | StoreError::Deadlock(_))
    }
}

/// A transactional handle over stock state.
///
/// All mutations issued through one `StockTx` commit or roll back together;
/// a dropped transaction rolls back. Reads with [`LockMode::Update`] hold
/// their row lock until the transaction finishes.
#[async_trait]
pub trait StockTx: Send {
    async fn fetch_ledger(
        &mut self,
        product_id: ProductId,
        lock: LockMode,
    ) -> Result<Option<StockLedger>, StoreError>;

    async fn insert_ledger(&mut self, ledger: &StockLedger) -> Result<(), StoreError>;

    /// Apply a delta to the ledger's counters, stamping `new_version`.
    /// Returns the number of rows affected: zero means the row is missing or
    /// the [`VersionGuard`] did not match (concurrent writer won).
    async fn apply_ledger_delta(
        &mut self,
        product_id: ProductId,
        delta: LedgerDelta,
        guard: Option<VersionGuard>,
        new_version: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Overwrite `reserved_stock` and derive `available_stock` from the
    /// stored physical count (reconciliation). Returns rows affected.
    async fn set_ledger_reserved(
        &mut self,
        product_id: ProductId,
        reserved: i64,
        new_version: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn fetch_reservation(
        &mut self,
        id: ReservationId,
        lock: LockMode,
    ) -> Result<Option<Reservation>, StoreError>;

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), StoreError>;

    /// Persist the current state of an existing reservation row.
    async fn update_reservation(&mut self, reservation: &Reservation) -> Result<(), StoreError>;

    /// Sum of quantities held by open (pending) reservations for a product.
    async fn sum_pending_quantity(&mut self, product_id: ProductId) -> Result<i64, StoreError>;

    async fn append_entry(&mut self, entry: &TransactionLogEntry) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// A stock storage backend.
///
/// The non-transactional reads are advisory (contention sampling, sweeps,
/// audit queries); every correctness-relevant mutation goes through a
/// [`StockTx`].
#[async_trait]
pub trait StockStore: Send + Sync + 'static {
    type Tx: StockTx;

    /// Open a transaction at the requested isolation level.
    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Tx, StoreError>;

    async fn ledger(&self, product_id: ProductId) -> Result<Option<StockLedger>, StoreError>;

    async fn reservation(&self, id: ReservationId)
        -> Result<Option<Reservation>, StoreError>;

    /// Count pending reservations for a product created at or after `since`.
    async fn pending_created_since(
        &self,
        product_id: ProductId,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Ids of pending reservations whose expiry deadline has passed.
    async fn expired_pending(&self, now: DateTime<Utc>) -> Result<Vec<ReservationId>, StoreError>;

    /// Audit trail for a product, oldest first.
    async fn entries(&self, product_id: ProductId) -> Result<Vec<TransactionLogEntry>, StoreError>;
}
