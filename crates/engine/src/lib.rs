//! `stocklock-engine` — reservation processing under adaptive concurrency
//! control.
//!
//! The engine layers on top of the pure domain model in `stocklock-ledger`:
//! a storage abstraction ([`store`]) that exposes isolation levels, row locks
//! and version-guarded updates; a contention analyzer and strategy selector
//! that pick between optimistic, pessimistic and hybrid locking per request;
//! the [`ReservationEngine`] itself with bounded retry and backoff; the
//! [`FulfillmentService`] for confirm/cancel; the [`InventoryService`] for
//! availability probes and inbound receipts; and the [`MaintenanceSweeper`]
//! that expires overdue holds and reconciles counter drift.
//!
//! Everything is generic over [`store::StockStore`] and [`cache::StockCache`];
//! in-memory implementations live alongside the traits, database-backed ones
//! in `stocklock-infra`.

pub mod cache;
pub mod config;
pub mod contention;
pub mod fulfill;
pub mod inventory;
pub mod outcome;
pub mod reserve;
pub mod store;
pub mod strategy;
pub mod sweeper;


pub use cache::StockCache;
pub use config::EngineConfig;
pub use contention::ContentionAnalyzer;
pub use fulfill::FulfillmentService;
pub use inventory::InventoryService;
pub use outcome::{AvailabilityOutcome, OperationOutcome, ReservationOutcome};
pub use reserve::{ReservationEngine, ReserveRequest};
pub use store::{IsolationLevel, LedgerDelta, LockMode, StockStore, StockTx, StoreError, VersionGuard};
pub use strategy::StrategySelector;
pub use sweeper::{MaintenanceSweeper, ReconcileReport, SweeperHandle, SweeperStats};
