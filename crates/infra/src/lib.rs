//! `stocklock-infra` — database and cache backends for the stock engine.
//!
//! Implements the engine's [`stocklock_engine::store::StockStore`] over
//! Postgres (sqlx) and its [`stocklock_engine::cache::StockCache`] over
//! Redis (behind the `redis` feature).

pub mod store;

#[cfg(feature = "redis")]
pub mod cache;

pub use store::postgres::{PgStockTx, PostgresStockStore};

#[cfg(feature = "redis")]
pub use cache::redis::RedisStockCache;
