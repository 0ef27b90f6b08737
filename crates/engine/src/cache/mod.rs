//! Contention-sample caching.
//!
//! Samples are advisory and short-lived, so the cache interface is infallible:
//! implementations swallow backend failures (logging them) and report a miss.
//! A miss only costs a fresh sample; it never affects correctness.

pub mod memory;

use std::time::Duration;

use stocklock_core::ProductId;
use stocklock_ledger::ContentionSample;

/// Best-effort cache for per-product contention samples.
pub trait StockCache: Send + Sync + 'static {
    /// A fresh (non-expired) sample for the product, if one is cached.
    fn get_sample(&self, product_id: ProductId) -> Option<ContentionSample>;

    /// Store a sample with the given time-to-live.
    fn put_sample(&self, product_id: ProductId, sample: ContentionSample, ttl: Duration);

    /// Drop every cached key for the product after its stock changed.
    fn invalidate_product(&self, product_id: ProductId);
}
