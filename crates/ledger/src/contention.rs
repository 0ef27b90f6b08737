//! Contention sampling types.

use serde::{Deserialize, Serialize};

/// Snapshot of recent reservation pressure on one product.
///
/// Ephemeral and advisory: samples live in a short-TTL cache and only tune
/// strategy selection. A stale or missing sample never affects correctness.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContentionSample {
    pub available_stock: i64,
    /// Pending reservations created within the recent trailing window.
    pub concurrent_reservation_count: u64,
    pub physical_stock: i64,
    pub reserved_stock: i64,
}

impl ContentionSample {
    /// Sample used when no ledger exists (or analysis failed): zero counts,
    /// which steers the selector toward the optimistic path.
    pub fn zeroed() -> Self {
        Self::default()
    }
}
