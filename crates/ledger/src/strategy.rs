//! Concurrency-control strategy selection policy.
//!
//! The policy is pure: given a contention sample it picks a locking strategy.
//! Pessimistic locking serializes access and protects scarce inventory under
//! hot contention; optimistic locking maximizes throughput when conflicts are
//! rare; hybrid tries the cheap path first and falls back.

use serde::{Deserialize, Serialize};

use crate::contention::ContentionSample;

/// Pending reservations in the trailing window at or above which contention
/// counts as high.
pub const HIGH_CONTENTION_THRESHOLD: u64 = 5;

/// Available stock at or below which inventory counts as scarce.
pub const CRITICAL_STOCK_THRESHOLD: i64 = 10;

/// Pending reservations at or above which contention counts as moderate.
pub const MODERATE_CONTENTION_THRESHOLD: u64 = 2;

/// A concrete locking strategy for one reservation attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockingStrategy {
    /// Version-guarded conditional update, no upfront lock.
    Optimistic,
    /// Upfront row lock for the duration of the transaction.
    Pessimistic,
    /// One optimistic try, then pessimistic fallback on conflict.
    Hybrid,
}

/// What the caller asks for: a fixed strategy, or adaptive selection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStrategy {
    #[default]
    Adaptive,
    Optimistic,
    Pessimistic,
    Hybrid,
}

/// Pick a locking strategy from observed contention.
pub fn choose_strategy(sample: &ContentionSample) -> LockingStrategy {
    if sample.concurrent_reservation_count >= HIGH_CONTENTION_THRESHOLD
        && sample.available_stock <= CRITICAL_STOCK_THRESHOLD
    {
        LockingStrategy::Pessimistic
    } else if sample.concurrent_reservation_count >= MODERATE_CONTENTION_THRESHOLD {
        LockingStrategy::Hybrid
    } else {
        LockingStrategy::Optimistic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pending: u64, available: i64) -> ContentionSample {
        ContentionSample {
            available_stock: available,
            concurrent_reservation_count: pending,
            physical_stock: available,
            reserved_stock: 0,
        }
    }

    #[test]
    fn hot_contention_on_scarce_stock_goes_pessimistic() {
        assert_eq!(choose_strategy(&sample(5, 10)), LockingStrategy::Pessimistic);
        assert_eq!(choose_strategy(&sample(8, 3)), LockingStrategy::Pessimistic);
    }

    #[test]
    fn hot_contention_on_plentiful_stock_goes_hybrid() {
        // High reservation pressure but stock above the critical threshold.
        assert_eq!(choose_strategy(&sample(5, 11)), LockingStrategy::Hybrid);
    }

    #[test]
    fn moderate_contention_goes_hybrid() {
        assert_eq!(choose_strategy(&sample(2, 100)), LockingStrategy::Hybrid);
        assert_eq!(choose_strategy(&sample(4, 5)), LockingStrategy::Hybrid);
    }

    #[test]
    fn quiet_product_goes_optimistic() {
        assert_eq!(choose_strategy(&sample(0, 100)), LockingStrategy::Optimistic);
        assert_eq!(choose_strategy(&sample(1, 1)), LockingStrategy::Optimistic);
        assert_eq!(choose_strategy(&ContentionSample::zeroed()), LockingStrategy::Optimistic);
    }
}
