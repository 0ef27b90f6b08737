//! Adaptive strategy selection.

use tracing::{debug, instrument};

use stocklock_core::ProductId;
use stocklock_ledger::{choose_strategy, LockingStrategy, ReservationStrategy};

use crate::cache::StockCache;
use crate::contention::ContentionAnalyzer;
use crate::store::StockStore;

/// Turns a caller's [`ReservationStrategy`] into a concrete
/// [`LockingStrategy`], consulting the contention analyzer when the caller
/// asked for adaptive selection.
pub struct StrategySelector<S, C> {
    analyzer: ContentionAnalyzer<S, C>,
}

impl<S: StockStore, C: StockCache> StrategySelector<S, C> {
    pub fn new(analyzer: ContentionAnalyzer<S, C>) -> Self {
        Self { analyzer }
    }

    #[instrument(skip(self), fields(product_id = %product_id))]
    pub async fn select(
        &self,
        product_id: ProductId,
        requested: ReservationStrategy,
    ) -> LockingStrategy {
        match requested {
            ReservationStrategy::Optimistic => LockingStrategy::Optimistic,
            ReservationStrategy::Pessimistic => LockingStrategy::Pessimistic,
            ReservationStrategy::Hybrid => LockingStrategy::Hybrid,
            ReservationStrategy::Adaptive => {
                let sample = self.analyzer.sample(product_id).await;
                let chosen = choose_strategy(&sample);
                debug!(
                    concurrent = sample.concurrent_reservation_count,
                    available = sample.available_stock,
                    strategy = ?chosen,
                    "adaptive strategy selected"
                );
                chosen
            }
        }
    }
}
