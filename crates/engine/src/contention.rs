//! Contention analysis.
//!
//! Samples recent reservation pressure on a product so the strategy selector
//! can pick a locking strategy. Sampling is best-effort: any storage failure
//! degrades to a zeroed sample (quiet product), never to an error, because a
//! wrong strategy only costs throughput.

use std::sync::Arc;

use chrono::Utc;
use tracing::{instrument, warn};

use stocklock_core::ProductId;
use stocklock_ledger::ContentionSample;

use crate::cache::StockCache;
use crate::config::EngineConfig;
use crate::store::{StockStore, StoreError};

/// Produces per-product [`ContentionSample`]s, serving cached ones while
/// fresh to keep hot products from hammering the store with count queries.
pub struct ContentionAnalyzer<S, C> {
    store: Arc<S>,
    cache: Arc<C>,
    config: EngineConfig,
}

impl<S: StockStore, C: StockCache> ContentionAnalyzer<S, C> {
    pub fn new(store: Arc<S>, cache: Arc<C>, config: EngineConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// The current contention sample for a product: cached if fresh,
    /// otherwise measured and cached.
    #[instrument(skip(self), fields(product_id = %product_id))]
    pub async fn sample(&self, product_id: ProductId) -> ContentionSample {
        if let Some(sample) = self.cache.get_sample(product_id) {
            return sample;
        }

        let sample = match self.measure(product_id).await {
            Ok(sample) => sample,
            Err(err) => {
                warn!(error = %err, "contention sampling failed, assuming quiet product");
                ContentionSample::zeroed()
            }
        };
        self.cache
            .put_sample(product_id, sample, self.config.contention_cache_ttl);
        sample
    }

    async fn measure(&self, product_id: ProductId) -> Result<ContentionSample, StoreError> {
        let Some(ledger) = self.store.ledger(product_id).await? else {
            return Ok(ContentionSample::zeroed());
        };

        let window = chrono::Duration::from_std(self.config.contention_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let concurrent = self
            .store
            .pending_created_since(product_id, Utc::now() - window)
            .await?;

        Ok(ContentionSample {
            available_stock: ledger.available_stock,
            concurrent_reservation_count: concurrent,
            physical_stock: ledger.physical_stock,
            reserved_stock: ledger.reserved_stock,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::InMemoryStockCache;
    use crate::store::memory::InMemoryStockStore;
    use std::time::Duration;
    use stocklock_core::ActorId;
    use stocklock_ledger::{ledger::DEFAULT_WAREHOUSE_CODE, Reservation, StockLedger};

    fn analyzer(
        store: Arc<InMemoryStockStore>,
        ttl: Duration,
    ) -> ContentionAnalyzer<InMemoryStockStore, InMemoryStockCache> {
        ContentionAnalyzer::new(
            store,
            Arc::new(InMemoryStockCache::new()),
            EngineConfig::default().with_contention_cache_ttl(ttl),
        )
    }

    fn seeded(physical: i64) -> (Arc<InMemoryStockStore>, ProductId) {
        let store = Arc::new(InMemoryStockStore::new());
        let product_id = ProductId::new();
        let mut ledger = StockLedger::new(product_id, DEFAULT_WAREHOUSE_CODE, Utc::now());
        ledger.inbound(physical, Utc::now()).unwrap();
        store.seed_ledger(ledger);
        (store, product_id)
    }

    #[tokio::test]
    async fn missing_ledger_samples_as_quiet() {
        let store = Arc::new(InMemoryStockStore::new());
        let analyzer = analyzer(store, Duration::from_secs(30));

        let sample = analyzer.sample(ProductId::new()).await;
        assert_eq!(sample, ContentionSample::zeroed());
    }

    #[tokio::test]
    async fn counts_recent_pending_reservations() {
        let (store, product_id) = seeded(50);
        for _ in 0..3 {
            store.seed_reservation(Reservation::pending(
                product_id,
                5,
                ActorId::new(),
                None,
                30,
                Utc::now(),
            ));
        }
        // Old enough to fall outside the trailing window.
        store.seed_reservation(Reservation::pending(
            product_id,
            5,
            ActorId::new(),
            None,
            30,
            Utc::now() - chrono::Duration::minutes(10),
        ));

        let analyzer = analyzer(store, Duration::from_secs(30));
        let sample = analyzer.sample(product_id).await;
        assert_eq!(sample.concurrent_reservation_count, 3);
        assert_eq!(sample.available_stock, 50);
    }

    #[tokio::test]
    async fn cached_sample_is_served_until_expiry() {
        let (store, product_id) = seeded(50);
        let analyzer = analyzer(store.clone(), Duration::from_secs(30));

        let first = analyzer.sample(product_id).await;
        assert_eq!(first.concurrent_reservation_count, 0);

        store.seed_reservation(Reservation::pending(
            product_id,
            5,
            ActorId::new(),
            None,
            30,
            Utc::now(),
        ));

        // Still within the TTL: the stale cached sample wins.
        let second = analyzer.sample(product_id).await;
        assert_eq!(second.concurrent_reservation_count, 0);
    }

    #[tokio::test]
    async fn zero_ttl_always_measures_fresh() {
        let (store, product_id) = seeded(50);
        let analyzer = analyzer(store.clone(), Duration::ZERO);

        analyzer.sample(product_id).await;
        store.seed_reservation(Reservation::pending(
            product_id,
            5,
            ActorId::new(),
            None,
            30,
            Utc::now(),
        ));

        let sample = analyzer.sample(product_id).await;
        assert_eq!(sample.concurrent_reservation_count, 1);
    }
}
