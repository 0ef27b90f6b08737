//! Process-local contention cache.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use stocklock_core::ProductId;
use stocklock_ledger::ContentionSample;

use super::StockCache;

/// In-process [`StockCache`] with per-entry expiry. Expired entries are
/// dropped lazily on read and overwritten on write.
#[derive(Debug, Default)]
pub struct InMemoryStockCache {
    entries: Mutex<HashMap<ProductId, (ContentionSample, Instant)>>,
}

impl InMemoryStockCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StockCache for InMemoryStockCache {
    fn get_sample(&self, product_id: ProductId) -> Option<ContentionSample> {
        let mut entries = self.entries.lock().expect("cache poisoned");
        match entries.get(&product_id) {
            Some((sample, deadline)) if Instant::now() < *deadline => Some(*sample),
            Some(_) => {
                entries.remove(&product_id);
                None
            }
            None => None,
        }
    }

    fn put_sample(&self, product_id: ProductId, sample: ContentionSample, ttl: Duration) {
        let mut entries = self.entries.lock().expect("cache poisoned");
        entries.insert(product_id, (sample, Instant::now() + ttl));
    }

    fn invalidate_product(&self, product_id: ProductId) {
        let mut entries = self.entries.lock().expect("cache poisoned");
        entries.remove(&product_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_within_ttl() {
        let cache = InMemoryStockCache::new();
        let product_id = ProductId::new();
        let sample = ContentionSample {
            available_stock: 7,
            concurrent_reservation_count: 3,
            physical_stock: 10,
            reserved_stock: 3,
        };

        cache.put_sample(product_id, sample, Duration::from_secs(30));
        assert_eq!(cache.get_sample(product_id), Some(sample));
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = InMemoryStockCache::new();
        let product_id = ProductId::new();

        cache.put_sample(product_id, ContentionSample::zeroed(), Duration::ZERO);
        assert_eq!(cache.get_sample(product_id), None);
    }

    #[test]
    fn invalidate_drops_entry() {
        let cache = InMemoryStockCache::new();
        let product_id = ProductId::new();

        cache.put_sample(product_id, ContentionSample::zeroed(), Duration::from_secs(30));
        cache.invalidate_product(product_id);
        assert_eq!(cache.get_sample(product_id), None);
    }
}
