//! Maintenance: expiring overdue holds and reconciling ledger drift.
//!
//! The sweeper runs each expiry in its own transaction, so one poisoned
//! reservation (missing ledger, concurrent state change) never blocks the
//! rest of the sweep.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use stocklock_core::{ProductId, StockError, StockResult};

use crate::cache::StockCache;
use crate::config::EngineConfig;
use crate::fulfill::FulfillmentService;
use crate::store::{IsolationLevel, LockMode, StockStore, StockTx, StoreError};

fn lift(err: StoreError) -> StockError {
    StockError::internal(err.to_string())
}

/// Outcome of one reconciliation pass over a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub product_id: ProductId,
    pub previous_reserved: i64,
    pub reconciled_reserved: i64,
    pub changed: bool,
}

/// Sweeper runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweeperStats {
    pub sweeps_run: u64,
    pub reservations_expired: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running background sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SweeperStats>>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> SweeperStats {
        self.stats.lock().expect("stats poisoned").clone()
    }
}

/// Expires overdue pending reservations and repairs counter drift.
pub struct MaintenanceSweeper<S, C> {
    store: Arc<S>,
    cache: Arc<C>,
    fulfillment: FulfillmentService<S, C>,
    config: EngineConfig,
}

impl<S: StockStore, C: StockCache> MaintenanceSweeper<S, C> {
    pub fn new(store: Arc<S>, cache: Arc<C>, config: EngineConfig) -> Self {
        let fulfillment = FulfillmentService::new(store.clone(), cache.clone());
        Self {
            store,
            cache,
            fulfillment,
            config,
        }
    }

    /// Expire every pending reservation whose deadline passed, returning how
    /// many were expired. Individual failures are logged and skipped.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> u64 {
        let ids = match self.store.expired_pending(now).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "failed to scan for expired reservations");
                return 0;
            }
        };

        let mut expired = 0u64;
        for id in ids {
            match self.fulfillment.expire(id, now).await {
                Ok(()) => expired += 1,
                // Lost a race with a confirm/cancel since the scan; fine.
                Err(StockError::InvalidState(_)) | Err(StockError::AlreadyCancelled) => {
                    debug!(reservation_id = %id, "reservation no longer expirable, skipping");
                }
                Err(err) => {
                    warn!(reservation_id = %id, error = %err, "failed to expire reservation");
                }
            }
        }
        if expired > 0 {
            info!(expired, "swept expired reservations");
        }
        expired
    }

    /// Recompute `reserved_stock` from the open reservations and overwrite
    /// the ledger's counters if they drifted. `available` is re-derived from
    /// the physical count, so the accounting identity holds afterwards.
    #[instrument(skip(self), fields(product_id = %product_id))]
    pub async fn reconcile(&self, product_id: ProductId) -> StockResult<ReconcileReport> {
        let mut tx = self
            .store
            .begin(IsolationLevel::ReadCommitted)
            .await
            .map_err(lift)?;

        let ledger = tx
            .fetch_ledger(product_id, LockMode::Update)
            .await
            .map_err(lift)?
            .ok_or(StockError::StockNotFound)?;

        let actual = tx.sum_pending_quantity(product_id).await.map_err(lift)?;
        if actual == ledger.reserved_stock {
            tx.rollback().await.map_err(lift)?;
            return Ok(ReconcileReport {
                product_id,
                previous_reserved: ledger.reserved_stock,
                reconciled_reserved: actual,
                changed: false,
            });
        }

        warn!(
            recorded = ledger.reserved_stock,
            actual, "ledger drift detected, reconciling"
        );
        let rows = tx
            .set_ledger_reserved(product_id, actual, Utc::now())
            .await
            .map_err(lift)?;
        if rows == 0 {
            return Err(StockError::internal("locked ledger row disappeared"));
        }
        tx.commit().await.map_err(lift)?;
        self.cache.invalidate_product(product_id);

        Ok(ReconcileReport {
            product_id,
            previous_reserved: ledger.reserved_stock,
            reconciled_reserved: actual,
            changed: true,
        })
    }

    /// Run the sweeper on its configured interval in a background task.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(SweeperStats::default()));
        let stats_clone = stats.clone();

        let join = tokio::spawn(async move {
            info!(interval = ?self.config.sweep_interval, "maintenance sweeper started");
            let started = Instant::now();
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let expired = self.sweep_expired(Utc::now()).await;
                        let mut s = stats_clone.lock().expect("stats poisoned");
                        s.sweeps_run += 1;
                        s.reservations_expired += expired;
                        s.uptime_secs = started.elapsed().as_secs();
                    }
                }
            }
            info!("maintenance sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::InMemoryStockCache;
    use crate::store::memory::InMemoryStockStore;
    use chrono::Duration;
    use stocklock_core::ActorId;
    use stocklock_ledger::{
        ledger::DEFAULT_WAREHOUSE_CODE, Reservation, ReservationStatus, StockLedger,
    };

    fn sweeper_over(
        store: Arc<InMemoryStockStore>,
        config: EngineConfig,
    ) -> MaintenanceSweeper<InMemoryStockStore, InMemoryStockCache> {
        MaintenanceSweeper::new(store, Arc::new(InMemoryStockCache::new()), config)
    }

    fn seed_ledger(store: &InMemoryStockStore, physical: i64, reserved: i64) -> ProductId {
        let product_id = ProductId::new();
        let mut ledger = StockLedger::new(product_id, DEFAULT_WAREHOUSE_CODE, Utc::now());
        ledger.inbound(physical, Utc::now()).unwrap();
        if reserved > 0 {
            ledger.reserve(reserved, Utc::now()).unwrap();
        }
        store.seed_ledger(ledger);
        product_id
    }

    fn seed_pending(
        store: &InMemoryStockStore,
        product_id: ProductId,
        quantity: i64,
        minutes_until_expiry: i64,
    ) -> Reservation {
        let mut reservation =
            Reservation::pending(product_id, quantity, ActorId::new(), None, 30, Utc::now());
        reservation.expires_at = Utc::now() + Duration::minutes(minutes_until_expiry);
        store.seed_reservation(reservation.clone());
        reservation
    }

    #[tokio::test]
    async fn sweep_expires_only_overdue_holds() {
        let store = Arc::new(InMemoryStockStore::new());
        let product_id = seed_ledger(&store, 100, 30);
        let overdue_a = seed_pending(&store, product_id, 10, -5);
        let overdue_b = seed_pending(&store, product_id, 5, -1);
        let live = seed_pending(&store, product_id, 15, 10);

        let sweeper = sweeper_over(store.clone(), EngineConfig::fast());
        let swept = sweeper.sweep_expired(Utc::now()).await;
        assert_eq!(swept, 2);

        let ledger = store.ledger(product_id).await.unwrap().unwrap();
        assert_eq!(ledger.reserved_stock, 15);
        assert_eq!(ledger.available_stock, 85);
        assert_eq!(ledger.physical_stock, 100);

        for id in [overdue_a.id, overdue_b.id] {
            let r = store.reservation(id).await.unwrap().unwrap();
            assert_eq!(r.status, ReservationStatus::Expired);
        }
        let r = store.reservation(live.id).await.unwrap().unwrap();
        assert_eq!(r.status, ReservationStatus::Pending);
    }

    #[tokio::test]
    async fn sweep_isolates_failures_per_reservation() {
        let store = Arc::new(InMemoryStockStore::new());
        let healthy_product = seed_ledger(&store, 50, 10);
        seed_pending(&store, healthy_product, 10, -5);
        // Orphan reservation: no ledger behind it, so expiry fails.
        let orphan = seed_pending(&store, ProductId::new(), 5, -5);

        let sweeper = sweeper_over(store.clone(), EngineConfig::fast());
        let swept = sweeper.sweep_expired(Utc::now()).await;
        assert_eq!(swept, 1);

        let ledger = store.ledger(healthy_product).await.unwrap().unwrap();
        assert_eq!(ledger.reserved_stock, 0);

        // The orphan is untouched, to be retried next sweep.
        let r = store.reservation(orphan.id).await.unwrap().unwrap();
        assert_eq!(r.status, ReservationStatus::Pending);
    }

    #[tokio::test]
    async fn reconcile_repairs_drifted_counters() {
        let store = Arc::new(InMemoryStockStore::new());
        // Ledger says 30 reserved, but only 10 units of pending holds exist.
        let product_id = seed_ledger(&store, 100, 30);
        seed_pending(&store, product_id, 10, 10);

        let sweeper = sweeper_over(store.clone(), EngineConfig::fast());
        let report = sweeper.reconcile(product_id).await.unwrap();
        assert!(report.changed);
        assert_eq!(report.previous_reserved, 30);
        assert_eq!(report.reconciled_reserved, 10);

        let ledger = store.ledger(product_id).await.unwrap().unwrap();
        assert_eq!(ledger.reserved_stock, 10);
        assert_eq!(ledger.available_stock, 90);
        ledger.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn reconcile_reports_clean_ledger_unchanged() {
        let store = Arc::new(InMemoryStockStore::new());
        let product_id = seed_ledger(&store, 100, 10);
        seed_pending(&store, product_id, 10, 10);

        let sweeper = sweeper_over(store.clone(), EngineConfig::fast());
        let report = sweeper.reconcile(product_id).await.unwrap();
        assert!(!report.changed);
        assert_eq!(report.reconciled_reserved, 10);
    }

    #[tokio::test]
    async fn reconcile_clears_phantom_holds() {
        let store = Arc::new(InMemoryStockStore::new());
        // Terminal reservations must not count toward reserved stock.
        let product_id = seed_ledger(&store, 100, 30);
        let mut cancelled =
            Reservation::pending(product_id, 30, ActorId::new(), None, 30, Utc::now());
        cancelled.cancel(Utc::now(), None).unwrap();
        store.seed_reservation(cancelled);

        let sweeper = sweeper_over(store.clone(), EngineConfig::fast());
        let report = sweeper.reconcile(product_id).await.unwrap();
        assert!(report.changed);
        assert_eq!(report.reconciled_reserved, 0);

        let ledger = store.ledger(product_id).await.unwrap().unwrap();
        assert_eq!(ledger.available_stock, 100);
    }

    #[tokio::test]
    async fn reconcile_unknown_product() {
        let store = Arc::new(InMemoryStockStore::new());
        let sweeper = sweeper_over(store, EngineConfig::fast());
        let err = sweeper.reconcile(ProductId::new()).await.unwrap_err();
        assert!(matches!(err, StockError::StockNotFound));
    }

    #[tokio::test]
    async fn background_sweeper_expires_and_shuts_down() {
        let store = Arc::new(InMemoryStockStore::new());
        let product_id = seed_ledger(&store, 20, 5);
        let overdue = seed_pending(&store, product_id, 5, -1);

        let sweeper = sweeper_over(store.clone(), EngineConfig::fast());
        let handle = sweeper.spawn();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let stats = handle.stats();
        handle.shutdown().await;

        assert!(stats.sweeps_run >= 1);
        assert_eq!(stats.reservations_expired, 1);
        let r = store.reservation(overdue.id).await.unwrap().unwrap();
        assert_eq!(r.status, ReservationStatus::Expired);
    }
}
