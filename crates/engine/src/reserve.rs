//! Reservation engine: placing holds under concurrency control.
//!
//! The engine runs one storage transaction per attempt. On the optimistic
//! path the only write barrier is a version-guarded conditional update; on
//! the pessimistic path the ledger row is locked up front at REPEATABLE READ.
//! Hybrid tries the optimistic path and falls back to pessimistic once a
//! concurrent writer is detected.
//!
//! Retry policy: losing the optimistic race is reported to the caller
//! immediately (`OPTIMISTIC_LOCK_CONFLICT`), since the caller may prefer a
//! different strategy over a blind retry. Transient storage failures
//! (serialization aborts, deadlock victims) are retried internally with
//! exponential backoff and jitter, up to the configured budget.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, instrument, warn};

use stocklock_core::{Principal, ProductId, StockError};
use stocklock_ledger::{
    LockingStrategy, Reservation, ReservationStrategy, StockTransactionKind, TransactionLogEntry,
};

use crate::cache::StockCache;
use crate::config::EngineConfig;
use crate::contention::ContentionAnalyzer;
use crate::outcome::ReservationOutcome;
use crate::store::{
    IsolationLevel, LedgerDelta, LockMode, StockStore, StockTx, StoreError, VersionGuard,
};
use crate::strategy::StrategySelector;

/// One reservation request.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub product_id: ProductId,
    pub quantity: i64,
    pub principal: Principal,
    pub order_id: Option<String>,
    /// Hold lifetime; `None` uses the configured default.
    pub duration_minutes: Option<i64>,
    pub strategy: ReservationStrategy,
    /// Isolation override; `None` lets the locking strategy pick.
    pub isolation: Option<IsolationLevel>,
}

impl ReserveRequest {
    pub fn new(product_id: ProductId, quantity: i64, principal: Principal) -> Self {
        Self {
            product_id,
            quantity,
            principal,
            order_id: None,
            duration_minutes: None,
            strategy: ReservationStrategy::default(),
            isolation: None,
        }
    }

    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn with_duration_minutes(mut self, minutes: i64) -> Self {
        self.duration_minutes = Some(minutes);
        self
    }

    pub fn with_strategy(mut self, strategy: ReservationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }
}

/// Failure of a single attempt, split by how the retry loop treats it.
enum AttemptError {
    /// Deterministic business failure; surfaces to the caller as-is.
    Business(StockError),
    /// Transient storage conflict; eligible for backoff and retry.
    Transient(StoreError),
}

impl From<StoreError> for AttemptError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Serialization(_) | StoreError::Deadlock(_) => AttemptError::Transient(err),
            StoreError::CheckViolation(_) => {
                AttemptError::Business(StockError::ConcurrentStockExhaustion)
            }
            StoreError::Backend(msg) => AttemptError::Business(StockError::internal(msg)),
        }
    }
}

impl From<StockError> for AttemptError {
    fn from(err: StockError) -> Self {
        AttemptError::Business(err)
    }
}

/// Places reservations against the stock ledger.
pub struct ReservationEngine<S, C> {
    store: Arc<S>,
    cache: Arc<C>,
    selector: StrategySelector<S, C>,
    config: EngineConfig,
}

impl<S: StockStore, C: StockCache> ReservationEngine<S, C> {
    pub fn new(store: Arc<S>, cache: Arc<C>, config: EngineConfig) -> Self {
        let analyzer = ContentionAnalyzer::new(store.clone(), cache.clone(), config.clone());
        Self {
            store,
            cache,
            selector: StrategySelector::new(analyzer),
            config,
        }
    }

    /// Reserve stock for a product.
    ///
    /// Never returns `Err`: every failure mode is folded into the outcome so
    /// callers get the full diagnostics (strategy, isolation, retries) either
    /// way.
    #[instrument(skip(self, request), fields(
        product_id = %request.product_id,
        quantity = request.quantity,
        strategy = ?request.strategy,
    ))]
    pub async fn reserve(&self, request: ReserveRequest) -> ReservationOutcome {
        let started = Instant::now();

        if request.quantity <= 0 {
            let mut outcome = ReservationOutcome::failed(&StockError::InvalidQuantity);
            outcome.execution_time = started.elapsed();
            return outcome;
        }

        let strategy = self
            .selector
            .select(request.product_id, request.strategy)
            .await;

        let (result, retries, conflict_seen, isolation_used) = match strategy {
            LockingStrategy::Optimistic => {
                let isolation = request
                    .isolation
                    .unwrap_or(IsolationLevel::ReadCommitted);
                let (result, retries) = self
                    .run_attempts(&request, LockingStrategy::Optimistic, isolation, self.config.max_retries)
                    .await;
                let conflict = matches!(result, Err(ref e) if e.is_conflict());
                (result, retries, conflict, isolation)
            }
            LockingStrategy::Pessimistic => {
                let isolation = request
                    .isolation
                    .unwrap_or(IsolationLevel::RepeatableRead);
                let (result, retries) = self
                    .run_attempts(&request, LockingStrategy::Pessimistic, isolation, self.config.max_retries)
                    .await;
                let conflict = matches!(result, Err(ref e) if e.is_conflict());
                (result, retries, conflict, isolation)
            }
            LockingStrategy::Hybrid => self.run_hybrid(&request).await,
        };

        let mut outcome = match result {
            Ok(reservation) => {
                self.cache.invalidate_product(request.product_id);
                debug!(reservation_id = %reservation.id, "reservation placed");
                ReservationOutcome::succeeded(reservation)
            }
            Err(err) => {
                debug!(error = %err, code = %err.code(), "reservation failed");
                ReservationOutcome::failed(&err)
            }
        };
        outcome.retry_count = retries;
        outcome.conflict_detected = outcome.conflict_detected || conflict_seen;
        outcome.strategy_used = Some(strategy);
        outcome.isolation_used = Some(isolation_used);
        outcome.execution_time = started.elapsed();
        outcome
    }

    /// Optimistic first; one conflict switches to the pessimistic path with
    /// the remaining retry budget.
    async fn run_hybrid(
        &self,
        request: &ReserveRequest,
    ) -> (Result<Reservation, StockError>, u32, bool, IsolationLevel) {
        let optimistic_isolation = request
            .isolation
            .unwrap_or(IsolationLevel::ReadCommitted);
        let (first, first_retries) = self
            .run_attempts(request, LockingStrategy::Optimistic, optimistic_isolation, 1)
            .await;

        match first {
            Err(ref err) if err.is_conflict() => {
                debug!("optimistic attempt lost the race, falling back to pessimistic");
                let fallback_isolation = request
                    .isolation
                    .unwrap_or(IsolationLevel::RepeatableRead);
                let budget = self.config.max_retries.saturating_sub(1);
                let (second, second_retries) = self
                    .run_attempts(request, LockingStrategy::Pessimistic, fallback_isolation, budget)
                    .await;
                (
                    second,
                    first_retries + 1 + second_retries,
                    true,
                    fallback_isolation,
                )
            }
            other => {
                let conflict = matches!(other, Err(ref e) if e.is_conflict());
                (other, first_retries, conflict, optimistic_isolation)
            }
        }
    }

    /// Attempt loop: transient storage conflicts back off and retry up to
    /// `max_retries` times; everything else returns on the spot.
    async fn run_attempts(
        &self,
        request: &ReserveRequest,
        locking: LockingStrategy,
        isolation: IsolationLevel,
        max_retries: u32,
    ) -> (Result<Reservation, StockError>, u32) {
        let mut attempt: u32 = 0;
        loop {
            let result = match locking {
                LockingStrategy::Pessimistic => {
                    self.attempt_pessimistic(request, isolation).await
                }
                _ => self.attempt_optimistic(request, isolation).await,
            };

            match result {
                Ok(reservation) => return (Ok(reservation), attempt),
                Err(AttemptError::Business(err)) => return (Err(err), attempt),
                Err(AttemptError::Transient(err)) => {
                    if attempt >= max_retries {
                        warn!(
                            error = %err,
                            attempts = attempt + 1,
                            "retry budget exhausted on transient storage conflict"
                        );
                        return (
                            Err(StockError::MaxRetryExceeded {
                                attempts: attempt + 1,
                            }),
                            attempt,
                        );
                    }
                    let delay = self.backoff_delay(attempt);
                    debug!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Exponential backoff with random jitter: `base * 2^attempt + jitter`.
    fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let base = self.config.base_retry_delay * 2u32.saturating_pow(attempt);
        let min = self.config.jitter_min.as_millis() as u64;
        let max = self.config.jitter_max.as_millis() as u64;
        let jitter_ms = if max > min {
            rand::thread_rng().gen_range(min..max)
        } else {
            min
        };
        base + std::time::Duration::from_millis(jitter_ms)
    }

    /// No upfront lock; the version-guarded update is the only write barrier.
    async fn attempt_optimistic(
        &self,
        request: &ReserveRequest,
        isolation: IsolationLevel,
    ) -> Result<Reservation, AttemptError> {
        let mut tx = self.store.begin(isolation).await?;

        let ledger = tx
            .fetch_ledger(request.product_id, LockMode::None)
            .await?
            .ok_or(StockError::StockNotFound)?;
        if ledger.available_stock < request.quantity {
            return Err(
                StockError::insufficient(ledger.available_stock, request.quantity).into(),
            );
        }

        let now = Utc::now();
        let guard = VersionGuard {
            expected_version: ledger.version,
            min_available: request.quantity,
        };
        let rows = tx
            .apply_ledger_delta(
                request.product_id,
                LedgerDelta::reserve(request.quantity),
                Some(guard),
                now,
            )
            .await?;
        if rows == 0 {
            // A concurrent writer changed the row between our read and the
            // guarded update. The caller decides whether to retry.
            return Err(StockError::OptimisticLockConflict.into());
        }

        let reservation = self.build_reservation(request, now);
        self.write_reservation(&mut tx, &reservation, &ledger, now)
            .await?;
        tx.commit().await?;
        Ok(reservation)
    }

    /// Row lock up front; no version guard needed once the lock is held.
    async fn attempt_pessimistic(
        &self,
        request: &ReserveRequest,
        isolation: IsolationLevel,
    ) -> Result<Reservation, AttemptError> {
        let mut tx = self.store.begin(isolation).await?;

        let ledger = tx
            .fetch_ledger(request.product_id, LockMode::Update)
            .await?
            .ok_or(StockError::StockNotFound)?;
        if ledger.available_stock < request.quantity {
            return Err(
                StockError::insufficient(ledger.available_stock, request.quantity).into(),
            );
        }

        let now = Utc::now();
        let rows = tx
            .apply_ledger_delta(
                request.product_id,
                LedgerDelta::reserve(request.quantity),
                None,
                now,
            )
            .await?;
        if rows == 0 {
            return Err(StockError::internal("locked ledger row disappeared").into());
        }

        let reservation = self.build_reservation(request, now);
        self.write_reservation(&mut tx, &reservation, &ledger, now)
            .await?;
        tx.commit().await?;
        Ok(reservation)
    }

    fn build_reservation(
        &self,
        request: &ReserveRequest,
        now: chrono::DateTime<Utc>,
    ) -> Reservation {
        let duration = request
            .duration_minutes
            .unwrap_or(self.config.default_reservation_minutes);
        Reservation::pending(
            request.product_id,
            request.quantity,
            request.principal.id,
            request.order_id.clone(),
            duration,
            now,
        )
    }

    async fn write_reservation(
        &self,
        tx: &mut S::Tx,
        reservation: &Reservation,
        ledger_before: &stocklock_ledger::StockLedger,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), AttemptError> {
        tx.insert_reservation(reservation).await?;

        let mut after = ledger_before.clone();
        after
            .reserve(reservation.quantity, now)
            .map_err(AttemptError::Business)?;
        let entry = TransactionLogEntry::record(
            StockTransactionKind::Reserve,
            reservation.quantity,
            ledger_before,
            &after,
            now,
        )
        .with_reference("reservation", reservation.id.to_string())
        .with_metadata(serde_json::json!({
            "order_id": reservation.order_id,
            "actor": reservation.owner,
            "expires_at": reservation.expires_at,
        }));
        tx.append_entry(&entry).await?;
        Ok(())
    }
}
