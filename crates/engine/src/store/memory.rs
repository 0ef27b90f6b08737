//! In-memory storage backend.
//!
//! Used by tests and demos, and as the reference semantics for real backends.
//! Concurrency model:
//!
//! - [`LockMode::Update`] reads take a per-row async mutex held until the
//!   transaction commits or rolls back, mirroring `SELECT ... FOR UPDATE`.
//! - Writes are staged and applied atomically at commit under one state lock.
//! - A [`VersionGuard`] is checked when the conditional update is issued
//!   (zero rows affected on a miss, like SQL) and re-validated at commit; a
//!   commit-time loser gets a retryable serialization error, mirroring how an
//!   MVCC backend aborts the second writer.
//! - Non-negativity of all counters is enforced at commit the way the real
//!   schema's check constraints are, surfacing as [`StoreError::CheckViolation`].
//!
//! A transaction must not lock the same row twice; the engine's flows never do.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};
use uuid::Uuid;

use stocklock_core::{ProductId, ReservationId};
use stocklock_ledger::{Reservation, ReservationStatus, StockLedger, TransactionLogEntry};

use super::{
    IsolationLevel, LedgerDelta, LockMode, StockStore, StockTx, StoreError, VersionGuard,
};

#[derive(Debug, Default, Clone)]
struct Committed {
    ledgers: HashMap<ProductId, StockLedger>,
    reservations: HashMap<ReservationId, Reservation>,
    entries: Vec<TransactionLogEntry>,
}

/// Per-row lock table keyed by the row's uuid (product or reservation).
#[derive(Debug, Default)]
struct LockTable {
    rows: Mutex<HashMap<Uuid, Arc<RowMutex<()>>>>,
}

impl LockTable {
    fn handle(&self, key: Uuid) -> Arc<RowMutex<()>> {
        let mut rows = self.rows.lock().expect("lock table poisoned");
        rows.entry(key).or_default().clone()
    }
}

/// In-memory stock store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStockStore {
    state: Arc<Mutex<Committed>>,
    locks: Arc<LockTable>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a ledger directly into committed state (test setup).
    pub fn seed_ledger(&self, ledger: StockLedger) {
        let mut state = self.state.lock().expect("state poisoned");
        state.ledgers.insert(ledger.product_id, ledger);
    }

    /// Overwrite a reservation row directly (test setup, e.g. forcing expiry).
    pub fn seed_reservation(&self, reservation: Reservation) {
        let mut state = self.state.lock().expect("state poisoned");
        state.reservations.insert(reservation.id, reservation);
    }
}

#[derive(Debug, Clone)]
enum Write {
    InsertLedger(StockLedger),
    Delta {
        product_id: ProductId,
        delta: LedgerDelta,
        guard: Option<VersionGuard>,
        new_version: DateTime<Utc>,
    },
    SetReserved {
        product_id: ProductId,
        reserved: i64,
        new_version: DateTime<Utc>,
    },
    InsertReservation(Reservation),
    UpdateReservation(Reservation),
    AppendEntry(TransactionLogEntry),
}

/// One open in-memory transaction: staged writes plus held row locks.
pub struct InMemoryTx {
    state: Arc<Mutex<Committed>>,
    locks: Arc<LockTable>,
    held: Vec<OwnedMutexGuard<()>>,
    writes: Vec<Write>,
}

impl InMemoryTx {
    /// The ledger as this transaction sees it: committed state with this
    /// transaction's staged writes applied on top.
    fn effective_ledger(&self, product_id: ProductId) -> Option<StockLedger> {
        let committed = self.state.lock().expect("state poisoned");
        let mut current = committed.ledgers.get(&product_id).cloned();
        drop(committed);

        for write in &self.writes {
            match write {
                Write::InsertLedger(l) if l.product_id == product_id => {
                    current = Some(l.clone());
                }
                Write::Delta {
                    product_id: pid,
                    delta,
                    new_version,
                    ..
                } if *pid == product_id => {
                    if let Some(l) = current.as_mut() {
                        apply_delta(l, *delta, *new_version);
                    }
                }
                Write::SetReserved {
                    product_id: pid,
                    reserved,
                    new_version,
                } if *pid == product_id => {
                    if let Some(l) = current.as_mut() {
                        apply_set_reserved(l, *reserved, *new_version);
                    }
                }
                _ => {}
            }
        }
        current
    }

    fn effective_reservation(&self, id: ReservationId) -> Option<Reservation> {
        let committed = self.state.lock().expect("state poisoned");
        let mut current = committed.reservations.get(&id).cloned();
        drop(committed);

        for write in &self.writes {
            match write {
                Write::InsertReservation(r) | Write::UpdateReservation(r) if r.id == id => {
                    current = Some(r.clone());
                }
                _ => {}
            }
        }
        current
    }

    async fn lock_row(&mut self, key: Uuid) {
        let handle = self.locks.handle(key);
        let guard = handle.lock_owned().await;
        self.held.push(guard);
    }
}

fn apply_delta(ledger: &mut StockLedger, delta: LedgerDelta, new_version: DateTime<Utc>) {
    ledger.physical_stock += delta.physical;
    ledger.reserved_stock += delta.reserved;
    ledger.available_stock += delta.available;
    ledger.version = new_version;
}

fn apply_set_reserved(ledger: &mut StockLedger, reserved: i64, new_version: DateTime<Utc>) {
    ledger.reserved_stock = reserved;
    ledger.available_stock = ledger.physical_stock - reserved;
    ledger.version = new_version;
}

fn check_constraints(ledger: &StockLedger) -> Result<(), StoreError> {
    if ledger.physical_stock < 0 || ledger.reserved_stock < 0 || ledger.available_stock < 0 {
        return Err(StoreError::CheckViolation(format!(
            "negative stock count for product {}: physical={}, reserved={}, available={}",
            ledger.product_id,
            ledger.physical_stock,
            ledger.reserved_stock,
            ledger.available_stock
        )));
    }
    Ok(())
}

#[async_trait]
impl StockTx for InMemoryTx {
    async fn fetch_ledger(
        &mut self,
        product_id: ProductId,
        lock: LockMode,
    ) -> Result<Option<StockLedger>, StoreError> {
        if lock == LockMode::Update {
            self.lock_row(*product_id.as_uuid()).await;
        }
        Ok(self.effective_ledger(product_id))
    }

    async fn insert_ledger(&mut self, ledger: &StockLedger) -> Result<(), StoreError> {
        if self.effective_ledger(ledger.product_id).is_some() {
            return Err(StoreError::Backend(format!(
                "ledger already exists for product {}",
                ledger.product_id
            )));
        }
        self.writes.push(Write::InsertLedger(ledger.clone()));
        Ok(())
    }

    async fn apply_ledger_delta(
        &mut self,
        product_id: ProductId,
        delta: LedgerDelta,
        guard: Option<VersionGuard>,
        new_version: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let Some(current) = self.effective_ledger(product_id) else {
            return Ok(0);
        };
        if let Some(g) = guard {
            if current.version != g.expected_version || current.available_stock < g.min_available {
                return Ok(0);
            }
        }
        self.writes.push(Write::Delta {
            product_id,
            delta,
            guard,
            new_version,
        });
        Ok(1)
    }

    async fn set_ledger_reserved(
        &mut self,
        product_id: ProductId,
        reserved: i64,
        new_version: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if self.effective_ledger(product_id).is_none() {
            return Ok(0);
        }
        self.writes.push(Write::SetReserved {
            product_id,
            reserved,
            new_version,
        });
        Ok(1)
    }

    async fn fetch_reservation(
        &mut self,
        id: ReservationId,
        lock: LockMode,
    ) -> Result<Option<Reservation>, StoreError> {
        if lock == LockMode::Update {
            self.lock_row(*id.as_uuid()).await;
        }
        Ok(self.effective_reservation(id))
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), StoreError> {
        if self.effective_reservation(reservation.id).is_some() {
            return Err(StoreError::Backend(format!(
                "reservation {} already exists",
                reservation.id
            )));
        }
        self.writes
            .push(Write::InsertReservation(reservation.clone()));
        Ok(())
    }

    async fn update_reservation(&mut self, reservation: &Reservation) -> Result<(), StoreError> {
        if self.effective_reservation(reservation.id).is_none() {
            return Err(StoreError::Backend(format!(
                "reservation {} does not exist",
                reservation.id
            )));
        }
        self.writes
            .push(Write::UpdateReservation(reservation.clone()));
        Ok(())
    }

    async fn sum_pending_quantity(&mut self, product_id: ProductId) -> Result<i64, StoreError> {
        let committed = self.state.lock().expect("state poisoned");
        let mut rows: HashMap<ReservationId, Reservation> = committed
            .reservations
            .values()
            .filter(|r| r.product_id == product_id)
            .map(|r| (r.id, r.clone()))
            .collect();
        drop(committed);

        for write in &self.writes {
            match write {
                Write::InsertReservation(r) | Write::UpdateReservation(r)
                    if r.product_id == product_id =>
                {
                    rows.insert(r.id, r.clone());
                }
                _ => {}
            }
        }

        Ok(rows
            .values()
            .filter(|r| r.status == ReservationStatus::Pending)
            .map(|r| r.quantity)
            .sum())
    }

    async fn append_entry(&mut self, entry: &TransactionLogEntry) -> Result<(), StoreError> {
        self.writes.push(Write::AppendEntry(entry.clone()));
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("state poisoned");
        let mut scratch = state.clone();

        for write in &self.writes {
            match write {
                Write::InsertLedger(l) => {
                    if scratch.ledgers.contains_key(&l.product_id) {
                        return Err(StoreError::Serialization(format!(
                            "ledger for product {} created concurrently",
                            l.product_id
                        )));
                    }
                    scratch.ledgers.insert(l.product_id, l.clone());
                }
                Write::Delta {
                    product_id,
                    delta,
                    guard,
                    new_version,
                } => {
                    let ledger = scratch.ledgers.get_mut(product_id).ok_or_else(|| {
                        StoreError::Backend(format!("ledger for product {product_id} vanished"))
                    })?;
                    if let Some(g) = guard {
                        // Re-validated under the state lock: a writer that
                        // committed since the guard was issued wins the race.
                        if ledger.version != g.expected_version
                            || ledger.available_stock < g.min_available
                        {
                            return Err(StoreError::Serialization(format!(
                                "version guard no longer holds for product {product_id}"
                            )));
                        }
                    }
                    apply_delta(ledger, *delta, *new_version);
                    check_constraints(ledger)?;
                }
                Write::SetReserved {
                    product_id,
                    reserved,
                    new_version,
                } => {
                    let ledger = scratch.ledgers.get_mut(product_id).ok_or_else(|| {
                        StoreError::Backend(format!("ledger for product {product_id} vanished"))
                    })?;
                    apply_set_reserved(ledger, *reserved, *new_version);
                    check_constraints(ledger)?;
                }
                Write::InsertReservation(r) => {
                    if scratch.reservations.contains_key(&r.id) {
                        return Err(StoreError::Backend(format!(
                            "duplicate reservation id {}",
                            r.id
                        )));
                    }
                    scratch.reservations.insert(r.id, r.clone());
                }
                Write::UpdateReservation(r) => {
                    scratch.reservations.insert(r.id, r.clone());
                }
                Write::AppendEntry(e) => {
                    scratch.entries.push(e.clone());
                }
            }
        }

        *state = scratch;
        Ok(())
        // Row locks in `self.held` release on drop.
    }

    async fn rollback(self) -> Result<(), StoreError> {
        // Staged writes are discarded and row locks released on drop.
        Ok(())
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    type Tx = InMemoryTx;

    async fn begin(&self, _isolation: IsolationLevel) -> Result<Self::Tx, StoreError> {
        // Isolation is accepted for interface parity; the staged-write model
        // already gives snapshot-like reads within one transaction.
        Ok(InMemoryTx {
            state: self.state.clone(),
            locks: self.locks.clone(),
            held: Vec::new(),
            writes: Vec::new(),
        })
    }

    async fn ledger(&self, product_id: ProductId) -> Result<Option<StockLedger>, StoreError> {
        let state = self.state.lock().expect("state poisoned");
        Ok(state.ledgers.get(&product_id).cloned())
    }

    async fn reservation(
        &self,
        id: ReservationId,
    ) -> Result<Option<Reservation>, StoreError> {
        let state = self.state.lock().expect("state poisoned");
        Ok(state.reservations.get(&id).cloned())
    }

    async fn pending_created_since(
        &self,
        product_id: ProductId,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let state = self.state.lock().expect("state poisoned");
        Ok(state
            .reservations
            .values()
            .filter(|r| {
                r.product_id == product_id
                    && r.status == ReservationStatus::Pending
                    && r.created_at >= since
            })
            .count() as u64)
    }

    async fn expired_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationId>, StoreError> {
        let state = self.state.lock().expect("state poisoned");
        let mut expired: Vec<&Reservation> = state
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Pending && r.expires_at < now)
            .collect();
        expired.sort_by_key(|r| r.created_at);
        Ok(expired.iter().map(|r| r.id).collect())
    }

    async fn entries(
        &self,
        product_id: ProductId,
    ) -> Result<Vec<TransactionLogEntry>, StoreError> {
        let state = self.state.lock().expect("state poisoned");
        Ok(state
            .entries
            .iter()
            .filter(|e| e.product_id == product_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stocklock_ledger::ledger::DEFAULT_WAREHOUSE_CODE;

    fn seeded_store(physical: i64) -> (InMemoryStockStore, ProductId) {
        let store = InMemoryStockStore::new();
        let product_id = ProductId::new();
        let mut ledger = StockLedger::new(product_id, DEFAULT_WAREHOUSE_CODE, Utc::now());
        ledger.inbound(physical, Utc::now()).unwrap();
        store.seed_ledger(ledger);
        (store, product_id)
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let (store, product_id) = seeded_store(10);

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.apply_ledger_delta(product_id, LedgerDelta::reserve(4), None, Utc::now())
            .await
            .unwrap();

        let outside = store.ledger(product_id).await.unwrap().unwrap();
        assert_eq!(outside.reserved_stock, 0);

        tx.commit().await.unwrap();
        let outside = store.ledger(product_id).await.unwrap().unwrap();
        assert_eq!(outside.reserved_stock, 4);
        assert_eq!(outside.available_stock, 6);
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let (store, product_id) = seeded_store(10);

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.apply_ledger_delta(product_id, LedgerDelta::reserve(4), None, Utc::now())
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let outside = store.ledger(product_id).await.unwrap().unwrap();
        assert_eq!(outside.reserved_stock, 0);
    }

    #[tokio::test]
    async fn stale_version_guard_affects_zero_rows() {
        let (store, product_id) = seeded_store(10);
        let captured = store.ledger(product_id).await.unwrap().unwrap().version;

        // A concurrent writer commits first, advancing the version.
        let mut other = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let bumped = captured + chrono::Duration::milliseconds(5);
        other
            .apply_ledger_delta(product_id, LedgerDelta::reserve(1), None, bumped)
            .await
            .unwrap();
        other.commit().await.unwrap();

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let rows = tx
            .apply_ledger_delta(
                product_id,
                LedgerDelta::reserve(2),
                Some(VersionGuard {
                    expected_version: captured,
                    min_available: 2,
                }),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn commit_revalidates_version_guard() {
        let (store, product_id) = seeded_store(10);
        let captured = store.ledger(product_id).await.unwrap().unwrap().version;
        let guard = VersionGuard {
            expected_version: captured,
            min_available: 2,
        };

        // Guard passes at issue time...
        let mut loser = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let rows = loser
            .apply_ledger_delta(product_id, LedgerDelta::reserve(2), Some(guard), Utc::now())
            .await
            .unwrap();
        assert_eq!(rows, 1);

        // ...but another transaction commits before us.
        let mut winner = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let bumped = captured + chrono::Duration::milliseconds(5);
        winner
            .apply_ledger_delta(product_id, LedgerDelta::reserve(1), None, bumped)
            .await
            .unwrap();
        winner.commit().await.unwrap();

        let err = loser.commit().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn commit_enforces_non_negative_counts() {
        let (store, product_id) = seeded_store(3);

        let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
        tx.fetch_ledger(product_id, LockMode::Update).await.unwrap();
        tx.apply_ledger_delta(product_id, LedgerDelta::reserve(5), None, Utc::now())
            .await
            .unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::CheckViolation(_)));

        // The failed commit must not have half-applied.
        let outside = store.ledger(product_id).await.unwrap().unwrap();
        assert_eq!(outside.available_stock, 3);
        assert_eq!(outside.reserved_stock, 0);
    }

    #[tokio::test]
    async fn row_lock_blocks_second_locker_until_commit() {
        let (store, product_id) = seeded_store(10);

        let mut holder = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
        holder
            .fetch_ledger(product_id, LockMode::Update)
            .await
            .unwrap();

        let contender_store = store.clone();
        let contender = tokio::spawn(async move {
            let mut tx = contender_store
                .begin(IsolationLevel::RepeatableRead)
                .await
                .unwrap();
            let ledger = tx
                .fetch_ledger(product_id, LockMode::Update)
                .await
                .unwrap()
                .unwrap();
            tx.rollback().await.unwrap();
            ledger.reserved_stock
        });

        // Give the contender a chance to block on the row lock.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        holder
            .apply_ledger_delta(product_id, LedgerDelta::reserve(4), None, Utc::now())
            .await
            .unwrap();
        holder.commit().await.unwrap();

        // Once the lock releases the contender observes the committed write.
        assert_eq!(contender.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn transaction_reads_its_own_staged_writes() {
        let (store, product_id) = seeded_store(10);

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.apply_ledger_delta(product_id, LedgerDelta::reserve(4), None, Utc::now())
            .await
            .unwrap();

        let seen = tx
            .fetch_ledger(product_id, LockMode::None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.reserved_stock, 4);
        tx.rollback().await.unwrap();
    }
}
