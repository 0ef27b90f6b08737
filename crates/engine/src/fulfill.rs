//! Confirm and cancel reservations.
//!
//! Both paths lock the reservation row first and the ledger row second, in
//! that order everywhere, so two fulfillment calls can never deadlock each
//! other. Confirmation converts the hold into an outbound shipment; physical
//! and reserved drop together and available is untouched. Cancellation
//! releases the hold back to available, unless the reservation was already
//! confirmed (the goods left the warehouse; there is nothing to put back).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use stocklock_core::{Principal, StockError, StockResult, ReservationId};
use stocklock_ledger::{
    Reservation, ReservationStatus, StockTransactionKind, TransactionLogEntry,
};

use crate::cache::StockCache;
use crate::outcome::OperationOutcome;
use crate::store::{IsolationLevel, LedgerDelta, LockMode, StockStore, StockTx, StoreError};

/// Drives the terminal transitions of the reservation state machine.
pub struct FulfillmentService<S, C> {
    store: Arc<S>,
    cache: Arc<C>,
}

fn lift(err: StoreError) -> StockError {
    StockError::internal(err.to_string())
}

impl<S: StockStore, C: StockCache> FulfillmentService<S, C> {
    pub fn new(store: Arc<S>, cache: Arc<C>) -> Self {
        Self { store, cache }
    }

    /// Confirm a pending reservation: the held units ship out.
    ///
    /// Privileged actors only; fulfillment is a back-office operation.
    #[instrument(skip(self, principal), fields(reservation_id = %reservation_id))]
    pub async fn confirm(
        &self,
        reservation_id: ReservationId,
        principal: &Principal,
    ) -> OperationOutcome {
        self.try_confirm(reservation_id, principal).await.into()
    }

    async fn try_confirm(
        &self,
        reservation_id: ReservationId,
        principal: &Principal,
    ) -> StockResult<()> {
        if !principal.privileged {
            return Err(StockError::permission_denied(
                "confirming a reservation requires a privileged actor",
            ));
        }

        let mut tx = self
            .store
            .begin(IsolationLevel::ReadCommitted)
            .await
            .map_err(lift)?;

        let mut reservation = tx
            .fetch_reservation(reservation_id, LockMode::Update)
            .await
            .map_err(lift)?
            .ok_or(StockError::ReservationNotFound)?;

        let now = Utc::now();
        reservation.confirm(now)?;

        let ledger = tx
            .fetch_ledger(reservation.product_id, LockMode::Update)
            .await
            .map_err(lift)?
            .ok_or(StockError::StockNotFound)?;

        let rows = tx
            .apply_ledger_delta(
                reservation.product_id,
                LedgerDelta::outbound(reservation.quantity),
                None,
                now,
            )
            .await
            .map_err(lift)?;
        if rows == 0 {
            return Err(StockError::internal("locked ledger row disappeared"));
        }

        tx.update_reservation(&reservation).await.map_err(lift)?;

        let mut after = ledger.clone();
        after.confirm_outbound(reservation.quantity, now)?;
        let entry = TransactionLogEntry::record(
            StockTransactionKind::Outbound,
            reservation.quantity,
            &ledger,
            &after,
            now,
        )
        .with_reference("reservation", reservation.id.to_string())
        .with_metadata(serde_json::json!({
            "order_id": reservation.order_id,
            "actor": principal.id,
        }));
        tx.append_entry(&entry).await.map_err(lift)?;

        tx.commit().await.map_err(lift)?;
        self.cache.invalidate_product(reservation.product_id);
        debug!(product_id = %reservation.product_id, quantity = reservation.quantity, "reservation confirmed");
        Ok(())
    }

    /// Cancel a reservation and release its hold.
    ///
    /// The owner may cancel their own pending reservation; a privileged actor
    /// may cancel anyone's. `force` additionally allows cancelling a
    /// confirmed reservation (privileged only), which records the
    /// cancellation without releasing stock that already shipped.
    #[instrument(skip(self, principal, reason), fields(reservation_id = %reservation_id, force))]
    pub async fn cancel(
        &self,
        reservation_id: ReservationId,
        principal: &Principal,
        reason: Option<String>,
        force: bool,
    ) -> OperationOutcome {
        self.try_cancel(reservation_id, principal, reason, force)
            .await
            .into()
    }

    async fn try_cancel(
        &self,
        reservation_id: ReservationId,
        principal: &Principal,
        reason: Option<String>,
        force: bool,
    ) -> StockResult<()> {
        let mut tx = self
            .store
            .begin(IsolationLevel::ReadCommitted)
            .await
            .map_err(lift)?;

        let mut reservation = tx
            .fetch_reservation(reservation_id, LockMode::Update)
            .await
            .map_err(lift)?
            .ok_or(StockError::ReservationNotFound)?;

        // Idempotence check comes before any permission gate so a repeated
        // cancel always reports the same thing regardless of caller.
        if matches!(
            reservation.status,
            ReservationStatus::Cancelled | ReservationStatus::Expired
        ) {
            return Err(StockError::AlreadyCancelled);
        }
        if force && !principal.privileged {
            return Err(StockError::permission_denied(
                "forced cancellation requires a privileged actor",
            ));
        }
        if reservation.owner != principal.id && !principal.privileged {
            return Err(StockError::permission_denied(
                "only the owner or a privileged actor may cancel a reservation",
            ));
        }
        if reservation.status != ReservationStatus::Pending && !force {
            return Err(StockError::invalid_state(format!(
                "cannot cancel a {} reservation without force",
                reservation.status
            )));
        }

        let now = Utc::now();
        let release_stock = !reservation.was_confirmed();
        reservation.cancel(now, reason)?;

        if release_stock {
            self.release_hold(&mut tx, &reservation, now).await?;
        }

        tx.update_reservation(&reservation).await.map_err(lift)?;
        tx.commit().await.map_err(lift)?;
        self.cache.invalidate_product(reservation.product_id);
        debug!(
            product_id = %reservation.product_id,
            released = release_stock,
            "reservation cancelled"
        );
        Ok(())
    }

    /// Expire one overdue pending reservation (sweeper path). Re-checks
    /// state and deadline under the row lock; a reservation that got
    /// confirmed or cancelled since the sweep scan is left alone.
    #[instrument(skip(self), fields(reservation_id = %reservation_id))]
    pub async fn expire(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> StockResult<()> {
        let mut tx = self
            .store
            .begin(IsolationLevel::ReadCommitted)
            .await
            .map_err(lift)?;

        let mut reservation = tx
            .fetch_reservation(reservation_id, LockMode::Update)
            .await
            .map_err(lift)?
            .ok_or(StockError::ReservationNotFound)?;

        if reservation.status != ReservationStatus::Pending {
            return Err(StockError::invalid_state(format!(
                "reservation is {}, not pending",
                reservation.status
            )));
        }
        if !reservation.is_expired(now) {
            return Err(StockError::invalid_state(
                "reservation deadline has not passed",
            ));
        }

        reservation.expire(now)?;
        self.release_hold(&mut tx, &reservation, now).await?;
        tx.update_reservation(&reservation).await.map_err(lift)?;
        tx.commit().await.map_err(lift)?;
        self.cache.invalidate_product(reservation.product_id);
        debug!(product_id = %reservation.product_id, quantity = reservation.quantity, "reservation expired");
        Ok(())
    }

    /// Put a hold's units back into available stock and log the release.
    async fn release_hold(
        &self,
        tx: &mut S::Tx,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> StockResult<()> {
        let ledger = tx
            .fetch_ledger(reservation.product_id, LockMode::Update)
            .await
            .map_err(lift)?
            .ok_or(StockError::StockNotFound)?;

        let rows = tx
            .apply_ledger_delta(
                reservation.product_id,
                LedgerDelta::release(reservation.quantity),
                None,
                now,
            )
            .await
            .map_err(lift)?;
        if rows == 0 {
            return Err(StockError::internal("locked ledger row disappeared"));
        }

        let mut after = ledger.clone();
        after.release(reservation.quantity, now)?;
        let notes = reservation
            .cancellation_reason
            .clone()
            .unwrap_or_default();
        let entry = TransactionLogEntry::record(
            StockTransactionKind::Release,
            reservation.quantity,
            &ledger,
            &after,
            now,
        )
        .with_reference("reservation", reservation.id.to_string())
        .with_notes(notes)
        .with_metadata(serde_json::json!({
            "order_id": reservation.order_id,
            "status": reservation.status,
        }));
        tx.append_entry(&entry).await.map_err(lift)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::InMemoryStockCache;
    use crate::store::memory::InMemoryStockStore;
    use chrono::Duration;
    use stocklock_core::{ActorId, ErrorCode};
    use stocklock_ledger::{ledger::DEFAULT_WAREHOUSE_CODE, StockLedger};

    struct Fixture {
        service: FulfillmentService<InMemoryStockStore, InMemoryStockCache>,
        store: Arc<InMemoryStockStore>,
        reservation: Reservation,
        owner: Principal,
        staff: Principal,
    }

    /// A ledger with `held` units already reserved out of `physical`, plus
    /// one pending reservation backing the hold.
    fn fixture(physical: i64, held: i64) -> Fixture {
        let store = Arc::new(InMemoryStockStore::new());
        let product_id = stocklock_core::ProductId::new();
        let owner = Principal::user(ActorId::new());
        let staff = Principal::privileged(ActorId::new());

        let mut ledger = StockLedger::new(product_id, DEFAULT_WAREHOUSE_CODE, Utc::now());
        ledger.inbound(physical, Utc::now()).unwrap();
        ledger.reserve(held, Utc::now()).unwrap();
        store.seed_ledger(ledger);

        let reservation = Reservation::pending(product_id, held, owner.id, None, 30, Utc::now());
        store.seed_reservation(reservation.clone());

        let service = FulfillmentService::new(store.clone(), Arc::new(InMemoryStockCache::new()));
        Fixture {
            service,
            store,
            reservation,
            owner,
            staff,
        }
    }

    #[tokio::test]
    async fn confirm_ships_held_units() {
        let f = fixture(100, 30);

        let outcome = f.service.confirm(f.reservation.id, &f.staff).await;
        assert!(outcome.success);

        let ledger = f
            .store
            .ledger(f.reservation.product_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ledger.physical_stock, 70);
        assert_eq!(ledger.reserved_stock, 0);
        assert_eq!(ledger.available_stock, 70);

        let stored = f.store.reservation(f.reservation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Confirmed);
        assert!(stored.confirmed_at.is_some());

        let entries = f.store.entries(f.reservation.product_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, StockTransactionKind::Outbound);
    }

    #[tokio::test]
    async fn confirm_requires_privilege() {
        let f = fixture(100, 30);

        let outcome = f.service.confirm(f.reservation.id, &f.owner).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_code, Some(ErrorCode::PermissionDenied));

        // Nothing changed.
        let stored = f.store.reservation(f.reservation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Pending);
    }

    #[tokio::test]
    async fn confirm_rejects_expired_reservation() {
        let f = fixture(100, 30);
        let mut stale = f.reservation.clone();
        stale.expires_at = Utc::now() - Duration::minutes(1);
        f.store.seed_reservation(stale);

        let outcome = f.service.confirm(f.reservation.id, &f.staff).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_code, Some(ErrorCode::ReservationExpired));

        let ledger = f
            .store
            .ledger(f.reservation.product_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ledger.physical_stock, 100);
    }

    #[tokio::test]
    async fn confirm_unknown_reservation() {
        let f = fixture(10, 5);
        let outcome = f.service.confirm(ReservationId::new(), &f.staff).await;
        assert_eq!(outcome.error_code, Some(ErrorCode::ReservationNotFound));
    }

    #[tokio::test]
    async fn owner_cancel_releases_hold() {
        let f = fixture(100, 30);

        let outcome = f
            .service
            .cancel(
                f.reservation.id,
                &f.owner,
                Some("changed my mind".to_string()),
                false,
            )
            .await;
        assert!(outcome.success);

        let ledger = f
            .store
            .ledger(f.reservation.product_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ledger.physical_stock, 100);
        assert_eq!(ledger.reserved_stock, 0);
        assert_eq!(ledger.available_stock, 100);

        let stored = f.store.reservation(f.reservation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Cancelled);
        assert_eq!(stored.cancellation_reason.as_deref(), Some("changed my mind"));

        let entries = f.store.entries(f.reservation.product_id).await.unwrap();
        assert_eq!(entries[0].kind, StockTransactionKind::Release);
        assert_eq!(entries[0].notes, "changed my mind");
    }

    #[tokio::test]
    async fn stranger_cannot_cancel() {
        let f = fixture(100, 30);
        let stranger = Principal::user(ActorId::new());

        let outcome = f.service.cancel(f.reservation.id, &stranger, None, false).await;
        assert_eq!(outcome.error_code, Some(ErrorCode::PermissionDenied));
    }

    #[tokio::test]
    async fn privileged_actor_can_cancel_for_others() {
        let f = fixture(100, 30);
        let outcome = f.service.cancel(f.reservation.id, &f.staff, None, false).await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn double_cancel_reports_already_cancelled() {
        let f = fixture(100, 30);

        assert!(f
            .service
            .cancel(f.reservation.id, &f.owner, None, false)
            .await
            .success);
        let outcome = f.service.cancel(f.reservation.id, &f.owner, None, false).await;
        assert_eq!(outcome.error_code, Some(ErrorCode::AlreadyCancelled));

        // Stock was released exactly once.
        let ledger = f
            .store
            .ledger(f.reservation.product_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ledger.available_stock, 100);
    }

    #[tokio::test]
    async fn cancelling_confirmed_needs_force() {
        let f = fixture(100, 30);
        assert!(f.service.confirm(f.reservation.id, &f.staff).await.success);

        let outcome = f.service.cancel(f.reservation.id, &f.staff, None, false).await;
        assert_eq!(
            outcome.error_code,
            Some(ErrorCode::InvalidReservationState)
        );
    }

    #[tokio::test]
    async fn force_cancel_confirmed_does_not_release_shipped_stock() {
        let f = fixture(100, 30);
        assert!(f.service.confirm(f.reservation.id, &f.staff).await.success);

        let outcome = f
            .service
            .cancel(f.reservation.id, &f.staff, Some("order rework".to_string()), true)
            .await;
        assert!(outcome.success);

        // Units already shipped; cancellation is bookkeeping only.
        let ledger = f
            .store
            .ledger(f.reservation.product_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ledger.physical_stock, 70);
        assert_eq!(ledger.reserved_stock, 0);
        assert_eq!(ledger.available_stock, 70);

        let stored = f.store.reservation(f.reservation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Cancelled);
    }

    #[tokio::test]
    async fn force_cancel_requires_privilege() {
        let f = fixture(100, 30);
        let outcome = f.service.cancel(f.reservation.id, &f.owner, None, true).await;
        assert_eq!(outcome.error_code, Some(ErrorCode::PermissionDenied));
    }

    #[tokio::test]
    async fn expire_releases_hold_and_marks_expired() {
        let f = fixture(100, 30);
        let later = f.reservation.expires_at + Duration::seconds(1);

        f.service.expire(f.reservation.id, later).await.unwrap();

        let ledger = f
            .store
            .ledger(f.reservation.product_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ledger.available_stock, 100);
        assert_eq!(ledger.reserved_stock, 0);

        let stored = f.store.reservation(f.reservation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Expired);
    }

    #[tokio::test]
    async fn expire_skips_unexpired_reservation() {
        let f = fixture(100, 30);
        let err = f
            .service
            .expire(f.reservation.id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StockError::InvalidState(_)));
    }
}
