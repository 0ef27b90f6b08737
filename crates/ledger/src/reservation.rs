//! Reservation lifecycle: a time-bounded hold against available stock.
//!
//! State machine: `Pending → {Confirmed, Cancelled, Expired}`. The three
//! outcomes are terminal; no transition leaves them. `Expired` is reached only
//! through the maintenance sweeper; an explicit cancel lands in `Cancelled`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use stocklock_core::{ActorId, ProductId, ReservationId, StockError, StockResult};

/// Default lifetime of a pending reservation.
pub const DEFAULT_RESERVATION_MINUTES: i64 = 30;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
        }
    }
}

impl core::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hold against a product's available stock.
///
/// Reservations are never deleted; terminal rows stay behind for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub order_id: Option<String>,
    pub owner: ActorId,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

impl Reservation {
    /// Create a pending reservation expiring `duration_minutes` from `now`.
    pub fn pending(
        product_id: ProductId,
        quantity: i64,
        owner: ActorId,
        order_id: Option<String>,
        duration_minutes: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            product_id,
            quantity,
            order_id,
            owner,
            status: ReservationStatus::Pending,
            created_at: now,
            expires_at: now + Duration::minutes(duration_minutes),
            confirmed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Whether the hold was ever converted into an outbound deduction.
    /// Cancelling a confirmed reservation must not release stock again.
    pub fn was_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }

    /// Pending → Confirmed. Rejects non-pending states and expired holds.
    pub fn confirm(&mut self, now: DateTime<Utc>) -> StockResult<()> {
        if self.status != ReservationStatus::Pending {
            return Err(StockError::invalid_state(format!(
                "cannot confirm a {} reservation",
                self.status
            )));
        }
        if self.is_expired(now) {
            return Err(StockError::Expired);
        }
        self.status = ReservationStatus::Confirmed;
        self.confirmed_at = Some(now);
        Ok(())
    }

    /// Move to Cancelled, recording when and why. Cancelling twice fails.
    pub fn cancel(&mut self, now: DateTime<Utc>, reason: Option<String>) -> StockResult<()> {
        self.cancel_as(ReservationStatus::Cancelled, now, reason)
    }

    /// Sweeper variant: move to Expired instead of Cancelled.
    pub fn expire(&mut self, now: DateTime<Utc>) -> StockResult<()> {
        self.cancel_as(
            ReservationStatus::Expired,
            now,
            Some("reservation expired".to_string()),
        )
    }

    fn cancel_as(
        &mut self,
        terminal: ReservationStatus,
        now: DateTime<Utc>,
        reason: Option<String>,
    ) -> StockResult<()> {
        if matches!(
            self.status,
            ReservationStatus::Cancelled | ReservationStatus::Expired
        ) {
            return Err(StockError::AlreadyCancelled);
        }
        self.status = terminal;
        self.cancelled_at = Some(now);
        self.cancellation_reason = reason;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_reservation(duration_minutes: i64) -> Reservation {
        Reservation::pending(
            ProductId::new(),
            10,
            ActorId::new(),
            Some("order-1".to_string()),
            duration_minutes,
            Utc::now(),
        )
    }

    #[test]
    fn pending_confirms_before_expiry() {
        let mut res = test_reservation(30);
        res.confirm(Utc::now()).unwrap();
        assert_eq!(res.status, ReservationStatus::Confirmed);
        assert!(res.confirmed_at.is_some());
    }

    #[test]
    fn expired_pending_cannot_confirm() {
        let mut res = test_reservation(30);
        let later = res.expires_at + Duration::seconds(1);
        assert!(matches!(res.confirm(later), Err(StockError::Expired)));
        assert_eq!(res.status, ReservationStatus::Pending);
    }

    #[test]
    fn confirmed_is_terminal() {
        let mut res = test_reservation(30);
        res.confirm(Utc::now()).unwrap();
        assert!(matches!(
            res.confirm(Utc::now()),
            Err(StockError::InvalidState(_))
        ));
    }

    #[test]
    fn double_cancel_is_rejected() {
        let mut res = test_reservation(30);
        res.cancel(Utc::now(), Some("caller change of mind".to_string()))
            .unwrap();
        assert!(matches!(
            res.cancel(Utc::now(), None),
            Err(StockError::AlreadyCancelled)
        ));
        assert!(matches!(res.expire(Utc::now()), Err(StockError::AlreadyCancelled)));
    }

    #[test]
    fn expire_records_reason_and_terminal_status() {
        let mut res = test_reservation(0);
        res.expire(Utc::now()).unwrap();
        assert_eq!(res.status, ReservationStatus::Expired);
        assert!(res.status.is_terminal());
        assert_eq!(res.cancellation_reason.as_deref(), Some("reservation expired"));
    }
}
