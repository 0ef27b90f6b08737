//! Postgres-backed stock store.
//!
//! Expected schema (see `migrations/`):
//!
//! - `stock_ledgers(product_id uuid primary key, physical_stock bigint,
//!   reserved_stock bigint, available_stock bigint, min_stock_level bigint,
//!   reorder_point bigint, warehouse_code text, version timestamptz)` with
//!   check constraints keeping every count non-negative.
//! - `reservations(id uuid primary key, product_id uuid, quantity bigint,
//!   order_id text, owner uuid, status text, created_at timestamptz,
//!   expires_at timestamptz, confirmed_at timestamptz, cancelled_at
//!   timestamptz, cancellation_reason text)`.
//! - `stock_transactions(id uuid primary key, product_id uuid, kind text,
//!   quantity bigint, reference_type text, reference_id text,
//!   before_physical bigint, after_physical bigint, before_available bigint,
//!   after_available bigint, notes text, metadata jsonb, created_at
//!   timestamptz)`.
//!
//! ## Error mapping
//!
//! | PostgreSQL error code | `StoreError` | Scenario |
//! |-----------------------|--------------|----------|
//! | `40001` | `Serialization` | serialization failure at REPEATABLE READ or above |
//! | `40P01` | `Deadlock` | transaction chosen as deadlock victim |
//! | `23514` | `CheckViolation` | a non-negativity constraint rejected the write |
//! | other | `Backend` | connection loss, pool closed, bad data, ... |
//!
//! The version-guarded update relies on READ COMMITTED semantics: a
//! conditional `UPDATE` blocks on the concurrent writer's row lock,
//! re-evaluates its predicate after that writer commits, and reports zero
//! rows affected when the guard no longer holds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use stocklock_core::{ActorId, EntryId, ProductId, ReservationId};
use stocklock_engine::store::{
    IsolationLevel, LedgerDelta, LockMode, StockStore, StockTx, StoreError, VersionGuard,
};
use stocklock_ledger::{
    Reservation, ReservationStatus, StockLedger, StockTransactionKind, TransactionLogEntry,
};

/// Postgres implementation of [`StockStore`].
#[derive(Debug, Clone)]
pub struct PostgresStockStore {
    pool: PgPool,
}

impl PostgresStockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// One open Postgres transaction.
pub struct PgStockTx {
    tx: Transaction<'static, Postgres>,
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("40001") => StoreError::Serialization(msg),
                Some("40P01") => StoreError::Deadlock(msg),
                Some("23514") => StoreError::CheckViolation(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

fn parse_status(s: &str) -> Result<ReservationStatus, StoreError> {
    match s {
        "pending" => Ok(ReservationStatus::Pending),
        "confirmed" => Ok(ReservationStatus::Confirmed),
        "cancelled" => Ok(ReservationStatus::Cancelled),
        "expired" => Ok(ReservationStatus::Expired),
        other => Err(StoreError::Backend(format!(
            "unknown reservation status '{other}' in database"
        ))),
    }
}

fn parse_kind(s: &str) -> Result<StockTransactionKind, StoreError> {
    match s {
        "inbound" => Ok(StockTransactionKind::Inbound),
        "outbound" => Ok(StockTransactionKind::Outbound),
        "reserve" => Ok(StockTransactionKind::Reserve),
        "release" => Ok(StockTransactionKind::Release),
        "adjust" => Ok(StockTransactionKind::Adjust),
        "return" => Ok(StockTransactionKind::Return),
        "transfer" => Ok(StockTransactionKind::Transfer),
        other => Err(StoreError::Backend(format!(
            "unknown transaction kind '{other}' in database"
        ))),
    }
}

const LEDGER_COLUMNS: &str = "product_id, physical_stock, reserved_stock, available_stock, \
     min_stock_level, reorder_point, warehouse_code, version";

const RESERVATION_COLUMNS: &str = "id, product_id, quantity, order_id, owner, status, \
     created_at, expires_at, confirmed_at, cancelled_at, cancellation_reason";

const ENTRY_COLUMNS: &str = "id, product_id, kind, quantity, reference_type, reference_id, \
     before_physical, after_physical, before_available, after_available, notes, metadata, \
     created_at";

#[derive(Debug)]
struct LedgerRow {
    product_id: uuid::Uuid,
    physical_stock: i64,
    reserved_stock: i64,
    available_stock: i64,
    min_stock_level: i64,
    reorder_point: i64,
    warehouse_code: String,
    version: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for LedgerRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(LedgerRow {
            product_id: row.try_get("product_id")?,
            physical_stock: row.try_get("physical_stock")?,
            reserved_stock: row.try_get("reserved_stock")?,
            available_stock: row.try_get("available_stock")?,
            min_stock_level: row.try_get("min_stock_level")?,
            reorder_point: row.try_get("reorder_point")?,
            warehouse_code: row.try_get("warehouse_code")?,
            version: row.try_get("version")?,
        })
    }
}

impl From<LedgerRow> for StockLedger {
    fn from(row: LedgerRow) -> Self {
        StockLedger {
            product_id: ProductId::from_uuid(row.product_id),
            physical_stock: row.physical_stock,
            reserved_stock: row.reserved_stock,
            available_stock: row.available_stock,
            min_stock_level: row.min_stock_level,
            reorder_point: row.reorder_point,
            warehouse_code: row.warehouse_code,
            version: row.version,
        }
    }
}

#[derive(Debug)]
struct ReservationRow {
    id: uuid::Uuid,
    product_id: uuid::Uuid,
    quantity: i64,
    order_id: Option<String>,
    owner: uuid::Uuid,
    status: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancellation_reason: Option<String>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for ReservationRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ReservationRow {
            id: row.try_get("id")?,
            product_id: row.try_get("product_id")?,
            quantity: row.try_get("quantity")?,
            order_id: row.try_get("order_id")?,
            owner: row.try_get("owner")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            confirmed_at: row.try_get("confirmed_at")?,
            cancelled_at: row.try_get("cancelled_at")?,
            cancellation_reason: row.try_get("cancellation_reason")?,
        })
    }
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> Result<Self, StoreError> {
        Ok(Reservation {
            id: ReservationId::from_uuid(row.id),
            product_id: ProductId::from_uuid(row.product_id),
            quantity: row.quantity,
            order_id: row.order_id,
            owner: ActorId::from_uuid(row.owner),
            status: parse_status(&row.status)?,
            created_at: row.created_at,
            expires_at: row.expires_at,
            confirmed_at: row.confirmed_at,
            cancelled_at: row.cancelled_at,
            cancellation_reason: row.cancellation_reason,
        })
    }
}

#[derive(Debug)]
struct EntryRow {
    id: uuid::Uuid,
    product_id: uuid::Uuid,
    kind: String,
    quantity: i64,
    reference_type: String,
    reference_id: String,
    before_physical: i64,
    after_physical: i64,
    before_available: i64,
    after_available: i64,
    notes: String,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for EntryRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(EntryRow {
            id: row.try_get("id")?,
            product_id: row.try_get("product_id")?,
            kind: row.try_get("kind")?,
            quantity: row.try_get("quantity")?,
            reference_type: row.try_get("reference_type")?,
            reference_id: row.try_get("reference_id")?,
            before_physical: row.try_get("before_physical")?,
            after_physical: row.try_get("after_physical")?,
            before_available: row.try_get("before_available")?,
            after_available: row.try_get("after_available")?,
            notes: row.try_get("notes")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<EntryRow> for TransactionLogEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, StoreError> {
        Ok(TransactionLogEntry {
            id: EntryId::from_uuid(row.id),
            product_id: ProductId::from_uuid(row.product_id),
            kind: parse_kind(&row.kind)?,
            quantity: row.quantity,
            reference_type: row.reference_type,
            reference_id: row.reference_id,
            before_physical: row.before_physical,
            after_physical: row.after_physical,
            before_available: row.before_available,
            after_available: row.after_available,
            notes: row.notes,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl StockTx for PgStockTx {
    async fn fetch_ledger(
        &mut self,
        product_id: ProductId,
        lock: LockMode,
    ) -> Result<Option<StockLedger>, StoreError> {
        let sql = match lock {
            LockMode::None => format!(
                "SELECT {LEDGER_COLUMNS} FROM stock_ledgers WHERE product_id = $1"
            ),
            LockMode::Update => format!(
                "SELECT {LEDGER_COLUMNS} FROM stock_ledgers WHERE product_id = $1 FOR UPDATE"
            ),
        };
        let row = sqlx::query(&sql)
            .bind(product_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("fetch_ledger", e))?;

        match row {
            Some(row) => {
                let ledger = LedgerRow::from_row(&row)
                    .map_err(|e| map_sqlx_error("fetch_ledger", e))?;
                Ok(Some(ledger.into()))
            }
            None => Ok(None),
        }
    }

    async fn insert_ledger(&mut self, ledger: &StockLedger) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stock_ledgers (
                product_id, physical_stock, reserved_stock, available_stock,
                min_stock_level, reorder_point, warehouse_code, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(ledger.product_id.as_uuid())
        .bind(ledger.physical_stock)
        .bind(ledger.reserved_stock)
        .bind(ledger.available_stock)
        .bind(ledger.min_stock_level)
        .bind(ledger.reorder_point)
        .bind(&ledger.warehouse_code)
        .bind(ledger.version)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_ledger", e))?;
        Ok(())
    }

    async fn apply_ledger_delta(
        &mut self,
        product_id: ProductId,
        delta: LedgerDelta,
        guard: Option<VersionGuard>,
        new_version: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = match guard {
            Some(guard) => sqlx::query(
                r#"
                UPDATE stock_ledgers
                SET physical_stock = physical_stock + $2,
                    reserved_stock = reserved_stock + $3,
                    available_stock = available_stock + $4,
                    version = $5
                WHERE product_id = $1
                    AND version = $6
                    AND available_stock >= $7
                "#,
            )
            .bind(product_id.as_uuid())
            .bind(delta.physical)
            .bind(delta.reserved)
            .bind(delta.available)
            .bind(new_version)
            .bind(guard.expected_version)
            .bind(guard.min_available)
            .execute(&mut *self.tx)
            .await,
            None => sqlx::query(
                r#"
                UPDATE stock_ledgers
                SET physical_stock = physical_stock + $2,
                    reserved_stock = reserved_stock + $3,
                    available_stock = available_stock + $4,
                    version = $5
                WHERE product_id = $1
                "#,
            )
            .bind(product_id.as_uuid())
            .bind(delta.physical)
            .bind(delta.reserved)
            .bind(delta.available)
            .bind(new_version)
            .execute(&mut *self.tx)
            .await,
        };
        let result = result.map_err(|e| map_sqlx_error("apply_ledger_delta", e))?;
        Ok(result.rows_affected())
    }

    async fn set_ledger_reserved(
        &mut self,
        product_id: ProductId,
        reserved: i64,
        new_version: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE stock_ledgers
            SET reserved_stock = $2,
                available_stock = physical_stock - $2,
                version = $3
            WHERE product_id = $1
            "#,
        )
        .bind(product_id.as_uuid())
        .bind(reserved)
        .bind(new_version)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("set_ledger_reserved", e))?;
        Ok(result.rows_affected())
    }

    async fn fetch_reservation(
        &mut self,
        id: ReservationId,
        lock: LockMode,
    ) -> Result<Option<Reservation>, StoreError> {
        let sql = match lock {
            LockMode::None => format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1"
            ),
            LockMode::Update => format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1 FOR UPDATE"
            ),
        };
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("fetch_reservation", e))?;

        match row {
            Some(row) => {
                let res = ReservationRow::from_row(&row)
                    .map_err(|e| map_sqlx_error("fetch_reservation", e))?;
                Ok(Some(res.try_into()?))
            }
            None => Ok(None),
        }
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reservations (
                id, product_id, quantity, order_id, owner, status,
                created_at, expires_at, confirmed_at, cancelled_at, cancellation_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.product_id.as_uuid())
        .bind(reservation.quantity)
        .bind(&reservation.order_id)
        .bind(reservation.owner.as_uuid())
        .bind(reservation.status.as_str())
        .bind(reservation.created_at)
        .bind(reservation.expires_at)
        .bind(reservation.confirmed_at)
        .bind(reservation.cancelled_at)
        .bind(&reservation.cancellation_reason)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_reservation", e))?;
        Ok(())
    }

    async fn update_reservation(&mut self, reservation: &Reservation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE reservations
            SET status = $2,
                expires_at = $3,
                confirmed_at = $4,
                cancelled_at = $5,
                cancellation_reason = $6
            WHERE id = $1
            "#,
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.status.as_str())
        .bind(reservation.expires_at)
        .bind(reservation.confirmed_at)
        .bind(reservation.cancelled_at)
        .bind(&reservation.cancellation_reason)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_reservation", e))?;
        Ok(())
    }

    async fn sum_pending_quantity(&mut self, product_id: ProductId) -> Result<i64, StoreError> {
        // SUM over BIGINT aggregates to NUMERIC; cast back for the i64 decode.
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(quantity), 0)::BIGINT AS total
            FROM reservations
            WHERE product_id = $1 AND status = 'pending'
            "#,
        )
        .bind(product_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("sum_pending_quantity", e))?;

        row.try_get::<i64, _>("total")
            .map_err(|e| map_sqlx_error("sum_pending_quantity", e))
    }

    async fn append_entry(&mut self, entry: &TransactionLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stock_transactions (
                id, product_id, kind, quantity, reference_type, reference_id,
                before_physical, after_physical, before_available, after_available,
                notes, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.product_id.as_uuid())
        .bind(entry.kind.as_str())
        .bind(entry.quantity)
        .bind(&entry.reference_type)
        .bind(&entry.reference_id)
        .bind(entry.before_physical)
        .bind(entry.after_physical)
        .bind(entry.before_available)
        .bind(entry.after_available)
        .bind(&entry.notes)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append_entry", e))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[async_trait]
impl StockStore for PostgresStockStore {
    type Tx = PgStockTx;

    #[instrument(skip(self))]
    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Tx, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        // Must be the first statement in the transaction.
        let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
        sqlx::query(&sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;

        Ok(PgStockTx { tx })
    }

    async fn ledger(&self, product_id: ProductId) -> Result<Option<StockLedger>, StoreError> {
        let sql = format!("SELECT {LEDGER_COLUMNS} FROM stock_ledgers WHERE product_id = $1");
        let row = sqlx::query(&sql)
            .bind(product_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ledger", e))?;

        match row {
            Some(row) => {
                let ledger =
                    LedgerRow::from_row(&row).map_err(|e| map_sqlx_error("ledger", e))?;
                Ok(Some(ledger.into()))
            }
            None => Ok(None),
        }
    }

    async fn reservation(
        &self,
        id: ReservationId,
    ) -> Result<Option<Reservation>, StoreError> {
        let sql = format!("SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("reservation", e))?;

        match row {
            Some(row) => {
                let res = ReservationRow::from_row(&row)
                    .map_err(|e| map_sqlx_error("reservation", e))?;
                Ok(Some(res.try_into()?))
            }
            None => Ok(None),
        }
    }

    async fn pending_created_since(
        &self,
        product_id: ProductId,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM reservations
            WHERE product_id = $1 AND status = 'pending' AND created_at >= $2
            "#,
        )
        .bind(product_id.as_uuid())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_created_since", e))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| map_sqlx_error("pending_created_since", e))?;
        Ok(total.max(0) as u64)
    }

    async fn expired_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM reservations
            WHERE status = 'pending' AND expires_at < $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("expired_pending", e))?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id: uuid::Uuid = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("expired_pending", e))?;
            ids.push(ReservationId::from_uuid(id));
        }
        Ok(ids)
    }

    async fn entries(
        &self,
        product_id: ProductId,
    ) -> Result<Vec<TransactionLogEntry>, StoreError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM stock_transactions WHERE product_id = $1 ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(product_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("entries", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let entry = EntryRow::from_row(&row).map_err(|e| map_sqlx_error("entries", e))?;
            entries.push(entry.try_into()?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            ReservationStatus::Pending,
            ReservationStatus::Confirmed,
            ReservationStatus::Cancelled,
            ReservationStatus::Expired,
        ] {
            assert_eq!(parse_status(status.as_str()).unwrap(), status);
        }
        assert!(parse_status("unknown").is_err());
    }

    #[test]
    fn kind_strings_round_trip() {
        for kind in [
            StockTransactionKind::Inbound,
            StockTransactionKind::Outbound,
            StockTransactionKind::Reserve,
            StockTransactionKind::Release,
            StockTransactionKind::Adjust,
            StockTransactionKind::Return,
            StockTransactionKind::Transfer,
        ] {
            assert_eq!(parse_kind(kind.as_str()).unwrap(), kind);
        }
        assert!(parse_kind("mystery").is_err());
    }
}
