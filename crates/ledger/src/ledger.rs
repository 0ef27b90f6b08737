//! Per-product stock ledger.
//!
//! Invariant: `available_stock + reserved_stock == physical_stock` holds after
//! every mutation, and no count ever goes negative. All mutation methods
//! validate before applying and stamp a fresh `version` token; a rejected
//! mutation leaves the ledger untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocklock_core::{ProductId, StockError, StockResult};

/// Default warehouse code assigned when a ledger is auto-created on first
/// inbound and no code was supplied.
pub const DEFAULT_WAREHOUSE_CODE: &str = "3077006";

/// The stock record for one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLedger {
    pub product_id: ProductId,
    /// Units physically present in the warehouse.
    pub physical_stock: i64,
    /// Units held by open (pending) reservations.
    pub reserved_stock: i64,
    /// Units sellable right now; always `physical - reserved`.
    pub available_stock: i64,
    pub min_stock_level: i64,
    pub reorder_point: i64,
    pub warehouse_code: String,
    /// Last-modification timestamp, doubling as the optimistic-lock token.
    pub version: DateTime<Utc>,
}

impl StockLedger {
    /// Create an empty ledger for a product.
    pub fn new(product_id: ProductId, warehouse_code: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            product_id,
            physical_stock: 0,
            reserved_stock: 0,
            available_stock: 0,
            min_stock_level: 0,
            reorder_point: 0,
            warehouse_code: warehouse_code.into(),
            version: now,
        }
    }

    pub fn is_low_stock(&self) -> bool {
        self.available_stock <= self.min_stock_level
    }

    pub fn needs_reorder(&self) -> bool {
        self.available_stock <= self.reorder_point
    }

    /// Verify the ledger's accounting identity and non-negativity.
    pub fn check_invariants(&self) -> StockResult<()> {
        if self.physical_stock < 0 || self.reserved_stock < 0 || self.available_stock < 0 {
            return Err(StockError::internal(format!(
                "negative stock count on product {}: physical={}, reserved={}, available={}",
                self.product_id, self.physical_stock, self.reserved_stock, self.available_stock
            )));
        }
        if self.available_stock + self.reserved_stock != self.physical_stock {
            return Err(StockError::internal(format!(
                "ledger identity violated on product {}: {} + {} != {}",
                self.product_id, self.available_stock, self.reserved_stock, self.physical_stock
            )));
        }
        Ok(())
    }

    /// Place a hold: move `quantity` units from available into reserved.
    pub fn reserve(&mut self, quantity: i64, now: DateTime<Utc>) -> StockResult<()> {
        if quantity <= 0 {
            return Err(StockError::InvalidQuantity);
        }
        if self.available_stock < quantity {
            return Err(StockError::insufficient(self.available_stock, quantity));
        }
        self.reserved_stock += quantity;
        self.available_stock -= quantity;
        self.version = now;
        Ok(())
    }

    /// Release a hold: move `quantity` units back from reserved to available.
    pub fn release(&mut self, quantity: i64, now: DateTime<Utc>) -> StockResult<()> {
        if quantity <= 0 {
            return Err(StockError::InvalidQuantity);
        }
        if self.reserved_stock < quantity {
            return Err(StockError::internal(format!(
                "release of {} would drive reserved stock negative (reserved: {})",
                quantity, self.reserved_stock
            )));
        }
        self.reserved_stock -= quantity;
        self.available_stock += quantity;
        self.version = now;
        Ok(())
    }

    /// Convert a hold into an outbound shipment: the units leave the warehouse,
    /// so physical and reserved both drop while available is untouched.
    pub fn confirm_outbound(&mut self, quantity: i64, now: DateTime<Utc>) -> StockResult<()> {
        if quantity <= 0 {
            return Err(StockError::InvalidQuantity);
        }
        if self.reserved_stock < quantity || self.physical_stock < quantity {
            return Err(StockError::internal(format!(
                "outbound of {} exceeds held stock (reserved: {}, physical: {})",
                quantity, self.reserved_stock, self.physical_stock
            )));
        }
        self.physical_stock -= quantity;
        self.reserved_stock -= quantity;
        self.version = now;
        Ok(())
    }

    /// Receive stock into the warehouse.
    pub fn inbound(&mut self, quantity: i64, now: DateTime<Utc>) -> StockResult<()> {
        if quantity <= 0 {
            return Err(StockError::InvalidQuantity);
        }
        self.physical_stock += quantity;
        self.available_stock += quantity;
        self.version = now;
        Ok(())
    }

    /// Overwrite the hold counters from a recomputed source of truth
    /// (reconciliation). `available` is forced back to `physical - reserved`.
    pub fn set_reserved(&mut self, reserved: i64, now: DateTime<Utc>) -> StockResult<()> {
        if reserved < 0 || reserved > self.physical_stock {
            return Err(StockError::internal(format!(
                "reconciled reserved count {} out of range for physical stock {}",
                reserved, self.physical_stock
            )));
        }
        self.reserved_stock = reserved;
        self.available_stock = self.physical_stock - reserved;
        self.version = now;
        Ok(())
    }
}
