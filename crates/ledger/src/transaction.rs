//! Append-only transaction log.
//!
//! One entry is appended per stock-affecting operation, with before/after
//! snapshots of the ledger counts. Entries are never mutated or deleted; they
//! are the audit trail and the input for reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocklock_core::{EntryId, ProductId};

use crate::ledger::StockLedger;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockTransactionKind {
    Inbound,
    Outbound,
    Reserve,
    Release,
    Adjust,
    Return,
    Transfer,
}

impl StockTransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockTransactionKind::Inbound => "inbound",
            StockTransactionKind::Outbound => "outbound",
            StockTransactionKind::Reserve => "reserve",
            StockTransactionKind::Release => "release",
            StockTransactionKind::Adjust => "adjust",
            StockTransactionKind::Return => "return",
            StockTransactionKind::Transfer => "transfer",
        }
    }
}

impl core::fmt::Display for StockTransactionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit record of one stock mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    pub id: EntryId,
    pub product_id: ProductId,
    pub kind: StockTransactionKind,
    pub quantity: i64,
    /// What the entry refers to ("reservation", "order", "inbound").
    pub reference_type: String,
    pub reference_id: String,
    pub before_physical: i64,
    pub after_physical: i64,
    pub before_available: i64,
    pub after_available: i64,
    pub notes: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TransactionLogEntry {
    /// Record a mutation by snapshotting the ledger before and after it.
    pub fn record(
        kind: StockTransactionKind,
        quantity: i64,
        before: &StockLedger,
        after: &StockLedger,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EntryId::new(),
            product_id: after.product_id,
            kind,
            quantity,
            reference_type: String::new(),
            reference_id: String::new(),
            before_physical: before.physical_stock,
            after_physical: after.physical_stock,
            before_available: before.available_stock,
            after_available: after.available_stock,
            notes: String::new(),
            metadata: serde_json::Value::Null,
            created_at: now,
        }
    }

    pub fn with_reference(mut self, reference_type: impl Into<String>, reference_id: impl Into<String>) -> Self {
        self.reference_type = reference_type.into();
        self.reference_id = reference_id.into();
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::DEFAULT_WAREHOUSE_CODE;

    #[test]
    fn record_captures_before_and_after_snapshots() {
        let now = Utc::now();
        let mut ledger = StockLedger::new(ProductId::new(), DEFAULT_WAREHOUSE_CODE, now);
        ledger.inbound(100, now).unwrap();

        let before = ledger.clone();
        ledger.reserve(30, now).unwrap();

        let entry = TransactionLogEntry::record(StockTransactionKind::Reserve, 30, &before, &ledger, now)
            .with_reference("reservation", "res-1")
            .with_metadata(serde_json::json!({ "order_id": "order-1" }));

        assert_eq!(entry.before_physical, 100);
        assert_eq!(entry.after_physical, 100);
        assert_eq!(entry.before_available, 100);
        assert_eq!(entry.after_available, 70);
        assert_eq!(entry.reference_type, "reservation");
        assert_eq!(entry.metadata["order_id"], "order-1");
    }
}
