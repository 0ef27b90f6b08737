//! Availability probes and inbound stock receipt.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use stocklock_core::{Principal, ProductId, StockError, StockResult};
use stocklock_ledger::{
    ledger::DEFAULT_WAREHOUSE_CODE, StockLedger, StockTransactionKind, TransactionLogEntry,
};

use crate::cache::StockCache;
use crate::outcome::{AvailabilityOutcome, OperationOutcome};
use crate::store::{IsolationLevel, LedgerDelta, LockMode, StockStore, StockTx, StoreError};

fn lift(err: StoreError) -> StockError {
    StockError::internal(err.to_string())
}

/// Read-side queries and warehouse receipts.
pub struct InventoryService<S, C> {
    store: Arc<S>,
    cache: Arc<C>,
}

impl<S: StockStore, C: StockCache> InventoryService<S, C> {
    pub fn new(store: Arc<S>, cache: Arc<C>) -> Self {
        Self { store, cache }
    }

    /// Can `quantity` units be served right now?
    ///
    /// With `include_reserved` the probe compares against physical stock,
    /// counting units currently held by pending reservations as servable
    /// (callers use this to decide whether waiting out holds would suffice).
    #[instrument(skip(self), fields(product_id = %product_id, quantity, include_reserved))]
    pub async fn check_availability(
        &self,
        product_id: ProductId,
        quantity: i64,
        include_reserved: bool,
    ) -> AvailabilityOutcome {
        if quantity <= 0 {
            return AvailabilityOutcome::failed(
                &StockError::InvalidQuantity,
                quantity,
                include_reserved,
            );
        }

        let ledger = match self.store.ledger(product_id).await {
            Ok(Some(ledger)) => ledger,
            Ok(None) => {
                return AvailabilityOutcome::failed(
                    &StockError::StockNotFound,
                    quantity,
                    include_reserved,
                );
            }
            Err(err) => {
                warn!(error = %err, "availability check failed against storage");
                return AvailabilityOutcome::failed(&lift(err), quantity, include_reserved);
            }
        };

        let servable = if include_reserved {
            ledger.physical_stock
        } else {
            ledger.available_stock
        };
        AvailabilityOutcome {
            available: servable >= quantity,
            requested: quantity,
            include_reserved,
            available_stock: ledger.available_stock,
            physical_stock: ledger.physical_stock,
            reserved_stock: ledger.reserved_stock,
            error_code: None,
            error_message: None,
        }
    }

    /// Receive stock into the warehouse, creating the ledger on first
    /// receipt. `warehouse_code` only matters for that first receipt; an
    /// existing ledger keeps its code.
    #[instrument(skip(self, principal, reason, warehouse_code), fields(product_id = %product_id, quantity))]
    pub async fn inbound(
        &self,
        product_id: ProductId,
        quantity: i64,
        warehouse_code: Option<String>,
        principal: &Principal,
        reason: Option<String>,
    ) -> OperationOutcome {
        self.try_inbound(product_id, quantity, warehouse_code, principal, reason)
            .await
            .into()
    }

    async fn try_inbound(
        &self,
        product_id: ProductId,
        quantity: i64,
        warehouse_code: Option<String>,
        principal: &Principal,
        reason: Option<String>,
    ) -> StockResult<()> {
        if !principal.privileged {
            return Err(StockError::permission_denied(
                "receiving stock requires a privileged actor",
            ));
        }
        if quantity <= 0 {
            return Err(StockError::InvalidQuantity);
        }

        let mut tx = self
            .store
            .begin(IsolationLevel::ReadCommitted)
            .await
            .map_err(lift)?;

        let now = Utc::now();
        let ledger = match tx
            .fetch_ledger(product_id, LockMode::Update)
            .await
            .map_err(lift)?
        {
            Some(ledger) => ledger,
            None => {
                let code = warehouse_code
                    .unwrap_or_else(|| DEFAULT_WAREHOUSE_CODE.to_string());
                let fresh = StockLedger::new(product_id, code, now);
                tx.insert_ledger(&fresh).await.map_err(lift)?;
                fresh
            }
        };

        let rows = tx
            .apply_ledger_delta(product_id, LedgerDelta::inbound(quantity), None, now)
            .await
            .map_err(lift)?;
        if rows == 0 {
            return Err(StockError::internal("locked ledger row disappeared"));
        }

        let mut after = ledger.clone();
        after.inbound(quantity, now)?;
        let reference_id = format!("INBOUND-{}-{}", product_id, now.format("%Y%m%d%H%M%S"));
        let entry = TransactionLogEntry::record(
            StockTransactionKind::Inbound,
            quantity,
            &ledger,
            &after,
            now,
        )
        .with_reference("inbound", reference_id)
        .with_metadata(serde_json::json!({
            "reason": reason,
            "actor": principal.id,
        }));
        tx.append_entry(&entry).await.map_err(lift)?;

        tx.commit().await.map_err(lift)?;
        self.cache.invalidate_product(product_id);
        debug!("stock received");
        Ok(())
    }

    /// Current ledger counts for a product.
    pub async fn ledger(&self, product_id: ProductId) -> StockResult<Option<StockLedger>> {
        self.store.ledger(product_id).await.map_err(lift)
    }

    /// Audit trail for a product, oldest first.
    pub async fn transactions(
        &self,
        product_id: ProductId,
    ) -> StockResult<Vec<TransactionLogEntry>> {
        self.store.entries(product_id).await.map_err(lift)
    }
}
