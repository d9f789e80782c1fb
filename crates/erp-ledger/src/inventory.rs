//! Inventory ledger: the append-only movement log and the two projections
//! it drives, `products.stock` and `products.avg_cost`.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde_json::json;
use tracing::debug;

use erp_store::{
    InventoryLogEntry, LedgerStore, Product, Query, RecordStore, RowId, StockAdjustment,
};
use erp_types::InventoryRef;

use crate::context::LedgerContext;
use crate::error::{LedgerError, LedgerResult};
use crate::locks::AggregateKey;

/// Average cost precision.
const COST_DP: u32 = 4;

/// One movement to append.
#[derive(Clone, Debug, PartialEq)]
pub struct Movement {
    pub product_id: RowId,
    pub ref_type: InventoryRef,
    pub ref_id: RowId,
    pub qty_change: i64,
    pub unit_cost: Option<Decimal>,
    pub memo: Option<String>,
}

impl Movement {
    pub fn new(product_id: RowId, ref_type: InventoryRef, ref_id: RowId, qty_change: i64) -> Self {
        Self {
            product_id,
            ref_type,
            ref_id,
            qty_change,
            unit_cost: None,
            memo: None,
        }
    }

    pub fn with_cost(mut self, unit_cost: Decimal) -> Self {
        self.unit_cost = Some(unit_cost);
        self
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }
}

/// Weighted average after receiving `qty` at `unit_cost` into `old_stock`.
pub fn inbound_average(old_stock: i64, old_avg: Decimal, qty: i64, unit_cost: Decimal) -> Decimal {
    let new_stock = old_stock + qty;
    if old_stock <= 0 || new_stock <= 0 {
        return unit_cost.max(Decimal::ZERO);
    }
    let value = Decimal::from(old_stock) * old_avg + Decimal::from(qty) * unit_cost;
    (value / Decimal::from(new_stock))
        .round_dp(COST_DP)
        .max(Decimal::ZERO)
}

/// Weighted average after taking back `removed_qty` units that came in at
/// `removed_cost`. `new_stock` is the stock once the reversal is applied.
pub fn removal_average(
    new_stock: i64,
    old_avg: Decimal,
    removed_qty: i64,
    removed_cost: Decimal,
) -> Decimal {
    if new_stock <= 0 {
        return Decimal::ZERO;
    }
    let old_stock = new_stock + removed_qty;
    let value = Decimal::from(old_stock) * old_avg - Decimal::from(removed_qty) * removed_cost;
    (value / Decimal::from(new_stock))
        .round_dp(COST_DP)
        .max(Decimal::ZERO)
}

pub struct InventoryLedger<'a, S: ?Sized> {
    store: &'a S,
    ctx: &'a LedgerContext,
}

impl<'a, S: LedgerStore + ?Sized> InventoryLedger<'a, S> {
    pub fn new(store: &'a S, ctx: &'a LedgerContext) -> Self {
        Self { store, ctx }
    }

    /// Insert one log row and move `products.stock` by its quantity.
    ///
    /// Does not check availability and takes no lock; callers that care
    /// about either hold the product lock around this call.
    pub fn append_movement(&self, movement: &Movement) -> LedgerResult<InventoryLogEntry> {
        let product: Product = self.store.get(movement.product_id)?;
        let entry = self.store.create(&InventoryLogEntry {
            id: 0,
            product_id: movement.product_id,
            ref_type: movement.ref_type,
            ref_id: movement.ref_id,
            qty_change: movement.qty_change,
            unit_cost: movement.unit_cost,
            memo: movement.memo.clone(),
            created_at: self.ctx.now(),
        })?;
        let stock = product.stock + movement.qty_change;
        self.store
            .patch::<Product>(product.id, &[("stock", json!(stock))])?;
        debug!(
            product_id = product.id,
            ref_type = %movement.ref_type,
            ref_id = movement.ref_id,
            qty_change = movement.qty_change,
            stock,
            "movement appended"
        );
        Ok(entry)
    }

    /// [`Self::append_movement`] under the product lock.
    pub fn post_movement(&self, movement: &Movement) -> LedgerResult<InventoryLogEntry> {
        let _guard = self
            .ctx
            .locks
            .acquire_one(AggregateKey::Product(movement.product_id))?;
        self.append_movement(movement)
    }

    /// Receive stock at a known cost and fold it into the weighted average.
    pub fn receive_inbound(&self, movement: &Movement) -> LedgerResult<InventoryLogEntry> {
        if movement.qty_change <= 0 {
            return Err(LedgerError::InvalidQuantity(movement.qty_change));
        }
        let unit_cost = movement.unit_cost.unwrap_or(Decimal::ZERO);
        let _guard = self
            .ctx
            .locks
            .acquire_one(AggregateKey::Product(movement.product_id))?;
        let before: Product = self.store.get(movement.product_id)?;
        let entry = self.append_movement(movement)?;
        let avg = inbound_average(before.stock, before.avg_cost, movement.qty_change, unit_cost);
        self.store
            .patch::<Product>(before.id, &[("avg_cost", json!(avg))])?;
        debug!(product_id = before.id, avg_cost = %avg, "average cost raised");
        Ok(entry)
    }

    /// Take back previously received stock and restore the average cost
    /// with the removal formula.
    ///
    /// The movement is written first; the cost is recomputed from the stock
    /// the movement left behind.
    pub fn remove_inbound(
        &self,
        movement: &Movement,
        removed_cost: Decimal,
    ) -> LedgerResult<Option<InventoryLogEntry>> {
        let removed_qty = -movement.qty_change;
        if removed_qty == 0 {
            return Ok(None);
        }
        let _guard = self
            .ctx
            .locks
            .acquire_one(AggregateKey::Product(movement.product_id))?;
        let entry = self.append_movement(movement)?;
        self.recompute_average_cost(movement.product_id, removed_qty, removed_cost)?;
        Ok(Some(entry))
    }

    /// Apply the removal formula to the product's current stock and cost.
    pub fn recompute_average_cost(
        &self,
        product_id: RowId,
        removed_qty: i64,
        removed_cost: Decimal,
    ) -> LedgerResult<Decimal> {
        let product: Product = self.store.get(product_id)?;
        let avg = removal_average(product.stock, product.avg_cost, removed_qty, removed_cost);
        self.store
            .patch::<Product>(product_id, &[("avg_cost", json!(avg))])?;
        debug!(product_id, avg_cost = %avg, stock = product.stock, "average cost restored");
        Ok(avg)
    }

    /// Fail with [`LedgerError::InsufficientStock`] unless `qty` can leave.
    pub fn check_availability(&self, product_id: RowId, qty: i64) -> LedgerResult<Product> {
        let product: Product = self.store.get(product_id)?;
        let may_go_negative = product.allow_negative || self.ctx.config.default_allow_negative;
        if !may_go_negative && product.stock < qty {
            return Err(LedgerError::InsufficientStock {
                product_id,
                requested: qty,
                available: product.stock,
            });
        }
        Ok(product)
    }

    /// Ship a delivery: one negative movement per line.
    ///
    /// Fails with [`LedgerError::AlreadyProcessed`] when movements for this
    /// delivery exist. Availability is checked for every product, with all
    /// of them locked, before the first movement is written.
    pub fn deduct_for_delivery(
        &self,
        delivery_id: RowId,
        lines: &[(RowId, i64)],
    ) -> LedgerResult<Vec<InventoryLogEntry>> {
        let mut per_product: BTreeMap<RowId, i64> = BTreeMap::new();
        for (product_id, qty) in lines {
            if *qty <= 0 {
                return Err(LedgerError::InvalidQuantity(*qty));
            }
            *per_product.entry(*product_id).or_default() += qty;
        }
        let _guard = self
            .ctx
            .locks
            .acquire(per_product.keys().map(|id| AggregateKey::Product(*id)))?;

        if self.has_movements(InventoryRef::Delivery, delivery_id)? {
            return Err(LedgerError::AlreadyProcessed {
                ref_type: InventoryRef::Delivery.as_str().into(),
                ref_id: delivery_id,
            });
        }
        for (product_id, qty) in &per_product {
            self.check_availability(*product_id, *qty)?;
        }
        lines
            .iter()
            .map(|(product_id, qty)| {
                self.append_movement(&Movement::new(
                    *product_id,
                    InventoryRef::Delivery,
                    delivery_id,
                    -qty,
                ))
            })
            .collect()
    }

    /// Append the negation of `entry` under a new reference. The original
    /// row is left untouched.
    pub fn reverse_movement(
        &self,
        entry: &InventoryLogEntry,
        reversal: InventoryRef,
        ref_id: RowId,
        memo: Option<String>,
    ) -> LedgerResult<InventoryLogEntry> {
        let mut movement = Movement::new(entry.product_id, reversal, ref_id, -entry.qty_change);
        movement.unit_cost = entry.unit_cost;
        movement.memo = memo.or_else(|| Some(format!("reverses log {}", entry.id)));
        self.post_movement(&movement)
    }

    pub fn movements(
        &self,
        ref_type: InventoryRef,
        ref_ids: &[RowId],
    ) -> LedgerResult<Vec<InventoryLogEntry>> {
        if ref_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.store.fetch(
            &Query::all()
                .eq("ref_type", ref_type.as_str())
                .is_in("ref_id", ref_ids.iter().copied()),
        )?)
    }

    pub fn has_movements(&self, ref_type: InventoryRef, ref_id: RowId) -> LedgerResult<bool> {
        Ok(self.store.exists::<InventoryLogEntry>(
            &Query::all()
                .eq("ref_type", ref_type.as_str())
                .eq("ref_id", ref_id),
        )?)
    }

    /// Overwrite stock with a counted value. The adjustment row becomes the
    /// new reconciliation baseline; later log rows add on top of it.
    pub fn adjust_stock(
        &self,
        product_id: RowId,
        new_stock: i64,
        reason: impl Into<String>,
    ) -> LedgerResult<StockAdjustment> {
        let _guard = self
            .ctx
            .locks
            .acquire_one(AggregateKey::Product(product_id))?;
        let product: Product = self.store.get(product_id)?;
        let watermark = self
            .store
            .fetch::<InventoryLogEntry>(&Query::all().newest_first().limit(1))?
            .first()
            .map_or(0, |entry| entry.id);
        let adjustment = self.store.create(&StockAdjustment {
            id: 0,
            product_id,
            previous_stock: product.stock,
            new_stock,
            reason: reason.into(),
            log_watermark: watermark,
            created_at: self.ctx.now(),
        })?;
        self.store
            .patch::<Product>(product_id, &[("stock", json!(new_stock))])?;
        debug!(product_id, previous = product.stock, new_stock, "stock adjusted");
        Ok(adjustment)
    }

    /// Stock as the log says it should be: the latest adjustment baseline
    /// plus every movement written after it.
    pub fn stock_from_log(&self, product_id: RowId) -> LedgerResult<i64> {
        let baseline = self
            .store
            .fetch::<StockAdjustment>(
                &Query::all()
                    .eq("product_id", product_id)
                    .newest_first()
                    .limit(1),
            )?
            .into_iter()
            .next();
        let (start, after) = baseline.map_or((0, 0), |adj| (adj.new_stock, adj.log_watermark));
        let moved: i64 = self
            .store
            .fetch::<InventoryLogEntry>(
                &Query::all()
                    .eq("product_id", product_id)
                    .gte("id", after + 1),
            )?
            .iter()
            .map(|entry| entry.qty_change)
            .sum();
        Ok(start + moved)
    }
}
