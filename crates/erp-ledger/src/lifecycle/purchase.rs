use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use erp_store::{
    AccountTransaction, InventoryLogEntry, LedgerStore, PartnerAccount, Purchase, PurchaseItem,
    Query, RecordStore, RowId,
};
use erp_types::{
    round_cents, BalanceDirection, DocumentKind, InventoryRef, PaymentMethod, PurchaseStatus,
    TransactionType,
};

use super::DocumentLifecycle;
use crate::accounts::{AccountTarget, PostingOutcome, PostingRequest};
use crate::error::{LedgerError, LedgerResult, Warning};
use crate::inventory::Movement;
use crate::settlement::SettlementReversal;

/// Unit cost filled in at approval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemCost {
    pub purchase_item_id: RowId,
    pub unit_cost: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PurchaseApproval {
    pub purchase: Purchase,
    pub items: Vec<PurchaseItem>,
    pub lines: Vec<PartnerAccount>,
    pub posting: Option<PostingOutcome>,
    pub warnings: Vec<Warning>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PurchaseItemDeletion {
    pub purchase_item_id: RowId,
    pub unstocked: Option<InventoryLogEntry>,
    pub settlements: SettlementReversal,
    pub removed_lines: usize,
    pub purchase_total: Decimal,
    /// Upfront payment beyond the new total, handed back to the account.
    pub refund: Decimal,
    pub posting: Option<PostingOutcome>,
    pub warnings: Vec<Warning>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PurchaseDeletion {
    pub purchase_id: RowId,
    pub unstocked: Vec<InventoryLogEntry>,
    pub reversed_transactions: Vec<RowId>,
    pub settlements: SettlementReversal,
    pub removed_lines: usize,
}

impl<'a, S: LedgerStore + ?Sized> DocumentLifecycle<'a, S> {
    /// Pending → approved. Fills in costs, recomputes subtotals and total,
    /// posts any upfront payment, and opens AP lines for what is still owed.
    /// Stock moves only when items are received.
    pub fn approve_purchase(
        &self,
        purchase_id: RowId,
        costs: &[ItemCost],
    ) -> LedgerResult<PurchaseApproval> {
        let mut purchase: Purchase = self.store.get(purchase_id)?;
        if purchase.status != PurchaseStatus::Pending {
            return Err(LedgerError::invalid_state(
                "purchases",
                purchase_id,
                format!("purchase is already {}", purchase.status),
            ));
        }
        let mut items: Vec<PurchaseItem> = self
            .store
            .fetch(&Query::all().eq("purchase_id", purchase_id))?;
        let mut cost_of: HashMap<RowId, Decimal> = HashMap::new();
        for cost in costs {
            if !items.iter().any(|item| item.id == cost.purchase_item_id) {
                return Err(LedgerError::not_found("purchase_items", cost.purchase_item_id));
            }
            if cost.unit_cost < Decimal::ZERO {
                return Err(LedgerError::InvalidAmount(cost.unit_cost));
            }
            cost_of.insert(cost.purchase_item_id, cost.unit_cost);
        }
        if purchase.paid_amount > Decimal::ZERO
            && purchase.payment_method == PaymentMethod::StoreCredit
        {
            return Err(LedgerError::invalid_state(
                "purchases",
                purchase_id,
                "vendors cannot be paid in store credit",
            ));
        }

        for item in &mut items {
            if let Some(cost) = cost_of.get(&item.id) {
                item.unit_cost = *cost;
            }
            item.subtotal = round_cents(Decimal::from(item.quantity) * item.unit_cost);
            self.store.save(&*item)?;
        }
        let total: Decimal = items.iter().map(|item| item.subtotal).sum();
        let paid = purchase.paid_amount.max(Decimal::ZERO).min(total);
        let approved_on = self.ctx.today();
        purchase.total = total;
        purchase.approved_on = Some(approved_on);

        let mut warnings = Vec::new();
        let posting = if paid > Decimal::ZERO {
            let request = PostingRequest::new(
                AccountTarget::resolve(purchase.account_id, &purchase.payment_method),
                paid,
                BalanceDirection::Decrease,
                TransactionType::Purchase,
                purchase.id,
            )
            .reference_no(purchase.purchase_no.clone());
            let outcome = self.accounts().update_account_balance(&request)?;
            if purchase.account_id.is_none() && outcome.posted() {
                purchase.account_id = outcome.account_id;
            }
            warnings.extend(outcome.warnings.iter().cloned());
            Some(outcome)
        } else {
            None
        };

        let lines = if paid < total - self.ctx.epsilon() {
            self.partners()
                .create_purchase_lines(&purchase, &items, paid, approved_on)?
        } else {
            Vec::new()
        };

        purchase.status = PurchaseStatus::Approved;
        self.store.save(&purchase)?;
        info!(purchase_id, total = %total, %paid, lines = lines.len(), "purchase approved");
        Ok(PurchaseApproval {
            purchase,
            items,
            lines,
            posting,
            warnings,
        })
    }

    /// Receive some of an approved item into stock at its approved cost.
    pub fn receive_purchase_item(
        &self,
        purchase_item_id: RowId,
        received_qty: i64,
    ) -> LedgerResult<InventoryLogEntry> {
        if received_qty <= 0 {
            return Err(LedgerError::InvalidQuantity(received_qty));
        }
        let item: PurchaseItem = self.store.get(purchase_item_id)?;
        let purchase: Purchase = self.store.get(item.purchase_id)?;
        if purchase.status != PurchaseStatus::Approved {
            return Err(LedgerError::invalid_state(
                "purchases",
                purchase.id,
                "only approved purchases can be received",
            ));
        }
        let open = item.quantity - item.received_quantity;
        if received_qty > open {
            return Err(LedgerError::invalid_state(
                "purchase_items",
                purchase_item_id,
                format!("{open} left to receive, got {received_qty}"),
            ));
        }

        let movement = Movement::new(
            item.product_id,
            InventoryRef::Purchase,
            item.id,
            received_qty,
        )
        .with_cost(item.unit_cost)
        .with_memo(purchase.purchase_no.clone());
        let entry = self.inventory().receive_inbound(&movement)?;
        self.store.patch::<PurchaseItem>(
            item.id,
            &[("received_quantity", json!(item.received_quantity + received_qty))],
        )?;
        info!(purchase_item_id, received_qty, "purchase item received");
        Ok(entry)
    }

    /// Remove one item: take back what was received, unwind settlements on
    /// its AP lines, and recompute the purchase total.
    ///
    /// An approved purchase whose upfront payment now exceeds its total gets
    /// the difference back as a `purchase_refund` keyed by the item.
    pub fn delete_purchase_item(&self, purchase_item_id: RowId) -> LedgerResult<PurchaseItemDeletion> {
        let item: PurchaseItem = self.store.get(purchase_item_id)?;
        let purchase: Purchase = self.store.get(item.purchase_id)?;

        let unstocked = self.unstock(&item, InventoryRef::PurchaseItemDelete, item.id)?;

        let line_ids: Vec<RowId> = self
            .partners()
            .lines_for_purchase_item(item.id)?
            .iter()
            .map(|line| line.id)
            .collect();
        let settlements = self.settlements().reverse_for_lines(&line_ids)?;
        let removed_lines = self.partners().delete_lines(&line_ids)?;

        self.store.remove::<PurchaseItem>(item.id)?;
        let purchase_total: Decimal = self
            .store
            .fetch::<PurchaseItem>(&Query::all().eq("purchase_id", purchase.id))?
            .iter()
            .map(|item| item.subtotal)
            .sum();
        let refund = (purchase.paid_amount - purchase_total).max(Decimal::ZERO);
        let mut warnings = Vec::new();
        let mut posting = None;
        if refund > self.ctx.epsilon() && purchase.status == PurchaseStatus::Approved {
            let request = PostingRequest::new(
                AccountTarget::resolve(purchase.account_id, &purchase.payment_method),
                refund,
                BalanceDirection::Increase,
                TransactionType::PurchaseRefund,
                item.id,
            )
            .reference_no(purchase.purchase_no.clone())
            .note(format!("item {} deleted", item.id));
            let outcome = self.accounts().update_account_balance(&request)?;
            warnings.extend(outcome.warnings.iter().cloned());
            posting = Some(outcome);
        }
        self.store.patch::<Purchase>(
            purchase.id,
            &[
                ("total", json!(purchase_total)),
                ("paid_amount", json!(purchase.paid_amount - refund)),
            ],
        )?;
        info!(
            purchase_item_id,
            purchase_id = purchase.id,
            total = %purchase_total,
            %refund,
            "purchase item deleted"
        );
        Ok(PurchaseItemDeletion {
            purchase_item_id,
            unstocked,
            settlements,
            removed_lines,
            purchase_total,
            refund,
            posting,
            warnings,
        })
    }

    /// Remove a purchase and everything it moved.
    pub fn delete_purchase(&self, purchase_id: RowId) -> LedgerResult<PurchaseDeletion> {
        let purchase: Purchase = self.store.get(purchase_id)?;
        let items: Vec<PurchaseItem> = self
            .store
            .fetch(&Query::all().eq("purchase_id", purchase_id))?;

        let mut unstocked = Vec::new();
        for item in &items {
            if let Some(entry) = self.unstock(item, InventoryRef::PurchaseDelete, purchase_id)? {
                unstocked.push(entry);
            }
        }

        let line_ids: Vec<RowId> = self
            .partners()
            .lines_for_document(DocumentKind::Purchase, purchase_id)?
            .iter()
            .map(|line| line.id)
            .collect();
        let settlements = self.settlements().reverse_for_lines(&line_ids)?;
        let removed_lines = self.partners().delete_lines(&line_ids)?;

        let accounts = self.accounts();
        let mut rows = accounts.transactions(TransactionType::Purchase, &[purchase_id])?;
        let refund = TransactionType::PurchaseRefund;
        rows.extend(self.store.fetch::<AccountTransaction>(
            &Query::all()
                .eq("ref_type", refund.ref_type())
                .eq("transaction_type", refund.as_str())
                .eq("ref_no", purchase.purchase_no.as_str()),
        )?);
        let reversed_transactions = accounts.reverse_transactions(&rows)?;

        self.store
            .remove_where::<PurchaseItem>(&Query::all().eq("purchase_id", purchase_id))?;
        self.store.remove::<Purchase>(purchase_id)?;
        info!(
            purchase_id,
            purchase_no = %purchase.purchase_no,
            movements = unstocked.len(),
            "purchase deleted"
        );
        Ok(PurchaseDeletion {
            purchase_id,
            unstocked,
            reversed_transactions,
            settlements,
            removed_lines,
        })
    }

    /// Take back exactly what the log says this item brought in.
    fn unstock(
        &self,
        item: &PurchaseItem,
        reversal: InventoryRef,
        ref_id: RowId,
    ) -> LedgerResult<Option<InventoryLogEntry>> {
        let inventory = self.inventory();
        let received: i64 = inventory
            .movements(InventoryRef::Purchase, &[item.id])?
            .iter()
            .map(|entry| entry.qty_change)
            .sum();
        if received <= 0 {
            return Ok(None);
        }
        let movement = Movement::new(item.product_id, reversal, ref_id, -received)
            .with_cost(item.unit_cost)
            .with_memo(format!("purchase item {}", item.id));
        inventory.remove_inbound(&movement, item.unit_cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{account, context, pending_purchase, product};
    use chrono::NaiveDate;
    use erp_store::{Account, InMemoryStore, Product};
    use erp_types::LineStatus;
    use rust_decimal_macros::dec;

    fn costs(items: &[PurchaseItem], unit_costs: &[Decimal]) -> Vec<ItemCost> {
        items
            .iter()
            .zip(unit_costs)
            .map(|(item, cost)| ItemCost {
                purchase_item_id: item.id,
                unit_cost: *cost,
            })
            .collect()
    }

    #[test]
    fn partly_paid_approval_opens_ap_lines() {
        let store = InMemoryStore::new();
        let ctx = context();
        let docs = DocumentLifecycle::new(&store, &ctx);
        let cash = account(&store, "cash", dec!(100));
        let p = product(&store, 0, dec!(0));
        let (purchase, items) =
            pending_purchase(&store, "V", "cash", dec!(30), &[(p.id, 2), (p.id, 3)]);

        let approval = docs
            .approve_purchase(purchase.id, &costs(&items, &[dec!(10), dec!(20)]))
            .unwrap();
        assert_eq!(approval.purchase.total, dec!(80));
        assert_eq!(approval.purchase.status, PurchaseStatus::Approved);
        assert_eq!(store.get::<Account>(cash.id).unwrap().balance, dec!(70));

        let balances: Vec<Decimal> = approval.lines.iter().map(|l| l.balance).collect();
        assert_eq!(balances, [dec!(12.5), dec!(37.5)]);
        for line in &approval.lines {
            assert_eq!(line.status, LineStatus::Partial);
            assert_eq!(line.due_date, NaiveDate::from_ymd_opt(2024, 5, 31).unwrap());
        }

        let again = docs.approve_purchase(purchase.id, &[]).unwrap_err();
        assert_eq!(again.code(), "invalid_state");
    }

    #[test]
    fn vendors_are_not_paid_in_store_credit() {
        let store = InMemoryStore::new();
        let ctx = context();
        let p = product(&store, 0, dec!(0));
        let (purchase, items) =
            pending_purchase(&store, "V", "store_credit", dec!(5), &[(p.id, 1)]);
        let err = DocumentLifecycle::new(&store, &ctx)
            .approve_purchase(purchase.id, &costs(&items, &[dec!(5)]))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState { .. }));
        assert_eq!(store.get::<PurchaseItem>(items[0].id).unwrap().unit_cost, Decimal::ZERO);
    }

    #[test]
    fn receiving_is_capped_by_ordered_quantity() {
        let store = InMemoryStore::new();
        let ctx = context();
        let docs = DocumentLifecycle::new(&store, &ctx);
        account(&store, "cash", dec!(0));
        let p = product(&store, 0, dec!(0));
        let (purchase, items) = pending_purchase(&store, "V", "cash", dec!(0), &[(p.id, 2)]);

        let early = docs.receive_purchase_item(items[0].id, 1).unwrap_err();
        assert_eq!(early.code(), "invalid_state");

        docs.approve_purchase(purchase.id, &costs(&items, &[dec!(10)]))
            .unwrap();
        assert!(matches!(
            docs.receive_purchase_item(items[0].id, 0).unwrap_err(),
            LedgerError::InvalidQuantity(0)
        ));
        assert!(docs.receive_purchase_item(items[0].id, 3).is_err());

        docs.receive_purchase_item(items[0].id, 2).unwrap();
        let product: Product = store.get(p.id).unwrap();
        assert_eq!(product.stock, 2);
        assert_eq!(product.avg_cost, dec!(10));
        assert_eq!(store.get::<PurchaseItem>(items[0].id).unwrap().received_quantity, 2);
        assert!(docs.receive_purchase_item(items[0].id, 1).is_err());
    }

    #[test]
    fn deleting_an_item_recomputes_the_total() {
        let store = InMemoryStore::new();
        let ctx = context();
        let docs = DocumentLifecycle::new(&store, &ctx);
        account(&store, "cash", dec!(0));
        let p = product(&store, 0, dec!(0));
        let (purchase, items) =
            pending_purchase(&store, "V", "cash", dec!(0), &[(p.id, 1), (p.id, 1)]);
        docs.approve_purchase(purchase.id, &costs(&items, &[dec!(4), dec!(6)]))
            .unwrap();
        docs.receive_purchase_item(items[1].id, 1).unwrap();

        let deletion = docs.delete_purchase_item(items[1].id).unwrap();
        assert_eq!(deletion.purchase_total, dec!(4));
        assert_eq!(deletion.removed_lines, 1);
        assert!(deletion.unstocked.is_some());
        assert_eq!(store.get::<Product>(p.id).unwrap().stock, 0);
        assert_eq!(store.get::<Purchase>(purchase.id).unwrap().total, dec!(4));
    }

    #[test]
    fn deleting_a_prepaid_item_refunds_its_payment() {
        let store = InMemoryStore::new();
        let ctx = context();
        let docs = DocumentLifecycle::new(&store, &ctx);
        let cash = account(&store, "cash", dec!(1000));
        let p = product(&store, 0, dec!(0));
        let (purchase, items) =
            pending_purchase(&store, "V", "cash", dec!(80), &[(p.id, 1), (p.id, 3)]);
        let approval = docs
            .approve_purchase(purchase.id, &costs(&items, &[dec!(20), dec!(20)]))
            .unwrap();
        assert!(approval.lines.is_empty());
        assert_eq!(store.get::<Account>(cash.id).unwrap().balance, dec!(920));

        let deletion = docs.delete_purchase_item(items[1].id).unwrap();
        assert_eq!(deletion.purchase_total, dec!(20));
        assert_eq!(deletion.refund, dec!(60));
        assert_eq!(store.get::<Account>(cash.id).unwrap().balance, dec!(980));
        let purchase: Purchase = store.get(purchase.id).unwrap();
        assert_eq!(purchase.paid_amount, dec!(20));

        let deletion = docs.delete_purchase(purchase.id).unwrap();
        assert_eq!(deletion.reversed_transactions.len(), 2);
        assert_eq!(store.get::<Account>(cash.id).unwrap().balance, dec!(1000));
    }
}
