use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use erp_store::{
    Delivery, DeliveryItem, IchibanKujiPrize, InventoryLogEntry, ItemDelta, LedgerStore,
    PartnerAccount, Query, RecordStore, RowId, Sale, SaleCorrection, SaleItem,
};
use erp_types::{
    round_cents, BalanceDirection, DeliveryStatus, DocumentKind, FulfillmentStatus, InventoryRef,
    LedgerSide, PartnerType, PaymentMethod, SaleStatus, TransactionType,
};

use super::DocumentLifecycle;
use crate::accounts::{AccountTarget, PostingOutcome, PostingRequest};
use crate::error::{LedgerError, LedgerResult, Warning};
use crate::inventory::Movement;
use crate::partners::LineDraft;
use crate::settlement::SettlementReversal;

const SALE_REF: &str = "sale";
const CORRECTION_REF: &str = "sale_correction";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SaleConfirmation {
    pub sale: Sale,
    pub lines: Vec<PartnerAccount>,
    pub posting: Option<PostingOutcome>,
    pub warnings: Vec<Warning>,
}

/// New quantity and, optionally, new unit price for one sale item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemAdjustment {
    pub sale_item_id: RowId,
    pub quantity: i64,
    #[serde(default)]
    pub unit_price: Option<Decimal>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SaleCorrectionOutcome {
    pub correction: SaleCorrection,
    pub restocked: Vec<InventoryLogEntry>,
    /// Upfront payment handed back through the sale's own method.
    pub refund: Decimal,
    pub posting: Option<PostingOutcome>,
    /// Receipts cut back because their lines now owe less than they paid.
    pub settlements: SettlementReversal,
    pub warnings: Vec<Warning>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SaleDeletion {
    pub sale_id: RowId,
    pub restored_credit: Decimal,
    pub reversed_movements: Vec<InventoryLogEntry>,
    pub restored_prizes: i64,
    pub reversed_transactions: Vec<RowId>,
    pub settlements: SettlementReversal,
    pub removed_lines: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeliveryConfirmation {
    pub delivery: Delivery,
    pub movements: Vec<InventoryLogEntry>,
    pub fulfillment_status: FulfillmentStatus,
}

/// One item's correction, fully computed before anything is written.
struct ItemPlan {
    item: SaleItem,
    quantity: i64,
    unit_price: Decimal,
    subtotal: Decimal,
    restock: i64,
    line: LinePlan,
}

impl ItemPlan {
    fn delta(&self) -> Decimal {
        self.subtotal - self.item.subtotal
    }
}

enum LinePlan {
    Untouched,
    Delete(RowId),
    Resize { line_id: RowId, amount: Decimal },
    Open,
}

impl<'a, S: LedgerStore + ?Sized> DocumentLifecycle<'a, S> {
    /// Draft → confirmed. Takes prize stock, posts any upfront payment, and
    /// opens AR lines for what is still owed. Inventory moves at delivery.
    pub fn confirm_sale(&self, sale_id: RowId) -> LedgerResult<SaleConfirmation> {
        let mut sale: Sale = self.store.get(sale_id)?;
        if sale.status != SaleStatus::Draft {
            return Err(LedgerError::invalid_state(
                "sales",
                sale_id,
                format!("sale is already {}", sale.status),
            ));
        }
        let items: Vec<SaleItem> = self.store.fetch(&Query::all().eq("sale_id", sale_id))?;
        let eps = self.ctx.epsilon();
        let paid = sale.paid_amount.max(Decimal::ZERO).min(sale.total);
        let owes = paid < sale.total - eps;
        if owes && sale.customer_code.is_none() {
            return Err(LedgerError::invalid_state(
                "sales",
                sale_id,
                "unpaid sale has no customer",
            ));
        }

        let prizes = prize_quantities(&items, |item| item.quantity);
        self.check_prizes(&prizes)?;
        let credit_code = if paid > Decimal::ZERO && sale.payment_method == PaymentMethod::StoreCredit
        {
            let code = sale.customer_code.clone().ok_or_else(|| {
                LedgerError::invalid_state("sales", sale_id, "store credit needs a customer")
            })?;
            self.credit().check_available(&code, paid)?;
            Some(code)
        } else {
            None
        };

        self.move_prizes(&prizes)?;

        let mut warnings = Vec::new();
        let posting = match credit_code {
            Some(code) => {
                self.credit().consume(&code, paid, SALE_REF, sale.id)?;
                None
            }
            None if paid > Decimal::ZERO => {
                let request = PostingRequest::new(
                    AccountTarget::resolve(sale.account_id, &sale.payment_method),
                    paid,
                    BalanceDirection::Increase,
                    TransactionType::Sale,
                    sale.id,
                )
                .reference_no(sale.sale_no.clone());
                let outcome = self.accounts().update_account_balance(&request)?;
                if sale.account_id.is_none() && outcome.posted() {
                    sale.account_id = outcome.account_id;
                }
                warnings.extend(outcome.warnings.iter().cloned());
                Some(outcome)
            }
            None => None,
        };

        let lines = if owes {
            self.partners().create_sale_lines(&sale, &items, paid)?
        } else {
            Vec::new()
        };

        sale.status = SaleStatus::Confirmed;
        self.store.save(&sale)?;
        info!(sale_id, total = %sale.total, %paid, lines = lines.len(), "sale confirmed");
        Ok(SaleConfirmation {
            sale,
            lines,
            posting,
            warnings,
        })
    }

    /// Change quantities or prices on a confirmed sale.
    ///
    /// Quantity cuts on a sale with confirmed deliveries put back whatever
    /// was shipped beyond the new quantity. Each item's AR line follows its
    /// new subtotal. Money paid beyond the new amount goes back to the
    /// receipts that paid the line first, newest first, and only the rest
    /// through the sale's payment method.
    pub fn correct_sale(
        &self,
        sale_id: RowId,
        adjustments: &[ItemAdjustment],
    ) -> LedgerResult<SaleCorrectionOutcome> {
        let mut sale: Sale = self.store.get(sale_id)?;
        if sale.status != SaleStatus::Confirmed {
            return Err(LedgerError::invalid_state(
                "sales",
                sale_id,
                "only confirmed sales can be corrected",
            ));
        }
        if adjustments.is_empty() {
            return Err(LedgerError::invalid_state("sales", sale_id, "nothing to correct"));
        }
        let items: HashMap<RowId, SaleItem> = self
            .store
            .fetch::<SaleItem>(&Query::all().eq("sale_id", sale_id))?
            .into_iter()
            .map(|item| (item.id, item))
            .collect();
        let eps = self.ctx.epsilon();
        let shipped = self.has_confirmed_delivery(sale_id)?;
        let delivered = self.delivered_quantities(sale_id)?;

        let mut plans = Vec::with_capacity(adjustments.len());
        for adjustment in adjustments {
            let item = items
                .get(&adjustment.sale_item_id)
                .cloned()
                .ok_or_else(|| LedgerError::not_found("sale_items", adjustment.sale_item_id))?;
            if adjustment.quantity < 0 {
                return Err(LedgerError::InvalidQuantity(adjustment.quantity));
            }
            let unit_price = adjustment.unit_price.unwrap_or(item.unit_price);
            if unit_price < Decimal::ZERO {
                return Err(LedgerError::InvalidAmount(unit_price));
            }
            let subtotal = round_cents(Decimal::from(adjustment.quantity) * unit_price);
            let restock = if shipped && adjustment.quantity < item.quantity {
                let out = delivered.get(&item.id).copied().unwrap_or(0);
                (out - adjustment.quantity).max(0)
            } else {
                0
            };
            let delta = subtotal - item.subtotal;
            let line = match self.partners().line_for_sale_item(item.id)? {
                Some(line) => {
                    let amount = (line.amount + delta).max(Decimal::ZERO);
                    if amount <= eps && line.received_paid <= eps {
                        LinePlan::Delete(line.id)
                    } else {
                        LinePlan::Resize {
                            line_id: line.id,
                            amount,
                        }
                    }
                }
                None if delta > eps => LinePlan::Open,
                None => LinePlan::Untouched,
            };
            plans.push(ItemPlan {
                item,
                quantity: adjustment.quantity,
                unit_price,
                subtotal,
                restock,
                line,
            });
        }

        let opens_line = plans.iter().any(|plan| matches!(plan.line, LinePlan::Open));
        if opens_line && sale.customer_code.is_none() {
            return Err(LedgerError::invalid_state(
                "sales",
                sale_id,
                "correction leaves a balance on a sale without customer",
            ));
        }
        let mut prize_delta = BTreeMap::new();
        for plan in &plans {
            if let Some(prize_id) = plan.item.prize_id {
                *prize_delta.entry(prize_id).or_insert(0) += plan.quantity - plan.item.quantity;
            }
        }
        self.check_prizes(&prize_delta)?;

        let adjustment_amount: Decimal = plans.iter().map(ItemPlan::delta).sum();
        let correction = self.store.create(&SaleCorrection {
            id: 0,
            sale_id,
            original_total: sale.total,
            corrected_total: sale.total + adjustment_amount,
            adjustment_amount,
            items: plans
                .iter()
                .map(|plan| ItemDelta {
                    sale_item_id: plan.item.id,
                    old_quantity: plan.item.quantity,
                    new_quantity: plan.quantity,
                    old_unit_price: plan.item.unit_price,
                    new_unit_price: plan.unit_price,
                    subtotal_delta: plan.delta(),
                })
                .collect(),
            created_at: self.ctx.now(),
        })?;
        self.move_prizes(&prize_delta)?;

        let mut restocked = Vec::new();
        let mut refund = Decimal::ZERO;
        let mut settlements = SettlementReversal::default();
        let mut warnings = Vec::new();
        for plan in &plans {
            if plan.restock > 0 {
                let movement = Movement::new(
                    plan.item.product_id,
                    InventoryRef::SaleCorrection,
                    plan.item.id,
                    plan.restock,
                )
                .with_memo(format!("correction {}", correction.id));
                restocked.push(self.inventory().post_movement(&movement)?);
            }

            let mut item = plan.item.clone();
            item.quantity = plan.quantity;
            item.unit_price = plan.unit_price;
            item.subtotal = plan.subtotal;
            self.store.save(&item)?;

            match plan.line {
                LinePlan::Untouched => {
                    if plan.delta() < Decimal::ZERO {
                        refund -= plan.delta();
                    }
                }
                LinePlan::Delete(line_id) => {
                    self.partners().delete_lines(&[line_id])?;
                }
                LinePlan::Resize { line_id, amount } => {
                    let (_, excess) = self.partners().set_amount(line_id, amount)?;
                    if excess > Decimal::ZERO {
                        let (reversal, upfront) =
                            self.settlements().refund_line_excess(line_id, excess)?;
                        warnings.extend(reversal.warnings.iter().cloned());
                        settlements.merge(reversal);
                        refund += upfront;
                    }
                }
                LinePlan::Open => {
                    self.partners().create_line(&LineDraft {
                        partner_type: PartnerType::Customer,
                        partner_code: sale.customer_code.clone().unwrap_or_default(),
                        direction: LedgerSide::Ar,
                        ref_type: DocumentKind::Sale,
                        ref_id: sale_id,
                        sale_item_id: Some(item.id),
                        purchase_item_id: None,
                        amount: plan.subtotal,
                        received_paid: plan.item.subtotal,
                        due_date: sale.sale_date,
                    })?;
                }
            }
        }

        let mut posting = None;
        if refund > eps {
            if sale.payment_method == PaymentMethod::StoreCredit {
                let code = sale.customer_code.clone().unwrap_or_default();
                match self.credit().customer_by_code(&code)? {
                    Some(customer) => {
                        self.credit().top_up(
                            customer.id,
                            refund,
                            CORRECTION_REF,
                            Some(correction.id),
                            Some(format!("refund on {}", sale.sale_no)),
                        )?;
                    }
                    None => warnings.push(Warning::NoBackingAccount {
                        method: PaymentMethod::StoreCredit,
                    }),
                }
            } else {
                let request = PostingRequest::new(
                    AccountTarget::resolve(sale.account_id, &sale.payment_method),
                    refund,
                    BalanceDirection::Decrease,
                    TransactionType::SaleRefund,
                    correction.id,
                )
                .reference_no(sale.sale_no.clone());
                let outcome = self.accounts().update_account_balance(&request)?;
                warnings.extend(outcome.warnings.iter().cloned());
                posting = Some(outcome);
            }
            sale.paid_amount = (sale.paid_amount - refund).max(Decimal::ZERO);
        }

        sale.total = correction.corrected_total;
        self.store.save(&sale)?;
        self.refresh_fulfillment(sale_id)?;
        info!(
            sale_id,
            correction_id = correction.id,
            adjustment = %adjustment_amount,
            %refund,
            settled_refund = %settlements.released,
            "sale corrected"
        );
        Ok(SaleCorrectionOutcome {
            correction,
            restocked,
            refund,
            posting,
            settlements,
            warnings,
        })
    }

    /// Remove a sale and everything it moved: store credit, shipped stock,
    /// prize stock, account postings, settlements, and AR lines.
    ///
    /// Shipped stock comes back through new `sale_delete` movements; the
    /// original delivery movements stay in the log.
    pub fn delete_sale(&self, sale_id: RowId) -> LedgerResult<SaleDeletion> {
        let sale: Sale = self.store.get(sale_id)?;
        let items: Vec<SaleItem> = self.store.fetch(&Query::all().eq("sale_id", sale_id))?;
        let item_ids: Vec<RowId> = items.iter().map(|item| item.id).collect();
        let correction_ids: Vec<RowId> = self
            .store
            .fetch::<SaleCorrection>(&Query::all().eq("sale_id", sale_id))?
            .iter()
            .map(|c| c.id)
            .collect();

        // 1. store credit spent on the sale, and credit refunded by corrections
        let credit = self.credit();
        let mut logs: Vec<_> = credit
            .logs(SALE_REF, &[sale_id])?
            .into_iter()
            .filter(|log| log.amount < Decimal::ZERO)
            .collect();
        logs.extend(credit.logs(CORRECTION_REF, &correction_ids)?);
        let restored_credit = credit.revert(&logs)?;

        // 2. shipped stock, including restocks made by corrections
        let inventory = self.inventory();
        let mut reversed_movements = Vec::new();
        let deliveries: Vec<Delivery> = self.store.fetch(&Query::all().eq("sale_id", sale_id))?;
        for delivery in &deliveries {
            if delivery.status == DeliveryStatus::Confirmed {
                for entry in inventory.movements(InventoryRef::Delivery, &[delivery.id])? {
                    reversed_movements.push(inventory.reverse_movement(
                        &entry,
                        InventoryRef::SaleDelete,
                        sale_id,
                        Some(format!("{} of deleted {}", delivery.delivery_no, sale.sale_no)),
                    )?);
                }
            }
            self.store
                .remove_where::<DeliveryItem>(&Query::all().eq("delivery_id", delivery.id))?;
            self.store.remove::<Delivery>(delivery.id)?;
        }
        for entry in inventory.movements(InventoryRef::SaleCorrection, &item_ids)? {
            reversed_movements.push(inventory.reverse_movement(
                &entry,
                InventoryRef::SaleDelete,
                sale_id,
                None,
            )?);
        }

        // 3. prize stock
        let mut restored_prizes = 0;
        if sale.status == SaleStatus::Confirmed {
            let prizes = prize_quantities(&items, |item| -item.quantity);
            restored_prizes = -prizes.values().sum::<i64>();
            self.move_prizes(&prizes)?;
        }

        // 4. the sale's own postings
        let accounts = self.accounts();
        let mut rows = accounts.transactions(TransactionType::Sale, &[sale_id])?;
        rows.extend(accounts.transactions(TransactionType::SaleRefund, &correction_ids)?);
        let reversed_transactions = accounts.reverse_transactions(&rows)?;

        // 5. receipts against the sale's AR lines
        let lines = self.partners().lines_for_document(DocumentKind::Sale, sale_id)?;
        let line_ids: Vec<RowId> = lines.iter().map(|line| line.id).collect();
        let settlements = self.settlements().reverse_for_lines(&line_ids)?;

        // 6. the document itself
        let removed_lines = self.partners().delete_lines(&line_ids)?;
        self.store
            .remove_where::<SaleCorrection>(&Query::all().eq("sale_id", sale_id))?;
        self.store
            .remove_where::<SaleItem>(&Query::all().eq("sale_id", sale_id))?;
        self.store.remove::<Sale>(sale_id)?;

        info!(
            sale_id,
            movements = reversed_movements.len(),
            transactions = reversed_transactions.len(),
            settlements_deleted = settlements.deleted.len(),
            "sale deleted"
        );
        Ok(SaleDeletion {
            sale_id,
            restored_credit,
            reversed_movements,
            restored_prizes,
            reversed_transactions,
            settlements,
            removed_lines,
        })
    }

    /// Ship a pending delivery of a confirmed sale.
    pub fn confirm_delivery(&self, delivery_id: RowId) -> LedgerResult<DeliveryConfirmation> {
        let mut delivery: Delivery = self.store.get(delivery_id)?;
        let sale: Sale = self.store.get(delivery.sale_id)?;
        if sale.status != SaleStatus::Confirmed {
            return Err(LedgerError::invalid_state(
                "sales",
                sale.id,
                "deliveries ship confirmed sales only",
            ));
        }
        if delivery.status == DeliveryStatus::Confirmed {
            return Err(LedgerError::AlreadyProcessed {
                ref_type: InventoryRef::Delivery.as_str().into(),
                ref_id: delivery_id,
            });
        }
        let items: Vec<DeliveryItem> = self
            .store
            .fetch(&Query::all().eq("delivery_id", delivery_id))?;
        if items.is_empty() {
            return Err(LedgerError::invalid_state(
                "deliveries",
                delivery_id,
                "delivery has no items",
            ));
        }
        let lines: Vec<(RowId, i64)> = items
            .iter()
            .map(|item| (item.product_id, item.quantity))
            .collect();
        let movements = self.inventory().deduct_for_delivery(delivery_id, &lines)?;

        delivery.status = DeliveryStatus::Confirmed;
        delivery.confirmed_at = Some(self.ctx.now());
        self.store.save(&delivery)?;
        let fulfillment_status = self.refresh_fulfillment(sale.id)?;
        info!(delivery_id, sale_id = sale.id, %fulfillment_status, "delivery confirmed");
        Ok(DeliveryConfirmation {
            delivery,
            movements,
            fulfillment_status,
        })
    }

    fn has_confirmed_delivery(&self, sale_id: RowId) -> LedgerResult<bool> {
        Ok(self.store.exists::<Delivery>(
            &Query::all()
                .eq("sale_id", sale_id)
                .eq("status", DeliveryStatus::Confirmed.as_str()),
        )?)
    }

    /// Net quantity shipped per sale item: confirmed deliveries minus what
    /// corrections already put back.
    fn delivered_quantities(&self, sale_id: RowId) -> LedgerResult<HashMap<RowId, i64>> {
        let confirmed: Vec<RowId> = self
            .store
            .fetch::<Delivery>(
                &Query::all()
                    .eq("sale_id", sale_id)
                    .eq("status", DeliveryStatus::Confirmed.as_str()),
            )?
            .iter()
            .map(|d| d.id)
            .collect();
        let mut delivered: HashMap<RowId, i64> = HashMap::new();
        if confirmed.is_empty() {
            return Ok(delivered);
        }
        for item in self
            .store
            .fetch::<DeliveryItem>(&Query::all().is_in("delivery_id", confirmed))?
        {
            *delivered.entry(item.sale_item_id).or_default() += item.quantity;
        }
        let item_ids: Vec<RowId> = delivered.keys().copied().collect();
        for entry in self
            .inventory()
            .movements(InventoryRef::SaleCorrection, &item_ids)?
        {
            *delivered.entry(entry.ref_id).or_default() -= entry.qty_change;
        }
        Ok(delivered)
    }

    /// Recompute and store the sale's fulfillment status.
    fn refresh_fulfillment(&self, sale_id: RowId) -> LedgerResult<FulfillmentStatus> {
        let items: Vec<SaleItem> = self.store.fetch(&Query::all().eq("sale_id", sale_id))?;
        let delivered = self.delivered_quantities(sale_id)?;
        let any_out = delivered.values().any(|qty| *qty > 0);
        let all_out = items
            .iter()
            .all(|item| delivered.get(&item.id).copied().unwrap_or(0) >= item.quantity);
        let status = match (any_out, all_out) {
            (false, _) => FulfillmentStatus::Unfulfilled,
            (true, true) => FulfillmentStatus::Completed,
            (true, false) => FulfillmentStatus::Partial,
        };
        self.store.patch::<Sale>(
            sale_id,
            &[("fulfillment_status", json!(status.as_str()))],
        )?;
        Ok(status)
    }

    /// Fail if any positive entry exceeds the prize's remaining count.
    fn check_prizes(&self, take: &BTreeMap<RowId, i64>) -> LedgerResult<()> {
        for (prize_id, qty) in take {
            if *qty <= 0 {
                continue;
            }
            let prize: IchibanKujiPrize = self.store.get(*prize_id)?;
            if prize.remaining < *qty {
                return Err(LedgerError::InsufficientPrizeStock {
                    prize_id: *prize_id,
                    requested: *qty,
                    remaining: prize.remaining,
                });
            }
        }
        Ok(())
    }

    /// Take positive quantities from prizes, give negative ones back.
    fn move_prizes(&self, take: &BTreeMap<RowId, i64>) -> LedgerResult<()> {
        for (prize_id, qty) in take {
            if *qty == 0 {
                continue;
            }
            let prize: IchibanKujiPrize = self.store.get(*prize_id)?;
            let remaining = prize.remaining - qty;
            self.store
                .patch::<IchibanKujiPrize>(*prize_id, &[("remaining", json!(remaining))])?;
            debug!(prize_id, remaining, "prize stock moved");
        }
        Ok(())
    }
}

fn prize_quantities(items: &[SaleItem], qty: impl Fn(&SaleItem) -> i64) -> BTreeMap<RowId, i64> {
    let mut per_prize = BTreeMap::new();
    for item in items {
        if let Some(prize_id) = item.prize_id {
            *per_prize.entry(prize_id).or_insert(0) += qty(item);
        }
    }
    per_prize
}
