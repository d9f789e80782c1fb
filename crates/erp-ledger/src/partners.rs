//! Partner accounts: one AR or AP line per confirmed document item that
//! still needs collecting or paying.

use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use tracing::debug;

use erp_store::{
    LedgerStore, PartnerAccount, Purchase, PurchaseItem, Query, RecordStore, RowId, Sale,
    SaleItem, SettlementAllocation,
};
use erp_types::{round_cents, DocumentKind, LedgerSide, LineStatus, PartnerType};

use crate::context::LedgerContext;
use crate::error::{LedgerError, LedgerResult};
use crate::locks::AggregateKey;

/// Status implied by the amounts, with `epsilon` tolerance at both ends.
pub fn derive_status(amount: Decimal, received_paid: Decimal, epsilon: Decimal) -> LineStatus {
    if received_paid >= amount - epsilon {
        LineStatus::Paid
    } else if received_paid <= epsilon {
        LineStatus::Unpaid
    } else {
        LineStatus::Partial
    }
}

/// Split `total_paid` across items in proportion to their subtotals.
///
/// Each share is rounded half away from zero to cents on its own; the
/// shares are not forced to add back up to `total_paid`.
pub fn redistribute_paid(total_paid: Decimal, subtotals: &[Decimal]) -> Vec<Decimal> {
    let total: Decimal = subtotals.iter().sum();
    if total <= Decimal::ZERO || total_paid <= Decimal::ZERO {
        return vec![Decimal::ZERO; subtotals.len()];
    }
    subtotals
        .iter()
        .map(|subtotal| round_cents(total_paid * subtotal / total))
        .collect()
}

/// What a new line should look like, before it is stored.
#[derive(Clone, Debug, PartialEq)]
pub struct LineDraft {
    pub partner_type: PartnerType,
    pub partner_code: String,
    pub direction: LedgerSide,
    pub ref_type: DocumentKind,
    pub ref_id: RowId,
    pub sale_item_id: Option<RowId>,
    pub purchase_item_id: Option<RowId>,
    pub amount: Decimal,
    pub received_paid: Decimal,
    pub due_date: NaiveDate,
}

pub struct PartnerAccounts<'a, S: ?Sized> {
    store: &'a S,
    ctx: &'a LedgerContext,
}

impl<'a, S: LedgerStore + ?Sized> PartnerAccounts<'a, S> {
    pub fn new(store: &'a S, ctx: &'a LedgerContext) -> Self {
        Self { store, ctx }
    }

    pub fn create_line(&self, draft: &LineDraft) -> LedgerResult<PartnerAccount> {
        let received_paid = draft.received_paid.min(draft.amount).max(Decimal::ZERO);
        let line = self.store.create(&PartnerAccount {
            id: 0,
            partner_type: draft.partner_type,
            partner_code: draft.partner_code.clone(),
            direction: draft.direction,
            ref_type: draft.ref_type,
            ref_id: draft.ref_id,
            sale_item_id: draft.sale_item_id,
            purchase_item_id: draft.purchase_item_id,
            amount: draft.amount,
            received_paid,
            balance: draft.amount - received_paid,
            due_date: draft.due_date,
            status: derive_status(draft.amount, received_paid, self.ctx.epsilon()),
        })?;
        debug!(
            line_id = line.id,
            direction = %line.direction,
            ref_id = line.ref_id,
            amount = %line.amount,
            balance = %line.balance,
            "partner line created"
        );
        Ok(line)
    }

    /// AR lines for the unpaid part of a sale, due on the sale date.
    ///
    /// `paid` is spread over the items by subtotal; items it fully covers
    /// get no line.
    pub fn create_sale_lines(
        &self,
        sale: &Sale,
        items: &[SaleItem],
        paid: Decimal,
    ) -> LedgerResult<Vec<PartnerAccount>> {
        let code = sale.customer_code.clone().ok_or_else(|| {
            LedgerError::invalid_state("sales", sale.id, "unpaid sale has no customer")
        })?;
        let subtotals: Vec<Decimal> = items.iter().map(|item| item.subtotal).collect();
        let shares = redistribute_paid(paid, &subtotals);
        let mut lines = Vec::new();
        for (item, share) in items.iter().zip(shares) {
            if self.is_covered(item.subtotal, share) {
                continue;
            }
            lines.push(self.create_line(&LineDraft {
                partner_type: PartnerType::Customer,
                partner_code: code.clone(),
                direction: LedgerSide::Ar,
                ref_type: DocumentKind::Sale,
                ref_id: sale.id,
                sale_item_id: Some(item.id),
                purchase_item_id: None,
                amount: item.subtotal,
                received_paid: share,
                due_date: sale.sale_date,
            })?);
        }
        Ok(lines)
    }

    /// AP lines for the unpaid part of a purchase, due `ap_due_days` after
    /// `approved_on`.
    pub fn create_purchase_lines(
        &self,
        purchase: &Purchase,
        items: &[PurchaseItem],
        paid: Decimal,
        approved_on: NaiveDate,
    ) -> LedgerResult<Vec<PartnerAccount>> {
        let due_date = approved_on
            .checked_add_days(Days::new(self.ctx.config.ap_due_days.into()))
            .unwrap_or(approved_on);
        let subtotals: Vec<Decimal> = items.iter().map(|item| item.subtotal).collect();
        let shares = redistribute_paid(paid, &subtotals);
        let mut lines = Vec::new();
        for (item, share) in items.iter().zip(shares) {
            if self.is_covered(item.subtotal, share) {
                continue;
            }
            lines.push(self.create_line(&LineDraft {
                partner_type: PartnerType::Vendor,
                partner_code: purchase.vendor_code.clone(),
                direction: LedgerSide::Ap,
                ref_type: DocumentKind::Purchase,
                ref_id: purchase.id,
                sale_item_id: None,
                purchase_item_id: Some(item.id),
                amount: item.subtotal,
                received_paid: share,
                due_date,
            })?);
        }
        Ok(lines)
    }

    fn is_covered(&self, subtotal: Decimal, paid: Decimal) -> bool {
        subtotal <= self.ctx.epsilon() || paid >= subtotal - self.ctx.epsilon()
    }

    /// Record `amount` more paid against a line.
    pub fn apply_allocation(&self, line_id: RowId, amount: Decimal) -> LedgerResult<PartnerAccount> {
        self.move_paid(line_id, amount)
    }

    /// Give back `amount` previously allocated to a line.
    pub fn release_allocation(
        &self,
        line_id: RowId,
        amount: Decimal,
    ) -> LedgerResult<PartnerAccount> {
        self.move_paid(line_id, -amount)
    }

    fn move_paid(&self, line_id: RowId, delta: Decimal) -> LedgerResult<PartnerAccount> {
        let _guard = self
            .ctx
            .locks
            .acquire_one(AggregateKey::PartnerAccount(line_id))?;
        let mut line: PartnerAccount = self.store.get(line_id)?;
        line.received_paid = (line.received_paid + delta).max(Decimal::ZERO);
        self.refresh(&mut line);
        self.store.save(&line)?;
        debug!(line_id, %delta, balance = %line.balance, status = %line.status, "partner line paid");
        Ok(line)
    }

    /// Change a line's amount, keeping what was paid up to the new amount.
    ///
    /// Returns the updated line and the paid excess the shrink left over.
    pub fn set_amount(
        &self,
        line_id: RowId,
        amount: Decimal,
    ) -> LedgerResult<(PartnerAccount, Decimal)> {
        let _guard = self
            .ctx
            .locks
            .acquire_one(AggregateKey::PartnerAccount(line_id))?;
        let mut line: PartnerAccount = self.store.get(line_id)?;
        let excess = (line.received_paid - amount).max(Decimal::ZERO);
        line.amount = amount;
        line.received_paid -= excess;
        self.refresh(&mut line);
        self.store.save(&line)?;
        Ok((line, excess))
    }

    fn refresh(&self, line: &mut PartnerAccount) {
        line.balance = line.amount - line.received_paid;
        line.status = derive_status(line.amount, line.received_paid, self.ctx.epsilon());
    }

    pub fn lines_for_document(
        &self,
        kind: DocumentKind,
        ref_id: RowId,
    ) -> LedgerResult<Vec<PartnerAccount>> {
        Ok(self.store.fetch(
            &Query::all()
                .eq("ref_type", kind.as_str())
                .eq("ref_id", ref_id),
        )?)
    }

    pub fn line_for_sale_item(&self, sale_item_id: RowId) -> LedgerResult<Option<PartnerAccount>> {
        Ok(self
            .store
            .fetch(&Query::all().eq("sale_item_id", sale_item_id).limit(1))?
            .into_iter()
            .next())
    }

    pub fn lines_for_purchase_item(
        &self,
        purchase_item_id: RowId,
    ) -> LedgerResult<Vec<PartnerAccount>> {
        Ok(self
            .store
            .fetch(&Query::all().eq("purchase_item_id", purchase_item_id))?)
    }

    pub fn delete_lines(&self, line_ids: &[RowId]) -> LedgerResult<usize> {
        if line_ids.is_empty() {
            return Ok(0);
        }
        let removed = self
            .store
            .remove_where::<PartnerAccount>(&Query::all().is_in("id", line_ids.iter().copied()))?;
        debug!(count = removed.len(), "partner lines deleted");
        Ok(removed.len())
    }

    /// Recompute a document's lines from its items.
    ///
    /// Everything paid on the document so far, upfront plus settlements, is
    /// spread over the current items with [`redistribute_paid`]. Existing
    /// lines are updated in place so their allocations stay attached; items
    /// without a line that now owe something get one; lines whose item is
    /// gone are dropped when nothing was allocated to them.
    pub fn rebuild_lines(&self, kind: DocumentKind, ref_id: RowId) -> LedgerResult<Vec<PartnerAccount>> {
        let existing = self.lines_for_document(kind, ref_id)?;
        let allocated: Decimal = if existing.is_empty() {
            Decimal::ZERO
        } else {
            self.store
                .fetch::<SettlementAllocation>(
                    &Query::all().is_in("partner_account_id", existing.iter().map(|l| l.id)),
                )?
                .iter()
                .map(|a| a.amount)
                .sum()
        };

        let (items, upfront, template) = match kind {
            DocumentKind::Sale => {
                let sale: Sale = self.store.get(ref_id)?;
                let items: Vec<SaleItem> = self.store.fetch(&Query::all().eq("sale_id", ref_id))?;
                let items: Vec<(RowId, Decimal)> =
                    items.iter().map(|item| (item.id, item.subtotal)).collect();
                let code = sale.customer_code.clone().unwrap_or_default();
                let template = LineDraft {
                    partner_type: PartnerType::Customer,
                    partner_code: code,
                    direction: LedgerSide::Ar,
                    ref_type: kind,
                    ref_id,
                    sale_item_id: None,
                    purchase_item_id: None,
                    amount: Decimal::ZERO,
                    received_paid: Decimal::ZERO,
                    due_date: sale.sale_date,
                };
                (items, sale.paid_amount, template)
            }
            DocumentKind::Purchase => {
                let purchase: Purchase = self.store.get(ref_id)?;
                let items: Vec<PurchaseItem> =
                    self.store.fetch(&Query::all().eq("purchase_id", ref_id))?;
                let items: Vec<(RowId, Decimal)> =
                    items.iter().map(|item| (item.id, item.subtotal)).collect();
                let approved_on = purchase.approved_on.unwrap_or_else(|| self.ctx.today());
                let due_date = approved_on
                    .checked_add_days(Days::new(self.ctx.config.ap_due_days.into()))
                    .unwrap_or(approved_on);
                let template = LineDraft {
                    partner_type: PartnerType::Vendor,
                    partner_code: purchase.vendor_code.clone(),
                    direction: LedgerSide::Ap,
                    ref_type: kind,
                    ref_id,
                    sale_item_id: None,
                    purchase_item_id: None,
                    amount: Decimal::ZERO,
                    received_paid: Decimal::ZERO,
                    due_date,
                };
                (items, purchase.paid_amount, template)
            }
        };

        let subtotals: Vec<Decimal> = items.iter().map(|(_, subtotal)| *subtotal).collect();
        let shares = redistribute_paid(upfront + allocated, &subtotals);
        let item_of = |line: &PartnerAccount| line.sale_item_id.or(line.purchase_item_id);

        let mut rebuilt = Vec::new();
        for ((item_id, subtotal), share) in items.iter().zip(shares) {
            let share = share.min(*subtotal);
            match existing.iter().find(|&line| item_of(line) == Some(*item_id)) {
                Some(line) => {
                    let _guard = self
                        .ctx
                        .locks
                        .acquire_one(AggregateKey::PartnerAccount(line.id))?;
                    let mut line = line.clone();
                    line.amount = *subtotal;
                    line.received_paid = share;
                    self.refresh(&mut line);
                    self.store.save(&line)?;
                    rebuilt.push(line);
                }
                None if !self.is_covered(*subtotal, share) => {
                    let mut draft = template.clone();
                    match kind {
                        DocumentKind::Sale => draft.sale_item_id = Some(*item_id),
                        DocumentKind::Purchase => draft.purchase_item_id = Some(*item_id),
                    }
                    draft.amount = *subtotal;
                    draft.received_paid = share;
                    rebuilt.push(self.create_line(&draft)?);
                }
                None => {}
            }
        }

        let orphans: Vec<RowId> = existing
            .iter()
            .filter(|&line| {
                item_of(line).map_or(true, |id| items.iter().all(|(item_id, _)| *item_id != id))
            })
            .filter(|line| line.received_paid <= self.ctx.epsilon())
            .map(|line| line.id)
            .collect();
        self.delete_lines(&orphans)?;
        debug!(%kind, ref_id, lines = rebuilt.len(), "partner lines rebuilt");
        Ok(rebuilt)
    }
}
