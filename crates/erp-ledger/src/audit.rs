use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;
use serde::Serialize;

use erp_store::{
    Account, AccountTransaction, LedgerStore, PartnerAccount, Product, Purchase, PurchaseItem,
    Query, RecordStore, RowId, Sale, SaleItem, Settlement, SettlementAllocation, Table,
};
use erp_types::{PurchaseStatus, SaleStatus};

use crate::accounts::AccountLedger;
use crate::context::LedgerContext;
use crate::error::LedgerResult;
use crate::inventory::InventoryLedger;
use crate::partners::{derive_status, redistribute_paid};

/// Result of an invariant sweep over the whole store.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AuditReport {
    pub products_checked: usize,
    pub accounts_checked: usize,
    pub lines_checked: usize,
    pub settlements_checked: usize,
    pub violations: Vec<Violation>,
}

impl AuditReport {
    /// Returns `true` if all checks passed.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn count(&self, kind: ViolationKind) -> usize {
        self.violations.iter().filter(|v| v.kind == kind).count()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub table: Table,
    pub id: RowId,
    pub description: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    StockDrift,
    NegativeStock,
    BalanceDrift,
    DuplicatePosting,
    LineBalanceMismatch,
    LineStatusMismatch,
    SettlementAllocationMismatch,
    OrphanAllocation,
    MissingPartnerLine,
}

/// Read-only invariant checker.
pub struct Auditor;

impl Auditor {
    pub fn audit<S: LedgerStore + ?Sized>(
        store: &S,
        ctx: &LedgerContext,
    ) -> LedgerResult<AuditReport> {
        let mut report = AuditReport::default();
        Self::check_products(store, ctx, &mut report)?;
        Self::check_accounts(store, ctx, &mut report)?;
        Self::check_lines(store, ctx, &mut report)?;
        Self::check_settlements(store, ctx, &mut report)?;
        Self::check_missing_lines(store, ctx, &mut report)?;
        Ok(report)
    }

    fn check_products<S: LedgerStore + ?Sized>(
        store: &S,
        ctx: &LedgerContext,
        report: &mut AuditReport,
    ) -> LedgerResult<()> {
        let inventory = InventoryLedger::new(store, ctx);
        for product in store.fetch::<Product>(&Query::all())? {
            report.products_checked += 1;
            let derived = inventory.stock_from_log(product.id)?;
            if derived != product.stock {
                report.violations.push(Violation {
                    kind: ViolationKind::StockDrift,
                    table: Table::Products,
                    id: product.id,
                    description: format!("stock {} but log says {derived}", product.stock),
                });
            }
            let may_go_negative = product.allow_negative || ctx.config.default_allow_negative;
            if product.stock < 0 && !may_go_negative {
                report.violations.push(Violation {
                    kind: ViolationKind::NegativeStock,
                    table: Table::Products,
                    id: product.id,
                    description: format!("stock {} on a product that disallows it", product.stock),
                });
            }
        }
        Ok(())
    }

    fn check_accounts<S: LedgerStore + ?Sized>(
        store: &S,
        ctx: &LedgerContext,
        report: &mut AuditReport,
    ) -> LedgerResult<()> {
        let ledger = AccountLedger::new(store, ctx);
        for account in store.fetch::<Account>(&Query::all())? {
            report.accounts_checked += 1;
            let rec = ledger.reconcile(account.id)?;
            if !rec.is_consistent(ctx.epsilon()) {
                report.violations.push(Violation {
                    kind: ViolationKind::BalanceDrift,
                    table: Table::Accounts,
                    id: account.id,
                    description: format!(
                        "balance {} but transactions imply {}",
                        rec.recorded, rec.derived
                    ),
                });
            }
        }

        let mut seen: HashMap<(String, RowId, String), RowId> = HashMap::new();
        for tx in store.fetch::<AccountTransaction>(&Query::all())? {
            let key = (
                tx.ref_type.clone(),
                tx.ref_id,
                tx.transaction_type.as_str().to_string(),
            );
            if let Some(first) = seen.get(&key) {
                report.violations.push(Violation {
                    kind: ViolationKind::DuplicatePosting,
                    table: Table::AccountTransactions,
                    id: tx.id,
                    description: format!(
                        "{} {} {} already posted as transaction {first}",
                        key.2, key.0, key.1
                    ),
                });
            } else {
                seen.insert(key, tx.id);
            }
        }
        Ok(())
    }

    fn check_lines<S: LedgerStore + ?Sized>(
        store: &S,
        ctx: &LedgerContext,
        report: &mut AuditReport,
    ) -> LedgerResult<()> {
        let eps = ctx.epsilon();
        for line in store.fetch::<PartnerAccount>(&Query::all())? {
            report.lines_checked += 1;
            let expected = line.amount - line.received_paid;
            if (line.balance - expected).abs() > eps {
                report.violations.push(Violation {
                    kind: ViolationKind::LineBalanceMismatch,
                    table: Table::PartnerAccounts,
                    id: line.id,
                    description: format!("balance {} but amount - paid is {expected}", line.balance),
                });
            }
            let status = derive_status(line.amount, line.received_paid, eps);
            if status != line.status {
                report.violations.push(Violation {
                    kind: ViolationKind::LineStatusMismatch,
                    table: Table::PartnerAccounts,
                    id: line.id,
                    description: format!("status {} but amounts say {status}", line.status),
                });
            }
        }
        Ok(())
    }

    fn check_settlements<S: LedgerStore + ?Sized>(
        store: &S,
        ctx: &LedgerContext,
        report: &mut AuditReport,
    ) -> LedgerResult<()> {
        let settlements = store.fetch::<Settlement>(&Query::all())?;
        let allocations = store.fetch::<SettlementAllocation>(&Query::all())?;
        let line_ids: HashSet<RowId> = store
            .fetch::<PartnerAccount>(&Query::all())?
            .iter()
            .map(|line| line.id)
            .collect();
        let settlement_ids: HashSet<RowId> = settlements.iter().map(|s| s.id).collect();

        let mut allocated: HashMap<RowId, Decimal> = HashMap::new();
        for allocation in &allocations {
            *allocated.entry(allocation.settlement_id).or_default() += allocation.amount;
            if !settlement_ids.contains(&allocation.settlement_id)
                || !line_ids.contains(&allocation.partner_account_id)
            {
                report.violations.push(Violation {
                    kind: ViolationKind::OrphanAllocation,
                    table: Table::SettlementAllocations,
                    id: allocation.id,
                    description: format!(
                        "settlement {} / line {} missing",
                        allocation.settlement_id, allocation.partner_account_id
                    ),
                });
            }
        }
        for settlement in &settlements {
            report.settlements_checked += 1;
            let sum = allocated.get(&settlement.id).copied().unwrap_or_default();
            if (sum - settlement.amount).abs() > ctx.epsilon() {
                report.violations.push(Violation {
                    kind: ViolationKind::SettlementAllocationMismatch,
                    table: Table::Settlements,
                    id: settlement.id,
                    description: format!("amount {} but allocations sum to {sum}", settlement.amount),
                });
            }
        }
        Ok(())
    }

    /// Every item of a confirmed document that is not covered by its share
    /// of the upfront payment must have a line.
    fn check_missing_lines<S: LedgerStore + ?Sized>(
        store: &S,
        ctx: &LedgerContext,
        report: &mut AuditReport,
    ) -> LedgerResult<()> {
        let eps = ctx.epsilon();
        let lines = store.fetch::<PartnerAccount>(&Query::all())?;
        let sale_items_with_line: HashSet<RowId> =
            lines.iter().filter_map(|line| line.sale_item_id).collect();
        let purchase_items_with_line: HashSet<RowId> =
            lines.iter().filter_map(|line| line.purchase_item_id).collect();

        let sales = store.fetch::<Sale>(
            &Query::all().eq("status", SaleStatus::Confirmed.as_str()),
        )?;
        for sale in sales {
            let items: Vec<SaleItem> = store.fetch(&Query::all().eq("sale_id", sale.id))?;
            let subtotals: Vec<Decimal> = items.iter().map(|i| i.subtotal).collect();
            let shares = redistribute_paid(sale.paid_amount.min(sale.total), &subtotals);
            for (item, share) in items.iter().zip(shares) {
                if item.subtotal > eps
                    && share < item.subtotal - eps
                    && !sale_items_with_line.contains(&item.id)
                {
                    report.violations.push(Violation {
                        kind: ViolationKind::MissingPartnerLine,
                        table: Table::SaleItems,
                        id: item.id,
                        description: format!("sale {} item owes but has no AR line", sale.sale_no),
                    });
                }
            }
        }

        let purchases = store.fetch::<Purchase>(
            &Query::all().eq("status", PurchaseStatus::Approved.as_str()),
        )?;
        for purchase in purchases {
            let items: Vec<PurchaseItem> =
                store.fetch(&Query::all().eq("purchase_id", purchase.id))?;
            let subtotals: Vec<Decimal> = items.iter().map(|i| i.subtotal).collect();
            let shares = redistribute_paid(purchase.paid_amount.min(purchase.total), &subtotals);
            for (item, share) in items.iter().zip(shares) {
                if item.subtotal > eps
                    && share < item.subtotal - eps
                    && !purchase_items_with_line.contains(&item.id)
                {
                    report.violations.push(Violation {
                        kind: ViolationKind::MissingPartnerLine,
                        table: Table::PurchaseItems,
                        id: item.id,
                        description: format!(
                            "purchase {} item owes but has no AP line",
                            purchase.purchase_no
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}
