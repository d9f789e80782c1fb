use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::info_span;

use erp_store::{
    Account, CustomerBalanceLog, InventoryLogEntry, LedgerStore, PartnerAccount, RowId,
    StockAdjustment,
};
use erp_types::{BusinessClock, DocumentKind};

use crate::accounts::{AccountLedger, AccountReconciliation, PostingOutcome, PostingRequest};
use crate::audit::{AuditReport, Auditor};
use crate::config::LedgerConfig;
use crate::context::LedgerContext;
use crate::credit::StoreCredit;
use crate::error::LedgerResult;
use crate::inventory::InventoryLedger;
use crate::journal::Journal;
use crate::lifecycle::{
    DeliveryConfirmation, DocumentLifecycle, ItemAdjustment, ItemCost, PurchaseApproval,
    PurchaseDeletion, PurchaseItemDeletion, SaleConfirmation, SaleCorrectionOutcome, SaleDeletion,
};
use crate::partners::PartnerAccounts;
use crate::settlement::{SettlementEngine, SettlementOutcome, SettlementRequest, SettlementReversal};

/// Entry point for every ledger operation.
///
/// Each write operation runs in its own [`Journal`]: it either completes,
/// or its writes are undone and the error is returned.
pub struct Ledger<S> {
    store: S,
    ctx: LedgerContext,
}

impl<S: LedgerStore> Ledger<S> {
    pub fn new(store: S, config: LedgerConfig, clock: Arc<dyn BusinessClock>) -> Self {
        Self {
            store,
            ctx: LedgerContext::new(config, clock),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn context(&self) -> &LedgerContext {
        &self.ctx
    }

    fn run<T>(
        &self,
        operation: &'static str,
        op: impl FnOnce(&Journal<'_, S>, &LedgerContext) -> LedgerResult<T>,
    ) -> LedgerResult<T> {
        let journal = Journal::begin(&self.store, &self.ctx, operation);
        let span = info_span!("ledger", operation, journal = %journal.id());
        let _entered = span.enter();
        match op(&journal, &self.ctx) {
            Ok(value) => {
                journal.commit();
                Ok(value)
            }
            Err(cause) => Err(journal.rollback(cause)),
        }
    }

    // -----------------------------------------------------------------------
    // Accounts
    // -----------------------------------------------------------------------

    pub fn open_account(
        &self,
        name: &str,
        account_type: &str,
        payment_method_code: Option<String>,
        opening_balance: Decimal,
    ) -> LedgerResult<Account> {
        self.run("open_account", |store, ctx| {
            AccountLedger::new(store, ctx).open_account(
                name,
                account_type,
                payment_method_code,
                opening_balance,
            )
        })
    }

    pub fn update_account_balance(&self, request: &PostingRequest) -> LedgerResult<PostingOutcome> {
        self.run("update_account_balance", |store, ctx| {
            AccountLedger::new(store, ctx).update_account_balance(request)
        })
    }

    pub fn reconcile_account(&self, account_id: RowId) -> LedgerResult<AccountReconciliation> {
        AccountLedger::new(&self.store, &self.ctx).reconcile(account_id)
    }

    // -----------------------------------------------------------------------
    // Inventory
    // -----------------------------------------------------------------------

    pub fn adjust_stock(
        &self,
        product_id: RowId,
        new_stock: i64,
        reason: &str,
    ) -> LedgerResult<StockAdjustment> {
        self.run("adjust_stock", |store, ctx| {
            InventoryLedger::new(store, ctx).adjust_stock(product_id, new_stock, reason)
        })
    }

    pub fn stock_from_log(&self, product_id: RowId) -> LedgerResult<i64> {
        InventoryLedger::new(&self.store, &self.ctx).stock_from_log(product_id)
    }

    // -----------------------------------------------------------------------
    // Settlements and store credit
    // -----------------------------------------------------------------------

    pub fn create_settlement(&self, request: &SettlementRequest) -> LedgerResult<SettlementOutcome> {
        self.run("create_settlement", |store, ctx| {
            SettlementEngine::new(store, ctx).create_settlement(request)
        })
    }

    pub fn void_settlement(&self, settlement_id: RowId) -> LedgerResult<SettlementReversal> {
        self.run("void_settlement", |store, ctx| {
            SettlementEngine::new(store, ctx).void_settlement(settlement_id)
        })
    }

    pub fn top_up_store_credit(
        &self,
        customer_id: RowId,
        amount: Decimal,
        note: Option<String>,
    ) -> LedgerResult<CustomerBalanceLog> {
        self.run("top_up_store_credit", |store, ctx| {
            StoreCredit::new(store, ctx).top_up(customer_id, amount, "top_up", None, note)
        })
    }

    pub fn rebuild_partner_lines(
        &self,
        kind: DocumentKind,
        ref_id: RowId,
    ) -> LedgerResult<Vec<PartnerAccount>> {
        self.run("rebuild_partner_lines", |store, ctx| {
            PartnerAccounts::new(store, ctx).rebuild_lines(kind, ref_id)
        })
    }

    // -----------------------------------------------------------------------
    // Sales
    // -----------------------------------------------------------------------

    pub fn confirm_sale(&self, sale_id: RowId) -> LedgerResult<SaleConfirmation> {
        self.run("confirm_sale", |store, ctx| {
            DocumentLifecycle::new(store, ctx).confirm_sale(sale_id)
        })
    }

    pub fn correct_sale(
        &self,
        sale_id: RowId,
        adjustments: &[ItemAdjustment],
    ) -> LedgerResult<SaleCorrectionOutcome> {
        self.run("correct_sale", |store, ctx| {
            DocumentLifecycle::new(store, ctx).correct_sale(sale_id, adjustments)
        })
    }

    pub fn delete_sale(&self, sale_id: RowId) -> LedgerResult<SaleDeletion> {
        self.run("delete_sale", |store, ctx| {
            DocumentLifecycle::new(store, ctx).delete_sale(sale_id)
        })
    }

    pub fn confirm_delivery(&self, delivery_id: RowId) -> LedgerResult<DeliveryConfirmation> {
        self.run("confirm_delivery", |store, ctx| {
            DocumentLifecycle::new(store, ctx).confirm_delivery(delivery_id)
        })
    }

    // -----------------------------------------------------------------------
    // Purchases
    // -----------------------------------------------------------------------

    pub fn approve_purchase(
        &self,
        purchase_id: RowId,
        costs: &[ItemCost],
    ) -> LedgerResult<PurchaseApproval> {
        self.run("approve_purchase", |store, ctx| {
            DocumentLifecycle::new(store, ctx).approve_purchase(purchase_id, costs)
        })
    }

    pub fn receive_purchase_item(
        &self,
        purchase_item_id: RowId,
        received_qty: i64,
    ) -> LedgerResult<InventoryLogEntry> {
        self.run("receive_purchase_item", |store, ctx| {
            DocumentLifecycle::new(store, ctx).receive_purchase_item(purchase_item_id, received_qty)
        })
    }

    pub fn delete_purchase_item(&self, purchase_item_id: RowId) -> LedgerResult<PurchaseItemDeletion> {
        self.run("delete_purchase_item", |store, ctx| {
            DocumentLifecycle::new(store, ctx).delete_purchase_item(purchase_item_id)
        })
    }

    pub fn delete_purchase(&self, purchase_id: RowId) -> LedgerResult<PurchaseDeletion> {
        self.run("delete_purchase", |store, ctx| {
            DocumentLifecycle::new(store, ctx).delete_purchase(purchase_id)
        })
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    pub fn audit(&self) -> LedgerResult<AuditReport> {
        Auditor::audit(&self.store, &self.ctx)
    }
}

impl<S> std::fmt::Debug for Ledger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").field("ctx", &self.ctx).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountTarget;
    use crate::error::{LedgerError, Warning};
    use crate::settlement::AllocationRequest;
    use crate::testing::{self, account, customer, delivery, draft_sale, pending_purchase, product};
    use erp_store::{
        AccountTransaction, InMemoryStore, Product, Query, RecordStore, Sale, SaleItem,
        Settlement, Table,
    };
    use erp_types::{
        BalanceDirection, FulfillmentStatus, LedgerSide, LineStatus, PartnerType, PaymentMethod,
        SettlementDirection, TransactionType,
    };
    use rust_decimal_macros::dec;

    fn balance<S: LedgerStore>(ledger: &Ledger<S>, account_id: RowId) -> Decimal {
        ledger.store().get::<Account>(account_id).unwrap().balance
    }

    fn receipt(code: &str, allocations: &[(RowId, Decimal)]) -> SettlementRequest {
        SettlementRequest {
            partner_type: PartnerType::Customer,
            partner_code: code.into(),
            direction: SettlementDirection::Receipt,
            method: PaymentMethod::Cash,
            amount: allocations.iter().map(|(_, amount)| *amount).sum(),
            allocations: allocations
                .iter()
                .map(|(id, amount)| AllocationRequest {
                    partner_account_id: *id,
                    amount: *amount,
                })
                .collect(),
            account_id: None,
            note: None,
        }
    }

    fn lines<S: LedgerStore>(ledger: &Ledger<S>) -> Vec<PartnerAccount> {
        ledger.store().fetch(&Query::all()).unwrap()
    }

    // -----------------------------------------------------------------------
    // Worked scenarios
    // -----------------------------------------------------------------------

    #[test]
    fn posting_twice_moves_balance_once() {
        let ledger = testing::ledger();
        let cash = ledger
            .open_account("Cash", "cash", Some("cash".into()), dec!(1000))
            .unwrap();
        let request = PostingRequest::new(
            AccountTarget::Id(cash.id),
            dec!(200),
            BalanceDirection::Increase,
            TransactionType::Sale,
            1,
        );

        let first = ledger.update_account_balance(&request).unwrap();
        assert_eq!(first.balance_before, Some(dec!(1000)));
        assert_eq!(first.balance_after, Some(dec!(1200)));

        let second = ledger.update_account_balance(&request).unwrap();
        assert!(!second.posted());
        assert!(matches!(second.warnings[0], Warning::AlreadyPosted { .. }));
        assert_eq!(balance(&ledger, cash.id), dec!(1200));

        let rows: Vec<AccountTransaction> = ledger.store().fetch(&Query::all()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].balance_before, dec!(1000));
        assert_eq!(rows[0].balance_after, dec!(1200));
        assert!(ledger.reconcile_account(cash.id).unwrap().is_consistent(dec!(0.01)));
    }

    #[test]
    fn receipt_settles_ar_line_and_delete_unwinds_it() {
        let ledger = testing::ledger();
        let store = ledger.store();
        let cash = account(store, "cash", dec!(1000));
        customer(store, "C", dec!(0));
        let p = product(store, 0, dec!(5));
        let (sale, _) = draft_sale(store, Some("C"), "cash", dec!(0), &[(p.id, 3, dec!(100))]);

        let confirmed = ledger.confirm_sale(sale.id).unwrap();
        assert_eq!(confirmed.lines.len(), 1);
        let line = &confirmed.lines[0];
        assert_eq!(line.direction, LedgerSide::Ar);
        assert_eq!((line.amount, line.balance), (dec!(300), dec!(300)));
        assert_eq!(line.status, LineStatus::Unpaid);

        ledger.create_settlement(&receipt("C", &[(line.id, dec!(300))])).unwrap();
        let paid = store.get::<PartnerAccount>(line.id).unwrap();
        assert_eq!(paid.balance, dec!(0));
        assert_eq!(paid.status, LineStatus::Paid);
        assert_eq!(balance(&ledger, cash.id), dec!(1300));

        let deletion = ledger.delete_sale(sale.id).unwrap();
        assert_eq!(deletion.settlements.deleted.len(), 1);
        assert_eq!(balance(&ledger, cash.id), dec!(1000));
        assert!(lines(&ledger).is_empty());
        assert!(store.fetch::<Settlement>(&Query::all()).unwrap().is_empty());
        assert_eq!(store.row_count(Table::SettlementAllocations).unwrap(), 0);
        assert!(ledger.audit().unwrap().is_clean());
    }

    #[test]
    fn deleting_received_purchase_item_floors_average_cost() {
        let ledger = testing::ledger();
        let store = ledger.store();
        let p = product(store, 0, dec!(0));
        let (purchase, items) = pending_purchase(store, "V", "cash", dec!(0), &[(p.id, 10)]);
        ledger
            .approve_purchase(
                purchase.id,
                &[ItemCost {
                    purchase_item_id: items[0].id,
                    unit_cost: dec!(5),
                }],
            )
            .unwrap();
        ledger.receive_purchase_item(items[0].id, 10).unwrap();
        let stocked: Product = store.get(p.id).unwrap();
        assert_eq!((stocked.stock, stocked.avg_cost), (10, dec!(5)));

        let deletion = ledger.delete_purchase_item(items[0].id).unwrap();
        assert!(deletion.unstocked.is_some());
        assert_eq!(deletion.purchase_total, dec!(0));
        let emptied: Product = store.get(p.id).unwrap();
        assert_eq!((emptied.stock, emptied.avg_cost), (0, dec!(0)));
        assert!(lines(&ledger).is_empty());
        assert_eq!(ledger.stock_from_log(p.id).unwrap(), 0);
    }

    #[test]
    fn over_allocation_writes_nothing() {
        let ledger = testing::ledger();
        let store = ledger.store();
        let cash = account(store, "cash", dec!(1000));
        customer(store, "C", dec!(0));
        let p = product(store, 10, dec!(5));
        let (sale, _) = draft_sale(store, Some("C"), "cash", dec!(0), &[(p.id, 1, dec!(100))]);
        let line_id = ledger.confirm_sale(sale.id).unwrap().lines[0].id;

        let err = ledger
            .create_settlement(&receipt("C", &[(line_id, dec!(150))]))
            .unwrap_err();
        assert!(matches!(err, LedgerError::OverAllocation { .. }));
        assert_eq!(store.row_count(Table::Settlements).unwrap(), 0);
        assert_eq!(store.row_count(Table::SettlementAllocations).unwrap(), 0);
        assert_eq!(balance(&ledger, cash.id), dec!(1000));
        assert_eq!(store.get::<PartnerAccount>(line_id).unwrap().balance, dec!(100));
    }

    // -----------------------------------------------------------------------
    // Round trips
    // -----------------------------------------------------------------------

    #[test]
    fn confirm_then_delete_restores_every_touched_aggregate() {
        let ledger = testing::ledger();
        let store = ledger.store();
        let cash = account(store, "cash", dec!(500));
        customer(store, "C", dec!(0));
        let a = product(store, 8, dec!(4));
        let b = product(store, 3, dec!(9));
        let (sale, _) = draft_sale(
            store,
            Some("C"),
            "cash",
            dec!(60),
            &[(a.id, 2, dec!(50)), (b.id, 1, dec!(40))],
        );

        ledger.confirm_sale(sale.id).unwrap();
        assert_eq!(balance(&ledger, cash.id), dec!(560));
        assert!(!lines(&ledger).is_empty());

        ledger.delete_sale(sale.id).unwrap();
        assert_eq!(balance(&ledger, cash.id), dec!(500));
        assert!(lines(&ledger).is_empty());
        assert_eq!(store.get::<Product>(a.id).unwrap().stock, 8);
        assert_eq!(store.get::<Product>(b.id).unwrap().stock, 3);
        assert!(store.find::<Sale>(sale.id).unwrap().is_none());
        assert_eq!(store.row_count(Table::SaleItems).unwrap(), 0);
    }

    #[test]
    fn delivered_sale_delete_puts_stock_back() {
        let ledger = testing::ledger();
        let store = ledger.store();
        account(store, "cash", dec!(0));
        let p = product(store, 0, dec!(0));
        ledger.adjust_stock(p.id, 10, "count").unwrap();
        let (sale, items) = draft_sale(store, None, "cash", dec!(40), &[(p.id, 4, dec!(10))]);
        ledger.confirm_sale(sale.id).unwrap();

        let d = delivery(store, sale.id, &[(&items[0], 4)]);
        let shipped = ledger.confirm_delivery(d.id).unwrap();
        assert_eq!(shipped.fulfillment_status, FulfillmentStatus::Completed);
        assert_eq!(store.get::<Product>(p.id).unwrap().stock, 6);
        assert!(matches!(
            ledger.confirm_delivery(d.id).unwrap_err(),
            LedgerError::AlreadyProcessed { .. }
        ));

        ledger.delete_sale(sale.id).unwrap();
        assert_eq!(store.get::<Product>(p.id).unwrap().stock, 10);
        assert_eq!(ledger.stock_from_log(p.id).unwrap(), 10);
        assert_eq!(store.fetch::<SaleItem>(&Query::all()).unwrap().len(), 0);
    }

    #[test]
    fn purchase_delete_unwinds_vendor_payments_and_stock() {
        let ledger = testing::ledger();
        let store = ledger.store();
        let cash = account(store, "cash", dec!(1000));
        let p = product(store, 0, dec!(5));
        ledger.adjust_stock(p.id, 10, "count").unwrap();
        let (purchase, items) = pending_purchase(store, "V", "cash", dec!(0), &[(p.id, 4), (p.id, 6)]);
        let approval = ledger
            .approve_purchase(
                purchase.id,
                &[
                    ItemCost {
                        purchase_item_id: items[0].id,
                        unit_cost: dec!(10),
                    },
                    ItemCost {
                        purchase_item_id: items[1].id,
                        unit_cost: dec!(20),
                    },
                ],
            )
            .unwrap();
        ledger.receive_purchase_item(items[0].id, 4).unwrap();
        ledger.receive_purchase_item(items[1].id, 6).unwrap();
        assert_eq!(store.get::<Product>(p.id).unwrap().stock, 20);

        let (first, second) = (approval.lines[0].id, approval.lines[1].id);
        let payment = ledger
            .create_settlement(&SettlementRequest {
                partner_type: PartnerType::Vendor,
                partner_code: "V".into(),
                direction: SettlementDirection::Payment,
                method: PaymentMethod::Cash,
                amount: dec!(100),
                allocations: vec![
                    AllocationRequest {
                        partner_account_id: first,
                        amount: dec!(30),
                    },
                    AllocationRequest {
                        partner_account_id: second,
                        amount: dec!(70),
                    },
                ],
                account_id: None,
                note: None,
            })
            .unwrap();
        assert_eq!(balance(&ledger, cash.id), dec!(900));

        let item = ledger.delete_purchase_item(items[1].id).unwrap();
        assert_eq!(item.settlements.shrunk, vec![(payment.settlement.id, dec!(30))]);
        assert_eq!(balance(&ledger, cash.id), dec!(970));
        assert_eq!(store.get::<Product>(p.id).unwrap().stock, 14);
        assert!(ledger.audit().unwrap().is_clean());

        let deletion = ledger.delete_purchase(purchase.id).unwrap();
        assert_eq!(deletion.settlements.deleted, vec![payment.settlement.id]);
        assert_eq!(balance(&ledger, cash.id), dec!(1000));
        let product: Product = store.get(p.id).unwrap();
        assert_eq!(product.stock, 10);
        assert_eq!(product.avg_cost, dec!(5));
        assert_eq!(store.row_count(Table::Settlements).unwrap(), 0);
        assert!(lines(&ledger).is_empty());
        assert!(ledger.audit().unwrap().is_clean());
    }

    // -----------------------------------------------------------------------
    // Compensation
    // -----------------------------------------------------------------------

    #[test]
    fn failed_allocation_insert_rolls_back_settlement_and_posting() {
        let ledger = testing::faulty_ledger();
        let store = ledger.store();
        let cash = account(store, "cash", dec!(1000));
        customer(store, "C", dec!(0));
        let p = product(store, 10, dec!(5));
        let (sale, _) = draft_sale(store, Some("C"), "cash", dec!(0), &[(p.id, 1, dec!(300))]);
        let line_id = ledger.confirm_sale(sale.id).unwrap().lines[0].id;

        store.fail_inserts(Table::SettlementAllocations);
        let err = ledger
            .create_settlement(&receipt("C", &[(line_id, dec!(300))]))
            .unwrap_err();
        assert_eq!(err.code(), "store_error");

        assert_eq!(store.row_count(Table::Settlements), 0);
        assert_eq!(store.row_count(Table::AccountTransactions), 0);
        assert_eq!(balance(&ledger, cash.id), dec!(1000));
        assert_eq!(store.get::<PartnerAccount>(line_id).unwrap().balance, dec!(300));
    }

    #[test]
    fn failed_inverse_reports_compensation_failure() {
        let ledger = testing::faulty_ledger();
        let store = ledger.store();
        account(store, "cash", dec!(1000));
        customer(store, "C", dec!(0));
        let p = product(store, 10, dec!(5));
        let (sale, _) = draft_sale(store, Some("C"), "cash", dec!(0), &[(p.id, 1, dec!(300))]);
        let line_id = ledger.confirm_sale(sale.id).unwrap().lines[0].id;

        store.fail_inserts(Table::SettlementAllocations);
        store.fail_deletes(Table::Settlements);
        let err = ledger
            .create_settlement(&receipt("C", &[(line_id, dec!(300))]))
            .unwrap_err();
        assert_eq!(err.code(), "compensation_failed");
        assert!(err.needs_reconciliation());
        let LedgerError::CompensationFailed { cause, failures, .. } = err else {
            unreachable!()
        };
        assert_eq!(cause.code(), "store_error");
        assert_eq!(failures.len(), 1);
        assert_eq!(store.row_count(Table::Settlements), 1);
    }

    #[test]
    fn rollback_keeps_a_posting_committed_meanwhile() {
        let ledger = testing::ledger();
        let cash = ledger
            .open_account("Cash", "cash", Some("cash".into()), dec!(1000))
            .unwrap();
        let posting = |amount: Decimal, reference_id: RowId| {
            PostingRequest::new(
                AccountTarget::Id(cash.id),
                amount,
                BalanceDirection::Increase,
                TransactionType::Sale,
                reference_id,
            )
        };

        let journal = Journal::begin(ledger.store(), ledger.context(), "confirm_sale");
        AccountLedger::new(&journal, ledger.context())
            .update_account_balance(&posting(dec!(200), 1))
            .unwrap();
        ledger.update_account_balance(&posting(dec!(50), 2)).unwrap();
        journal.rollback(LedgerError::InvalidAmount(dec!(0)));

        assert_eq!(balance(&ledger, cash.id), dec!(1050));
        let rec = ledger.reconcile_account(cash.id).unwrap();
        assert_eq!(rec.derived, dec!(1050));
        assert!(rec.is_consistent(dec!(0.01)));
    }

    #[test]
    fn failed_confirmation_leaves_sale_draft() {
        let ledger = testing::faulty_ledger();
        let store = ledger.store();
        let cash = account(store, "cash", dec!(100));
        customer(store, "C", dec!(0));
        let p = product(store, 10, dec!(5));
        let (sale, _) = draft_sale(store, Some("C"), "cash", dec!(20), &[(p.id, 1, dec!(50))]);

        store.fail_inserts(Table::PartnerAccounts);
        assert!(ledger.confirm_sale(sale.id).is_err());
        assert_eq!(balance(&ledger, cash.id), dec!(100));
        assert_eq!(store.row_count(Table::AccountTransactions), 0);

        store.heal();
        let confirmed = ledger.confirm_sale(sale.id).unwrap();
        assert_eq!(confirmed.lines[0].balance, dec!(30));
        assert_eq!(balance(&ledger, cash.id), dec!(120));
    }

    #[test]
    fn top_up_is_journaled() {
        let ledger = Ledger::new(
            InMemoryStore::new(),
            LedgerConfig::default(),
            Arc::new(testing::clock()),
        );
        let c = customer(ledger.store(), "C", dec!(5));
        let log = ledger.top_up_store_credit(c.id, dec!(20), None).unwrap();
        assert_eq!(log.balance_after, dec!(25));
        assert!(matches!(
            ledger.top_up_store_credit(c.id, dec!(0), None).unwrap_err(),
            LedgerError::InvalidAmount(_)
        ));
    }
}
