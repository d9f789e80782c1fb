//! Account ledger: balance-bearing accounts with an append-only transaction
//! log, idempotent posting, and reversal for delete flows.

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use erp_store::{Account, AccountTransaction, LedgerStore, Query, RecordStore, RowId};
use erp_types::{BalanceDirection, PaymentMethod, TransactionType};

use crate::context::LedgerContext;
use crate::error::{LedgerError, LedgerResult, Warning};
use crate::locks::AggregateKey;

/// Which account a posting lands on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccountTarget {
    Id(RowId),
    /// Resolve the active account mapped to this method.
    Method(PaymentMethod),
}

impl AccountTarget {
    /// Prefer an explicit account, fall back to the method mapping.
    pub fn resolve(account_id: Option<RowId>, method: &PaymentMethod) -> Self {
        match account_id {
            Some(id) => Self::Id(id),
            None => Self::Method(method.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PostingRequest {
    pub target: AccountTarget,
    pub amount: Decimal,
    pub direction: BalanceDirection,
    pub transaction_type: TransactionType,
    pub reference_id: RowId,
    pub reference_no: Option<String>,
    pub note: Option<String>,
}

impl PostingRequest {
    pub fn new(
        target: AccountTarget,
        amount: Decimal,
        direction: BalanceDirection,
        transaction_type: TransactionType,
        reference_id: RowId,
    ) -> Self {
        Self {
            target,
            amount,
            direction,
            transaction_type,
            reference_id,
            reference_no: None,
            note: None,
        }
    }

    pub fn reference_no(mut self, no: impl Into<String>) -> Self {
        self.reference_no = Some(no.into());
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Result of a posting. A posting that moved nothing still succeeds and
/// explains itself through `warnings`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PostingOutcome {
    pub account_id: Option<RowId>,
    pub transaction_id: Option<RowId>,
    pub balance_before: Option<Decimal>,
    pub balance_after: Option<Decimal>,
    pub warnings: Vec<Warning>,
}

impl PostingOutcome {
    fn skipped(account_id: Option<RowId>, warning: Warning) -> Self {
        Self {
            account_id,
            warnings: vec![warning],
            ..Self::default()
        }
    }

    /// Whether the balance moved.
    pub fn posted(&self) -> bool {
        self.balance_after.is_some()
    }
}

/// Recorded balance against the balance implied by the transaction log.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AccountReconciliation {
    pub account_id: RowId,
    pub recorded: Decimal,
    pub derived: Decimal,
}

impl AccountReconciliation {
    pub fn difference(&self) -> Decimal {
        self.recorded - self.derived
    }

    pub fn is_consistent(&self, epsilon: Decimal) -> bool {
        self.difference().abs() <= epsilon
    }
}

pub struct AccountLedger<'a, S: ?Sized> {
    store: &'a S,
    ctx: &'a LedgerContext,
}

impl<'a, S: LedgerStore + ?Sized> AccountLedger<'a, S> {
    pub fn new(store: &'a S, ctx: &'a LedgerContext) -> Self {
        Self { store, ctx }
    }

    pub fn open_account(
        &self,
        name: impl Into<String>,
        account_type: impl Into<String>,
        payment_method_code: Option<String>,
        opening_balance: Decimal,
    ) -> LedgerResult<Account> {
        let account = self.store.create(&Account {
            id: 0,
            name: name.into(),
            account_type: account_type.into(),
            payment_method_code,
            balance: opening_balance,
            opening_balance,
            is_active: true,
        })?;
        debug!(account_id = account.id, %opening_balance, "account opened");
        Ok(account)
    }

    /// The active account backing `method`, if any.
    pub fn account_for_method(&self, method: &PaymentMethod) -> LedgerResult<Option<Account>> {
        let Some(code) = method.account_code() else {
            return Ok(None);
        };
        Ok(self
            .store
            .fetch::<Account>(
                &Query::all()
                    .eq("payment_method_code", code)
                    .eq("is_active", true)
                    .limit(1),
            )?
            .into_iter()
            .next())
    }

    /// Move an account balance and append its audit row, at most once per
    /// `(ref_type, reference_id, transaction_type)`.
    pub fn update_account_balance(&self, request: &PostingRequest) -> LedgerResult<PostingOutcome> {
        if request.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(request.amount));
        }
        let account_id = match &request.target {
            AccountTarget::Id(id) => *id,
            AccountTarget::Method(PaymentMethod::Pending) => {
                debug!(reference_id = request.reference_id, "pending payment, nothing posted");
                return Ok(PostingOutcome::skipped(None, Warning::PendingPayment));
            }
            AccountTarget::Method(method) => match self.account_for_method(method)? {
                Some(account) => account.id,
                None => {
                    warn!(%method, reference_id = request.reference_id, "no account for payment method");
                    return Ok(PostingOutcome::skipped(
                        None,
                        Warning::NoBackingAccount {
                            method: method.clone(),
                        },
                    ));
                }
            },
        };

        let _guard = self
            .ctx
            .locks
            .acquire_one(AggregateKey::Account(account_id))?;
        let account: Account = self.store.get(account_id)?;
        if !account.is_active {
            return Err(LedgerError::AccountInactive(account_id));
        }

        let ref_type = request.transaction_type.ref_type();
        let key = Query::all()
            .eq("ref_type", ref_type)
            .eq("ref_id", request.reference_id)
            .eq("transaction_type", request.transaction_type.as_str());
        if self.store.exists::<AccountTransaction>(&key)? {
            warn!(
                account_id,
                ref_type,
                ref_id = request.reference_id,
                "already posted"
            );
            return Ok(PostingOutcome::skipped(
                Some(account_id),
                Warning::AlreadyPosted {
                    ref_type: ref_type.to_string(),
                    ref_id: request.reference_id,
                    transaction_type: request.transaction_type.as_str().to_string(),
                },
            ));
        }

        let before = account.balance;
        let after = match request.direction {
            BalanceDirection::Increase => before + request.amount,
            BalanceDirection::Decrease => before - request.amount,
        };
        self.store
            .patch::<Account>(account_id, &[("balance", json!(after))])?;

        let mut outcome = PostingOutcome {
            account_id: Some(account_id),
            transaction_id: None,
            balance_before: Some(before),
            balance_after: Some(after),
            warnings: Vec::new(),
        };
        let audit = AccountTransaction {
            id: 0,
            account_id,
            transaction_type: request.transaction_type,
            direction: request.direction,
            amount: request.amount,
            balance_before: before,
            balance_after: after,
            ref_type: ref_type.to_string(),
            ref_id: request.reference_id,
            ref_no: request.reference_no.clone(),
            note: request.note.clone(),
            created_at: self.ctx.now(),
        };
        match self.store.create(&audit) {
            Ok(row) => outcome.transaction_id = Some(row.id),
            Err(e) => {
                warn!(account_id, error = %e, "balance updated but audit row not written");
                outcome.warnings.push(Warning::AuditTrailMissing {
                    account_id,
                    reason: e.to_string(),
                });
            }
        }
        debug!(
            account_id,
            transaction_type = %request.transaction_type,
            %before,
            %after,
            "account posted"
        );
        Ok(outcome)
    }

    pub fn transactions(
        &self,
        transaction_type: TransactionType,
        ref_ids: &[RowId],
    ) -> LedgerResult<Vec<AccountTransaction>> {
        if ref_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.store.fetch(
            &Query::all()
                .eq("ref_type", transaction_type.ref_type())
                .eq("transaction_type", transaction_type.as_str())
                .is_in("ref_id", ref_ids.iter().copied()),
        )?)
    }

    /// Undo each transaction's effect on its account and delete the row.
    ///
    /// Returns the ids of the removed rows.
    pub fn reverse_transactions(&self, rows: &[AccountTransaction]) -> LedgerResult<Vec<RowId>> {
        let mut reversed = Vec::with_capacity(rows.len());
        for tx in rows {
            let _guard = self
                .ctx
                .locks
                .acquire_one(AggregateKey::Account(tx.account_id))?;
            let account: Account = self.store.get(tx.account_id)?;
            let balance = account.balance - tx.signed_amount();
            self.store
                .patch::<Account>(account.id, &[("balance", json!(balance))])?;
            self.store.remove::<AccountTransaction>(tx.id)?;
            debug!(
                account_id = account.id,
                transaction_id = tx.id,
                balance = %balance,
                "transaction reversed"
            );
            reversed.push(tx.id);
        }
        Ok(reversed)
    }

    /// Compare the recorded balance with opening balance plus the log.
    pub fn reconcile(&self, account_id: RowId) -> LedgerResult<AccountReconciliation> {
        let account: Account = self.store.get(account_id)?;
        let moved: Decimal = self
            .store
            .fetch::<AccountTransaction>(&Query::all().eq("account_id", account_id))?
            .iter()
            .map(AccountTransaction::signed_amount)
            .sum();
        Ok(AccountReconciliation {
            account_id,
            recorded: account.balance,
            derived: account.opening_balance + moved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{account, context, FaultyStore};
    use erp_store::{InMemoryStore, Table};
    use rust_decimal_macros::dec;

    fn sale_posting(target: AccountTarget, amount: Decimal, reference_id: RowId) -> PostingRequest {
        PostingRequest::new(
            target,
            amount,
            BalanceDirection::Increase,
            TransactionType::Sale,
            reference_id,
        )
    }

    #[test]
    fn posting_is_idempotent() {
        let store = InMemoryStore::new();
        let ctx = context();
        let cash = account(&store, "cash", dec!(1000));
        let ledger = AccountLedger::new(&store, &ctx);
        let request = sale_posting(AccountTarget::Id(cash.id), dec!(200), 1);

        let first = ledger.update_account_balance(&request).unwrap();
        assert!(first.posted());
        assert_eq!(first.balance_before, Some(dec!(1000)));
        assert_eq!(first.balance_after, Some(dec!(1200)));

        let second = ledger.update_account_balance(&request).unwrap();
        assert!(!second.posted());
        assert!(matches!(second.warnings[0], Warning::AlreadyPosted { ref_id: 1, .. }));
        assert_eq!(store.get::<Account>(cash.id).unwrap().balance, dec!(1200));

        let rows = ledger.transactions(TransactionType::Sale, &[1]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].balance_before, dec!(1000));
        assert_eq!(rows[0].balance_after, dec!(1200));
    }

    #[test]
    fn non_positive_amount_is_rejected() {
        let store = InMemoryStore::new();
        let ctx = context();
        let cash = account(&store, "cash", dec!(0));
        let ledger = AccountLedger::new(&store, &ctx);
        for amount in [dec!(0), dec!(-1)] {
            let err = ledger
                .update_account_balance(&sale_posting(AccountTarget::Id(cash.id), amount, 1))
                .unwrap_err();
            assert_eq!(err.code(), "invalid_amount");
        }
    }

    #[test]
    fn pending_and_unmapped_methods_warn() {
        let store = InMemoryStore::new();
        let ctx = context();
        let ledger = AccountLedger::new(&store, &ctx);

        let pending = ledger
            .update_account_balance(&sale_posting(
                AccountTarget::Method(PaymentMethod::Pending),
                dec!(10),
                1,
            ))
            .unwrap();
        assert_eq!(pending.warnings, vec![Warning::PendingPayment]);

        let card = ledger
            .update_account_balance(&sale_posting(
                AccountTarget::Method(PaymentMethod::Card),
                dec!(10),
                1,
            ))
            .unwrap();
        assert!(!card.posted());
        assert!(matches!(card.warnings[0], Warning::NoBackingAccount { .. }));
    }

    #[test]
    fn method_resolves_active_account_only() {
        let store = InMemoryStore::new();
        let ctx = context();
        let retired = account(&store, "transfer", dec!(0));
        store
            .patch::<Account>(retired.id, &[("is_active", json!(false))])
            .unwrap();
        let live = account(&store, "transfer", dec!(50));
        let ledger = AccountLedger::new(&store, &ctx);

        let outcome = ledger
            .update_account_balance(&sale_posting(
                AccountTarget::Method(PaymentMethod::from("bank")),
                dec!(25),
                9,
            ))
            .unwrap();
        assert_eq!(outcome.account_id, Some(live.id));
        assert_eq!(store.get::<Account>(live.id).unwrap().balance, dec!(75));
    }

    #[test]
    fn inactive_account_by_id_fails() {
        let store = InMemoryStore::new();
        let ctx = context();
        let cash = account(&store, "cash", dec!(0));
        store
            .patch::<Account>(cash.id, &[("is_active", json!(false))])
            .unwrap();
        let ledger = AccountLedger::new(&store, &ctx);
        let err = ledger
            .update_account_balance(&sale_posting(AccountTarget::Id(cash.id), dec!(1), 1))
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountInactive(id) if id == cash.id));
    }

    #[test]
    fn unknown_account_is_not_found() {
        let store = InMemoryStore::new();
        let ctx = context();
        let ledger = AccountLedger::new(&store, &ctx);
        let err = ledger
            .update_account_balance(&sale_posting(AccountTarget::Id(3), dec!(1), 1))
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn audit_failure_keeps_balance_and_warns() {
        let store = FaultyStore::new();
        let ctx = context();
        let cash = account(&store, "cash", dec!(100));
        store.fail_inserts(Table::AccountTransactions);
        let ledger = AccountLedger::new(&store, &ctx);

        let outcome = ledger
            .update_account_balance(&sale_posting(AccountTarget::Id(cash.id), dec!(5), 1))
            .unwrap();
        assert!(outcome.posted());
        assert!(outcome.transaction_id.is_none());
        assert!(matches!(outcome.warnings[0], Warning::AuditTrailMissing { .. }));
        assert_eq!(store.get::<Account>(cash.id).unwrap().balance, dec!(105));
    }

    #[test]
    fn reversal_restores_balance_and_reconciles() {
        let store = InMemoryStore::new();
        let ctx = context();
        let ledger = AccountLedger::new(&store, &ctx);
        let bank = ledger
            .open_account("Bank", "bank", Some("transfer".into()), dec!(500))
            .unwrap();

        ledger
            .update_account_balance(&sale_posting(AccountTarget::Id(bank.id), dec!(80), 1))
            .unwrap();
        ledger
            .update_account_balance(&PostingRequest::new(
                AccountTarget::Id(bank.id),
                dec!(30),
                BalanceDirection::Decrease,
                TransactionType::Expense,
                2,
            ))
            .unwrap();
        let rec = ledger.reconcile(bank.id).unwrap();
        assert_eq!(rec.recorded, dec!(550));
        assert!(rec.is_consistent(ctx.epsilon()));

        let sales = ledger.transactions(TransactionType::Sale, &[1]).unwrap();
        let removed = ledger.reverse_transactions(&sales).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(store.get::<Account>(bank.id).unwrap().balance, dec!(470));
        assert!(ledger.reconcile(bank.id).unwrap().is_consistent(ctx.epsilon()));
    }

    #[test]
    fn settlement_types_share_settlement_ref() {
        let store = InMemoryStore::new();
        let ctx = context();
        let cash = account(&store, "cash", dec!(0));
        let ledger = AccountLedger::new(&store, &ctx);
        ledger
            .update_account_balance(&PostingRequest::new(
                AccountTarget::Id(cash.id),
                dec!(10),
                BalanceDirection::Increase,
                TransactionType::CustomerPayment,
                4,
            ))
            .unwrap();
        let rows = ledger
            .transactions(TransactionType::CustomerPayment, &[4])
            .unwrap();
        assert_eq!(rows[0].ref_type, "settlement");
    }
}
