//! Customer store credit: a balance on the customer row with its own
//! signed audit trail, kept apart from the account ledger.

use rust_decimal::Decimal;
use serde_json::json;
use tracing::debug;

use erp_store::{Customer, CustomerBalanceLog, LedgerStore, Query, RecordStore, RowId};

use crate::context::LedgerContext;
use crate::error::{LedgerError, LedgerResult};
use crate::locks::AggregateKey;

pub struct StoreCredit<'a, S: ?Sized> {
    store: &'a S,
    ctx: &'a LedgerContext,
}

impl<'a, S: LedgerStore + ?Sized> StoreCredit<'a, S> {
    pub fn new(store: &'a S, ctx: &'a LedgerContext) -> Self {
        Self { store, ctx }
    }

    pub fn customer_by_code(&self, code: &str) -> LedgerResult<Option<Customer>> {
        Ok(self
            .store
            .fetch::<Customer>(&Query::all().eq("code", code).limit(1))?
            .into_iter()
            .next())
    }

    /// Fail unless the customer can spend `amount`.
    pub fn check_available(&self, code: &str, amount: Decimal) -> LedgerResult<Customer> {
        let customer = self.customer_by_code(code)?;
        let available = customer.as_ref().map_or(Decimal::ZERO, |c| c.store_credit);
        match customer {
            Some(customer) if available >= amount => Ok(customer),
            _ => Err(LedgerError::InsufficientStoreCredit {
                customer: code.to_string(),
                requested: amount,
                available,
            }),
        }
    }

    /// Spend credit and log a negative entry against `(ref_type, ref_id)`.
    pub fn consume(
        &self,
        code: &str,
        amount: Decimal,
        ref_type: &str,
        ref_id: RowId,
    ) -> LedgerResult<CustomerBalanceLog> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let customer = self.check_available(code, amount)?;
        let _guard = self
            .ctx
            .locks
            .acquire_one(AggregateKey::Customer(customer.id))?;
        let current: Customer = self.store.get(customer.id)?;
        if current.store_credit < amount {
            return Err(LedgerError::InsufficientStoreCredit {
                customer: code.to_string(),
                requested: amount,
                available: current.store_credit,
            });
        }
        self.post(&current, -amount, ref_type, Some(ref_id), None)
    }

    /// Add credit, e.g. a refund or a counter top-up.
    pub fn top_up(
        &self,
        customer_id: RowId,
        amount: Decimal,
        ref_type: &str,
        ref_id: Option<RowId>,
        note: Option<String>,
    ) -> LedgerResult<CustomerBalanceLog> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let _guard = self
            .ctx
            .locks
            .acquire_one(AggregateKey::Customer(customer_id))?;
        let customer: Customer = self.store.get(customer_id)?;
        self.post(&customer, amount, ref_type, ref_id, note)
    }

    fn post(
        &self,
        customer: &Customer,
        amount: Decimal,
        ref_type: &str,
        ref_id: Option<RowId>,
        note: Option<String>,
    ) -> LedgerResult<CustomerBalanceLog> {
        let balance = customer.store_credit + amount;
        self.store
            .patch::<Customer>(customer.id, &[("store_credit", json!(balance))])?;
        let log = self.store.create(&CustomerBalanceLog {
            id: 0,
            customer_id: customer.id,
            amount,
            balance_after: balance,
            ref_type: ref_type.to_string(),
            ref_id,
            note,
            created_at: self.ctx.now(),
        })?;
        debug!(customer_id = customer.id, %amount, %balance, ref_type, "store credit moved");
        Ok(log)
    }

    pub fn logs(&self, ref_type: &str, ref_ids: &[RowId]) -> LedgerResult<Vec<CustomerBalanceLog>> {
        if ref_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.store.fetch(
            &Query::all()
                .eq("ref_type", ref_type)
                .is_in("ref_id", ref_ids.iter().copied()),
        )?)
    }

    /// Take back the effect of each log entry and delete it.
    ///
    /// Returns the net amount given back to customers.
    pub fn revert(&self, logs: &[CustomerBalanceLog]) -> LedgerResult<Decimal> {
        let mut restored = Decimal::ZERO;
        for log in logs {
            let _guard = self
                .ctx
                .locks
                .acquire_one(AggregateKey::Customer(log.customer_id))?;
            let customer: Customer = self.store.get(log.customer_id)?;
            let balance = customer.store_credit - log.amount;
            self.store
                .patch::<Customer>(customer.id, &[("store_credit", json!(balance))])?;
            self.store.remove::<CustomerBalanceLog>(log.id)?;
            restored -= log.amount;
            debug!(customer_id = customer.id, log_id = log.id, %balance, "store credit reverted");
        }
        Ok(restored)
    }
}
