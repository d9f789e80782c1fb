//! Document lifecycle manager: sequences the engines for sale and purchase
//! state transitions, corrections, and deletions.
//!
//! Each operation validates before its first write. The caller is expected
//! to run it against a [`crate::Journal`] so that a failure after the first
//! write rolls the store back.

mod purchase;
mod sale;

pub use purchase::{ItemCost, PurchaseApproval, PurchaseDeletion, PurchaseItemDeletion};
pub use sale::{
    DeliveryConfirmation, ItemAdjustment, SaleConfirmation, SaleCorrectionOutcome, SaleDeletion,
};

use erp_store::LedgerStore;

use crate::accounts::AccountLedger;
use crate::context::LedgerContext;
use crate::credit::StoreCredit;
use crate::inventory::InventoryLedger;
use crate::partners::PartnerAccounts;
use crate::settlement::SettlementEngine;

pub struct DocumentLifecycle<'a, S: ?Sized> {
    store: &'a S,
    ctx: &'a LedgerContext,
}

impl<'a, S: LedgerStore + ?Sized> DocumentLifecycle<'a, S> {
    pub fn new(store: &'a S, ctx: &'a LedgerContext) -> Self {
        Self { store, ctx }
    }

    fn inventory(&self) -> InventoryLedger<'a, S> {
        InventoryLedger::new(self.store, self.ctx)
    }

    fn accounts(&self) -> AccountLedger<'a, S> {
        AccountLedger::new(self.store, self.ctx)
    }

    fn partners(&self) -> PartnerAccounts<'a, S> {
        PartnerAccounts::new(self.store, self.ctx)
    }

    fn settlements(&self) -> SettlementEngine<'a, S> {
        SettlementEngine::new(self.store, self.ctx)
    }

    fn credit(&self) -> StoreCredit<'a, S> {
        StoreCredit::new(self.store, self.ctx)
    }
}
