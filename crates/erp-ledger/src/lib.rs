//! Ledger consistency engine for the storefront ERP.
//!
//! Keeps stock, average cost, account balances, AR/AP lines, and
//! settlements mutually consistent across confirmation, correction, and
//! deletion of sales and purchases. It provides:
//! - [`InventoryLedger`]: movement log, stock, weighted-average cost
//! - [`AccountLedger`]: idempotent postings with an audit trail
//! - [`PartnerAccounts`]: per-item AR/AP lines and status derivation
//! - [`SettlementEngine`]: receipts/payments and their cascade reversal
//! - [`DocumentLifecycle`]: sale and purchase state transitions
//! - [`Journal`]: compensation log that undoes partial failures
//! - [`Auditor`]: read-only invariant sweep
//!
//! [`Ledger`] ties them together and runs every write operation inside a
//! journal.

pub mod accounts;
pub mod audit;
pub mod config;
pub mod context;
pub mod credit;
pub mod error;
pub mod inventory;
pub mod journal;
pub mod ledger;
pub mod lifecycle;
pub mod locks;
pub mod partners;
pub mod settlement;

#[cfg(test)]
pub(crate) mod testing;

pub use accounts::{
    AccountLedger, AccountReconciliation, AccountTarget, PostingOutcome, PostingRequest,
};
pub use audit::{AuditReport, Auditor, Violation, ViolationKind};
pub use config::LedgerConfig;
pub use context::LedgerContext;
pub use credit::StoreCredit;
pub use error::{LedgerError, LedgerResult, Warning};
pub use inventory::{InventoryLedger, Movement};
pub use journal::Journal;
pub use ledger::Ledger;
pub use lifecycle::{
    DeliveryConfirmation, DocumentLifecycle, ItemAdjustment, ItemCost, PurchaseApproval,
    PurchaseDeletion, PurchaseItemDeletion, SaleConfirmation, SaleCorrectionOutcome, SaleDeletion,
};
pub use locks::{AggregateGuard, AggregateKey, AggregateLocks};
pub use partners::{derive_status, redistribute_paid, LineDraft, PartnerAccounts};
pub use settlement::{
    AllocationRequest, SettlementEngine, SettlementOutcome, SettlementRequest, SettlementReversal,
};
