//! Relational store boundary for the storefront ERP ledger.
//!
//! The ledger engines never talk to a database directly. They issue filtered
//! reads and single-row writes against named tables through the
//! [`LedgerStore`] trait, which makes no promise of cross-statement
//! atomicity. Consistency across tables is the engines' job.
//!
//! # Layers
//!
//! - [`LedgerStore`] -- four object-safe primitives over untyped [`Row`]s
//! - [`RecordStore`] -- typed helpers, blanket-implemented for every store
//! - [`InMemoryStore`] -- `BTreeMap`-per-table backend for tests and embedding
//!
//! # Design Rules
//!
//! 1. Every row carries an integer `id`; `insert` assigns one when absent.
//! 2. An explicit `id` on insert is honoured so deleted rows can be restored
//!    with their identity intact.
//! 3. `update` merges a patch and hands back the previous row.
//! 4. `delete` hands back every row it removed.
//! 5. Results are returned in ascending `id` order unless the query says
//!    otherwise.

pub mod error;
pub mod memory;
pub mod query;
pub mod records;
pub mod table;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::{InMemoryStore, Snapshot};
pub use query::{Filter, Query};
pub use records::{
    Account, AccountTransaction, Customer, CustomerBalanceLog, Delivery, DeliveryItem,
    IchibanKujiPrize, InventoryLogEntry, ItemDelta, PartnerAccount, Product, Purchase,
    PurchaseItem, Record, Sale, SaleCorrection, SaleItem, Settlement, SettlementAllocation,
    StockAdjustment,
};
pub use table::{row_id, Row, RowId, Table};
pub use traits::{LedgerStore, RecordStore};
