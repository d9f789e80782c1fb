//! Foundation types for the storefront ERP ledger.
//!
//! Every other ERP crate depends on `erp-types`. It carries no I/O: only the
//! vocabulary shared by the store, the engines, and the HTTP surface.
//!
//! # Key Types
//!
//! - [`round_cents`] and [`MONEY_EPSILON`] -- two-decimal money rules on `rust_decimal`
//! - [`InventoryRef`] -- reference kind of an inventory movement
//! - [`TransactionType`] -- account-ledger posting kind and its idempotency ref type
//! - [`PaymentMethod`] -- explicit payment method → account resolution mapping
//! - [`BusinessClock`] -- injected clock with a fixed business-day offset

pub mod clock;
pub mod error;
pub mod kinds;
pub mod money;

pub use clock::{BusinessClock, FixedClock, SystemClock};
pub use error::TypeError;
pub use kinds::{
    BalanceDirection, DeliveryStatus, DocumentKind, FulfillmentStatus, InventoryRef, LedgerSide,
    LineStatus, PartnerType, PaymentMethod, PurchaseStatus, SaleStatus, SettlementDirection,
    TransactionType,
};
pub use money::{round_cents, MONEY_EPSILON};
