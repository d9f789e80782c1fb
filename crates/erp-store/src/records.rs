//! Typed rows for every table the ledger touches.
//!
//! A record with `id == 0` has not been stored yet; [`crate::RecordStore::create`]
//! returns it with its assigned id.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use erp_types::{
    BalanceDirection, DeliveryStatus, DocumentKind, FulfillmentStatus, InventoryRef, LedgerSide,
    LineStatus, PartnerType, PaymentMethod, PurchaseStatus, SaleStatus, SettlementDirection,
    TransactionType,
};

use crate::error::{StoreError, StoreResult};
use crate::table::{Row, RowId, Table};

/// A typed view over one table.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: Table;

    fn id(&self) -> RowId;

    fn to_row(&self) -> StoreResult<Row> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(row)) => Ok(row),
            Ok(other) => Err(StoreError::MalformedRow {
                table: Self::TABLE,
                reason: format!("expected an object, got {other}"),
            }),
            Err(e) => Err(StoreError::MalformedRow {
                table: Self::TABLE,
                reason: e.to_string(),
            }),
        }
    }

    fn from_row(row: Row) -> StoreResult<Self> {
        serde_json::from_value(serde_json::Value::Object(row)).map_err(|e| {
            StoreError::MalformedRow {
                table: Self::TABLE,
                reason: e.to_string(),
            }
        })
    }
}

macro_rules! record {
    ($ty:ty, $table:expr) => {
        impl Record for $ty {
            const TABLE: Table = $table;

            fn id(&self) -> RowId {
                self.id
            }
        }
    };
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(default)]
    pub id: RowId,
    pub sku: String,
    pub name: String,
    /// Current on-hand quantity.
    pub stock: i64,
    /// Weighted-average unit cost.
    pub avg_cost: Decimal,
    #[serde(default)]
    pub allow_negative: bool,
}

/// Append-only quantity movement. Reversal inserts a negated entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InventoryLogEntry {
    #[serde(default)]
    pub id: RowId,
    pub product_id: RowId,
    pub ref_type: InventoryRef,
    pub ref_id: RowId,
    pub qty_change: i64,
    pub unit_cost: Option<Decimal>,
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Manual stock override. Resets the log-derived baseline for its product.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StockAdjustment {
    #[serde(default)]
    pub id: RowId,
    pub product_id: RowId,
    pub previous_stock: i64,
    pub new_stock: i64,
    pub reason: String,
    /// Highest inventory log id at the time of the adjustment.
    pub log_watermark: RowId,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub id: RowId,
    pub name: String,
    /// cash, bank, pettycash, ...
    pub account_type: String,
    pub payment_method_code: Option<String>,
    pub balance: Decimal,
    pub opening_balance: Decimal,
    pub is_active: bool,
}

/// Append-only audit row of one balance change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountTransaction {
    #[serde(default)]
    pub id: RowId,
    pub account_id: RowId,
    pub transaction_type: TransactionType,
    pub direction: BalanceDirection,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub ref_type: String,
    pub ref_id: RowId,
    pub ref_no: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AccountTransaction {
    /// Effect of this row on its account's balance.
    pub fn signed_amount(&self) -> Decimal {
        self.balance_after - self.balance_before
    }
}

/// Receivable/payable line for one document item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartnerAccount {
    #[serde(default)]
    pub id: RowId,
    pub partner_type: PartnerType,
    pub partner_code: String,
    pub direction: LedgerSide,
    pub ref_type: DocumentKind,
    pub ref_id: RowId,
    pub sale_item_id: Option<RowId>,
    pub purchase_item_id: Option<RowId>,
    pub amount: Decimal,
    pub received_paid: Decimal,
    /// Always `amount - received_paid`.
    pub balance: Decimal,
    pub due_date: NaiveDate,
    pub status: LineStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    #[serde(default)]
    pub id: RowId,
    pub partner_type: PartnerType,
    pub partner_code: String,
    pub direction: SettlementDirection,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub account_id: Option<RowId>,
    pub trans_date: NaiveDate,
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SettlementAllocation {
    #[serde(default)]
    pub id: RowId,
    pub settlement_id: RowId,
    pub partner_account_id: RowId,
    pub amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    #[serde(default)]
    pub id: RowId,
    pub code: String,
    pub name: String,
    pub store_credit: Decimal,
}

/// Audit row for a store-credit change. Negative amounts are consumption.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomerBalanceLog {
    #[serde(default)]
    pub id: RowId,
    pub customer_id: RowId,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub ref_type: String,
    pub ref_id: Option<RowId>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    #[serde(default)]
    pub id: RowId,
    pub sale_no: String,
    pub customer_code: Option<String>,
    pub sale_date: NaiveDate,
    pub status: SaleStatus,
    pub fulfillment_status: FulfillmentStatus,
    pub total: Decimal,
    pub paid_amount: Decimal,
    pub payment_method: PaymentMethod,
    pub account_id: Option<RowId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaleItem {
    #[serde(default)]
    pub id: RowId,
    pub sale_id: RowId,
    pub product_id: RowId,
    pub quantity: i64,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
    /// Ichiban-kuji prize drawn by this line, if any.
    pub prize_id: Option<RowId>,
}

/// One item's before/after state inside a [`SaleCorrection`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemDelta {
    pub sale_item_id: RowId,
    pub old_quantity: i64,
    pub new_quantity: i64,
    pub old_unit_price: Decimal,
    pub new_unit_price: Decimal,
    pub subtotal_delta: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaleCorrection {
    #[serde(default)]
    pub id: RowId,
    pub sale_id: RowId,
    pub original_total: Decimal,
    pub corrected_total: Decimal,
    pub adjustment_amount: Decimal,
    pub items: Vec<ItemDelta>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    #[serde(default)]
    pub id: RowId,
    pub purchase_no: String,
    pub vendor_code: String,
    pub status: PurchaseStatus,
    pub total: Decimal,
    pub paid_amount: Decimal,
    pub payment_method: PaymentMethod,
    pub account_id: Option<RowId>,
    pub approved_on: Option<NaiveDate>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PurchaseItem {
    #[serde(default)]
    pub id: RowId,
    pub purchase_id: RowId,
    pub product_id: RowId,
    pub quantity: i64,
    pub unit_cost: Decimal,
    pub subtotal: Decimal,
    #[serde(default)]
    pub received_quantity: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    #[serde(default)]
    pub id: RowId,
    pub sale_id: RowId,
    pub delivery_no: String,
    pub status: DeliveryStatus,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeliveryItem {
    #[serde(default)]
    pub id: RowId,
    pub delivery_id: RowId,
    pub sale_item_id: RowId,
    pub product_id: RowId,
    pub quantity: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IchibanKujiPrize {
    #[serde(default)]
    pub id: RowId,
    pub name: String,
    pub remaining: i64,
}

record!(Product, Table::Products);
record!(InventoryLogEntry, Table::InventoryLogs);
record!(StockAdjustment, Table::StockAdjustments);
record!(Account, Table::Accounts);
record!(AccountTransaction, Table::AccountTransactions);
record!(PartnerAccount, Table::PartnerAccounts);
record!(Settlement, Table::Settlements);
record!(SettlementAllocation, Table::SettlementAllocations);
record!(Customer, Table::Customers);
record!(CustomerBalanceLog, Table::CustomerBalanceLogs);
record!(Sale, Table::Sales);
record!(SaleItem, Table::SaleItems);
record!(SaleCorrection, Table::SaleCorrections);
record!(Purchase, Table::Purchases);
record!(PurchaseItem, Table::PurchaseItems);
record!(Delivery, Table::Deliveries);
record!(DeliveryItem, Table::DeliveryItems);
record!(IchibanKujiPrize, Table::IchibanKujiPrizes);
