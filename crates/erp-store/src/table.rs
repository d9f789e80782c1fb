use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single untyped row: column name → JSON value.
pub type Row = Map<String, Value>;

/// Primary key of every row.
pub type RowId = i64;

/// Named relations the ledger reads and writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Products,
    InventoryLogs,
    StockAdjustments,
    Accounts,
    AccountTransactions,
    PartnerAccounts,
    Settlements,
    SettlementAllocations,
    Customers,
    CustomerBalanceLogs,
    Sales,
    SaleItems,
    SaleCorrections,
    Purchases,
    PurchaseItems,
    Deliveries,
    DeliveryItems,
    IchibanKujiPrizes,
}

impl Table {
    pub const ALL: [Table; 18] = [
        Table::Products,
        Table::InventoryLogs,
        Table::StockAdjustments,
        Table::Accounts,
        Table::AccountTransactions,
        Table::PartnerAccounts,
        Table::Settlements,
        Table::SettlementAllocations,
        Table::Customers,
        Table::CustomerBalanceLogs,
        Table::Sales,
        Table::SaleItems,
        Table::SaleCorrections,
        Table::Purchases,
        Table::PurchaseItems,
        Table::Deliveries,
        Table::DeliveryItems,
        Table::IchibanKujiPrizes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Products => "products",
            Self::InventoryLogs => "inventory_logs",
            Self::StockAdjustments => "stock_adjustments",
            Self::Accounts => "accounts",
            Self::AccountTransactions => "account_transactions",
            Self::PartnerAccounts => "partner_accounts",
            Self::Settlements => "settlements",
            Self::SettlementAllocations => "settlement_allocations",
            Self::Customers => "customers",
            Self::CustomerBalanceLogs => "customer_balance_logs",
            Self::Sales => "sales",
            Self::SaleItems => "sale_items",
            Self::SaleCorrections => "sale_corrections",
            Self::Purchases => "purchases",
            Self::PurchaseItems => "purchase_items",
            Self::Deliveries => "deliveries",
            Self::DeliveryItems => "delivery_items",
            Self::IchibanKujiPrizes => "ichiban_kuji_prizes",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::ALL
            .iter()
            .find(|table| table.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown table: {s}"))
    }
}

/// Read the `id` column of a row, if present and non-zero.
pub fn row_id(row: &Row) -> Option<RowId> {
    row.get("id").and_then(Value::as_i64).filter(|id| *id != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_round_trip() {
        for table in Table::ALL {
            assert_eq!(table.as_str().parse::<Table>().unwrap(), table);
        }
        assert!("ledgers".parse::<Table>().is_err());
    }

    #[test]
    fn serde_matches_as_str() {
        let json = serde_json::to_string(&Table::SettlementAllocations).unwrap();
        assert_eq!(json, "\"settlement_allocations\"");
    }

    #[test]
    fn zero_id_counts_as_absent() {
        let mut row = Row::new();
        assert_eq!(row_id(&row), None);
        row.insert("id".into(), Value::from(0));
        assert_eq!(row_id(&row), None);
        row.insert("id".into(), Value::from(42));
        assert_eq!(row_id(&row), Some(42));
    }
}
