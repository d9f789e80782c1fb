//! Enumerations shared across the ledger: reference kinds, directions,
//! lifecycle states, and payment methods.
//!
//! Each unit enum round-trips through its snake_case store representation
//! via `as_str` / `FromStr`, matching its serde form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

macro_rules! string_kind {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// Store representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = TypeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(TypeError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_kind! {
    /// Reference kind of an inventory movement.
    InventoryRef, "inventory ref" {
        Purchase => "purchase",
        PurchaseDelete => "purchase_delete",
        PurchaseItemDelete => "purchase_item_delete",
        Delivery => "delivery",
        DeliveryDelete => "delivery_delete",
        SaleDelete => "sale_delete",
        SaleCorrection => "sale_correction",
        Adjustment => "adjustment",
        Return => "return",
    }
}

string_kind! {
    /// Kind of an account-ledger posting.
    TransactionType, "transaction type" {
        Sale => "sale",
        Purchase => "purchase",
        PurchasePayment => "purchase_payment",
        CustomerPayment => "customer_payment",
        SettlementRefund => "settlement_refund",
        SaleRefund => "sale_refund",
        PurchaseRefund => "purchase_refund",
        Expense => "expense",
        Adjustment => "adjustment",
    }
}

impl TransactionType {
    /// The `ref_type` recorded on the audit row. Together with the reference
    /// id and the transaction type it forms the idempotency key.
    pub fn ref_type(&self) -> &'static str {
        match self {
            Self::PurchasePayment | Self::CustomerPayment => "settlement",
            Self::SaleRefund => "sale_correction",
            Self::PurchaseRefund => "purchase_item_delete",
            other => other.as_str(),
        }
    }
}

string_kind! {
    /// Whether a posting adds to or subtracts from an account balance.
    BalanceDirection, "balance direction" {
        Increase => "increase",
        Decrease => "decrease",
    }
}

impl BalanceDirection {
    pub fn reversed(&self) -> Self {
        match self {
            Self::Increase => Self::Decrease,
            Self::Decrease => Self::Increase,
        }
    }
}

string_kind! {
    PartnerType, "partner type" {
        Customer => "customer",
        Vendor => "vendor",
    }
}

string_kind! {
    /// Receivable or payable side of a partner-account line.
    LedgerSide, "ledger side" {
        Ar => "AR",
        Ap => "AP",
    }
}

string_kind! {
    SettlementDirection, "settlement direction" {
        Receipt => "receipt",
        Payment => "payment",
    }
}

impl SettlementDirection {
    /// Receipts settle receivables, payments settle payables.
    pub fn expected_side(&self) -> LedgerSide {
        match self {
            Self::Receipt => LedgerSide::Ar,
            Self::Payment => LedgerSide::Ap,
        }
    }

    /// Effect of the settlement on the receiving/paying account.
    pub fn balance_direction(&self) -> BalanceDirection {
        match self {
            Self::Receipt => BalanceDirection::Increase,
            Self::Payment => BalanceDirection::Decrease,
        }
    }

    pub fn transaction_type(&self) -> TransactionType {
        match self {
            Self::Receipt => TransactionType::CustomerPayment,
            Self::Payment => TransactionType::PurchasePayment,
        }
    }
}

string_kind! {
    /// Source document of a partner-account line.
    DocumentKind, "document kind" {
        Sale => "sale",
        Purchase => "purchase",
    }
}

string_kind! {
    LineStatus, "line status" {
        Unpaid => "unpaid",
        Partial => "partial",
        Paid => "paid",
    }
}

string_kind! {
    SaleStatus, "sale status" {
        Draft => "draft",
        Confirmed => "confirmed",
    }
}

string_kind! {
    PurchaseStatus, "purchase status" {
        Pending => "pending",
        Approved => "approved",
    }
}

string_kind! {
    FulfillmentStatus, "fulfillment status" {
        Unfulfilled => "none",
        Partial => "partial",
        Completed => "completed",
    }
}

string_kind! {
    DeliveryStatus, "delivery status" {
        Pending => "pending",
        Confirmed => "confirmed",
    }
}

/// How a payment was made.
///
/// Resolution to a backing account goes through [`PaymentMethod::account_code`]
/// rather than string matching at each call site. Unknown method strings are
/// kept as [`PaymentMethod::Other`] and resolve by their own name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentMethod {
    Cash,
    Card,
    Transfer,
    PettyCash,
    StoreCredit,
    /// Not yet paid; never touches a real account.
    Pending,
    Other(String),
}

impl PaymentMethod {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Cash => "cash",
            Self::Card => "card",
            Self::Transfer => "transfer",
            Self::PettyCash => "pettycash",
            Self::StoreCredit => "store_credit",
            Self::Pending => "pending",
            Self::Other(name) => name,
        }
    }

    /// The `payment_method_code` of the account backing this method, or
    /// `None` when the method never moves an account balance.
    pub fn account_code(&self) -> Option<&str> {
        match self {
            Self::Pending | Self::StoreCredit => None,
            other => Some(other.as_str()),
        }
    }
}

impl From<String> for PaymentMethod {
    fn from(value: String) -> Self {
        match value.as_str() {
            "cash" => Self::Cash,
            "card" => Self::Card,
            "transfer" | "bank" => Self::Transfer,
            "pettycash" | "petty_cash" => Self::PettyCash,
            "store_credit" => Self::StoreCredit,
            "pending" => Self::Pending,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for PaymentMethod {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<PaymentMethod> for String {
    fn from(value: PaymentMethod) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
