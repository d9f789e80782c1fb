use std::fmt;

use rust_decimal::Decimal;
use serde::Serialize;

use erp_store::{RowId, StoreError};
use erp_types::{LedgerSide, PaymentMethod};

/// Errors produced by ledger operations.
///
/// Validation failures are raised before any write. Everything else may be
/// raised mid-sequence, in which case the operation's journal has already
/// been rolled back by the time the caller sees it.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i64),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("account {0} is inactive")]
    AccountInactive(RowId),

    #[error("partner account {partner_account_id} is {actual}, expected {expected}")]
    WrongDirection {
        partner_account_id: RowId,
        expected: LedgerSide,
        actual: LedgerSide,
    },

    #[error("allocation of {requested} exceeds balance {available} on partner account {partner_account_id}")]
    OverAllocation {
        partner_account_id: RowId,
        requested: Decimal,
        available: Decimal,
    },

    #[error("allocations total {allocated} but settlement amount is {amount}")]
    AllocationMismatch { amount: Decimal, allocated: Decimal },

    #[error("product {product_id} has {available} on hand, {requested} requested")]
    InsufficientStock {
        product_id: RowId,
        requested: i64,
        available: i64,
    },

    #[error("prize {prize_id} has {remaining} remaining, {requested} requested")]
    InsufficientPrizeStock {
        prize_id: RowId,
        requested: i64,
        remaining: i64,
    },

    #[error("customer {customer} has {available} store credit, {requested} requested")]
    InsufficientStoreCredit {
        customer: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("{ref_type} {ref_id} was already processed")]
    AlreadyProcessed { ref_type: String, ref_id: RowId },

    #[error("{entity} {id} cannot be processed: {reason}")]
    InvalidState {
        entity: &'static str,
        id: RowId,
        reason: String,
    },

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("{operation} failed ({cause}) and {} compensation step(s) also failed", .failures.len())]
    CompensationFailed {
        operation: String,
        cause: Box<LedgerError>,
        failures: Vec<String>,
    },
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(entity: &'static str, id: RowId, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            entity,
            id,
            reason: reason.into(),
        }
    }

    /// Stable code for the calling layer to map onto its own conventions.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount(_) => "invalid_amount",
            Self::InvalidQuantity(_) => "invalid_quantity",
            Self::NotFound { .. } => "not_found",
            Self::AccountInactive(_) => "account_inactive",
            Self::WrongDirection { .. } => "wrong_direction",
            Self::OverAllocation { .. } => "over_allocation",
            Self::AllocationMismatch { .. } => "allocation_mismatch",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::InsufficientPrizeStock { .. } => "insufficient_prize_stock",
            Self::InsufficientStoreCredit { .. } => "insufficient_store_credit",
            Self::AlreadyProcessed { .. } => "already_processed",
            Self::InvalidState { .. } => "invalid_state",
            Self::Store(_) => "store_error",
            Self::CompensationFailed { .. } => "compensation_failed",
        }
    }

    /// `true` when the store may be left inconsistent and a human must
    /// reconcile it.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, Self::CompensationFailed { .. })
    }
}

impl From<StoreError> for LedgerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { table, id } => Self::NotFound {
                entity: table.as_str(),
                id: id.to_string(),
            },
            other => Self::Store(other),
        }
    }
}

/// Result alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Advisory attached to a successful outcome. Never a failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// Payment method `pending` never touches an account.
    PendingPayment,
    /// No active account is mapped to this payment method.
    NoBackingAccount { method: PaymentMethod },
    /// The posting's idempotency key already exists.
    AlreadyPosted {
        ref_type: String,
        ref_id: RowId,
        transaction_type: String,
    },
    /// The balance moved but the audit row could not be written.
    AuditTrailMissing { account_id: RowId, reason: String },
    /// A partial refund could not be posted back to an account.
    RefundNotPosted { settlement_id: RowId, reason: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PendingPayment => write!(f, "pending payment, no account posted"),
            Self::NoBackingAccount { method } => {
                write!(f, "no active account for payment method {method}")
            }
            Self::AlreadyPosted {
                ref_type,
                ref_id,
                transaction_type,
            } => write!(f, "{transaction_type} for {ref_type} {ref_id} already posted"),
            Self::AuditTrailMissing { account_id, reason } => {
                write!(f, "account {account_id} updated without audit row: {reason}")
            }
            Self::RefundNotPosted {
                settlement_id,
                reason,
            } => write!(f, "refund for settlement {settlement_id} not posted: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use erp_store::Table;

    #[test]
    fn store_not_found_becomes_ledger_not_found() {
        let err: LedgerError = StoreError::NotFound {
            table: Table::Products,
            id: 7,
        }
        .into();
        assert_eq!(err.code(), "not_found");
        assert_eq!(err.to_string(), "products 7 not found");
    }

    #[test]
    fn other_store_errors_are_wrapped() {
        let err: LedgerError = StoreError::Unavailable("disk".into()).into();
        assert_eq!(err.code(), "store_error");
        assert!(!err.needs_reconciliation());
    }

    #[test]
    fn compensation_failure_is_distinct() {
        let err = LedgerError::CompensationFailed {
            operation: "delete_sale".into(),
            cause: Box::new(LedgerError::InvalidAmount(Decimal::ZERO)),
            failures: vec!["restore sales 1".into()],
        };
        assert_eq!(err.code(), "compensation_failed");
        assert!(err.needs_reconciliation());
        assert!(err.to_string().contains("1 compensation step(s)"));
    }

    #[test]
    fn warnings_render_human_messages() {
        let w = Warning::NoBackingAccount {
            method: PaymentMethod::Card,
        };
        assert_eq!(w.to_string(), "no active account for payment method card");
        let json = serde_json::to_value(&w).unwrap();
        assert_eq!(json["kind"], "no_backing_account");
    }
}
