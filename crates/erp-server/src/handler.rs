//! Request handlers. Ledger calls are synchronous and may wait on aggregate
//! locks, so each one runs on the blocking pool.

use axum::extract::{Path, State};
use axum::response::Json;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;

use erp_ledger::{
    AccountReconciliation, AccountTarget, AuditReport, DeliveryConfirmation, ItemAdjustment,
    ItemCost, Ledger, LedgerResult, PostingOutcome, PostingRequest, PurchaseApproval,
    PurchaseDeletion, PurchaseItemDeletion, SaleConfirmation, SaleCorrectionOutcome,
    SaleDeletion, SettlementOutcome, SettlementRequest, SettlementReversal,
};
use erp_store::{CustomerBalanceLog, InMemoryStore, InventoryLogEntry, RowId, StockAdjustment};
use erp_types::{BalanceDirection, PaymentMethod, TransactionType};

use crate::error::{ServerError, ServerResult};
use crate::state::SharedState;

async fn blocking<T, F>(state: SharedState, op: F) -> ServerResult<Json<T>>
where
    T: Send + 'static,
    F: FnOnce(&Ledger<InMemoryStore>) -> LedgerResult<T> + Send + 'static,
{
    let value = tokio::task::spawn_blocking(move || op(&state.ledger))
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))??;
    Ok(Json(value))
}

pub async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn info_handler() -> Json<serde_json::Value> {
    Json(json!({
        "name": "erp-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// Body of `POST /v1/accounts/postings`. Either `account_id` or `method`
/// picks the account.
#[derive(Debug, Deserialize)]
pub struct PostingBody {
    #[serde(default)]
    pub account_id: Option<RowId>,
    #[serde(default)]
    pub method: Option<PaymentMethod>,
    pub amount: Decimal,
    pub direction: BalanceDirection,
    pub transaction_type: TransactionType,
    pub reference_id: RowId,
    #[serde(default)]
    pub reference_no: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl PostingBody {
    fn into_request(self) -> PostingRequest {
        let method = self.method.unwrap_or(PaymentMethod::Pending);
        let mut request = PostingRequest::new(
            AccountTarget::resolve(self.account_id, &method),
            self.amount,
            self.direction,
            self.transaction_type,
            self.reference_id,
        );
        request.reference_no = self.reference_no;
        request.note = self.note;
        request
    }
}

pub async fn post_to_account(
    State(state): State<SharedState>,
    Json(body): Json<PostingBody>,
) -> ServerResult<Json<PostingOutcome>> {
    let request = body.into_request();
    blocking(state, move |ledger| ledger.update_account_balance(&request)).await
}

pub async fn reconcile_account(
    State(state): State<SharedState>,
    Path(account_id): Path<RowId>,
) -> ServerResult<Json<AccountReconciliation>> {
    blocking(state, move |ledger| ledger.reconcile_account(account_id)).await
}

#[derive(Debug, Deserialize)]
pub struct TopUpBody {
    pub amount: Decimal,
    #[serde(default)]
    pub note: Option<String>,
}

pub async fn top_up_store_credit(
    State(state): State<SharedState>,
    Path(customer_id): Path<RowId>,
    Json(body): Json<TopUpBody>,
) -> ServerResult<Json<CustomerBalanceLog>> {
    blocking(state, move |ledger| {
        ledger.top_up_store_credit(customer_id, body.amount, body.note)
    })
    .await
}

// ---------------------------------------------------------------------------
// Settlements
// ---------------------------------------------------------------------------

pub async fn create_settlement(
    State(state): State<SharedState>,
    Json(request): Json<SettlementRequest>,
) -> ServerResult<Json<SettlementOutcome>> {
    blocking(state, move |ledger| ledger.create_settlement(&request)).await
}

pub async fn void_settlement(
    State(state): State<SharedState>,
    Path(settlement_id): Path<RowId>,
) -> ServerResult<Json<SettlementReversal>> {
    blocking(state, move |ledger| ledger.void_settlement(settlement_id)).await
}

// ---------------------------------------------------------------------------
// Sales and deliveries
// ---------------------------------------------------------------------------

pub async fn confirm_sale(
    State(state): State<SharedState>,
    Path(sale_id): Path<RowId>,
) -> ServerResult<Json<SaleConfirmation>> {
    blocking(state, move |ledger| ledger.confirm_sale(sale_id)).await
}

#[derive(Debug, Deserialize)]
pub struct CorrectionBody {
    pub items: Vec<ItemAdjustment>,
}

pub async fn correct_sale(
    State(state): State<SharedState>,
    Path(sale_id): Path<RowId>,
    Json(body): Json<CorrectionBody>,
) -> ServerResult<Json<SaleCorrectionOutcome>> {
    blocking(state, move |ledger| ledger.correct_sale(sale_id, &body.items)).await
}

pub async fn delete_sale(
    State(state): State<SharedState>,
    Path(sale_id): Path<RowId>,
) -> ServerResult<Json<SaleDeletion>> {
    blocking(state, move |ledger| ledger.delete_sale(sale_id)).await
}

pub async fn confirm_delivery(
    State(state): State<SharedState>,
    Path(delivery_id): Path<RowId>,
) -> ServerResult<Json<DeliveryConfirmation>> {
    blocking(state, move |ledger| ledger.confirm_delivery(delivery_id)).await
}

// ---------------------------------------------------------------------------
// Purchases
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ApprovalBody {
    #[serde(default)]
    pub costs: Vec<ItemCost>,
}

pub async fn approve_purchase(
    State(state): State<SharedState>,
    Path(purchase_id): Path<RowId>,
    Json(body): Json<ApprovalBody>,
) -> ServerResult<Json<PurchaseApproval>> {
    blocking(state, move |ledger| ledger.approve_purchase(purchase_id, &body.costs)).await
}

#[derive(Debug, Deserialize)]
pub struct ReceiveBody {
    pub quantity: i64,
}

pub async fn receive_purchase_item(
    State(state): State<SharedState>,
    Path(purchase_item_id): Path<RowId>,
    Json(body): Json<ReceiveBody>,
) -> ServerResult<Json<InventoryLogEntry>> {
    blocking(state, move |ledger| {
        ledger.receive_purchase_item(purchase_item_id, body.quantity)
    })
    .await
}

pub async fn delete_purchase_item(
    State(state): State<SharedState>,
    Path(purchase_item_id): Path<RowId>,
) -> ServerResult<Json<PurchaseItemDeletion>> {
    blocking(state, move |ledger| ledger.delete_purchase_item(purchase_item_id)).await
}

pub async fn delete_purchase(
    State(state): State<SharedState>,
    Path(purchase_id): Path<RowId>,
) -> ServerResult<Json<PurchaseDeletion>> {
    blocking(state, move |ledger| ledger.delete_purchase(purchase_id)).await
}

// ---------------------------------------------------------------------------
// Inventory and audit
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AdjustmentBody {
    pub stock: i64,
    pub reason: String,
}

pub async fn adjust_stock(
    State(state): State<SharedState>,
    Path(product_id): Path<RowId>,
    Json(body): Json<AdjustmentBody>,
) -> ServerResult<Json<StockAdjustment>> {
    blocking(state, move |ledger| {
        ledger.adjust_stock(product_id, body.stock, &body.reason)
    })
    .await
}

pub async fn audit(State(state): State<SharedState>) -> ServerResult<Json<AuditReport>> {
    blocking(state, |ledger| ledger.audit()).await
}
