use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handler;
use crate::state::SharedState;

/// Build the axum router with every ledger endpoint.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/v1/health", get(handler::health_handler))
        .route("/v1/info", get(handler::info_handler))
        .route("/v1/accounts/postings", post(handler::post_to_account))
        .route(
            "/v1/accounts/:id/reconciliation",
            get(handler::reconcile_account),
        )
        .route("/v1/customers/:id/credit", post(handler::top_up_store_credit))
        .route("/v1/settlements", post(handler::create_settlement))
        .route("/v1/settlements/:id", delete(handler::void_settlement))
        .route("/v1/sales/:id", delete(handler::delete_sale))
        .route("/v1/sales/:id/confirm", post(handler::confirm_sale))
        .route("/v1/sales/:id/corrections", post(handler::correct_sale))
        .route("/v1/deliveries/:id/confirm", post(handler::confirm_delivery))
        .route("/v1/purchases/:id", delete(handler::delete_purchase))
        .route("/v1/purchases/:id/approve", post(handler::approve_purchase))
        .route(
            "/v1/purchase-items/:id",
            delete(handler::delete_purchase_item),
        )
        .route(
            "/v1/purchase-items/:id/receive",
            post(handler::receive_purchase_item),
        )
        .route("/v1/products/:id/adjustments", post(handler::adjust_stock))
        .route("/v1/audit", get(handler::audit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
