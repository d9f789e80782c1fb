//! HTTP surface for the storefront ERP ledger.
//!
//! A thin JSON layer over [`erp_ledger::Ledger`]: every route maps to one
//! ledger operation, and every [`erp_ledger::LedgerError`] maps to a status
//! code with a `{ "error": { "code", "message" } }` body.

pub mod config;
pub mod error;
pub mod handler;
pub mod router;
pub mod server;
pub mod state;

pub use config::{ServerConfig, BIND_ADDR_ENV};
pub use error::{ServerError, ServerResult};
pub use server::ErpServer;
pub use state::{AppState, SharedState};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    use erp_ledger::{Ledger, LedgerConfig};
    use erp_store::{Customer, InMemoryStore, Product, RecordStore, Sale, SaleItem};
    use erp_types::clock::offset_from_hours;
    use erp_types::{FixedClock, FulfillmentStatus, PaymentMethod, SaleStatus};
    use rust_decimal_macros::dec;

    fn state() -> SharedState {
        let clock = FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap(),
            offset_from_hours(8).unwrap(),
        );
        let ledger = Ledger::new(InMemoryStore::new(), LedgerConfig::default(), Arc::new(clock));
        Arc::new(AppState::new(ledger))
    }

    /// A confirmed, unpaid sale of 100 for customer "C" plus a cash account
    /// holding 1000. Returns the id of the AR line.
    fn unpaid_sale(state: &SharedState) -> i64 {
        let ledger = &state.ledger;
        ledger
            .open_account("Cash", "cash", Some("cash".into()), dec!(1000))
            .unwrap();
        let store = ledger.store();
        store
            .create(&Customer {
                id: 0,
                code: "C".into(),
                name: "Carol".into(),
                store_credit: dec!(0),
            })
            .unwrap();
        let product = store
            .create(&Product {
                id: 0,
                sku: "P1".into(),
                name: "Widget".into(),
                stock: 0,
                avg_cost: dec!(0),
                allow_negative: false,
            })
            .unwrap();
        let sale = store
            .create(&Sale {
                id: 0,
                sale_no: "S-1".into(),
                customer_code: Some("C".into()),
                sale_date: ledger.context().today(),
                status: SaleStatus::Draft,
                fulfillment_status: FulfillmentStatus::Unfulfilled,
                total: dec!(100),
                paid_amount: dec!(0),
                payment_method: PaymentMethod::Cash,
                account_id: None,
            })
            .unwrap();
        store
            .create(&SaleItem {
                id: 0,
                sale_id: sale.id,
                product_id: product.id,
                quantity: 1,
                unit_price: dec!(100),
                subtotal: dec!(100),
                prize_id: None,
            })
            .unwrap();
        ledger.confirm_sale(sale.id).unwrap().lines[0].id
    }

    async fn call(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let body = body.map_or_else(Body::empty, |value| Body::from(value.to_string()));
        let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = router::build_router(state());
        let (status, body) = call(app, Method::GET, "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn info_endpoint() {
        let app = router::build_router(state());
        let (status, body) = call(app, Method::GET, "/v1/info", None).await;
        assert_eq!(status, 200);
        assert_eq!(body["name"], "erp-server");
    }

    #[tokio::test]
    async fn posting_is_idempotent_over_http() {
        let state = state();
        let body = json!({
            "method": "cash",
            "amount": "200",
            "direction": "increase",
            "transaction_type": "sale",
            "reference_id": 1
        });
        state
            .ledger
            .open_account("Cash", "cash", Some("cash".into()), dec!(1000))
            .unwrap();

        let app = router::build_router(Arc::clone(&state));
        let (status, first) =
            call(app.clone(), Method::POST, "/v1/accounts/postings", Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["balance_after"], "1200");

        let (status, second) = call(app, Method::POST, "/v1/accounts/postings", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["warnings"][0]["kind"], "already_posted");
    }

    #[tokio::test]
    async fn receipt_settles_line() {
        let state = state();
        let line_id = unpaid_sale(&state);
        let app = router::build_router(Arc::clone(&state));
        let request = json!({
            "partner_type": "customer",
            "partner_code": "C",
            "direction": "receipt",
            "method": "cash",
            "amount": "100",
            "allocations": [{"partner_account_id": line_id, "amount": "100"}]
        });
        let (status, body) = call(app.clone(), Method::POST, "/v1/settlements", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allocations"].as_array().unwrap().len(), 1);

        let (status, report) = call(app, Method::GET, "/v1/audit", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["violations"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn over_allocation_is_unprocessable() {
        let state = state();
        let line_id = unpaid_sale(&state);
        let app = router::build_router(state);
        let request = json!({
            "partner_type": "customer",
            "partner_code": "C",
            "direction": "receipt",
            "method": "cash",
            "amount": "150",
            "allocations": [{"partner_account_id": line_id, "amount": "150"}]
        });
        let (status, body) = call(app, Method::POST, "/v1/settlements", Some(request)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "over_allocation");
    }

    #[tokio::test]
    async fn unknown_sale_is_not_found() {
        let app = router::build_router(state());
        let (status, body) = call(app, Method::POST, "/v1/sales/42/confirm", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn confirming_twice_conflicts() {
        let state = state();
        unpaid_sale(&state);
        let app = router::build_router(state);
        let (status, body) = call(app, Method::POST, "/v1/sales/1/confirm", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "invalid_state");
    }
}
