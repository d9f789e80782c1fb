use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

use erp_ledger::LedgerError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("store error: {0}")]
    Store(#[from] erp_store::StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Ledger(e) => e.code(),
            Self::Store(_) => "store_error",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        let Self::Ledger(e) = self else {
            return StatusCode::INTERNAL_SERVER_ERROR;
        };
        match e {
            LedgerError::InvalidAmount(_)
            | LedgerError::InvalidQuantity(_)
            | LedgerError::WrongDirection { .. }
            | LedgerError::AllocationMismatch { .. } => StatusCode::BAD_REQUEST,
            LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
            LedgerError::AccountInactive(_)
            | LedgerError::AlreadyProcessed { .. }
            | LedgerError::InvalidState { .. } => StatusCode::CONFLICT,
            LedgerError::OverAllocation { .. }
            | LedgerError::InsufficientStock { .. }
            | LedgerError::InsufficientPrizeStock { .. }
            | LedgerError::InsufficientStoreCredit { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::Store(_) | LedgerError::CompensationFailed { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "request rejected");
        }
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
