use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::billing::BillingError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Billing(err) => match err {
                BillingError::UnknownPlan(_) => StatusCode::UNPROCESSABLE_ENTITY,
                BillingError::NotFound(_) => StatusCode::NOT_FOUND,
                BillingError::AlreadyExists(_) | BillingError::InvalidTransition { .. } => {
                    StatusCode::CONFLICT
                }
                BillingError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
                BillingError::Contention(_) | BillingError::TransientStore { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                BillingError::Store(store) if store.is_transient() => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                BillingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
