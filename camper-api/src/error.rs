use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use camper_order::{EngineError, ErrorKind};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Authentication(String),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidPricingInput | ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::StateConflict => StatusCode::CONFLICT,
        ErrorKind::InsufficientBalance => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::AmountMismatch | ErrorKind::SignatureVerificationFailed => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ExternalChannelError => StatusCode::BAD_GATEWAY,
        ErrorKind::ReconciliationRequired => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, leg) = match self {
            AppError::Authentication(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", msg, None),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, ErrorKind::ValidationError.as_str(), msg, None),
            AppError::Engine(err) => {
                let kind = err.kind();
                let status = status_for(kind);
                let leg = err.failed_leg().map(|leg| leg.as_str());
                let message = match kind {
                    ErrorKind::Internal => {
                        tracing::error!("Internal Server Error: {}", err);
                        "Internal Server Error".to_string()
                    }
                    ErrorKind::ReconciliationRequired => {
                        tracing::error!("Reconciliation required: {}", err);
                        "Payment is being reconciled, please retry later".to_string()
                    }
                    _ => err.to_string(),
                };
                (status, kind.as_str(), message, leg)
            }
            AppError::Internal(err) => {
                tracing::error!("Internal Server Error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorKind::Internal.as_str(),
                    "Internal Server Error".to_string(),
                    None,
                )
            }
        };

        let body = Json(json!({
            "error": message,
            "code": code,
            "leg": leg,
        }));

        (status, body).into_response()
    }
}
