use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use tollway_accounts::AccountError;
use tollway_core::HttpError;
use tollway_ledger::LedgerError;

/// Errors returned to relay callers
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Missing, unknown, or disabled API key
    #[error("invalid API key")]
    Unauthorized,

    #[error("API key has expired")]
    KeyExpired,

    /// The key already spent its daily cost limit
    #[error("API key daily cost limit reached")]
    KeyDailyLimit,

    /// Client sent a malformed request body
    #[error("{0}")]
    InvalidRequest(String),

    /// The API key may not call this model
    #[error("API key is not allowed to use model {0}")]
    ModelNotAllowed(String),

    /// The caller has no plan or balance that covers the request
    #[error("insufficient quota: {0}")]
    PaymentRequired(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Account(#[from] AccountError),

    /// Network or timeout failure talking to the provider
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl HttpError for RelayError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized | Self::KeyExpired => StatusCode::UNAUTHORIZED,
            Self::KeyDailyLimit => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::ModelNotAllowed(_) => StatusCode::FORBIDDEN,
            Self::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            Self::Ledger(e) => e.status_code(),
            Self::Account(e) => e.status_code(),
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Unauthorized | Self::KeyExpired => "authentication_error",
            Self::KeyDailyLimit => "rate_limit_error",
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::ModelNotAllowed(_) => "permission_error",
            Self::PaymentRequired(_) => "payment_required",
            Self::Ledger(e) => e.error_type(),
            Self::Account(e) => e.error_type(),
            Self::Upstream(_) => "api_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Ledger(e) => e.client_message(),
            Self::Account(e) => e.client_message(),
            Self::Upstream(_) => "Upstream provider request failed".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        error_response(&self)
    }
}

/// Render any [`HttpError`] as an Anthropic-style JSON error body
pub fn error_response(error: &impl HttpError) -> Response {
    let body = serde_json::json!({
        "type": "error",
        "error": {
            "type": error.error_type(),
            "message": error.client_message(),
        }
    });

    (error.status_code(), Json(body)).into_response()
}
