use http::StatusCode;
use tollway_core::HttpError;

/// Upstream account errors
///
/// Callers of the relay only ever see a generic "no account available"
/// message; details are for logs.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("no upstream account is available")]
    NoAccountAvailable,

    #[error("upstream account {0} not found")]
    NotFound(String),

    #[error("upstream account {0} is disabled")]
    Disabled(String),

    #[error("upstream account {0} has no access token")]
    MissingAccessToken(String),

    #[error("upstream account {0} has no refresh token")]
    MissingRefreshToken(String),

    /// Token already expired and could not be refreshed; the account is now disabled
    #[error("upstream account {account_id} token expired and refresh failed: {reason}")]
    TokenExpired { account_id: String, reason: String },

    #[error("token refresh rejected with status {status}: {body}")]
    RefreshRejected { status: u16, body: String },

    #[error("token refresh request failed: {0}")]
    RefreshTransport(#[from] reqwest::Error),

    #[error("invalid token refresh response: {0}")]
    RefreshResponse(String),

    #[error("account store failed during {operation}: {message}")]
    Store { operation: &'static str, message: String },
}

impl AccountError {
    pub fn store(operation: &'static str, error: impl std::fmt::Display) -> Self {
        Self::Store {
            operation,
            message: error.to_string(),
        }
    }
}

impl HttpError for AccountError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Store { .. } => "api_error",
            _ => "overloaded_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Store { .. } => "Internal server error".to_string(),
            _ => "No upstream account is available, try again later".to_string(),
        }
    }
}
