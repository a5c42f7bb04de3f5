use http::StatusCode;
use tollway_core::HttpError;

use crate::model::CardStatus;

/// Ledger errors
///
/// Running out of funds is not an error; probes and deductions report it
/// through their outcome types.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Malformed or missing input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A read or write against the store failed
    #[error("ledger store failed during {operation}: {message}")]
    Store { operation: &'static str, message: String },

    #[error("recharge card not found")]
    CardNotFound,

    #[error("recharge card is {0}")]
    CardUnavailable(CardStatus),

    #[error("recharge card has expired")]
    CardExpired,

    #[error("recharge card code already exists")]
    DuplicateCard,
}

impl LedgerError {
    pub fn store(operation: &'static str, error: impl std::fmt::Display) -> Self {
        Self::Store {
            operation,
            message: error.to_string(),
        }
    }
}

impl HttpError for LedgerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::CardUnavailable(_) | Self::CardExpired => StatusCode::BAD_REQUEST,
            Self::CardNotFound => StatusCode::NOT_FOUND,
            Self::DuplicateCard => StatusCode::CONFLICT,
            Self::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::InvalidInput(_) | Self::CardUnavailable(_) | Self::CardExpired | Self::DuplicateCard => {
                "invalid_request_error"
            }
            Self::CardNotFound => "not_found_error",
            Self::Store { .. } => "api_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Store { .. } => "Internal billing error".to_string(),
            other => other.to_string(),
        }
    }
}
