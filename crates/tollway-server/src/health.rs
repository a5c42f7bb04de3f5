use std::sync::Arc;

use axum::{Json, extract::State, response::IntoResponse};
use http::StatusCode;
use serde::Serialize;
use tollway_accounts::{AccountManager, AccountStatus, AccountStore};

#[derive(Debug, Default, Serialize)]
struct AccountCounts {
    active: usize,
    rate_limited: usize,
    disabled: usize,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    accounts: Option<AccountCounts>,
}

/// Liveness probe
///
/// Always answers 200 while the process serves; the account pool summary
/// is omitted when the account store cannot be read.
pub async fn health_handler(State(accounts): State<Arc<AccountManager>>) -> impl IntoResponse {
    let counts = match accounts.store().list().await {
        Ok(list) => {
            let mut counts = AccountCounts::default();
            for account in list {
                match account.status {
                    AccountStatus::Active => counts.active += 1,
                    AccountStatus::RateLimited => counts.rate_limited += 1,
                    AccountStatus::Disabled => counts.disabled += 1,
                }
            }
            Some(counts)
        }
        Err(e) => {
            tracing::warn!(error = %e, "health check could not list upstream accounts");
            None
        }
    };

    (
        StatusCode::OK,
        Json(HealthReport {
            status: "ok",
            accounts: counts,
        }),
    )
}
