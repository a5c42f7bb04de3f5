//! Upstream account lifecycle
//!
//! Tracks OAuth credentials and operational status for each upstream
//! account: proactive token refresh with graceful fallback, rate-limit
//! cooldowns with automatic reinstatement, and disablement when a token
//! can no longer be renewed.

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

mod error;
mod manager;
mod model;
pub mod rate_limit;
mod refresh;
pub mod store;

pub use error::AccountError;
pub use manager::{AccountManager, AccountSettings, RefreshSweepReport};
pub use model::{AccountStatus, TokenUpdate, UpstreamAccount, mask_token};
pub use refresh::{OAuthRefresher, RefreshedToken, TokenRefresher};
#[cfg(feature = "postgres")]
pub use store::PostgresAccountStore;
pub use store::{AccountStore, MemoryAccountStore};
