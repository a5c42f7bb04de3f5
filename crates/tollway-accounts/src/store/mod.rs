//! Persistence seam for upstream accounts
//!
//! Writes touch a single row and a subset of its columns, so a status
//! change cannot clobber tokens written by a concurrent refresh.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use jiff::Timestamp;

pub use self::memory::MemoryAccountStore;
#[cfg(feature = "postgres")]
pub use self::postgres::PostgresAccountStore;
use crate::{AccountError, AccountStatus, TokenUpdate, UpstreamAccount};

#[async_trait::async_trait]
pub trait AccountStore: Send + Sync {
    /// Insert an account, replacing any existing row with the same id
    async fn upsert(&self, account: &UpstreamAccount) -> Result<(), AccountError>;

    async fn get(&self, id: &str) -> Result<Option<UpstreamAccount>, AccountError>;

    /// All accounts ordered by id
    async fn list(&self) -> Result<Vec<UpstreamAccount>, AccountError>;

    async fn update_tokens(&self, id: &str, update: &TokenUpdate) -> Result<(), AccountError>;

    /// Move an account to `status` if its current status is one of `from`
    ///
    /// Returns whether the row changed.
    async fn transition(
        &self,
        id: &str,
        from: &[AccountStatus],
        status: AccountStatus,
        rate_limit_end: Option<Timestamp>,
    ) -> Result<bool, AccountError>;

    async fn touch(&self, id: &str, used_at: Timestamp) -> Result<(), AccountError>;
}
