use dashmap::DashMap;
use jiff::Timestamp;

use super::AccountStore;
use crate::{AccountError, AccountStatus, TokenUpdate, UpstreamAccount};

/// Process-local account store
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: DashMap<String, UpstreamAccount>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AccountStore for MemoryAccountStore {
    async fn upsert(&self, account: &UpstreamAccount) -> Result<(), AccountError> {
        self.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UpstreamAccount>, AccountError> {
        Ok(self.accounts.get(id).map(|entry| entry.value().clone()))
    }

    async fn list(&self) -> Result<Vec<UpstreamAccount>, AccountError> {
        let mut accounts: Vec<_> = self.accounts.iter().map(|entry| entry.value().clone()).collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    async fn update_tokens(&self, id: &str, update: &TokenUpdate) -> Result<(), AccountError> {
        let mut account = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| AccountError::NotFound(id.to_string()))?;
        account.access_token = update.access_token.clone();
        account.refresh_token = update.refresh_token.clone();
        account.expires_at = update.expires_at;
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        from: &[AccountStatus],
        status: AccountStatus,
        rate_limit_end: Option<Timestamp>,
    ) -> Result<bool, AccountError> {
        let mut account = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| AccountError::NotFound(id.to_string()))?;

        if !from.contains(&account.status) {
            return Ok(false);
        }

        account.status = status;
        account.rate_limit_end = rate_limit_end;
        Ok(true)
    }

    async fn touch(&self, id: &str, used_at: Timestamp) -> Result<(), AccountError> {
        if let Some(mut account) = self.accounts.get_mut(id) {
            account.last_used_at = Some(used_at);
        }
        Ok(())
    }
}
