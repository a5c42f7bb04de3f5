use std::sync::Arc;

use dashmap::DashMap;
use http::{HeaderMap, StatusCode};
use jiff::{SignedDuration, Timestamp};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tollway_config::{AccountSeed, UpstreamConfig};
use tollway_core::SharedClock;
use tollway_telemetry::metrics;

use crate::{
    AccountError, AccountStatus, TokenUpdate, UpstreamAccount,
    model::mask_token,
    rate_limit::detect_rate_limit,
    refresh::TokenRefresher,
    store::AccountStore,
};

/// Timing rules for the account state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountSettings {
    /// Refresh on use when the token expires within this window
    pub refresh_buffer: SignedDuration,
    /// Refresh from the periodic sweep when the token expires within this window
    pub sweep_refresh_buffer: SignedDuration,
    /// Cooldown applied when a rate limit carries no reset time
    pub rate_limit_cooldown: SignedDuration,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            refresh_buffer: SignedDuration::from_mins(5),
            sweep_refresh_buffer: SignedDuration::from_mins(20),
            rate_limit_cooldown: SignedDuration::from_hours(5),
        }
    }
}

impl AccountSettings {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        let convert = |d: std::time::Duration| SignedDuration::try_from(d).unwrap_or(SignedDuration::MAX);
        Self {
            refresh_buffer: convert(config.refresh_buffer),
            sweep_refresh_buffer: convert(config.sweep_refresh_buffer),
            rate_limit_cooldown: convert(config.rate_limit_cooldown),
        }
    }
}

/// Counts from one token-refresh sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSweepReport {
    pub refreshed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub disabled: u64,
}

/// Owns the lifecycle of every upstream account
///
/// Each account moves independently between active, rate limited, and
/// disabled. Token refreshes are serialized per account so concurrent
/// callers never race to rotate the same refresh token.
pub struct AccountManager {
    store: Arc<dyn AccountStore>,
    refresher: Arc<dyn TokenRefresher>,
    clock: SharedClock,
    settings: AccountSettings,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    selection: Mutex<()>,
}

impl std::fmt::Debug for AccountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl AccountManager {
    pub fn new(
        store: Arc<dyn AccountStore>,
        refresher: Arc<dyn TokenRefresher>,
        clock: SharedClock,
        settings: AccountSettings,
    ) -> Self {
        Self {
            store,
            refresher,
            clock,
            settings,
            refresh_locks: DashMap::new(),
            selection: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    /// Register accounts from configuration
    pub async fn seed(&self, seeds: &[AccountSeed]) -> Result<(), AccountError> {
        for seed in seeds {
            self.store.upsert(&UpstreamAccount::from_seed(seed)).await?;
        }
        tracing::info!(accounts = seeds.len(), "upstream accounts registered");
        Ok(())
    }

    /// Pick the least recently used schedulable account
    ///
    /// A rate-limited account whose cooldown has passed is reinstated
    /// here rather than waiting for the sweep.
    pub async fn select_account(&self) -> Result<UpstreamAccount, AccountError> {
        let _selection = self.selection.lock().await;
        let now = self.clock.now();

        let mut account = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|account| account.is_schedulable(now))
            .min_by(|a, b| a.last_used_at.cmp(&b.last_used_at).then_with(|| a.id.cmp(&b.id)))
            .ok_or(AccountError::NoAccountAvailable)?;

        if account.status == AccountStatus::RateLimited && self.reinstate(&account.id).await? {
            account.status = AccountStatus::Active;
            account.rate_limit_end = None;
        }

        self.store.touch(&account.id, now).await?;
        account.last_used_at = Some(now);

        Ok(account)
    }

    /// Access token for an account, refreshed first when close to expiry
    ///
    /// When the refresh fails the current token is still returned as long
    /// as it has not expired. An expired token with a failed refresh
    /// disables the account. A refresh the provider accepted is never
    /// treated as failed, even when the new token cannot be stored.
    pub async fn get_valid_access_token(&self, account_id: &str) -> Result<SecretString, AccountError> {
        let lock = self.refresh_lock(account_id);
        let _guard = lock.lock().await;

        // Reload under the lock: a caller we waited on may have refreshed already
        let account = self.load(account_id).await?;
        if account.status == AccountStatus::Disabled {
            return Err(AccountError::Disabled(account.id));
        }
        if !account.has_access_token() {
            return Err(AccountError::MissingAccessToken(account.id));
        }

        let now = self.clock.now();
        if !account.expires_within(now, self.settings.refresh_buffer) {
            return Ok(account.access_token);
        }

        tracing::info!(account_id, expires_at = account.expires_at, "access token near expiry, refreshing");

        match self.refresh(&account, now).await {
            Ok(token) => Ok(token),
            Err(e) if !account.is_expired(now) => {
                tracing::warn!(account_id, error = %e, "token refresh failed, using current token until it expires");
                Ok(account.access_token)
            }
            Err(e) => {
                self.disable(&account.id, &e).await?;
                Err(AccountError::TokenExpired {
                    account_id: account.id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Feed an upstream response into the state machine
    ///
    /// Returns whether the account was marked rate limited.
    pub async fn report_response(
        &self,
        account_id: &str,
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<bool, AccountError> {
        if status.is_success() {
            self.record_success(account_id).await?;
            return Ok(false);
        }

        let Some(signal) = detect_rate_limit(status, headers, body) else {
            return Ok(false);
        };

        let now = self.clock.now();
        let end = signal
            .reset_at
            .unwrap_or_else(|| now.saturating_add(self.settings.rate_limit_cooldown).unwrap_or(now));

        let changed = self
            .store
            .transition(
                account_id,
                &[AccountStatus::Active, AccountStatus::RateLimited],
                AccountStatus::RateLimited,
                Some(end),
            )
            .await?;

        if changed {
            metrics::record_account_transition(AccountStatus::RateLimited.as_ref());
            tracing::warn!(
                account_id,
                status = status.as_u16(),
                until = %end,
                from_header = signal.reset_at.is_some(),
                "upstream account rate limited"
            );
        }

        Ok(changed)
    }

    /// Clear a rate limit after the provider served a request successfully
    pub async fn record_success(&self, account_id: &str) -> Result<bool, AccountError> {
        self.reinstate(account_id).await
    }

    /// Reinstate every rate-limited account whose cooldown has passed
    pub async fn sweep_rate_limits(&self) -> Result<u64, AccountError> {
        let now = self.clock.now();
        let mut recovered = 0;

        for account in self.store.list().await? {
            if account.status != AccountStatus::RateLimited {
                continue;
            }
            if !account.cooldown_elapsed(now) {
                tracing::debug!(account_id = %account.id, until = ?account.rate_limit_end, "still rate limited");
                continue;
            }
            match self.reinstate(&account.id).await {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(account_id = %account.id, error = %e, "failed to reinstate account"),
            }
        }

        tracing::info!(recovered, "rate limit sweep finished");
        Ok(recovered)
    }

    /// Refresh every token expiring within the sweep window
    pub async fn sweep_token_refresh(&self) -> Result<RefreshSweepReport, AccountError> {
        let now = self.clock.now();
        let mut report = RefreshSweepReport::default();

        for account in self.store.list().await? {
            let due = account.status != AccountStatus::Disabled
                && account.has_access_token()
                && account.has_refresh_token()
                && account.expires_within(now, self.settings.sweep_refresh_buffer);
            if !due {
                report.skipped += 1;
                continue;
            }

            let lock = self.refresh_lock(&account.id);
            let _guard = lock.lock().await;

            // Reload under the lock: a caller may have refreshed or disabled it meanwhile
            let account = match self.load(&account.id).await {
                Ok(account) => account,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(account_id = %account.id, error = %e, "failed to reload account for refresh");
                    continue;
                }
            };
            if account.status == AccountStatus::Disabled
                || !account.expires_within(now, self.settings.sweep_refresh_buffer)
            {
                report.skipped += 1;
                continue;
            }

            match self.refresh(&account, now).await {
                Ok(_) => report.refreshed += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(account_id = %account.id, error = %e, "scheduled token refresh failed");
                    if !account.is_expired(now) {
                        continue;
                    }
                    match self.disable(&account.id, &e).await {
                        Ok(()) => report.disabled += 1,
                        Err(e) => {
                            tracing::warn!(account_id = %account.id, error = %e, "failed to disable account");
                        }
                    }
                }
            }
        }

        tracing::info!(
            refreshed = report.refreshed,
            skipped = report.skipped,
            failed = report.failed,
            disabled = report.disabled,
            "token refresh sweep finished"
        );
        Ok(report)
    }

    async fn refresh(&self, account: &UpstreamAccount, now: Timestamp) -> Result<SecretString, AccountError> {
        let refresh_token = account
            .refresh_token
            .as_ref()
            .filter(|token| !token.expose_secret().is_empty())
            .ok_or_else(|| AccountError::MissingRefreshToken(account.id.clone()))?;

        let refreshed = self.refresher.refresh(refresh_token).await?;
        let update = TokenUpdate {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token.or_else(|| Some(refresh_token.clone())),
            expires_at: now.as_second().saturating_add(refreshed.expires_in),
        };
        // Accepted by the provider: a failed write is not a failed refresh
        if let Err(e) = self.store.update_tokens(&account.id, &update).await {
            tracing::error!(
                account_id = %account.id,
                error = %e,
                expires_at = update.expires_at,
                "refreshed token could not be persisted"
            );
            return Ok(update.access_token);
        }

        tracing::info!(
            account_id = %account.id,
            token = %mask_token(update.access_token.expose_secret()),
            expires_at = update.expires_at,
            "access token refreshed"
        );

        Ok(update.access_token)
    }

    async fn reinstate(&self, account_id: &str) -> Result<bool, AccountError> {
        let changed = self
            .store
            .transition(account_id, &[AccountStatus::RateLimited], AccountStatus::Active, None)
            .await?;

        if changed {
            metrics::record_account_transition(AccountStatus::Active.as_ref());
            tracing::info!(account_id, "upstream account reinstated");
        }
        Ok(changed)
    }

    async fn disable(&self, account_id: &str, cause: &AccountError) -> Result<(), AccountError> {
        let changed = self
            .store
            .transition(
                account_id,
                &[AccountStatus::Active, AccountStatus::RateLimited],
                AccountStatus::Disabled,
                None,
            )
            .await?;

        if changed {
            metrics::record_account_transition(AccountStatus::Disabled.as_ref());
            tracing::error!(account_id, error = %cause, "token expired and refresh failed, account disabled");
        }
        Ok(())
    }

    async fn load(&self, account_id: &str) -> Result<UpstreamAccount, AccountError> {
        self.store
            .get(account_id)
            .await?
            .ok_or_else(|| AccountError::NotFound(account_id.to_string()))
    }

    fn refresh_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.refresh_locks.entry(account_id.to_string()).or_default().value())
    }
}
