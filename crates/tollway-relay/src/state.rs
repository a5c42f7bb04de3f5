use std::{sync::Arc, time::Duration};

use rust_decimal::Decimal;
use tollway_accounts::AccountManager;
use tollway_config::{LedgerConfig, UpstreamConfig};
use tollway_ledger::Ledger;

use crate::billing::BillingQueue;

/// Upstream and admission settings for the relay
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Full URL of the provider's messages endpoint
    pub messages_url: String,
    pub anthropic_version: String,
    /// Beta flag required for OAuth access tokens
    pub beta: String,
    pub timeout: Duration,
    /// Cost assumed by the pre-flight quota probe
    pub estimated_cost: Decimal,
}

impl RelaySettings {
    pub fn from_config(upstream: &UpstreamConfig, ledger: &LedgerConfig) -> Self {
        let base = upstream.base_url.as_str().trim_end_matches('/');

        Self {
            messages_url: format!("{base}/v1/messages"),
            anthropic_version: upstream.anthropic_version.clone(),
            beta: upstream.beta.clone(),
            timeout: upstream.timeout,
            estimated_cost: ledger.estimated_cost,
        }
    }
}

/// Shared state behind the relay route
#[derive(Clone)]
pub struct RelayState {
    pub(crate) inner: Arc<RelayInner>,
}

pub(crate) struct RelayInner {
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) accounts: Arc<AccountManager>,
    pub(crate) billing: BillingQueue,
    pub(crate) http: reqwest::Client,
    pub(crate) settings: RelaySettings,
}

impl RelayState {
    pub fn new(
        ledger: Arc<Ledger>,
        accounts: Arc<AccountManager>,
        billing: BillingQueue,
        settings: RelaySettings,
    ) -> Result<Self, reqwest::Error> {
        // Idle timeout between reads, long streams are not cut off
        let http = reqwest::Client::builder()
            .connect_timeout(settings.timeout)
            .read_timeout(settings.timeout)
            .build()?;

        Ok(Self {
            inner: Arc::new(RelayInner {
                ledger,
                accounts,
                billing,
                http,
                settings,
            }),
        })
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.inner.settings
    }
}

impl std::fmt::Debug for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayState")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}
