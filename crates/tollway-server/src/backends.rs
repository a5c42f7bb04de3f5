use std::sync::Arc;

use tollway_accounts::{AccountStore, MemoryAccountStore};
use tollway_config::{Config, StoreConfig};
use tollway_ledger::{LedgerStore, MemoryLedgerStore};
use tollway_pricing::{PricingSource, StaticPricing};

/// Storage for the ledger, the account pool, and model prices
pub struct Backends {
    pub ledger: Arc<dyn LedgerStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub pricing: Arc<dyn PricingSource>,
}

impl Backends {
    /// Open the configured store, creating tables when it is a database
    ///
    /// Prices come from `[pricing.models]` when any are configured;
    /// otherwise a database store serves them from its price table.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        match &config.ledger.store {
            StoreConfig::Memory => {
                tracing::info!("using in-memory ledger and account store");
                Ok(Self {
                    ledger: Arc::new(MemoryLedgerStore::new()),
                    accounts: Arc::new(MemoryAccountStore::new()),
                    pricing: Arc::new(StaticPricing::from_config(&config.pricing)),
                })
            }
            #[cfg(feature = "postgres")]
            StoreConfig::Postgres { url, max_connections } => {
                use secrecy::ExposeSecret;
                use tollway_accounts::PostgresAccountStore;
                use tollway_ledger::PostgresLedgerStore;
                use tollway_pricing::PostgresPricing;

                let ledger = PostgresLedgerStore::connect(url.expose_secret(), *max_connections).await?;
                ledger.migrate().await?;

                let accounts = PostgresAccountStore::new(ledger.pool().clone());
                accounts.migrate().await?;

                let pricing: Arc<dyn PricingSource> = if config.pricing.models.is_empty() {
                    let pricing = PostgresPricing::new(ledger.pool().clone());
                    pricing.migrate().await?;
                    Arc::new(pricing)
                } else {
                    Arc::new(StaticPricing::from_config(&config.pricing))
                };

                tracing::info!(max_connections, "using postgres ledger and account store");
                Ok(Self {
                    ledger: Arc::new(ledger),
                    accounts: Arc::new(accounts),
                    pricing,
                })
            }
            #[cfg(not(feature = "postgres"))]
            StoreConfig::Postgres { .. } => {
                anyhow::bail!("ledger.store.kind = \"postgres\" requires building with the `postgres` feature")
            }
        }
    }
}
