#![allow(clippy::must_use_candidate)]

pub mod accounts;
mod env;
pub mod keys;
pub mod ledger;
mod loader;
pub mod pricing;
pub mod scheduler;
pub mod server;
pub mod telemetry;
pub mod upstream;
pub mod users;

use serde::Deserialize;

pub use accounts::*;
pub use keys::*;
pub use ledger::*;
pub use pricing::*;
pub use scheduler::*;
pub use server::*;
pub use telemetry::TelemetryConfig;
pub use upstream::*;
pub use users::*;

/// Top-level Tollway configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Quota ledger configuration
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Model price table
    #[serde(default)]
    pub pricing: PricingConfig,
    /// Upstream provider configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Upstream accounts seeded at startup
    #[serde(default)]
    pub accounts: Vec<AccountSeed>,
    /// Caller API keys
    #[serde(default)]
    pub keys: Vec<ApiKeyConfig>,
    /// Funding seeded into the ledger at startup
    #[serde(default)]
    pub users: Vec<UserSeed>,
    /// Periodic maintenance jobs
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
}
