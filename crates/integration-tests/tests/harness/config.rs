//! Programmatic configuration builder for integration tests

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use jiff::{SignedDuration, Timestamp};
use rust_decimal::Decimal;
use secrecy::SecretString;
use tollway_config::{
    AccountSeed, ApiKeyConfig, Config, HealthConfig, LedgerConfig, ModelPriceConfig, PricingConfig, SchedulerConfig,
    ServerConfig, UpstreamConfig, UserSeed,
};

pub const MODEL: &str = "claude-sonnet-4";

/// Builder for constructing test configurations
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Minimal config pointed at a mock upstream
    ///
    /// Background jobs are off so tests drive state changes themselves.
    pub fn new(upstream_url: &str) -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            MODEL.to_string(),
            ModelPriceConfig {
                input: Decimal::from(3),
                output: Decimal::from(15),
                cache_write: Decimal::new(375, 2),
                cache_read: Decimal::new(30, 2),
            },
        );

        let mut upstream = UpstreamConfig {
            base_url: upstream_url.parse().expect("valid URL"),
            timeout: Duration::from_secs(10),
            ..UpstreamConfig::default()
        };
        upstream.oauth.token_url = format!("{upstream_url}/v1/oauth/token").parse().expect("valid URL");
        upstream.oauth.client_id = "test-client".to_string();

        Self {
            config: Config {
                server: ServerConfig {
                    listen_address: Some(SocketAddr::from(([127, 0, 0, 1], 0))),
                    health: HealthConfig::default(),
                },
                ledger: LedgerConfig::default(),
                pricing: PricingConfig {
                    models,
                    ..PricingConfig::default()
                },
                upstream,
                accounts: Vec::new(),
                keys: Vec::new(),
                users: Vec::new(),
                scheduler: SchedulerConfig {
                    enabled: false,
                    ..SchedulerConfig::default()
                },
                telemetry: None,
            },
        }
    }

    /// Add a caller key for `user_id` limited to the test model
    pub fn with_key(mut self, user_id: &str, secret: &str) -> Self {
        self.config.keys.push(ApiKeyConfig {
            id: format!("key-{user_id}"),
            user_id: user_id.to_owned(),
            key: SecretString::from(secret),
            models: vec![MODEL.to_string()],
            enabled: true,
            expires_at: None,
            daily_limit: None,
        });
        self
    }

    /// Add a caller key that expired an hour ago
    pub fn with_expired_key(mut self, user_id: &str, secret: &str) -> Self {
        self.config.keys.push(ApiKeyConfig {
            id: format!("expired-{user_id}"),
            user_id: user_id.to_owned(),
            key: SecretString::from(secret),
            models: Vec::new(),
            enabled: true,
            expires_at: Some(Timestamp::now() - SignedDuration::from_hours(1)),
            daily_limit: None,
        });
        self
    }

    /// Add a caller key that may spend `daily_limit` dollars a day
    pub fn with_limited_key(mut self, user_id: &str, secret: &str, daily_limit: Decimal) -> Self {
        self.config.keys.push(ApiKeyConfig {
            id: format!("limited-{user_id}"),
            user_id: user_id.to_owned(),
            key: SecretString::from(secret),
            models: vec![MODEL.to_string()],
            enabled: true,
            expires_at: None,
            daily_limit: Some(daily_limit),
        });
        self
    }

    /// Add a disabled caller key
    pub fn with_disabled_key(mut self, user_id: &str, secret: &str) -> Self {
        self.config.keys.push(ApiKeyConfig {
            id: format!("disabled-{user_id}"),
            user_id: user_id.to_owned(),
            key: SecretString::from(secret),
            models: Vec::new(),
            enabled: false,
            expires_at: None,
            daily_limit: None,
        });
        self
    }

    /// Seed a user with a cash balance and no plans
    pub fn with_balance(mut self, user_id: &str, balance: Decimal) -> Self {
        self.config.users.push(UserSeed {
            id: user_id.to_owned(),
            balance,
            usage_plans: Vec::new(),
            time_plans: Vec::new(),
        });
        self
    }

    /// Add an upstream account whose token stays valid for an hour
    pub fn with_account(self, id: &str) -> Self {
        let expires_at = jiff::Timestamp::now().as_second() + 3600;
        self.with_account_expiring(id, expires_at)
    }

    /// Add an upstream account with a refresh token and a given expiry
    pub fn with_account_expiring(mut self, id: &str, expires_at: i64) -> Self {
        self.config.accounts.push(AccountSeed {
            id: id.to_owned(),
            name: None,
            access_token: SecretString::from(format!("access-{id}")),
            refresh_token: Some(SecretString::from(format!("refresh-{id}"))),
            expires_at,
        });
        self
    }

    /// Disable health endpoint
    pub fn without_health(mut self) -> Self {
        self.config.server.health.enabled = false;
        self
    }

    /// Build the final config
    pub fn build(self) -> Config {
        self.config
    }
}
