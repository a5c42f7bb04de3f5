use std::{collections::HashSet, path::Path};

use rust_decimal::Decimal;
use secrecy::ExposeSecret;

use crate::{Config, StoreConfig};

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Reads the file, expands `{{ env.VAR }}` placeholders, then
    /// deserializes and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, environment variable
    /// expansion fails, TOML parsing fails, or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if expansion, parsing, or validation fails
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let expanded =
            crate::env::expand_env(raw).map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self = toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistency found
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_ledger()?;
        self.validate_pricing()?;
        self.validate_accounts()?;
        self.validate_keys()?;
        self.validate_scheduler()?;
        Ok(())
    }

    fn validate_ledger(&self) -> anyhow::Result<()> {
        jiff::tz::TimeZone::get(&self.ledger.timezone)
            .map_err(|e| anyhow::anyhow!("ledger.timezone '{}' is not a known time zone: {e}", self.ledger.timezone))?;

        if self.ledger.estimated_cost < Decimal::ZERO {
            anyhow::bail!("ledger.estimated_cost must not be negative");
        }

        if self.ledger.log_retention_months == 0 {
            anyhow::bail!("ledger.log_retention_months must be greater than 0");
        }

        if let StoreConfig::Postgres { url, max_connections } = &self.ledger.store {
            if url.expose_secret().is_empty() {
                anyhow::bail!("ledger.store.url must not be empty");
            }
            if *max_connections == 0 {
                anyhow::bail!("ledger.store.max_connections must be greater than 0");
            }
        }

        let mut seen = HashSet::new();
        for user in &self.users {
            if !seen.insert(user.id.as_str()) {
                anyhow::bail!("user '{}' is seeded more than once", user.id);
            }
            if user.balance < Decimal::ZERO {
                anyhow::bail!("user '{}' has a negative seed balance", user.id);
            }
            if user.time_plans.iter().any(|plan| plan.days == 0 || plan.daily_limit == 0) {
                anyhow::bail!("user '{}' has a time plan with zero days or zero daily limit", user.id);
            }
        }

        Ok(())
    }

    fn validate_pricing(&self) -> anyhow::Result<()> {
        for (model, price) in &self.pricing.models {
            let prices = [price.input, price.output, price.cache_write, price.cache_read];
            if prices.iter().any(|p| *p < Decimal::ZERO) {
                anyhow::bail!("pricing for model '{model}' contains a negative price");
            }
        }

        if self.pricing.refresh_interval.is_zero() {
            anyhow::bail!("pricing.refresh_interval must be greater than 0");
        }

        Ok(())
    }

    fn validate_accounts(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.id.as_str()) {
                anyhow::bail!("upstream account '{}' is defined more than once", account.id);
            }
            if account.access_token.expose_secret().is_empty() {
                anyhow::bail!("upstream account '{}' has an empty access token", account.id);
            }
        }

        if self.upstream.sweep_refresh_buffer < self.upstream.refresh_buffer {
            anyhow::bail!("upstream.sweep_refresh_buffer must not be shorter than upstream.refresh_buffer");
        }

        Ok(())
    }

    fn validate_keys(&self) -> anyhow::Result<()> {
        let mut ids = HashSet::new();
        let mut secrets = HashSet::new();
        for key in &self.keys {
            if !ids.insert(key.id.as_str()) {
                anyhow::bail!("api key '{}' is defined more than once", key.id);
            }
            let secret = key.key.expose_secret();
            if secret.is_empty() {
                anyhow::bail!("api key '{}' has an empty secret", key.id);
            }
            if !secrets.insert(secret) {
                anyhow::bail!("api key '{}' reuses the secret of another key", key.id);
            }
            if key.daily_limit.is_some_and(|limit| limit <= Decimal::ZERO) {
                anyhow::bail!("api key '{}' must have a positive daily_limit", key.id);
            }
        }

        Ok(())
    }

    fn validate_scheduler(&self) -> anyhow::Result<()> {
        if self.scheduler.rate_limit_sweep.is_zero() || self.scheduler.token_refresh_sweep.is_zero() {
            anyhow::bail!("scheduler sweep intervals must be greater than 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::Config;

    const MINIMAL: &str = r#"
        [[accounts]]
        id = "acct-1"
        access_token = "at-1"
        refresh_token = "rt-1"
        expires_at = 1750000000

        [[keys]]
        id = "key-1"
        user_id = "alice"
        key = "sk-alice"
        models = ["claude-sonnet-4"]

        [[users]]
        id = "alice"
        balance = "10"
    "#;

    #[test]
    fn minimal_config_loads() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.accounts.len(), 1);
        assert_eq!(config.keys[0].user_id, "alice");
        assert!(config.scheduler.enabled);
    }

    #[test]
    fn expands_secrets_from_env() {
        let raw = r#"
            [[accounts]]
            id = "acct-1"
            access_token = "{{ env.TW_ACCESS }}"
            refresh_token = "{{ env.TW_REFRESH | default("none") }}"
        "#;

        temp_env::with_vars([("TW_ACCESS", Some("at-env")), ("TW_REFRESH", None::<&str>)], || {
            let config = Config::from_toml(raw).unwrap();
            let account = &config.accounts[0];
            assert_eq!(secrecy::ExposeSecret::expose_secret(&account.access_token), "at-env");
            let refresh = account.refresh_token.as_ref().unwrap();
            assert_eq!(secrecy::ExposeSecret::expose_secret(refresh), "none");
        });
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let raw = "[ledger]\ntimezone = \"Mars/Olympus_Mons\"";
        let err = Config::from_toml(raw).unwrap_err();
        assert!(err.to_string().contains("ledger.timezone"));
    }

    #[test]
    fn duplicate_account_is_rejected() {
        let raw = r#"
            [[accounts]]
            id = "a"
            access_token = "x"

            [[accounts]]
            id = "a"
            access_token = "y"
        "#;
        let err = Config::from_toml(raw).unwrap_err();
        assert!(err.to_string().contains("defined more than once"));
    }

    #[test]
    fn shared_key_secret_is_rejected() {
        let raw = r#"
            [[keys]]
            id = "k1"
            user_id = "a"
            key = "same"

            [[keys]]
            id = "k2"
            user_id = "b"
            key = "same"
        "#;
        let err = Config::from_toml(raw).unwrap_err();
        assert!(err.to_string().contains("reuses the secret"));
    }

    #[test]
    fn non_positive_key_limit_is_rejected() {
        let raw = r#"
            [[keys]]
            id = "k1"
            user_id = "a"
            key = "secret"
            daily_limit = "0"
        "#;
        let err = Config::from_toml(raw).unwrap_err();
        assert!(err.to_string().contains("positive daily_limit"));
    }

    #[test]
    fn negative_price_is_rejected() {
        let raw = r#"
            [pricing.models.bad]
            input = "-1"
            output = "1"
        "#;
        let err = Config::from_toml(raw).unwrap_err();
        assert!(err.to_string().contains("negative price"));
    }

    #[test]
    fn sweep_buffer_shorter_than_refresh_buffer_is_rejected() {
        let raw = r#"
            [upstream]
            refresh_buffer = "30m"
            sweep_refresh_buffer = "10m"
        "#;
        assert!(Config::from_toml(raw).is_err());
    }
}
