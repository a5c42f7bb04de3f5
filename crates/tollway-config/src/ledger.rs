use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::Deserialize;

/// Quota ledger configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    /// IANA time zone that decides where a calendar day starts
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Cost assumed by the admission probe before the real usage is known
    #[serde(default = "default_estimated_cost")]
    pub estimated_cost: Decimal,
    /// Consider time plans when selecting a funding source
    #[serde(default = "default_true")]
    pub time_plans_enabled: bool,
    /// Consider usage plans when selecting a funding source
    #[serde(default = "default_true")]
    pub usage_plans_enabled: bool,
    /// Months of request logs kept by the retention job
    #[serde(default = "default_log_retention_months")]
    pub log_retention_months: u32,
    /// Backing store
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            estimated_cost: default_estimated_cost(),
            time_plans_enabled: true,
            usage_plans_enabled: true,
            log_retention_months: default_log_retention_months(),
            store: StoreConfig::default(),
        }
    }
}

/// Where ledger and account rows live
#[derive(Debug, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum StoreConfig {
    /// Process-local maps, lost on restart
    #[default]
    Memory,
    /// `PostgreSQL` with row-level locking
    Postgres {
        url: SecretString,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_estimated_cost() -> Decimal {
    Decimal::new(5, 1)
}

#[allow(clippy::missing_const_for_fn)]
fn default_true() -> bool {
    true
}

const fn default_log_retention_months() -> u32 {
    3
}

const fn default_max_connections() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn defaults() {
        let config: LedgerConfig = toml::from_str("").unwrap();
        assert_eq!(config.timezone, "UTC");
        assert_eq!(config.estimated_cost, Decimal::new(5, 1));
        assert!(config.time_plans_enabled);
        assert!(config.usage_plans_enabled);
        assert_eq!(config.log_retention_months, 3);
        assert!(matches!(config.store, StoreConfig::Memory));
    }

    #[test]
    fn postgres_store() {
        let config: LedgerConfig = toml::from_str(
            r#"
            estimated_cost = "0.25"
            usage_plans_enabled = false

            [store]
            kind = "postgres"
            url = "postgres://tollway@localhost/tollway"
            "#,
        )
        .unwrap();

        assert_eq!(config.estimated_cost, Decimal::new(25, 2));
        assert!(!config.usage_plans_enabled);
        let StoreConfig::Postgres { url, max_connections } = config.store else {
            panic!("expected postgres store");
        };
        assert_eq!(url.expose_secret(), "postgres://tollway@localhost/tollway");
        assert_eq!(max_connections, 10);
    }

    #[test]
    fn rejects_unknown_fields() {
        let result: Result<LedgerConfig, _> = toml::from_str("currency = \"EUR\"");
        assert!(result.is_err());
    }
}
