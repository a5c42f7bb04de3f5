use std::{collections::BTreeMap, time::Duration};

use rust_decimal::Decimal;
use serde::Deserialize;

/// Model price table served by the pricing resolver
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    /// Maximum age of the cached price table
    #[serde(default = "default_refresh_interval", deserialize_with = "duration_str::deserialize_duration")]
    pub refresh_interval: Duration,
    /// Prices keyed by model name; the `unknown` row is the fallback
    #[serde(default)]
    pub models: BTreeMap<String, ModelPriceConfig>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            models: BTreeMap::new(),
        }
    }
}

/// USD per 1,000,000 tokens for each token category
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelPriceConfig {
    pub input: Decimal,
    pub output: Decimal,
    #[serde(default)]
    pub cache_write: Decimal,
    #[serde(default)]
    pub cache_read: Decimal,
}

const fn default_refresh_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_models() {
        let config: PricingConfig = toml::from_str(
            r#"
            refresh_interval = "1m"

            [models.claude-sonnet-4]
            input = "3.00"
            output = "15.00"
            cache_write = "3.75"
            cache_read = "0.30"

            [models.unknown]
            input = 3
            output = 15
            "#,
        )
        .unwrap();

        assert_eq!(config.refresh_interval, Duration::from_secs(60));
        assert_eq!(config.models["claude-sonnet-4"].cache_read, Decimal::new(30, 2));
        assert_eq!(config.models["unknown"].cache_write, Decimal::ZERO);
    }

    #[test]
    fn default_refresh_is_five_minutes() {
        let config = PricingConfig::default();
        assert_eq!(config.refresh_interval, Duration::from_secs(300));
        assert!(config.models.is_empty());
    }
}
