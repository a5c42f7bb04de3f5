use jiff::Timestamp;
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::Deserialize;

/// Caller API key
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeyConfig {
    pub id: String,
    /// Ledger owner charged for requests made with this key
    pub user_id: String,
    pub key: SecretString,
    /// Models this key may call, empty for no restriction
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Key is rejected from this instant on
    #[serde(default)]
    pub expires_at: Option<Timestamp>,
    /// Dollars this key may spend per ledger day
    #[serde(default)]
    pub daily_limit: Option<Decimal>,
}

#[allow(clippy::missing_const_for_fn)]
fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_optional() {
        let key: ApiKeyConfig = toml::from_str(
            r#"
            id = "k1"
            user_id = "alice"
            key = "sk-alice"
            "#,
        )
        .unwrap();
        assert!(key.enabled);
        assert!(key.expires_at.is_none());
        assert!(key.daily_limit.is_none());

        let key: ApiKeyConfig = toml::from_str(
            r#"
            id = "k1"
            user_id = "alice"
            key = "sk-alice"
            expires_at = "2026-01-01T00:00:00Z"
            daily_limit = "2.5"
            "#,
        )
        .unwrap();
        assert_eq!(key.expires_at, Some("2026-01-01T00:00:00Z".parse().unwrap()));
        assert_eq!(key.daily_limit, Some(Decimal::new(25, 1)));
    }
}
