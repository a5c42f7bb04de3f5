use secrecy::SecretString;
use serde::Deserialize;

/// Upstream credential seeded into the account store at startup
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountSeed {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub access_token: SecretString,
    #[serde(default)]
    pub refresh_token: Option<SecretString>,
    /// Access token expiry as Unix seconds, 0 when unknown
    #[serde(default)]
    pub expires_at: i64,
}
