use std::time::Duration;

use serde::Deserialize;
use url::Url;

/// Upstream provider the relay forwards to
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Provider base URL; requests go to `{base_url}/v1/messages`
    #[serde(default = "default_base_url")]
    pub base_url: Url,
    /// Whole-request timeout for upstream calls
    #[serde(default = "default_timeout", deserialize_with = "duration_str::deserialize_duration")]
    pub timeout: Duration,
    /// Value sent as `anthropic-version`
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
    /// Value sent as `anthropic-beta`
    #[serde(default = "default_beta")]
    pub beta: String,
    /// OAuth token endpoint settings
    #[serde(default)]
    pub oauth: OAuthClientConfig,
    /// Refresh a token on use when it expires within this window
    #[serde(default = "default_refresh_buffer", deserialize_with = "duration_str::deserialize_duration")]
    pub refresh_buffer: Duration,
    /// Window used by the periodic refresh sweep
    #[serde(
        default = "default_sweep_refresh_buffer",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub sweep_refresh_buffer: Duration,
    /// Cooldown applied when the provider gives no reset time
    #[serde(
        default = "default_rate_limit_cooldown",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub rate_limit_cooldown: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout: default_timeout(),
            anthropic_version: default_anthropic_version(),
            beta: default_beta(),
            oauth: OAuthClientConfig::default(),
            refresh_buffer: default_refresh_buffer(),
            sweep_refresh_buffer: default_sweep_refresh_buffer(),
            rate_limit_cooldown: default_rate_limit_cooldown(),
        }
    }
}

/// OAuth client used to refresh upstream access tokens
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthClientConfig {
    #[serde(default = "default_token_url")]
    pub token_url: Url,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

impl Default for OAuthClientConfig {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            client_id: default_client_id(),
        }
    }
}

fn default_base_url() -> Url {
    Url::parse("https://api.anthropic.com").expect("must be valid url")
}

fn default_token_url() -> Url {
    Url::parse("https://console.anthropic.com/v1/oauth/token").expect("must be valid url")
}

fn default_client_id() -> String {
    "9d1c250a-e61b-44d9-88ed-5944d1962f5e".to_string()
}

fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}

fn default_beta() -> String {
    "oauth-2025-04-20".to_string()
}

const fn default_timeout() -> Duration {
    Duration::from_secs(120)
}

const fn default_refresh_buffer() -> Duration {
    Duration::from_secs(5 * 60)
}

const fn default_sweep_refresh_buffer() -> Duration {
    Duration::from_secs(20 * 60)
}

const fn default_rate_limit_cooldown() -> Duration {
    Duration::from_secs(5 * 60 * 60)
}
