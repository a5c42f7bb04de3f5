use std::net::SocketAddr;

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Falls back to `0.0.0.0:3000`
    pub listen_address: Option<SocketAddr>,
    #[serde(default)]
    pub health: HealthConfig,
}

/// Unauthenticated liveness route
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            path: default_health_path(),
        }
    }
}

#[allow(clippy::missing_const_for_fn)]
fn default_health_enabled() -> bool {
    true
}

fn default_health_path() -> String {
    "/health".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_defaults_on() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert!(config.listen_address.is_none());
        assert!(config.health.enabled);
        assert_eq!(config.health.path, "/health");
    }

    #[test]
    fn custom_health_route() {
        let config: ServerConfig = toml::from_str(
            r#"
            listen_address = "127.0.0.1:8080"

            [health]
            path = "/healthz"
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_address, Some(SocketAddr::from(([127, 0, 0, 1], 8080))));
        assert_eq!(config.health.path, "/healthz");
    }
}
