//! OAuth access-token refresh

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tollway_config::OAuthClientConfig;
use url::Url;

use crate::AccountError;

/// Tokens returned by a refresh
#[derive(Debug)]
pub struct RefreshedToken {
    pub access_token: SecretString,
    /// Rotated refresh token, `None` when the old one stays valid
    pub refresh_token: Option<SecretString>,
    /// Lifetime of the new access token in seconds
    pub expires_in: i64,
}

/// Exchanges a refresh token for a new access token
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<RefreshedToken, AccountError>;
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
    client_id: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: i64,
}

/// Refresh-token grant against the provider's OAuth token endpoint
#[derive(Debug, Clone)]
pub struct OAuthRefresher {
    http: reqwest::Client,
    token_url: Url,
    client_id: String,
}

impl OAuthRefresher {
    const TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(token_url: Url, client_id: String) -> Result<Self, AccountError> {
        let http = reqwest::Client::builder().timeout(Self::TIMEOUT).build()?;

        Ok(Self {
            http,
            token_url,
            client_id,
        })
    }

    pub fn from_config(config: &OAuthClientConfig) -> Result<Self, AccountError> {
        Self::new(config.token_url.clone(), config.client_id.clone())
    }
}

#[async_trait::async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<RefreshedToken, AccountError> {
        let body = RefreshRequest {
            grant_type: "refresh_token",
            refresh_token: refresh_token.expose_secret(),
            client_id: &self.client_id,
        };

        let response = self
            .http
            .post(self.token_url.clone())
            .header(http::header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(AccountError::RefreshRejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AccountError::RefreshResponse(e.to_string()))?;

        if token.access_token.is_empty() {
            return Err(AccountError::RefreshResponse("missing access_token".to_string()));
        }

        Ok(RefreshedToken {
            access_token: SecretString::from(token.access_token),
            refresh_token: token
                .refresh_token
                .filter(|token| !token.is_empty())
                .map(SecretString::from),
            expires_in: token.expires_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, method, path},
    };

    use super::*;

    async fn refresher(server: &MockServer) -> OAuthRefresher {
        let url = Url::parse(&format!("{}/v1/oauth/token", server.uri())).unwrap();
        OAuthRefresher::new(url, "client-123".to_string()).unwrap()
    }

    #[tokio::test]
    async fn posts_refresh_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .and(body_json(serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": "rt-old",
                "client_id": "client-123",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-new",
                "refresh_token": "rt-new",
                "expires_in": 28800,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = refresher(&server)
            .await
            .refresh(&SecretString::from("rt-old"))
            .await
            .unwrap();

        assert_eq!(token.access_token.expose_secret(), "at-new");
        assert_eq!(token.refresh_token.unwrap().expose_secret(), "rt-new");
        assert_eq!(token.expires_in, 28800);
    }

    #[tokio::test]
    async fn keeps_refresh_token_when_not_rotated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-new",
                "expires_in": 3600,
            })))
            .mount(&server)
            .await;

        let token = refresher(&server)
            .await
            .refresh(&SecretString::from("rt"))
            .await
            .unwrap();
        assert!(token.refresh_token.is_none());
    }

    #[tokio::test]
    async fn non_200_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#))
            .mount(&server)
            .await;

        let error = refresher(&server)
            .await
            .refresh(&SecretString::from("rt"))
            .await
            .unwrap_err();

        assert!(matches!(error, AccountError::RefreshRejected { status: 400, ref body } if body.contains("invalid_grant")));
    }

    #[tokio::test]
    async fn missing_access_token_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "expires_in": 10 })))
            .mount(&server)
            .await;

        let error = refresher(&server)
            .await
            .refresh(&SecretString::from("rt"))
            .await
            .unwrap_err();
        assert!(matches!(error, AccountError::RefreshResponse(_)));
    }
}
