use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jiff::Timestamp;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use tollway_config::ApiKeyConfig;
use tollway_core::{CallerIdentity, HttpError, SharedClock};
use tollway_ledger::Ledger;
use tollway_relay::RelayError;
use tollway_telemetry::metrics;

const X_API_KEY: &str = "x-api-key";

/// Configured caller keys, indexed by the SHA-256 digest of the secret
#[derive(Debug, Default)]
pub struct ApiKeys {
    by_digest: HashMap<String, KeyEntry>,
}

#[derive(Debug)]
struct KeyEntry {
    identity: CallerIdentity,
    enabled: bool,
    expires_at: Option<Timestamp>,
    daily_limit: Option<Decimal>,
}

fn digest(secret: &str) -> String {
    format!("{:x}", Sha256::digest(secret.as_bytes()))
}

impl ApiKeys {
    pub fn from_config(keys: &[ApiKeyConfig]) -> Self {
        let by_digest = keys
            .iter()
            .map(|key| {
                let identity = CallerIdentity {
                    user_id: key.user_id.clone(),
                    api_key_id: key.id.clone(),
                    allowed_models: key.models.iter().map(|m| m.to_lowercase()).collect(),
                };
                let entry = KeyEntry {
                    identity,
                    enabled: key.enabled,
                    expires_at: key.expires_at,
                    daily_limit: key.daily_limit,
                };
                (digest(key.key.expose_secret()), entry)
            })
            .collect();

        Self { by_digest }
    }

    /// Entry behind a presented secret, if the key exists and is enabled
    fn lookup(&self, secret: &str) -> Option<&KeyEntry> {
        self.by_digest.get(&digest(secret)).filter(|entry| entry.enabled)
    }

    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }
}

/// Decides whether a presented key may make a relay request
///
/// Beyond the key lookup this enforces each key's expiry and its daily
/// cost limit. Spend is read from the request log, which the billing
/// queue writes after each request, so a burst of concurrent requests can
/// overshoot the limit by what is still in flight.
#[derive(Debug)]
pub struct KeyGuard {
    keys: ApiKeys,
    ledger: Arc<Ledger>,
    clock: SharedClock,
}

impl KeyGuard {
    pub const fn new(keys: ApiKeys, ledger: Arc<Ledger>, clock: SharedClock) -> Self {
        Self { keys, ledger, clock }
    }

    pub const fn keys(&self) -> &ApiKeys {
        &self.keys
    }

    pub async fn admit(&self, secret: Option<&str>) -> Result<CallerIdentity, RelayError> {
        let entry = secret
            .and_then(|secret| self.keys.lookup(secret))
            .ok_or(RelayError::Unauthorized)?;
        let key_id = &entry.identity.api_key_id;

        if entry.expires_at.is_some_and(|at| at <= self.clock.now()) {
            return Err(RelayError::KeyExpired);
        }

        if let Some(limit) = entry.daily_limit {
            let spent = self.ledger.api_key_cost_today(key_id).await?;
            if spent >= limit {
                tracing::info!(api_key_id = %key_id, %spent, %limit, "API key daily cost limit reached");
                return Err(RelayError::KeyDailyLimit);
            }
        }

        Ok(entry.identity.clone())
    }
}

/// Secret from `x-api-key`, falling back to `Authorization: Bearer`
fn presented_key(request: &Request) -> Option<&str> {
    let headers = request.headers();

    headers
        .get(X_API_KEY)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

/// Authenticate relay requests by API key
///
/// Inserts the caller's [`CallerIdentity`] for the relay handler. Missing,
/// unknown, and disabled keys are all rejected the same way.
pub async fn auth_middleware(guard: Arc<KeyGuard>, request: Request, next: Next) -> Response {
    let secret = presented_key(&request).map(str::to_owned);

    let identity = match guard.admit(secret.as_deref()).await {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(path = %request.uri().path(), error = %e, "API key rejected");
            metrics::record_relay_request(e.status_code().as_u16());
            return e.into_response();
        }
    };

    let mut request = request;
    request.extensions_mut().insert(identity);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use jiff::SignedDuration;
    use rust_decimal_macros::dec;
    use secrecy::SecretString;
    use tollway_core::{Clock, ManualClock, TokenUsage};
    use tollway_ledger::{LedgerSettings, MemoryLedgerStore, RequestLog};

    use super::*;

    fn key(id: &str, user: &str, secret: &str, enabled: bool) -> ApiKeyConfig {
        ApiKeyConfig {
            id: id.to_string(),
            user_id: user.to_string(),
            key: SecretString::from(secret),
            models: vec!["Claude-Sonnet-4".to_string()],
            enabled,
            expires_at: None,
            daily_limit: None,
        }
    }

    fn guard(keys: &[ApiKeyConfig]) -> (KeyGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new("2025-06-10T12:00:00Z".parse().unwrap()));
        let ledger = Ledger::new(
            Arc::new(MemoryLedgerStore::new()),
            clock.clone(),
            LedgerSettings::default(),
        );
        let guard = KeyGuard::new(ApiKeys::from_config(keys), Arc::new(ledger), clock.clone());
        (guard, clock)
    }

    #[tokio::test]
    async fn admits_enabled_keys_only() {
        let (guard, _) = guard(&[key("k1", "alice", "sk-alice", true), key("k2", "bob", "sk-bob", false)]);

        let alice = guard.admit(Some("sk-alice")).await.unwrap();
        assert_eq!(alice.user_id, "alice");
        assert_eq!(alice.allowed_models, vec!["claude-sonnet-4".to_string()]);
        assert!(matches!(guard.admit(Some("sk-bob")).await, Err(RelayError::Unauthorized)));
        assert!(matches!(guard.admit(Some("sk-mallory")).await, Err(RelayError::Unauthorized)));
        assert!(matches!(guard.admit(None).await, Err(RelayError::Unauthorized)));
    }

    #[tokio::test]
    async fn expired_key_is_rejected() {
        let mut k1 = key("k1", "alice", "sk-alice", true);
        k1.expires_at = Some("2025-06-10T13:00:00Z".parse().unwrap());
        let (guard, clock) = guard(&[k1]);

        assert!(guard.admit(Some("sk-alice")).await.is_ok());

        clock.advance(SignedDuration::from_hours(1));
        let error = guard.admit(Some("sk-alice")).await.unwrap_err();
        assert!(matches!(error, RelayError::KeyExpired));
        assert_eq!(error.status_code(), http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn daily_limit_counts_todays_spend_only() {
        let mut k1 = key("k1", "alice", "sk-alice", true);
        k1.daily_limit = Some(dec!(1));
        let (guard, clock) = guard(&[k1]);

        let spend = |cost: Decimal, created_at: Timestamp| RequestLog {
            request_id: "r".to_string(),
            user_id: "alice".to_string(),
            api_key_id: Some("k1".to_string()),
            account_id: None,
            model: "claude-sonnet-4".to_string(),
            usage: TokenUsage::default(),
            cost_usd: cost,
            is_stream: false,
            status: 200,
            duration_ms: 10,
            created_at,
        };

        guard.ledger.record_request(&spend(dec!(0.6), clock.now())).await.unwrap();
        assert!(guard.admit(Some("sk-alice")).await.is_ok());

        guard.ledger.record_request(&spend(dec!(0.4), clock.now())).await.unwrap();
        let error = guard.admit(Some("sk-alice")).await.unwrap_err();
        assert!(matches!(error, RelayError::KeyDailyLimit));
        assert_eq!(error.status_code(), http::StatusCode::TOO_MANY_REQUESTS);

        clock.advance(SignedDuration::from_hours(24));
        assert!(guard.admit(Some("sk-alice")).await.is_ok());
    }

    #[test]
    fn secrets_are_not_kept_in_plain_text() {
        let keys = ApiKeys::from_config(&[key("k1", "alice", "sk-alice", true)]);
        assert!(!format!("{keys:?}").contains("sk-alice"));
    }

    #[test]
    fn reads_either_header() {
        let request = Request::builder()
            .header(X_API_KEY, "sk-one")
            .header("authorization", "Bearer sk-two")
            .body(Body::empty())
            .unwrap();
        assert_eq!(presented_key(&request), Some("sk-one"));

        let request = Request::builder()
            .header("authorization", "Bearer sk-two")
            .body(Body::empty())
            .unwrap();
        assert_eq!(presented_key(&request), Some("sk-two"));

        let request = Request::builder()
            .header("authorization", "Basic abc")
            .body(Body::empty())
            .unwrap();
        assert_eq!(presented_key(&request), None);
    }
}
