//! `POST /v1/messages` pass-through

use std::time::Instant;

use axum::{
    Extension, Router,
    body::{Body, Bytes},
    extract::State,
    response::{IntoResponse, Response},
    routing,
};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tollway_core::{CallerIdentity, HttpError};
use tollway_telemetry::metrics;

use crate::{
    RelayError,
    billing::{BillingJob, BillingQueue},
    state::{RelaySettings, RelayState},
    usage::{self, TapOutcome, UsageTap},
};

/// Headers never copied between client and upstream
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::CONTENT_LENGTH,
];

/// Client headers replaced by the relay's own credentials or encoding
const CLIENT_ONLY: &[HeaderName] = &[
    header::HOST,
    header::AUTHORIZATION,
    header::COOKIE,
    header::ACCEPT,
    header::ACCEPT_ENCODING,
    header::CONTENT_TYPE,
];

const KEEP_ALIVE: &str = "keep-alive";
const X_API_KEY: &str = "x-api-key";
const ANTHROPIC_VERSION: &str = "anthropic-version";
const ANTHROPIC_BETA: &str = "anthropic-beta";

/// Build the relay router
pub fn relay_router(state: RelayState) -> Router {
    Router::new()
        .route("/v1/messages", routing::post(messages))
        .with_state(state)
}

/// Handle `POST /v1/messages`
async fn messages(
    State(state): State<RelayState>,
    Extension(caller): Extension<CallerIdentity>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let response = match state.relay(&caller, &headers, &body).await {
        Ok(response) => response,
        Err(e) => {
            if e.status_code().is_server_error() {
                tracing::warn!(user_id = %caller.user_id, error = %e, "relay failed");
            } else {
                tracing::debug!(user_id = %caller.user_id, error = %e, "relay refused");
            }
            e.into_response()
        }
    };

    metrics::record_relay_request(response.status().as_u16());
    response
}

/// Request body after validation, re-encoded with streaming forced on
#[derive(Debug)]
struct PreparedBody {
    model: String,
    client_stream: bool,
    payload: Vec<u8>,
}

fn prepare_body(body: &[u8]) -> Result<PreparedBody, RelayError> {
    let mut value: Value = serde_json::from_slice(body)
        .map_err(|e| RelayError::InvalidRequest(format!("request body is not valid JSON: {e}")))?;

    let object = value
        .as_object_mut()
        .ok_or_else(|| RelayError::InvalidRequest("request body must be a JSON object".to_string()))?;

    let model = match object.get("model") {
        Some(Value::String(model)) if !model.trim().is_empty() => model.clone(),
        _ => return Err(RelayError::InvalidRequest("model: field required".to_string())),
    };

    let client_stream = object.get("stream").and_then(Value::as_bool).unwrap_or(false);
    object.insert("stream".to_string(), Value::Bool(true));

    let payload = serde_json::to_vec(&value).map_err(|e| RelayError::InvalidRequest(e.to_string()))?;

    Ok(PreparedBody {
        model,
        client_stream,
        payload,
    })
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name.as_str() == KEEP_ALIVE
}

/// Client headers to send upstream, with the account's credentials in place
fn upstream_headers(client: &HeaderMap, token: &SecretString, settings: &RelaySettings) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in client {
        if is_hop_by_hop(name) || CLIENT_ONLY.contains(name) || name.as_str() == X_API_KEY {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret())) {
        headers.insert(header::AUTHORIZATION, value);
    }

    if !headers.contains_key(ANTHROPIC_VERSION)
        && let Ok(value) = HeaderValue::from_str(&settings.anthropic_version)
    {
        headers.insert(ANTHROPIC_VERSION, value);
    }

    let beta = merge_beta(headers.get(ANTHROPIC_BETA), &settings.beta);
    if let Ok(value) = HeaderValue::from_str(&beta) {
        headers.insert(ANTHROPIC_BETA, value);
    }

    headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

    headers
}

/// Append the OAuth beta flag to whatever betas the client asked for
fn merge_beta(client: Option<&HeaderValue>, required: &str) -> String {
    let Some(existing) = client.and_then(|v| v.to_str().ok()).filter(|v| !v.trim().is_empty()) else {
        return required.to_string();
    };

    if required.is_empty() || existing.split(',').any(|flag| flag.trim() == required) {
        existing.to_string()
    } else {
        format!("{existing},{required}")
    }
}

/// Upstream response headers safe to hand back to the client
fn downstream_headers(upstream: &HeaderMap) -> HeaderMap {
    upstream
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Everything needed to bill a relay except the usage it will report
struct PendingBilling {
    request_id: String,
    caller: CallerIdentity,
    account_id: String,
    model: String,
    is_stream: bool,
    status: u16,
    started: Instant,
}

impl PendingBilling {
    async fn bill_when_finished(self, usage_tap: UsageTap, billing: BillingQueue) {
        let accumulator = match usage_tap.outcome().await {
            TapOutcome::Finished(accumulator) => accumulator,
            TapOutcome::Interrupted(reason) => {
                tracing::info!(
                    request_id = %self.request_id,
                    user_id = %self.caller.user_id,
                    %reason,
                    "relay cut short, nothing billed"
                );
                return;
            }
        };

        let Some(usage) = accumulator.billable() else {
            tracing::warn!(
                request_id = %self.request_id,
                user_id = %self.caller.user_id,
                completed = accumulator.is_completed(),
                "stream ended without billable usage"
            );
            return;
        };

        billing.submit(BillingJob {
            request_id: self.request_id,
            caller: self.caller,
            account_id: self.account_id,
            model: self.model,
            usage,
            is_stream: self.is_stream,
            status: self.status,
            duration_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
        });
    }
}

impl RelayState {
    /// Admit, forward, and stream one request
    ///
    /// The returned response streams upstream bytes unchanged. Billing is
    /// queued once the stream has been fully delivered.
    pub async fn relay(
        &self,
        caller: &CallerIdentity,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Response, RelayError> {
        let started = Instant::now();
        let inner = &self.inner;

        let prepared = prepare_body(body)?;
        if !caller.allows_model(&prepared.model) {
            return Err(RelayError::ModelNotAllowed(prepared.model));
        }

        let probe = inner
            .ledger
            .check_quota(&caller.user_id, inner.settings.estimated_cost)
            .await?;
        if !probe.has_quota() {
            tracing::info!(user_id = %caller.user_id, model = %prepared.model, "{}", probe.message());
            return Err(RelayError::PaymentRequired(probe.message()));
        }

        let account = inner.accounts.select_account().await?;
        let token = inner
            .accounts
            .get_valid_access_token(&account.id)
            .await
            .inspect_err(|e| tracing::warn!(account_id = %account.id, error = %e, "no usable access token"))?;

        let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());

        let upstream = inner
            .http
            .post(&inner.settings.messages_url)
            .headers(upstream_headers(headers, &token, &inner.settings))
            .body(prepared.payload)
            .send()
            .await
            .inspect_err(|e| {
                tracing::error!(request_id = %request_id, account_id = %account.id, error = %e, "upstream request failed");
            })?;

        let status = upstream.status();
        let response_headers = downstream_headers(upstream.headers());

        if !status.is_success() {
            let upstream_headers = upstream.headers().clone();
            let error_body = upstream.bytes().await?;

            tracing::warn!(
                request_id = %request_id,
                account_id = %account.id,
                status = status.as_u16(),
                "upstream returned error"
            );

            if let Err(e) = inner
                .accounts
                .report_response(&account.id, status, &upstream_headers, &error_body)
                .await
            {
                tracing::warn!(account_id = %account.id, error = %e, "failed to record upstream error");
            }

            return Ok(build_response(status, response_headers, Body::from(error_body)));
        }

        if let Err(e) = inner.accounts.record_success(&account.id).await {
            tracing::warn!(account_id = %account.id, error = %e, "failed to record upstream success");
        }

        let (stream, usage_tap) = usage::tap(Box::pin(upstream.bytes_stream()));
        let pending = PendingBilling {
            request_id,
            caller: caller.clone(),
            account_id: account.id,
            model: prepared.model,
            is_stream: prepared.client_stream,
            status: status.as_u16(),
            started,
        };
        tokio::spawn(pending.bill_when_finished(usage_tap, inner.billing.clone()));

        Ok(build_response(status, response_headers, Body::from_stream(stream)))
    }
}
