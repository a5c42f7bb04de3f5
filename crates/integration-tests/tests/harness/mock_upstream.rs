//! Mock Anthropic backend for integration tests
//!
//! Serves `/v1/messages` as a server-sent event stream and the OAuth
//! refresh-token grant, counting every call it receives.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Token issued by the mock refresh endpoint
pub const REFRESHED_ACCESS_TOKEN: &str = "refreshed-access";

/// How the mock answers `/v1/messages`
#[derive(Debug, Clone)]
pub enum Reply {
    /// A complete stream reporting the given usage
    Stream { input_tokens: u64, output_tokens: u64 },
    /// A stream cut off before `message_stop`
    Truncated,
    /// 429 with an optional reset header in Unix seconds
    RateLimited { reset_at: Option<i64> },
    /// A JSON error with the given status
    Error { status: u16 },
}

/// Mock upstream provider
pub struct MockUpstream {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<MockState>,
}

struct MockState {
    reply: Mutex<Reply>,
    message_count: AtomicU32,
    refresh_count: AtomicU32,
    refresh_fails: AtomicBool,
    last_authorization: Mutex<Option<String>>,
    last_body: Mutex<Option<Value>>,
}

impl MockUpstream {
    /// Start a mock that streams 1000 input and 500 output tokens
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(Reply::Stream {
            input_tokens: 1000,
            output_tokens: 500,
        })
        .await
    }

    pub async fn start_with(reply: Reply) -> anyhow::Result<Self> {
        let state = Arc::new(MockState {
            reply: Mutex::new(reply),
            message_count: AtomicU32::new(0),
            refresh_count: AtomicU32::new(0),
            refresh_fails: AtomicBool::new(false),
            last_authorization: Mutex::new(None),
            last_body: Mutex::new(None),
        });

        let app = Router::new()
            .route("/v1/messages", routing::post(handle_messages))
            .route("/v1/oauth/token", routing::post(handle_token))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_clone.cancelled().await;
                })
                .await
                .ok();
        });

        Ok(Self { addr, shutdown, state })
    }

    /// Base URL, without a trailing slash
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Change the reply for subsequent requests
    pub fn set_reply(&self, reply: Reply) {
        *self.state.reply.lock().unwrap() = reply;
    }

    /// Make the token endpoint reject refresh grants
    pub fn fail_refresh(&self) {
        self.state.refresh_fails.store(true, Ordering::Relaxed);
    }

    pub fn message_count(&self) -> u32 {
        self.state.message_count.load(Ordering::Relaxed)
    }

    pub fn refresh_count(&self) -> u32 {
        self.state.refresh_count.load(Ordering::Relaxed)
    }

    /// `Authorization` header of the last messages request
    pub fn last_authorization(&self) -> Option<String> {
        self.state.last_authorization.lock().unwrap().clone()
    }

    /// JSON body of the last messages request
    pub fn last_body(&self) -> Option<Value> {
        self.state.last_body.lock().unwrap().clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Anthropic event stream with usage split across start and delta events
pub fn sse_stream(input_tokens: u64, output_tokens: u64, complete: bool) -> String {
    let mut events = vec![
        (
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": "msg_mock",
                    "type": "message",
                    "role": "assistant",
                    "model": "claude-sonnet-4",
                    "content": [],
                    "usage": {"input_tokens": input_tokens, "output_tokens": 1}
                }
            }),
        ),
        (
            "content_block_start",
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        ),
        (
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hello"}}),
        ),
    ];

    if complete {
        events.extend([
            ("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
            (
                "message_delta",
                json!({
                    "type": "message_delta",
                    "delta": {"stop_reason": "end_turn"},
                    "usage": {"output_tokens": output_tokens}
                }),
            ),
            ("message_stop", json!({"type": "message_stop"})),
        ]);
    }

    events
        .into_iter()
        .map(|(event, data)| format!("event: {event}\ndata: {data}\n\n"))
        .collect()
}

async fn handle_messages(State(state): State<Arc<MockState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    state.message_count.fetch_add(1, Ordering::Relaxed);
    *state.last_authorization.lock().unwrap() = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    *state.last_body.lock().unwrap() = Some(body);

    let reply = state.reply.lock().unwrap().clone();

    match reply {
        Reply::Stream {
            input_tokens,
            output_tokens,
        } => event_stream(sse_stream(input_tokens, output_tokens, true)),
        Reply::Truncated => event_stream(sse_stream(1000, 0, false)),
        Reply::RateLimited { reset_at } => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "type": "error",
                    "error": {"type": "rate_limit_error", "message": "Number of requests has exceeded your rate limit"}
                })),
            )
                .into_response();
            if let Some(reset_at) = reset_at {
                response
                    .headers_mut()
                    .insert("anthropic-ratelimit-unified-reset", reset_at.into());
            }
            response
        }
        Reply::Error { status } => (
            StatusCode::from_u16(status).unwrap(),
            Json(json!({"type": "error", "error": {"type": "api_error", "message": "mock failure"}})),
        )
            .into_response(),
    }
}

fn event_stream(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn handle_token(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    state.refresh_count.fetch_add(1, Ordering::Relaxed);

    if state.refresh_fails.load(Ordering::Relaxed) || body["grant_type"] != "refresh_token" {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_grant"}))).into_response();
    }

    Json(json!({
        "access_token": REFRESHED_ACCESS_TOKEN,
        "refresh_token": "refreshed-refresh",
        "expires_in": 3600
    }))
    .into_response()
}
