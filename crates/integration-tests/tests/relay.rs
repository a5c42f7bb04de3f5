//! End-to-end metering through the messages relay

mod harness;

use harness::config::{ConfigBuilder, MODEL};
use harness::eventually;
use harness::mock_upstream::{MockUpstream, Reply, sse_stream};
use harness::server::TestServer;
use rust_decimal_macros::dec;
use serde_json::json;

const KEY: &str = "sk-alice";

fn request(stream: bool) -> serde_json::Value {
    json!({
        "model": MODEL,
        "max_tokens": 256,
        "stream": stream,
        "messages": [{"role": "user", "content": "Hello"}]
    })
}

#[tokio::test]
async fn streams_response_and_bills_real_usage() {
    let mock = MockUpstream::start().await.unwrap();
    let config = ConfigBuilder::new(&mock.base_url())
        .with_key("alice", KEY)
        .with_balance("alice", dec!(1))
        .with_account("acct-1")
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server.send_message(KEY, &request(true)).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");

    let body = resp.text().await.unwrap();
    assert_eq!(body, sse_stream(1000, 500, true));

    assert_eq!(mock.last_authorization().as_deref(), Some("Bearer access-acct-1"));

    // 1000 input at $3/M plus 500 output at $15/M
    let billed = eventually(|| async { server.ledger().user_stats("alice").await.unwrap().balance == dec!(0.9895) }).await;
    assert!(billed, "usage was not charged");

    let stats = server.ledger().user_stats("alice").await.unwrap();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.total_consumed, dec!(0.0105));
}

#[tokio::test]
async fn upstream_always_receives_a_stream_request() {
    let mock = MockUpstream::start().await.unwrap();
    let config = ConfigBuilder::new(&mock.base_url())
        .with_key("alice", KEY)
        .with_balance("alice", dec!(1))
        .with_account("acct-1")
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server.send_message(KEY, &request(false)).await;
    assert_eq!(resp.status(), 200);
    resp.text().await.unwrap();

    let body = mock.last_body().unwrap();
    assert_eq!(body["stream"], true);
    assert_eq!(body["model"], MODEL);
}

#[tokio::test]
async fn truncated_stream_is_not_billed() {
    let mock = MockUpstream::start_with(Reply::Truncated).await.unwrap();
    let config = ConfigBuilder::new(&mock.base_url())
        .with_key("alice", KEY)
        .with_balance("alice", dec!(1))
        .with_account("acct-1")
        .build();

    let server = TestServer::start(config).await.unwrap();
    let ledger = server.ledger().clone();

    let resp = server.send_message(KEY, &request(true)).await;
    assert_eq!(resp.status(), 200);
    resp.text().await.unwrap();

    server.shutdown().await;

    let stats = ledger.user_stats("alice").await.unwrap();
    assert_eq!(stats.balance, dec!(1));
    assert_eq!(stats.total_requests, 0);
}

#[tokio::test]
async fn shutdown_waits_for_queued_billing() {
    let mock = MockUpstream::start().await.unwrap();
    let config = ConfigBuilder::new(&mock.base_url())
        .with_key("alice", KEY)
        .with_balance("alice", dec!(1))
        .with_account("acct-1")
        .build();

    let server = TestServer::start(config).await.unwrap();
    let ledger = server.ledger().clone();

    for _ in 0..3 {
        let resp = server.send_message(KEY, &request(true)).await;
        resp.text().await.unwrap();
    }

    server.shutdown().await;

    let stats = ledger.user_stats("alice").await.unwrap();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.balance, dec!(0.9685));
}

#[tokio::test]
async fn empty_funding_is_payment_required() {
    let mock = MockUpstream::start().await.unwrap();
    let config = ConfigBuilder::new(&mock.base_url())
        .with_key("bob", "sk-bob")
        .with_account("acct-1")
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server.send_message("sk-bob", &request(true)).await;
    assert_eq!(resp.status(), 402);

    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["type"], "error");
    assert_eq!(json["error"]["type"], "payment_required");

    assert_eq!(mock.message_count(), 0);
}

#[tokio::test]
async fn rejects_unknown_and_disabled_keys() {
    let mock = MockUpstream::start().await.unwrap();
    let config = ConfigBuilder::new(&mock.base_url())
        .with_key("alice", KEY)
        .with_disabled_key("mallory", "sk-mallory")
        .with_balance("alice", dec!(1))
        .with_account("acct-1")
        .build();

    let server = TestServer::start(config).await.unwrap();

    for key in ["sk-unknown", "sk-mallory"] {
        let resp = server.send_message(key, &request(true)).await;
        assert_eq!(resp.status(), 401);

        let json: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(json["error"]["type"], "authentication_error");
    }

    let resp = server
        .client()
        .post(server.url("/v1/messages"))
        .json(&request(true))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = server
        .client()
        .post(server.url("/v1/messages"))
        .bearer_auth(KEY)
        .json(&request(true))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    resp.text().await.unwrap();

    assert_eq!(mock.message_count(), 1);
}

#[tokio::test]
async fn rejects_expired_key() {
    let mock = MockUpstream::start().await.unwrap();
    let config = ConfigBuilder::new(&mock.base_url())
        .with_expired_key("alice", KEY)
        .with_balance("alice", dec!(1))
        .with_account("acct-1")
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server.send_message(KEY, &request(true)).await;
    assert_eq!(resp.status(), 401);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"]["type"], "authentication_error");
    assert_eq!(mock.message_count(), 0);
}

#[tokio::test]
async fn key_is_throttled_once_daily_limit_is_spent() {
    let mock = MockUpstream::start().await.unwrap();
    let config = ConfigBuilder::new(&mock.base_url())
        .with_limited_key("alice", KEY, dec!(0.01))
        .with_balance("alice", dec!(1))
        .with_account("acct-1")
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server.send_message(KEY, &request(true)).await;
    assert_eq!(resp.status(), 200);
    resp.text().await.unwrap();

    // One request costs $0.0105, over the $0.01 limit
    let logged = eventually(|| async {
        server.ledger().api_key_cost_today("limited-alice").await.unwrap() == dec!(0.0105)
    })
    .await;
    assert!(logged, "request cost was not logged");

    let resp = server.send_message(KEY, &request(true)).await;
    assert_eq!(resp.status(), 429);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"]["type"], "rate_limit_error");
    assert_eq!(mock.message_count(), 1);
}

#[tokio::test]
async fn rejects_invalid_bodies_and_disallowed_models() {
    let mock = MockUpstream::start().await.unwrap();
    let config = ConfigBuilder::new(&mock.base_url())
        .with_key("alice", KEY)
        .with_balance("alice", dec!(1))
        .with_account("acct-1")
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server
        .client()
        .post(server.url("/v1/messages"))
        .header("x-api-key", KEY)
        .header("content-type", "application/json")
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"]["type"], "invalid_request_error");

    let resp = server.send_message(KEY, &json!({"messages": []})).await;
    assert_eq!(resp.status(), 400);

    let resp = server
        .send_message(KEY, &json!({"model": "claude-opus-4", "messages": []}))
        .await;
    assert_eq!(resp.status(), 403);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"]["type"], "permission_error");

    assert_eq!(mock.message_count(), 0);
}

#[tokio::test]
async fn upstream_errors_pass_through_unbilled() {
    let mock = MockUpstream::start_with(Reply::Error { status: 529 }).await.unwrap();
    let config = ConfigBuilder::new(&mock.base_url())
        .with_key("alice", KEY)
        .with_balance("alice", dec!(1))
        .with_account("acct-1")
        .build();

    let server = TestServer::start(config).await.unwrap();
    let ledger = server.ledger().clone();

    let resp = server.send_message(KEY, &request(true)).await;
    assert_eq!(resp.status(), 529);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"]["message"], "mock failure");

    server.shutdown().await;

    let stats = ledger.user_stats("alice").await.unwrap();
    assert_eq!(stats.balance, dec!(1));
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    // Reserve a port, then release it so nothing listens there
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base_url = format!("http://{}", closed.local_addr().unwrap());
    drop(closed);

    let config = ConfigBuilder::new(&base_url)
        .with_key("alice", KEY)
        .with_balance("alice", dec!(1))
        .with_account("acct-1")
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server.send_message(KEY, &request(true)).await;
    assert_eq!(resp.status(), 502);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"]["type"], "api_error");
}
