//! REST Integration Tests
//!
//! Exercise the rate-limited request executor against a wiremock server.
//!
//! Run with: cargo test -p integration-tests --test rest_tests

use chatlink_rest::{Method, RestConfig, RestError};
use integration_tests::{rest_client, rest_client_with, TEST_TOKEN};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Gateway Discovery Tests
// ============================================================================

#[tokio::test]
async fn test_gateway_url_gets_trailing_slash() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/gateway"))
        .and(header("authorization", TEST_TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "url": "wss://gateway.test" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = rest_client(&server.uri());
    assert_eq!(client.gateway().await.unwrap(), "wss://gateway.test/");
}

#[tokio::test]
async fn test_gateway_bot_recommends_shards() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/gateway/bot"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": "wss://gateway.test/",
            "shards": 3,
            "session_start_limit": { "total": 1000, "remaining": 999, "reset_after": 14_400_000, "max_concurrency": 1 }
        })))
        .mount(&server)
        .await;

    let client = rest_client(&server.uri());
    let bot = client.gateway_bot().await.unwrap();

    assert_eq!(bot.url, "wss://gateway.test/");
    assert_eq!(bot.shards, 3);
    assert_eq!(bot.session_start_limit.unwrap().remaining, 999);
}

// ============================================================================
// Retry Tests
// ============================================================================

#[tokio::test]
async fn test_rate_limited_request_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/users/@me"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "message": "You are being rate limited.",
            "retry_after": 0.2,
            "global": false
        })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/users/@me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "1", "username": "bot" })))
        .mount(&server)
        .await;

    // A single attempt is allowed; 429s don't count against it
    let client = rest_client_with(
        RestConfig::new(TEST_TOKEN)
            .with_api_base(format!("{}/api", server.uri()))
            .with_max_retries(1),
    );

    let start = Instant::now();
    let me: Value = client.request_json(Method::GET, "/users/@me", None).await.unwrap();

    assert_eq!(me["username"], "bot");
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(client.ratelimiter().global_until().is_none());
}

#[tokio::test]
async fn test_global_rate_limit_blocks_other_routes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/channels/1/messages"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "message": "You are being rate limited.",
            "retry_after": 0.5,
            "global": true
        })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/channels/1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "2" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/guilds/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "2" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = rest_client(&server.uri());
    let sender = client.clone();
    let first = tokio::spawn(async move {
        let body = json!({ "content": "hello" });
        sender.request(Method::POST, "/channels/1/messages", Some(&body)).await
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    let until = loop {
        if let Some(until) = client.ratelimiter().global_until() {
            break until;
        }
        assert!(Instant::now() < deadline, "global lock never set");
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    // A different route still waits out the global lock
    client.request(Method::GET, "/guilds/2", None).await.unwrap();
    assert!(tokio::time::Instant::now() >= until);

    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bad_gateway_retried_until_budget_spent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/guilds/1"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&server)
        .await;

    let client = rest_client_with(
        RestConfig::new(TEST_TOKEN)
            .with_api_base(format!("{}/api", server.uri()))
            .with_max_retries(2),
    );

    let err = client.request(Method::GET, "/guilds/1", None).await.unwrap_err();
    assert_eq!(err.status().map(|s| s.as_u16()), Some(502));
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/channels/404"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({ "code": 10003, "message": "Unknown Channel" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = rest_client(&server.uri());
    let err = client.request(Method::GET, "/channels/404", None).await.unwrap_err();

    assert_eq!(err.status().map(|s| s.as_u16()), Some(404));
    assert!(matches!(err, RestError::Http(_)));
}

// ============================================================================
// Bucket Tests
// ============================================================================

#[tokio::test]
async fn test_exhausted_bucket_delays_next_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/channels/5/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .insert_header("x-ratelimit-remaining", "0")
                .insert_header("x-ratelimit-reset-after", "0.3"),
        )
        .expect(2)
        .mount(&server)
        .await;

    let client = rest_client(&server.uri());
    client.request(Method::GET, "/channels/5/messages", None).await.unwrap();

    let start = Instant::now();
    client.request(Method::GET, "/channels/5/messages", None).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(250));
}

#[tokio::test]
async fn test_query_string_shares_bucket() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/channels/6/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let client = rest_client(&server.uri());
    client
        .request(Method::GET, "/channels/6/messages?limit=1", None)
        .await
        .unwrap();
    client
        .request(Method::GET, "/channels/6/messages?limit=50", None)
        .await
        .unwrap();

    // Both calls spent the same bucket; no headers came back to refill it
    let key = format!("{}/api/channels/6/messages", server.uri());
    let bucket = client.ratelimiter().get_bucket(&key);
    assert_eq!(bucket.key(), key);
    assert_eq!(bucket.remaining(), -1);
}
