use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use ditto_relay::gateway::{
    Channel, DisablePolicy, MemoryChannelStore, MemoryLedger, OpenAiErrorResponse, RelayContext,
    RelayHttpState, RetryConfig,
};
use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::json;
use tower::util::ServiceExt;

const RATE_LIMITED_BODY: &str = r#"{"error":{"message":"Rate limit reached for requests","type":"requests","param":null,"code":"rate_limit_exceeded"}}"#;

async fn store_with(channels: Vec<Channel>) -> Arc<MemoryChannelStore> {
    let store = Arc::new(MemoryChannelStore::new());
    for channel in channels {
        store.insert(channel, Vec::new(), Vec::new()).await;
    }
    store
}

fn app(state: RelayHttpState) -> Router {
    ditto_relay::gateway::http::router(state)
}

fn chat_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .extension(RelayContext::new(1, "token-a", 7, "default"))
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"gpt-4","messages":[]}"#))
        .unwrap()
}

async fn error_body(response: axum::response::Response) -> OpenAiErrorResponse {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).expect("single error envelope")
}

#[tokio::test]
async fn exhausted_budget_on_rate_limit_returns_saturation_message() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(429)
            .header("content-type", "application/json")
            .body(RATE_LIMITED_BODY);
    });

    let store = store_with(vec![Channel::new(1, "primary", upstream.base_url())]).await;
    let state = RelayHttpState::new(store.clone(), Arc::new(MemoryLedger::new()))
        .expect("state")
        .with_retry_times(2);
    let router = app(state.clone());

    let response = router.oneshot(chat_request("/v1/chat/completions")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let envelope = error_body(response).await;
    assert_eq!(
        envelope.error.message,
        "The current load is saturated, please try again later."
    );
    assert_eq!(envelope.error.code, json!("rate_limit_exceeded"));
    mock.assert_calls(3);

    assert_eq!(store.is_enabled(1).await, Some(true));
    let snapshot = state.observability();
    assert_eq!(snapshot.upstream_attempts, 3);
    assert_eq!(snapshot.retries, 2);
    assert_eq!(snapshot.upstream_failures, 3);
    assert_eq!(snapshot.rate_limited, 1);
}

#[tokio::test]
async fn custom_rate_limited_message_is_used() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(429).body(RATE_LIMITED_BODY);
    });

    let store = store_with(vec![Channel::new(1, "primary", upstream.base_url())]).await;
    let state = RelayHttpState::new(store, Arc::new(MemoryLedger::new()))
        .expect("state")
        .with_rate_limited_message("busy, retry later");

    let response = app(state)
        .oneshot(chat_request("/v1/chat/completions"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(error_body(response).await.error.message, "busy, retry later");
    mock.assert_calls(1);
}

#[tokio::test]
async fn failed_channel_is_rotated_out_on_retry() {
    let primary = MockServer::start();
    let primary_mock = primary.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(500)
            .header("content-type", "application/json")
            .body(r#"{"error":{"message":"boom","type":"server_error","code":null}}"#);
    });
    let secondary = MockServer::start();
    let secondary_mock = secondary.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"id":"from-secondary"}"#);
    });

    let store = store_with(vec![
        Channel::new(1, "primary", primary.base_url()),
        Channel::new(2, "secondary", secondary.base_url()),
    ])
    .await;
    let state = RelayHttpState::new(store, Arc::new(MemoryLedger::new()))
        .expect("state")
        .with_retry_times(1);

    let response = app(state)
        .oneshot(chat_request("/v1/chat/completions"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.as_ref(), br#"{"id":"from-secondary"}"#);
    primary_mock.assert_calls(1);
    secondary_mock.assert_calls(1);
}

#[tokio::test]
async fn zero_budget_returns_upstream_error_unchanged() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(500)
            .header("content-type", "application/json")
            .body(r#"{"error":{"message":"The server had an error","type":"server_error","param":null,"code":null}}"#);
    });

    let store = store_with(vec![Channel::new(1, "primary", upstream.base_url())]).await;
    let state = RelayHttpState::new(store, Arc::new(MemoryLedger::new())).expect("state");

    let response = app(state)
        .oneshot(chat_request("/v1/chat/completions"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let envelope = error_body(response).await;
    assert_eq!(envelope.error.message, "The server had an error");
    assert_eq!(envelope.error.kind, "server_error");
    mock.assert_calls(1);
}

#[tokio::test]
async fn invalid_api_key_disables_the_channel() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(401)
            .header("content-type", "application/json")
            .body(r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error","param":null,"code":"invalid_api_key"}}"#);
    });

    let store = store_with(vec![Channel::new(1, "primary", upstream.base_url())]).await;
    let state = RelayHttpState::new(store.clone(), Arc::new(MemoryLedger::new())).expect("state");
    let router = app(state.clone());

    let response = router
        .clone()
        .oneshot(chat_request("/v1/chat/completions"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        error_body(response).await.error.code,
        json!("invalid_api_key")
    );
    assert_eq!(store.is_enabled(1).await, Some(false));
    assert_eq!(state.observability().channels_disabled, 1);

    let response = router
        .oneshot(chat_request("/v1/chat/completions"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        error_body(response).await.error.code,
        json!("no_available_channel")
    );
    mock.assert_calls(1);
}

#[tokio::test]
async fn disabled_policy_keeps_channel_enabled() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(401)
            .body(r#"{"error":{"message":"bad key","type":"invalid_request_error","code":"invalid_api_key"}}"#);
    });

    let store = store_with(vec![Channel::new(1, "primary", upstream.base_url())]).await;
    let state = RelayHttpState::new(store.clone(), Arc::new(MemoryLedger::new()))
        .expect("state")
        .with_disable_policy(DisablePolicy::disabled());

    let response = app(state)
        .oneshot(chat_request("/v1/chat/completions"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(store.is_enabled(1).await, Some(true));
    mock.assert_calls(1);
}

#[tokio::test]
async fn unreachable_channel_fails_over_to_healthy_one() {
    let healthy = MockServer::start();
    let healthy_mock = healthy.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).body("{}");
    });

    let store = store_with(vec![
        Channel::new(1, "dead", "http://127.0.0.1:1"),
        Channel::new(2, "healthy", healthy.base_url()),
    ])
    .await;
    let state = RelayHttpState::new(store, Arc::new(MemoryLedger::new()))
        .expect("state")
        .with_retry_times(1);

    let response = app(state)
        .oneshot(chat_request("/v1/chat/completions"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    healthy_mock.assert_calls(1);
}

#[tokio::test]
async fn unreachable_channel_without_budget_is_do_request_failed() {
    let store = store_with(vec![Channel::new(1, "dead", "http://127.0.0.1:1")]).await;
    let state = RelayHttpState::new(store, Arc::new(MemoryLedger::new())).expect("state");

    let response = app(state)
        .oneshot(chat_request("/v1/chat/completions"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let envelope = error_body(response).await;
    assert_eq!(envelope.error.message, "do_request_failed");
    assert_eq!(envelope.error.code, json!("do_request_failed"));
}

#[tokio::test]
async fn client_retry_parameter_requires_opt_in() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(503).body("unavailable");
    });

    let store = store_with(vec![Channel::new(1, "primary", upstream.base_url())]).await;
    let state = RelayHttpState::new(store.clone(), Arc::new(MemoryLedger::new())).expect("state");
    let response = app(state)
        .oneshot(chat_request("/v1/chat/completions?retry=3"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let envelope = error_body(response).await;
    assert_eq!(envelope.error.code, json!("bad_response_status_code"));
    mock.assert_calls(1);

    let state = RelayHttpState::new(store, Arc::new(MemoryLedger::new()))
        .expect("state")
        .with_retry(RetryConfig {
            times: 0,
            allow_client_override: true,
            max_client_retries: 2,
        });
    let response = app(state)
        .oneshot(chat_request("/v1/chat/completions?retry=3"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    // retry=3 is capped at two extra attempts.
    mock.assert_calls(4);
}
