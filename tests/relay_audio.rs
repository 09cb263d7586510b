use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use ditto_relay::gateway::ledger::LedgerSnapshot;
use ditto_relay::gateway::{
    Channel, MemoryChannelStore, MemoryLedger, OpenAiErrorResponse, QuotaPolicy, RelayContext,
    RelayHttpState,
};
use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::json;
use tower::util::ServiceExt;

const BOUNDARY: &str = "relay-test-boundary";
const QUOTA_PER_UNIT: f64 = 500_000.0;

fn wav_header(byte_rate: u32, data_size: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(44);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_size).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&(byte_rate / 2).to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_size.to_le_bytes());
    out
}

fn transcription_body(file: Option<(&str, &[u8])>, fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some((filename, data)) = file {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: audio/wav\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn transcription_request(body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/audio/transcriptions")
        .extension(RelayContext::new(21, "audio-token", 9, "default"))
        .header("authorization", "Bearer sk-client")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn audio_app(base_url: String) -> (Router, Arc<MemoryLedger>) {
    let store = Arc::new(MemoryChannelStore::new());
    store
        .insert(Channel::new(4, "whisper", base_url), Vec::new(), Vec::new())
        .await;
    let ledger = Arc::new(MemoryLedger::new());
    let state = RelayHttpState::new(store, ledger.clone())
        .expect("state")
        .with_quota_policy(QuotaPolicy::default().with_quota_per_unit(QUOTA_PER_UNIT));
    (ditto_relay::gateway::http::router(state), ledger)
}

fn expected_quota(duration: f64) -> u64 {
    (duration * (QUOTA_PER_UNIT * 0.006 / 60.0)).floor() as u64
}

async fn wait_for_settlement(ledger: &MemoryLedger) -> LedgerSnapshot {
    for _ in 0..200 {
        let snapshot = ledger.snapshot().await;
        if !snapshot.user_cache_refreshes.is_empty() {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    ledger.snapshot().await
}

#[tokio::test]
async fn wav_upload_is_billed_by_header_duration() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/audio/transcriptions")
            .header("authorization", "Bearer sk-client");
        then.status(200)
            .header("content-type", "application/json")
            .header("x-request-trace", "audio-1")
            .body(r#"{"text":"hello world"}"#);
    });

    let (app, ledger) = audio_app(upstream.base_url()).await;
    // Header claims ten seconds; only the header itself is uploaded.
    let file = wav_header(16_000, 160_000);
    let body = transcription_body(Some(("clip.wav", &file)), &[("model", "whisper-1")]);

    let response = app.oneshot(transcription_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-request-trace").unwrap(), "audio-1");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.as_ref(), br#"{"text":"hello world"}"#);
    mock.assert();

    let snapshot = wait_for_settlement(&ledger).await;
    let quota = expected_quota(10.0);
    assert_eq!(quota, 500);
    assert_eq!(snapshot.token_consumed.get(&21), Some(&quota));
    assert_eq!(snapshot.user_used_quota.get(&9), Some(&quota));
    assert_eq!(snapshot.channel_used_quota.get(&4), Some(&quota));
    assert_eq!(snapshot.logs.len(), 1);
    assert_eq!(snapshot.logs[0].model, "whisper-1");
    assert_eq!(snapshot.logs[0].token_name, "audio-token");
    assert_eq!(snapshot.logs[0].quota, quota);
}

#[tokio::test]
async fn non_wav_upload_is_billed_by_size_and_fields_are_forwarded() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/audio/transcriptions")
            .header("accept", "application/json")
            .body_includes("name=\"model\"")
            .body_includes("whisper-1")
            .body_includes("name=\"prompt\"")
            .body_includes("meeting notes")
            .body_includes("name=\"response_format\"")
            .body_includes("verbose_json")
            .body_includes("name=\"temperature\"")
            .body_includes("0.2")
            .body_includes("name=\"language\"")
            .body_includes("filename=\"notes.mp3\"")
            .body_includes("application/octet-stream");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"text":"ok"}"#);
    });

    let (app, ledger) = audio_app(upstream.base_url()).await;
    // 48 000 bytes of non-WAV data at the fallback rate is three seconds.
    let file = vec![b'a'; 48_000];
    let body = transcription_body(
        Some(("notes.mp3", &file)),
        &[
            ("model", "whisper-1"),
            ("prompt", "meeting notes"),
            ("response_format", "verbose_json"),
            ("temperature", "0.2"),
            ("language", "en"),
        ],
    );
    let mut request = transcription_request(body);
    request
        .headers_mut()
        .insert("accept", "application/json".parse().unwrap());

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    mock.assert();

    let snapshot = wait_for_settlement(&ledger).await;
    let quota = expected_quota(48_000.0 / 16_000.0);
    assert_eq!(quota, 150);
    assert_eq!(snapshot.token_consumed.get(&21), Some(&quota));
    assert_eq!(snapshot.logs.len(), 1);
    assert_eq!(snapshot.logs[0].quota, quota);
}

#[tokio::test]
async fn missing_model_is_a_bind_error() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/audio/transcriptions");
        then.status(200).body("{}");
    });

    let (app, ledger) = audio_app(upstream.base_url()).await;
    let file = wav_header(16_000, 160_000);
    let body = transcription_body(Some(("clip.wav", &file)), &[]);

    let response = app.oneshot(transcription_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let envelope: OpenAiErrorResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(envelope.error.message, "bind_form_failed");
    assert_eq!(envelope.error.code, json!("audio_error"));
    assert!(!envelope.error.param.is_empty());
    mock.assert_calls(0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ledger.snapshot().await.user_cache_refreshes.is_empty());
}

#[tokio::test]
async fn non_multipart_body_is_a_bind_error() {
    let (app, _ledger) = audio_app("http://127.0.0.1:1".to_string()).await;
    let request = Request::builder()
        .method("POST")
        .uri("/v1/audio/transcriptions")
        .extension(RelayContext::new(21, "audio-token", 9, "default"))
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"whisper-1"}"#))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let envelope: OpenAiErrorResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(envelope.error.message, "bind_form_failed");
}

#[tokio::test]
async fn unreachable_upstream_is_do_request_failed_without_billing() {
    let (app, ledger) = audio_app("http://127.0.0.1:1".to_string()).await;
    let file = wav_header(16_000, 160_000);
    let body = transcription_body(Some(("clip.wav", &file)), &[("model", "whisper-1")]);

    let response = app.oneshot(transcription_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let envelope: OpenAiErrorResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(envelope.error.message, "do_request_failed");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = ledger.snapshot().await;
    assert!(snapshot.user_cache_refreshes.is_empty());
    assert!(snapshot.logs.is_empty());
}

#[tokio::test]
async fn upstream_error_is_relayed_without_billing() {
    let upstream = MockServer::start();
    let upstream_body = r#"{"error":{"message":"Invalid file format.","type":"invalid_request_error","param":null,"code":null}}"#;
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/audio/transcriptions");
        then.status(400)
            .header("content-type", "application/json")
            .body(upstream_body);
    });

    let (app, ledger) = audio_app(upstream.base_url()).await;
    let file = wav_header(16_000, 160_000);
    let body = transcription_body(Some(("clip.wav", &file)), &[("model", "whisper-1")]);

    let response = app.oneshot(transcription_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.as_ref(), upstream_body.as_bytes());
    mock.assert_calls(1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = ledger.snapshot().await;
    assert!(snapshot.user_cache_refreshes.is_empty());
    assert!(snapshot.token_consumed.is_empty());
}

#[tokio::test]
async fn audio_without_context_is_unauthorized() {
    let (app, _ledger) = audio_app("http://127.0.0.1:1".to_string()).await;
    let request = Request::builder()
        .method("POST")
        .uri("/v1/audio/transcriptions")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(transcription_body(None, &[("model", "whisper-1")])))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
