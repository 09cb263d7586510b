use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument as _;

use super::accounting::settle_usage;
use super::channel::{Channel, ChannelStore};
use super::config::{ProxyConfig, RelayConfig, RetryConfig};
use super::context::RelayContext;
use super::costing::{
    AUDIO_BILLING_MODEL, QuotaPolicy, UsageRecord, estimate_tokens_from_len,
};
use super::health::{ChannelHealthController, DisablePolicy};
use super::ledger::QuotaLedger;
use super::multipart::bind_transcription_form;
use super::observability::{Observability, ObservabilitySnapshot};
use super::proxy_backend::{UpstreamClient, outbound_headers};
use super::relay_mode::{RelayMode, RelayPipeline};
use super::retry::RetryContext;
use super::usage::{ObservedUsage, UsageObserver};
use super::wav::read_duration_seconds;
use super::{RELAY_ERROR_TYPE, RelayError, UpstreamError};
use crate::DittoError;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct RelayHttpState {
    channels: Arc<dyn ChannelStore>,
    ledger: Arc<dyn QuotaLedger>,
    health: ChannelHealthController,
    upstream: UpstreamClient,
    quota: Arc<QuotaPolicy>,
    retry: RetryConfig,
    proxy: ProxyConfig,
    rate_limited_message: Arc<str>,
    observability: Arc<Observability>,
}

impl RelayHttpState {
    pub fn new(
        channels: Arc<dyn ChannelStore>,
        ledger: Arc<dyn QuotaLedger>,
    ) -> Result<Self, DittoError> {
        Self::from_config(&RelayConfig::default(), channels, ledger)
    }

    pub fn from_config(
        config: &RelayConfig,
        channels: Arc<dyn ChannelStore>,
        ledger: Arc<dyn QuotaLedger>,
    ) -> Result<Self, DittoError> {
        let health = ChannelHealthController::new(
            channels.clone(),
            DisablePolicy::from_config(&config.health),
        );
        Ok(Self {
            channels,
            ledger,
            health,
            upstream: UpstreamClient::new(&config.proxy)?,
            quota: Arc::new(QuotaPolicy::from_config(&config.billing)),
            retry: config.retry.clone(),
            proxy: config.proxy.clone(),
            rate_limited_message: Arc::from(config.rate_limited_message.as_str()),
            observability: Arc::new(Observability::default()),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry_times(mut self, times: u32) -> Self {
        self.retry.times = times;
        self
    }

    pub fn with_quota_policy(mut self, quota: QuotaPolicy) -> Self {
        self.quota = Arc::new(quota);
        self
    }

    pub fn with_disable_policy(mut self, policy: DisablePolicy) -> Self {
        self.health = ChannelHealthController::new(self.channels.clone(), policy);
        self
    }

    pub fn with_proxy_config(mut self, proxy: ProxyConfig) -> Result<Self, DittoError> {
        self.upstream = UpstreamClient::new(&proxy)?;
        self.proxy = proxy;
        Ok(self)
    }

    pub fn with_rate_limited_message(mut self, message: impl AsRef<str>) -> Self {
        self.rate_limited_message = Arc::from(message.as_ref());
        self
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Client-visible error envelope: `{"error": {"message", "type", "param", "code"}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenAiErrorResponse {
    pub error: UpstreamError,
}

type RelayResult = Result<Response, (StatusCode, Json<OpenAiErrorResponse>)>;

pub fn router(state: RelayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route(
            "/v1/chat/completions",
            post(handle_relay).fallback(handle_not_found),
        )
        .route(
            "/v1/completions",
            post(handle_relay).fallback(handle_not_found),
        )
        .route("/v1/edits", post(handle_relay).fallback(handle_not_found))
        .route(
            "/v1/embeddings",
            post(handle_relay).fallback(handle_not_found),
        )
        .route(
            "/v1/engines/:model/embeddings",
            post(handle_relay).fallback(handle_not_found),
        )
        .route(
            "/v1/moderations",
            post(handle_relay).fallback(handle_not_found),
        )
        .route(
            "/v1/images/generations",
            post(handle_relay).fallback(handle_not_found),
        )
        .route(
            "/v1/audio/transcriptions",
            post(handle_relay_audio).fallback(handle_not_found),
        )
        .route("/v1/images/edits", any(handle_not_implemented))
        .route("/v1/images/variations", any(handle_not_implemented))
        .route("/v1/audio/translations", any(handle_not_implemented))
        .route("/v1/files", any(handle_not_implemented))
        .route("/v1/files/*path", any(handle_not_implemented))
        .route("/v1/fine-tunes", any(handle_not_implemented))
        .route("/v1/fine-tunes/*path", any(handle_not_implemented))
        .fallback(handle_not_found)
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn metrics(State(state): State<RelayHttpState>) -> Json<ObservabilitySnapshot> {
    Json(state.observability.snapshot())
}

async fn handle_not_implemented() -> (StatusCode, Json<OpenAiErrorResponse>) {
    openai_error(UpstreamError::new(
        StatusCode::NOT_IMPLEMENTED,
        RELAY_ERROR_TYPE,
        "api_not_implemented",
        "API not implemented",
    ))
}

async fn handle_not_found(req: Request<Body>) -> (StatusCode, Json<OpenAiErrorResponse>) {
    openai_error(UpstreamError::new(
        StatusCode::NOT_FOUND,
        RELAY_ERROR_TYPE,
        "api_not_found",
        format!("API not found: {}:{}", req.method(), req.uri().path()),
    ))
}

fn openai_error(error: UpstreamError) -> (StatusCode, Json<OpenAiErrorResponse>) {
    (error.status(), Json(OpenAiErrorResponse { error }))
}

fn relay_error(err: RelayError) -> (StatusCode, Json<OpenAiErrorResponse>) {
    openai_error(err.into_upstream_error())
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("ditto-{ts_ms}-{seq}")
}

fn relay_context(extensions: &axum::http::Extensions) -> Result<RelayContext, RelayError> {
    extensions
        .get::<RelayContext>()
        .cloned()
        .ok_or(RelayError::MissingContext)
}
