//! Relay gateway: dispatch, forwarding, failover and usage metering.

pub mod accounting;
pub mod channel;
pub mod config;
pub mod context;
pub mod costing;
pub mod health;
pub mod http;
pub mod ledger;
pub mod multipart;
pub mod observability;
pub mod proxy_backend;
pub mod relay_mode;
pub mod retry;
pub mod usage;
pub mod wav;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use accounting::settle_usage;
pub use channel::{Channel, ChannelStore, ChannelStoreError, ChannelType, MemoryChannelStore};
pub use config::{
    BillingConfig, ChannelConfig, HealthConfig, ProxyConfig, RelayConfig, RetryConfig, TokenConfig,
};
pub use context::{RelayContext, StaticTokenResolver};
pub use costing::{QuotaPolicy, UsageRecord};
pub use health::{ChannelHealthController, DisablePolicy};
pub use http::{OpenAiErrorResponse, RelayHttpState};
pub use ledger::{ConsumeLogEntry, LedgerError, MemoryLedger, QuotaLedger};
pub use observability::{Observability, ObservabilitySnapshot};
pub use proxy_backend::UpstreamClient;
pub use relay_mode::{RelayMode, RelayPipeline};
pub use retry::RetryContext;

pub(crate) const RELAY_ERROR_TYPE: &str = "ditto_relay_error";

/// Error reported by (or synthesized on behalf of) an upstream channel, in the OpenAI shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpstreamError {
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, deserialize_with = "param_from_any")]
    pub param: String,
    #[serde(default)]
    pub code: Value,
    #[serde(skip)]
    pub status_code: u16,
}

fn param_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(value)) => value,
        Some(other) => other.to_string(),
    })
}

#[derive(Deserialize)]
struct UpstreamErrorEnvelope {
    error: UpstreamError,
}

impl UpstreamError {
    pub fn new(
        status: StatusCode,
        kind: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            kind: kind.into(),
            param: String::new(),
            code: Value::String(code.into()),
            status_code: status.as_u16(),
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = param.into();
        self
    }

    /// Decodes a non-2xx upstream body. Bodies that are not an OpenAI error envelope still
    /// produce an error carrying the upstream status.
    pub fn from_upstream_body(status: StatusCode, body: &[u8]) -> Self {
        match serde_json::from_slice::<UpstreamErrorEnvelope>(body) {
            Ok(envelope) => {
                let mut err = envelope.error;
                err.status_code = status.as_u16();
                err
            }
            Err(_) => Self::new(
                status,
                "upstream_error",
                "bad_response_status_code",
                format!("bad response status code {}", status.as_u16()),
            ),
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::BAD_GATEWAY)
    }

    pub fn code_str(&self) -> Option<&str> {
        self.code.as_str()
    }
}

/// Failure taxonomy of a single relay invocation.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("bind form failed: {reason}")]
    Bind { reason: String },
    #[error("local io error: {message}")]
    LocalIo { status: StatusCode, message: String },
    #[error("upstream request failed: {message}")]
    UpstreamIo { message: String },
    #[error("upstream api error ({}): {}", .0.status_code, .0.message)]
    UpstreamApi(UpstreamError),
    #[error("no available channel for model {model} in group {group}")]
    NoAvailableChannel { group: String, model: String },
    #[error("relay context missing")]
    MissingContext,
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl RelayError {
    /// Only failures of the upstream exchange itself are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::UpstreamIo { .. } | RelayError::UpstreamApi(_))
    }

    pub fn into_upstream_error(self) -> UpstreamError {
        match self {
            RelayError::Bind { reason } => UpstreamError::new(
                StatusCode::BAD_REQUEST,
                RELAY_ERROR_TYPE,
                "audio_error",
                "bind_form_failed",
            )
            .with_param(reason),
            RelayError::LocalIo { status, message } => {
                UpstreamError::new(status, RELAY_ERROR_TYPE, "audio_error", message)
            }
            RelayError::UpstreamIo { message } => UpstreamError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                RELAY_ERROR_TYPE,
                "do_request_failed",
                "do_request_failed",
            )
            .with_param(message),
            RelayError::UpstreamApi(err) => err,
            RelayError::NoAvailableChannel { group, model } => UpstreamError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                RELAY_ERROR_TYPE,
                "no_available_channel",
                format!("no available channel for model {model} in group {group}"),
            ),
            RelayError::MissingContext => UpstreamError::new(
                StatusCode::UNAUTHORIZED,
                RELAY_ERROR_TYPE,
                "missing_relay_context",
                "request is not authenticated",
            ),
            RelayError::InvalidRequest { reason } => UpstreamError::new(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_request",
                reason,
            ),
        }
    }
}
