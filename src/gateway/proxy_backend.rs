use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use reqwest::multipart::{Form, Part};

use super::channel::Channel;
use super::config::ProxyConfig;
use super::multipart::TranscriptionForm;
use super::{RelayError, UpstreamError};
use crate::DittoError;
use crate::utils::http::response_bytes_truncated;

/// Headers copied from the client onto every upstream request.
const FORWARDED_REQUEST_HEADERS: &[&str] = &["authorization", "accept"];

/// Shared HTTP client for talking to channels.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    error_max_body_bytes: usize,
}

impl UpstreamClient {
    pub fn new(config: &ProxyConfig) -> Result<Self, DittoError> {
        let mut builder = reqwest::Client::builder();
        if config.request_timeout_seconds > 0 {
            builder = builder.timeout(Duration::from_secs(config.request_timeout_seconds));
        }
        Ok(Self {
            client: builder.build()?,
            error_max_body_bytes: config.error_max_body_bytes,
        })
    }

    pub fn url_for(channel: &Channel, path_and_query: &str) -> String {
        join_base_url(channel.resolved_base_url(), path_and_query)
    }

    /// Sends a buffered body. Transport failures are `UpstreamIo`; the status is not inspected.
    pub async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, RelayError> {
        self.client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| RelayError::UpstreamIo {
                message: err.to_string(),
            })
    }

    /// Sends a buffered body and turns any non-2xx answer into `UpstreamApi`.
    pub async fn forward(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, RelayError> {
        let response = self.send(method, url, headers, body).await?;
        self.check_status(response).await
    }

    pub async fn check_status(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, RelayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let (body, _) = response_bytes_truncated(response, self.error_max_body_bytes).await;
        Err(RelayError::UpstreamApi(UpstreamError::from_upstream_body(
            status, &body,
        )))
    }

    /// Re-encodes a bound transcription form and sends it. The upstream status is returned
    /// as-is so the caller can relay it.
    pub async fn forward_transcription(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: HeaderMap,
        form: &TranscriptionForm,
    ) -> Result<reqwest::Response, RelayError> {
        let multipart = transcription_multipart(form)?;
        self.client
            .request(method, url)
            .headers(headers)
            .multipart(multipart)
            .send()
            .await
            .map_err(|err| RelayError::UpstreamIo {
                message: err.to_string(),
            })
    }
}

/// Authorization and Accept from the client; a channel key replaces the client's credential.
/// `content_type` is set for pass-through bodies and left out for multipart, whose boundary
/// the client library writes.
pub fn outbound_headers(
    inbound: &HeaderMap,
    channel: &Channel,
    content_type: Option<&HeaderValue>,
) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in FORWARDED_REQUEST_HEADERS {
        if let Some(value) = inbound.get(*name) {
            out.insert(*name, value.clone());
        }
    }
    if let Some(key) = channel.key.as_deref().map(str::trim).filter(|key| !key.is_empty()) {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {key}")) {
            out.insert("authorization", value);
        }
    }
    if let Some(content_type) = content_type {
        out.insert("content-type", content_type.clone());
    }
    out
}

fn transcription_multipart(form: &TranscriptionForm) -> Result<Form, RelayError> {
    let file = Part::bytes(form.file.data.to_vec())
        .file_name(form.file.filename.clone())
        .mime_str("application/octet-stream")
        .map_err(|_| RelayError::LocalIo {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "create_form_file_failed".to_string(),
        })?;
    Ok(Form::new()
        .part("file", file)
        .text("model", form.model.clone())
        .text("prompt", form.prompt.clone())
        .text("response_format", form.response_format.clone())
        .text("temperature", format_temperature(form.temperature))
        .text("language", form.language.clone()))
}

/// Shortest decimal that round-trips, without exponent for ordinary values (`0.2`, `1`, `0`).
pub(crate) fn format_temperature(value: f64) -> String {
    format!("{value}")
}

fn join_base_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.strip_prefix('/').unwrap_or(path);

    // A base URL that already names the version segment still takes full `/v1/...` paths.
    if base.ends_with("/v1") {
        if path == "v1" || path.starts_with("v1?") {
            return format!("{base}{}", &path[2..]);
        }
        if let Some(rest) = path.strip_prefix("v1/") {
            return format!("{base}/{rest}");
        }
    }
    format!("{base}/{path}")
}
