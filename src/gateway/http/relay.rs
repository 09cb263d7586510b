/// What the text/image pipeline needs from the inbound JSON body.
#[derive(Debug, Default)]
struct RelayRequestMeta {
    model: String,
    image_size: Option<String>,
    image_count: u64,
}

impl RelayRequestMeta {
    fn from_request(mode: RelayMode, path: &str, body: &[u8]) -> Result<Self, RelayError> {
        let parsed: Option<Value> = if body.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(
                serde_json::from_slice(body).map_err(|err| RelayError::InvalidRequest {
                    reason: format!("invalid request body: {err}"),
                })?,
            )
        };
        let field = |name: &str| {
            parsed
                .as_ref()
                .and_then(|value| value.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let model = field("model")
            .filter(|model| !model.is_empty())
            .or_else(|| engine_model_from_path(path))
            .unwrap_or_else(|| default_model(mode).to_string());
        let image_count = parsed
            .as_ref()
            .and_then(|value| value.get("n"))
            .and_then(Value::as_u64)
            .filter(|n| *n > 0)
            .unwrap_or(1);

        Ok(Self {
            model,
            image_size: field("size"),
            image_count,
        })
    }
}

fn engine_model_from_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/v1/engines/")?;
    let (model, _) = rest.split_once('/')?;
    (!model.is_empty()).then(|| model.to_string())
}

fn default_model(mode: RelayMode) -> &'static str {
    match mode {
        RelayMode::Moderations => "text-moderation-latest",
        RelayMode::ImageGeneration => "dall-e",
        _ => "",
    }
}

async fn handle_relay(State(state): State<RelayHttpState>, req: Request<Body>) -> RelayResult {
    let (parts, body) = req.into_parts();
    let request_id =
        extract_header(&parts.headers, "x-request-id").unwrap_or_else(generate_request_id);
    let mode = RelayMode::from_path(parts.uri.path());
    let span = tracing::info_span!(
        "ditto.relay",
        request_id = %request_id,
        method = %parts.method,
        path = %parts.uri.path(),
        mode = %mode,
        channel_id = tracing::field::Empty,
        status = tracing::field::Empty,
    );

    async move {
        state.observability.record_request();
        if mode == RelayMode::Unknown {
            return Err(openai_error(UpstreamError::new(
                StatusCode::NOT_FOUND,
                RELAY_ERROR_TYPE,
                "api_not_found",
                format!("API not found: {}:{}", parts.method, parts.uri.path()),
            )));
        }
        let ctx = relay_context(&parts.extensions).map_err(relay_error)?;
        let body = to_bytes(body, state.proxy.max_body_bytes)
            .await
            .map_err(|err| {
                relay_error(RelayError::InvalidRequest {
                    reason: err.to_string(),
                })
            })?;
        let meta =
            RelayRequestMeta::from_request(mode, parts.uri.path(), &body).map_err(relay_error)?;
        let retry = RetryContext::from_request(&state.retry, parts.uri.path(), parts.uri.query());

        relay_with_failover(&state, &parts, &ctx, mode, &meta, retry, body).await
    }
    .instrument(span)
    .await
}

/// Runs attempts until one succeeds or the retry budget is spent. Each failed attempt is
/// checked against the disable policy; only the final failure reaches the client.
async fn relay_with_failover(
    state: &RelayHttpState,
    parts: &axum::http::request::Parts,
    ctx: &RelayContext,
    mode: RelayMode,
    meta: &RelayRequestMeta,
    mut retry: RetryContext,
    body: Bytes,
) -> RelayResult {
    let mut tried: Vec<i64> = Vec::new();
    let mut last_error: Option<UpstreamError> = None;

    loop {
        let channel = match state
            .channels
            .select_channel(&ctx.group, &meta.model, &tried)
            .await
        {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                return Err(match last_error {
                    Some(err) => terminal_error(state, err),
                    None => relay_error(RelayError::NoAvailableChannel {
                        group: ctx.group.clone(),
                        model: meta.model.clone(),
                    }),
                });
            }
            Err(err) => {
                tracing::error!(error = %err, "channel store unavailable");
                return Err(match last_error {
                    Some(err) => terminal_error(state, err),
                    None => relay_error(RelayError::NoAvailableChannel {
                        group: ctx.group.clone(),
                        model: meta.model.clone(),
                    }),
                });
            }
        };
        tracing::Span::current().record("channel_id", channel.id);
        if !tried.contains(&channel.id) {
            tried.push(channel.id);
        }

        state.observability.record_upstream_attempt();
        let err = match attempt(state, parts, &channel, &retry, body.clone()).await {
            Ok(upstream) => {
                tracing::Span::current().record("status", upstream.status().as_u16());
                let pricing = match mode.pipeline() {
                    RelayPipeline::Image => Pricing::Fixed(state.quota.image_usage(
                        &meta.model,
                        &ctx.group,
                        meta.image_size.as_deref(),
                        meta.image_count,
                    )),
                    _ => Pricing::Metered {
                        prompt_estimate: estimate_tokens_from_len(body.len()),
                    },
                };
                let settlement = Settlement::new(state, ctx, &channel, &meta.model, pricing);
                return Ok(relay_upstream_response(
                    upstream,
                    Some(settlement),
                    state.proxy.usage_max_body_bytes,
                ));
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(relay_error(err));
        }
        state.observability.record_upstream_failure();
        let err = err.into_upstream_error();
        tracing::error!(
            channel_id = channel.id,
            status = err.status_code,
            "relay error (channel #{}): {}",
            channel.id,
            err.message
        );
        if state.health.evaluate(&channel, &err).await {
            state.observability.record_channel_disabled();
        }

        if !retry.try_consume() {
            return Err(terminal_error(state, err));
        }
        state.observability.record_retry();
        tracing::info!(
            channel_id = channel.id,
            remaining = retry.remaining(),
            "retrying relay on another channel"
        );
        last_error = Some(err);
    }
}

async fn attempt(
    state: &RelayHttpState,
    parts: &axum::http::request::Parts,
    channel: &Channel,
    retry: &RetryContext,
    body: Bytes,
) -> Result<reqwest::Response, RelayError> {
    let url = UpstreamClient::url_for(channel, &retry.path_and_query());
    let headers = outbound_headers(&parts.headers, channel, parts.headers.get("content-type"));
    state
        .upstream
        .forward(parts.method.clone(), &url, headers, body)
        .await
}

/// Final client-visible error. A rate-limited last attempt gets the configured saturation
/// message instead of the upstream's.
fn terminal_error(
    state: &RelayHttpState,
    mut err: UpstreamError,
) -> (StatusCode, Json<OpenAiErrorResponse>) {
    if err.status() == StatusCode::TOO_MANY_REQUESTS {
        state.observability.record_rate_limited();
        err.message = state.rate_limited_message.to_string();
    }
    openai_error(err)
}
