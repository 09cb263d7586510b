type UpstreamBodyStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Response headers that describe the upstream connection rather than the payload.
const HOP_BY_HOP_HEADERS: &[&str] = &["connection", "keep-alive", "transfer-encoding"];

enum Pricing {
    /// Charge known before the body is read (audio duration, image count).
    Fixed(UsageRecord),
    /// Charge derived from the usage the upstream reports in its body.
    Metered { prompt_estimate: u64 },
}

/// Deferred usage accounting for one successful upstream attempt.
struct Settlement {
    ledger: Arc<dyn QuotaLedger>,
    quota: Arc<QuotaPolicy>,
    observability: Arc<Observability>,
    ctx: RelayContext,
    channel_id: i64,
    model: String,
    pricing: Pricing,
}

impl Settlement {
    fn new(
        state: &RelayHttpState,
        ctx: &RelayContext,
        channel: &Channel,
        model: &str,
        pricing: Pricing,
    ) -> Self {
        Self {
            ledger: state.ledger.clone(),
            quota: state.quota.clone(),
            observability: state.observability.clone(),
            ctx: ctx.clone(),
            channel_id: channel.id,
            model: model.to_string(),
            pricing,
        }
    }

    fn is_metered(&self) -> bool {
        matches!(self.pricing, Pricing::Metered { .. })
    }

    fn usage(&self, observed: Option<ObservedUsage>, streamed_estimate: u64) -> UsageRecord {
        match &self.pricing {
            Pricing::Fixed(usage) => usage.clone(),
            Pricing::Metered { prompt_estimate } => {
                let (prompt, completion) = match observed {
                    Some(observed) => (observed.prompt_tokens, observed.completion_tokens),
                    None => (*prompt_estimate, streamed_estimate),
                };
                self.quota
                    .text_usage(&self.model, &self.ctx.group, prompt, completion)
            }
        }
    }

    fn spawn(self, observed: Option<ObservedUsage>, streamed_estimate: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(
                channel_id = self.channel_id,
                "no runtime available to settle usage"
            );
            return;
        };
        handle.spawn(async move {
            let usage = self.usage(observed, streamed_estimate);
            settle_usage(
                self.ledger.as_ref(),
                &self.ctx,
                self.channel_id,
                &self.model,
                &usage,
            )
            .await;
            self.observability.record_settlement(usage.quota);
        });
    }
}

/// Upstream body pump. Chunks go to the client unchanged and in order; settlement runs once,
/// when the upstream ends, fails, or the client goes away.
struct MeteredBody {
    upstream: UpstreamBodyStream,
    observer: Option<UsageObserver>,
    settlement: Option<Settlement>,
    bytes_sent: u64,
}

impl MeteredBody {
    fn finish(&mut self) {
        let Some(settlement) = self.settlement.take() else {
            return;
        };
        let (observed, streamed_estimate) = self
            .observer
            .take()
            .map(UsageObserver::finish)
            .unwrap_or((None, 0));
        settlement.spawn(observed, streamed_estimate);
    }
}

impl Drop for MeteredBody {
    fn drop(&mut self) {
        if self.settlement.is_some() {
            tracing::debug!(bytes_sent = self.bytes_sent, "relay body dropped before completion");
        }
        self.finish();
    }
}

/// Copies the upstream status and the first value of each upstream header, then streams the
/// body through unchanged.
fn relay_upstream_response(
    upstream: reqwest::Response,
    settlement: Option<Settlement>,
    usage_max_body_bytes: usize,
) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = first_value_headers(upstream.headers());
    let observer = settlement
        .as_ref()
        .filter(|settlement| settlement.is_metered())
        .map(|_| {
            let content_type = headers
                .get("content-type")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            UsageObserver::for_content_type(content_type, usage_max_body_bytes)
        });

    let state = MeteredBody {
        upstream: upstream
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed(),
        observer,
        settlement,
        bytes_sent: 0,
    };

    let stream = futures_util::stream::try_unfold(state, |mut state| async move {
        match state.upstream.next().await {
            Some(Ok(chunk)) => {
                state.bytes_sent = state.bytes_sent.saturating_add(chunk.len() as u64);
                if let Some(observer) = state.observer.as_mut() {
                    observer.observe(&chunk);
                }
                Ok(Some((chunk, state)))
            }
            Some(Err(err)) => {
                // Status and headers are already committed; the client sees a truncated body.
                tracing::warn!(
                    bytes_sent = state.bytes_sent,
                    error = %err,
                    "copy_response_body_failed"
                );
                state.finish();
                Err(err)
            }
            None => {
                state.finish();
                Ok(None)
            }
        }
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn first_value_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(upstream.keys_len());
    for name in upstream.keys() {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Some(value) = upstream.get(name) {
            out.insert(name.clone(), value.clone());
        }
    }
    out
}
