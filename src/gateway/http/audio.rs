async fn handle_relay_audio(State(state): State<RelayHttpState>, req: Request<Body>) -> RelayResult {
    let (parts, body) = req.into_parts();
    let request_id =
        extract_header(&parts.headers, "x-request-id").unwrap_or_else(generate_request_id);
    let span = tracing::info_span!(
        "ditto.relay",
        request_id = %request_id,
        method = %parts.method,
        path = %parts.uri.path(),
        mode = %RelayMode::AudioTranscription,
        channel_id = tracing::field::Empty,
        status = tracing::field::Empty,
    );

    async move {
        state.observability.record_request();
        let ctx = relay_context(&parts.extensions).map_err(relay_error)?;
        let content_type = extract_header(&parts.headers, "content-type").unwrap_or_default();
        let body = to_bytes(body, state.proxy.max_body_bytes)
            .await
            .map_err(|err| {
                relay_error(RelayError::Bind {
                    reason: err.to_string(),
                })
            })?;
        let form = bind_transcription_form(&content_type, &body).map_err(relay_error)?;

        // The header read consumes its own view of the upload; the forwarded body starts at
        // byte zero again.
        let mut header_reader: &[u8] = &form.file.data;
        let duration = read_duration_seconds(&mut header_reader, form.file.size());

        let channel = match state.channels.select_channel(&ctx.group, &form.model, &[]).await {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                return Err(relay_error(RelayError::NoAvailableChannel {
                    group: ctx.group.clone(),
                    model: form.model.clone(),
                }));
            }
            Err(err) => {
                tracing::error!(error = %err, "channel store unavailable");
                return Err(relay_error(RelayError::NoAvailableChannel {
                    group: ctx.group.clone(),
                    model: form.model.clone(),
                }));
            }
        };
        tracing::Span::current().record("channel_id", channel.id);

        let url = UpstreamClient::url_for(&channel, parts.uri.path());
        let headers = outbound_headers(&parts.headers, &channel, None);
        state.observability.record_upstream_attempt();
        let upstream = match state
            .upstream
            .forward_transcription(parts.method.clone(), &url, headers, &form)
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => {
                state.observability.record_upstream_failure();
                tracing::error!(channel_id = channel.id, error = %err, "RelayAudio do_request_failed");
                return Err(relay_error(err));
            }
        };

        let status = upstream.status();
        tracing::Span::current().record("status", status.as_u16());
        let settlement = (status == reqwest::StatusCode::OK).then(|| {
            let usage = state.quota.audio_usage(duration, &ctx.group);
            tracing::debug!(duration, quota = usage.quota, "audio usage estimated");
            Settlement::new(
                &state,
                &ctx,
                &channel,
                AUDIO_BILLING_MODEL,
                Pricing::Fixed(usage),
            )
        });

        Ok(relay_upstream_response(
            upstream,
            settlement,
            state.proxy.usage_max_body_bytes,
        ))
    }
    .instrument(span)
    .await
}
