use super::context::RelayContext;
use super::costing::UsageRecord;
use super::ledger::{ConsumeLogEntry, QuotaLedger};

/// Charges a finished relay call. Every step is attempted even when an earlier one fails;
/// failures are logged and never reach the client, which already has its response.
///
/// Order: token quota, user quota cache, then (only for a non-zero charge) consume log,
/// user used quota and request count, channel used quota.
pub async fn settle_usage(
    ledger: &dyn QuotaLedger,
    ctx: &RelayContext,
    channel_id: i64,
    model: &str,
    usage: &UsageRecord,
) {
    let quota = usage.quota;

    if let Err(err) = ledger.consume_token_quota(ctx.token_id, quota).await {
        tracing::error!(
            token_id = ctx.token_id,
            quota,
            error = %err,
            "error consuming token remain quota"
        );
    }
    if let Err(err) = ledger.refresh_user_quota_cache(ctx.user_id).await {
        tracing::error!(user_id = ctx.user_id, error = %err, "error update user quota cache");
    }

    if quota == 0 {
        return;
    }

    let entry = ConsumeLogEntry {
        user_id: ctx.user_id,
        channel_id,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        model: model.to_string(),
        token_name: ctx.token_name.clone(),
        quota,
        content: format!(
            "model ratio {:.2}, group ratio {:.2}",
            usage.model_ratio, usage.group_ratio
        ),
    };
    if let Err(err) = ledger.record_consume_log(entry).await {
        tracing::error!(user_id = ctx.user_id, error = %err, "error recording consume log");
    }
    if let Err(err) = ledger.add_user_used_quota(ctx.user_id, quota).await {
        tracing::error!(user_id = ctx.user_id, error = %err, "error update user used quota");
    }
    if let Err(err) = ledger.add_channel_used_quota(channel_id, quota).await {
        tracing::error!(channel_id, error = %err, "error update channel used quota");
    }
}
