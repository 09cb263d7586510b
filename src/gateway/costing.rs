use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::config::BillingConfig;

/// Per-minute quota multiplier of transcription models, relative to `quota_per_unit`.
pub const AUDIO_QUOTA_PER_MINUTE_RATIO: f64 = 0.006;

/// Model billed for audio transcription log entries.
pub const AUDIO_BILLING_MODEL: &str = "whisper-1";

/// What one successful relay call costs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Tokens for text, seconds for audio, images for image generation.
    pub billable_quantity: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub model_ratio: f64,
    pub group_ratio: f64,
    pub quota: u64,
}

#[derive(Clone, Debug)]
pub struct QuotaPolicy {
    quota_per_unit: f64,
    default_model_ratio: f64,
    model_ratios: BTreeMap<String, f64>,
    completion_ratios: BTreeMap<String, f64>,
    group_ratios: BTreeMap<String, f64>,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::from_config(&BillingConfig::default())
    }
}

impl QuotaPolicy {
    pub fn from_config(config: &BillingConfig) -> Self {
        Self {
            quota_per_unit: config.quota_per_unit,
            default_model_ratio: config.default_model_ratio,
            model_ratios: config.model_ratios.clone(),
            completion_ratios: config.completion_ratios.clone(),
            group_ratios: config.group_ratios.clone(),
        }
    }

    pub fn with_quota_per_unit(mut self, quota_per_unit: f64) -> Self {
        self.quota_per_unit = quota_per_unit;
        self
    }

    pub fn with_model_ratio(mut self, model: impl Into<String>, ratio: f64) -> Self {
        self.model_ratios.insert(model.into(), ratio);
        self
    }

    pub fn with_group_ratio(mut self, group: impl Into<String>, ratio: f64) -> Self {
        self.group_ratios.insert(group.into(), ratio);
        self
    }

    pub fn quota_per_unit(&self) -> f64 {
        self.quota_per_unit
    }

    pub fn model_ratio(&self, model: &str) -> f64 {
        self.model_ratios
            .get(model)
            .copied()
            .unwrap_or(self.default_model_ratio)
    }

    pub fn completion_ratio(&self, model: &str) -> f64 {
        self.completion_ratios.get(model).copied().unwrap_or(1.0)
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratios.get(group).copied().unwrap_or(1.0)
    }

    /// quota = floor(duration * quota_per_unit * 0.006 / 60). Model and group ratios are
    /// reported but do not scale audio.
    pub fn audio_usage(&self, duration_seconds: f64, group: &str) -> UsageRecord {
        let per_second = self.quota_per_unit * AUDIO_QUOTA_PER_MINUTE_RATIO / 60.0;
        UsageRecord {
            billable_quantity: duration_seconds,
            prompt_tokens: 0,
            completion_tokens: 0,
            model_ratio: self.model_ratio(AUDIO_BILLING_MODEL),
            group_ratio: self.group_ratio(group),
            quota: truncate_quota(duration_seconds * per_second),
        }
    }

    pub fn text_usage(
        &self,
        model: &str,
        group: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> UsageRecord {
        let model_ratio = self.model_ratio(model);
        let group_ratio = self.group_ratio(group);
        let weighted =
            prompt_tokens as f64 + completion_tokens as f64 * self.completion_ratio(model);
        UsageRecord {
            billable_quantity: (prompt_tokens + completion_tokens) as f64,
            prompt_tokens,
            completion_tokens,
            model_ratio,
            group_ratio,
            quota: truncate_quota(weighted * model_ratio * group_ratio),
        }
    }

    pub fn image_usage(&self, model: &str, group: &str, size: Option<&str>, n: u64) -> UsageRecord {
        let model_ratio = self.model_ratio(model);
        let group_ratio = self.group_ratio(group);
        let per_image = truncate_quota(model_ratio * group_ratio * image_size_ratio(size) * 1000.0);
        UsageRecord {
            billable_quantity: n as f64,
            prompt_tokens: 0,
            completion_tokens: 0,
            model_ratio,
            group_ratio,
            quota: per_image.saturating_mul(n),
        }
    }
}

fn image_size_ratio(size: Option<&str>) -> f64 {
    match size {
        Some("512x512") => 1.125,
        Some("1024x1024") => 1.25,
        _ => 1.0,
    }
}

/// Truncates toward zero; negative and non-finite amounts bill nothing.
fn truncate_quota(amount: f64) -> u64 {
    if !amount.is_finite() || amount <= 0.0 {
        return 0;
    }
    amount.trunc() as u64
}

/// Rough token count for text whose tokenization is unknown: one token per four bytes.
pub fn estimate_tokens_from_len(len: usize) -> u64 {
    (len as u64).div_ceil(4)
}
