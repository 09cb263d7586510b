use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub upstream_attempts: u64,
    pub retries: u64,
    pub upstream_failures: u64,
    pub rate_limited: u64,
    pub channels_disabled: u64,
    pub settlements: u64,
    pub quota_charged: u64,
}

/// Process-wide relay counters, readable at `GET /metrics`.
#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    upstream_attempts: AtomicU64,
    retries: AtomicU64,
    upstream_failures: AtomicU64,
    rate_limited: AtomicU64,
    channels_disabled: AtomicU64,
    settlements: AtomicU64,
    quota_charged: AtomicU64,
}

impl Observability {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_attempt(&self) {
        self.upstream_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_channel_disabled(&self) {
        self.channels_disabled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_settlement(&self, quota: u64) {
        self.settlements.fetch_add(1, Ordering::Relaxed);
        self.quota_charged.fetch_add(quota, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            upstream_attempts: self.upstream_attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            channels_disabled: self.channels_disabled.load(Ordering::Relaxed),
            settlements: self.settlements.load(Ordering::Relaxed),
            quota_charged: self.quota_charged.load(Ordering::Relaxed),
        }
    }
}

/// Installs the global subscriber. Filtering follows `RUST_LOG`, defaulting to `info`.
pub fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}
