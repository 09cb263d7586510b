use std::collections::BTreeSet;
use std::sync::Arc;

use super::UpstreamError;
use super::channel::{Channel, ChannelStore};
use super::config::HealthConfig;

/// Which upstream errors mean a channel is unusable until an operator intervenes.
#[derive(Clone, Debug)]
pub struct DisablePolicy {
    enabled: bool,
    codes: BTreeSet<String>,
    types: BTreeSet<String>,
}

impl Default for DisablePolicy {
    fn default() -> Self {
        Self::from_config(&HealthConfig::default())
    }
}

impl DisablePolicy {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            enabled: config.automatic_disable_channel,
            codes: config.disable_error_codes.iter().cloned().collect(),
            types: config.disable_error_types.iter().cloned().collect(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn should_disable(&self, err: &UpstreamError) -> bool {
        if !self.enabled {
            return false;
        }
        if self.types.contains(&err.kind) {
            return true;
        }
        err.code_str().is_some_and(|code| self.codes.contains(code))
    }
}

#[derive(Clone)]
pub struct ChannelHealthController {
    store: Arc<dyn ChannelStore>,
    policy: DisablePolicy,
}

impl ChannelHealthController {
    pub fn new(store: Arc<dyn ChannelStore>, policy: DisablePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &DisablePolicy {
        &self.policy
    }

    /// Disables `channel` when `err` says its credentials or account are dead. Returns `true`
    /// only for the call that flipped the channel off.
    pub async fn evaluate(&self, channel: &Channel, err: &UpstreamError) -> bool {
        if !self.policy.should_disable(err) {
            return false;
        }
        match self.store.disable_channel(channel.id).await {
            Ok(true) => {
                tracing::warn!(
                    channel_id = channel.id,
                    channel_name = %channel.name,
                    reason = %err.message,
                    "channel has been disabled"
                );
                true
            }
            Ok(false) => false,
            Err(store_err) => {
                tracing::error!(
                    channel_id = channel.id,
                    error = %store_err,
                    "failed to disable channel"
                );
                false
            }
        }
    }
}
