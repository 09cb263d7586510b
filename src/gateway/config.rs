use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::channel::{Channel, ChannelType, MemoryChannelStore};
use super::context::StaticTokenResolver;
use crate::{DittoError, Result};

const DEFAULT_RATE_LIMITED_MESSAGE: &str =
    "The current load is saturated, please try again later.";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Shown to clients instead of the upstream body when the last attempt was rate limited.
    #[serde(default = "default_rate_limited_message")]
    pub rate_limited_message: String,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            retry: RetryConfig::default(),
            billing: BillingConfig::default(),
            health: HealthConfig::default(),
            proxy: ProxyConfig::default(),
            rate_limited_message: default_rate_limited_message(),
            channels: Vec::new(),
            tokens: Vec::new(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_rate_limited_message() -> String {
    DEFAULT_RATE_LIMITED_MESSAGE.to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Extra attempts after the first failure. Zero disables failover.
    #[serde(default)]
    pub times: u32,
    /// Honour a client-supplied `retry` query parameter.
    #[serde(default)]
    pub allow_client_override: bool,
    /// Ceiling for a client-supplied `retry` value.
    #[serde(default = "default_max_client_retries")]
    pub max_client_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            times: 0,
            allow_client_override: false,
            max_client_retries: default_max_client_retries(),
        }
    }
}

fn default_max_client_retries() -> u32 {
    3
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BillingConfig {
    #[serde(default = "default_quota_per_unit")]
    pub quota_per_unit: f64,
    #[serde(default = "default_model_ratio")]
    pub default_model_ratio: f64,
    #[serde(default)]
    pub model_ratios: BTreeMap<String, f64>,
    #[serde(default)]
    pub completion_ratios: BTreeMap<String, f64>,
    #[serde(default)]
    pub group_ratios: BTreeMap<String, f64>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            quota_per_unit: default_quota_per_unit(),
            default_model_ratio: default_model_ratio(),
            model_ratios: BTreeMap::new(),
            completion_ratios: BTreeMap::new(),
            group_ratios: BTreeMap::new(),
        }
    }
}

fn default_quota_per_unit() -> f64 {
    500_000.0
}

fn default_model_ratio() -> f64 {
    30.0
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub automatic_disable_channel: bool,
    #[serde(default = "default_disable_error_codes")]
    pub disable_error_codes: Vec<String>,
    #[serde(default = "default_disable_error_types")]
    pub disable_error_types: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            automatic_disable_channel: true,
            disable_error_codes: default_disable_error_codes(),
            disable_error_types: default_disable_error_types(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_disable_error_codes() -> Vec<String> {
    vec![
        "invalid_api_key".to_string(),
        "account_deactivated".to_string(),
    ]
}

fn default_disable_error_types() -> Vec<String> {
    vec!["insufficient_quota".to_string()]
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_usage_max_body_bytes")]
    pub usage_max_body_bytes: usize,
    #[serde(default = "default_error_max_body_bytes")]
    pub error_max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout_seconds(),
            max_body_bytes: default_max_body_bytes(),
            usage_max_body_bytes: default_usage_max_body_bytes(),
            error_max_body_bytes: default_error_max_body_bytes(),
        }
    }
}

fn default_request_timeout_seconds() -> u64 {
    300
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_usage_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_error_max_body_bytes() -> usize {
    64 * 1024
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ChannelType,
    #[serde(default)]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Empty means every model.
    #[serde(default)]
    pub models: Vec<String>,
    /// Empty means every group.
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("key", &"<redacted>")
            .field("models", &self.models)
            .field("groups", &self.groups)
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub key: String,
    pub token_id: i64,
    #[serde(default)]
    pub name: String,
    pub user_id: i64,
    #[serde(default = "default_group")]
    pub group: String,
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("key", &"<redacted>")
            .field("token_id", &self.token_id)
            .field("name", &self.name)
            .field("user_id", &self.user_id)
            .field("group", &self.group)
            .finish()
    }
}

fn default_group() -> String {
    "default".to_string()
}

impl RelayConfig {
    /// Loads a `.toml` file, or JSON for any other extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let config: Self = if is_toml {
            toml::from_str(&raw)?
        } else {
            serde_json::from_str(&raw)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.id) {
                return Err(DittoError::InvalidConfig(format!(
                    "duplicate channel id: {}",
                    channel.id
                )));
            }
            if channel.kind == ChannelType::Custom && channel.base_url.trim().is_empty() {
                return Err(DittoError::InvalidConfig(format!(
                    "custom channel {} requires base_url",
                    channel.id
                )));
            }
        }
        if self.billing.quota_per_unit < 0.0 {
            return Err(DittoError::InvalidConfig(
                "billing.quota_per_unit must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn build_channel_store(&self) -> Arc<MemoryChannelStore> {
        let store = MemoryChannelStore::new();
        for config in &self.channels {
            let channel = Channel {
                id: config.id,
                name: config.name.clone(),
                kind: config.kind,
                base_url: config.base_url.clone(),
                key: config.key.clone(),
                enabled: config.enabled,
            };
            store
                .insert(channel, config.models.clone(), config.groups.clone())
                .await;
        }
        Arc::new(store)
    }

    pub fn build_token_resolver(&self) -> StaticTokenResolver {
        StaticTokenResolver::new(&self.tokens)
    }
}
