use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Known upstream kinds. A channel without an explicit base URL uses its kind's default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    #[default]
    OpenAi,
    Custom,
    Api2d,
    OpenAiSb,
    OpenAiMax,
    OhMyGpt,
    AiProxy,
}

impl ChannelType {
    pub fn default_base_url(self) -> &'static str {
        match self {
            ChannelType::OpenAi => "https://api.openai.com",
            ChannelType::Custom => "",
            ChannelType::Api2d => "https://oa.api2d.net",
            ChannelType::OpenAiSb => "https://api.openai-sb.com",
            ChannelType::OpenAiMax => "https://api.openaimax.com",
            ChannelType::OhMyGpt => "https://api.ohmygpt.com",
            ChannelType::AiProxy => "https://api.aiproxy.io",
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ChannelType,
    #[serde(default)]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl Channel {
    pub fn new(id: i64, name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: ChannelType::Custom,
            base_url: base_url.into(),
            key: None,
            enabled: true,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn resolved_base_url(&self) -> &str {
        let base_url = self.base_url.trim();
        if base_url.is_empty() {
            self.kind.default_base_url()
        } else {
            base_url
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelStoreError {
    #[error("channel not found: {id}")]
    NotFound { id: i64 },
    #[error("channel store unavailable: {message}")]
    Unavailable { message: String },
}

/// Channel configuration storage. Every call is one atomic unit; callers never hold its locks.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Picks an enabled channel serving `model` for `group`, preferring channels not in
    /// `exclude`.
    async fn select_channel(
        &self,
        group: &str,
        model: &str,
        exclude: &[i64],
    ) -> Result<Option<Channel>, ChannelStoreError>;

    /// Compare-and-set disable. Returns `true` only when this call flipped the flag.
    async fn disable_channel(&self, channel_id: i64) -> Result<bool, ChannelStoreError>;
}

#[derive(Clone, Debug)]
struct ChannelEntry {
    channel: Channel,
    models: Vec<String>,
    groups: Vec<String>,
}

impl ChannelEntry {
    fn serves(&self, group: &str, model: &str) -> bool {
        let model_ok = self.models.is_empty() || self.models.iter().any(|m| m == model);
        let group_ok = self.groups.is_empty() || self.groups.iter().any(|g| g == group);
        self.channel.enabled && model_ok && group_ok
    }
}

/// In-process channel store with round-robin rotation across eligible channels.
#[derive(Debug, Default)]
pub struct MemoryChannelStore {
    entries: RwLock<Vec<ChannelEntry>>,
    cursor: AtomicUsize,
}

impl MemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel. Empty `models` / `groups` mean "any".
    pub async fn insert(&self, channel: Channel, models: Vec<String>, groups: Vec<String>) {
        let mut entries = self.entries.write().await;
        entries.retain(|entry| entry.channel.id != channel.id);
        entries.push(ChannelEntry {
            channel,
            models,
            groups,
        });
    }

    pub async fn get(&self, channel_id: i64) -> Option<Channel> {
        self.entries
            .read()
            .await
            .iter()
            .find(|entry| entry.channel.id == channel_id)
            .map(|entry| entry.channel.clone())
    }

    pub async fn is_enabled(&self, channel_id: i64) -> Option<bool> {
        self.get(channel_id).await.map(|channel| channel.enabled)
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn select_channel(
        &self,
        group: &str,
        model: &str,
        exclude: &[i64],
    ) -> Result<Option<Channel>, ChannelStoreError> {
        let entries = self.entries.read().await;
        let eligible: Vec<&ChannelEntry> = entries
            .iter()
            .filter(|entry| entry.serves(group, model))
            .collect();
        if eligible.is_empty() {
            return Ok(None);
        }

        let fresh: Vec<&ChannelEntry> = eligible
            .iter()
            .copied()
            .filter(|entry| !exclude.contains(&entry.channel.id))
            .collect();
        let pool = if fresh.is_empty() { eligible } else { fresh };

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(Some(pool[start % pool.len()].channel.clone()))
    }

    async fn disable_channel(&self, channel_id: i64) -> Result<bool, ChannelStoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|entry| entry.channel.id == channel_id)
            .ok_or(ChannelStoreError::NotFound { id: channel_id })?;
        if !entry.channel.enabled {
            return Ok(false);
        }
        entry.channel.enabled = false;
        Ok(true)
    }
}
