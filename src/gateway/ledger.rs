use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("unknown user: {user_id}")]
    UnknownUser { user_id: i64 },
    #[error("ledger unavailable: {message}")]
    Unavailable { message: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsumeLogEntry {
    pub user_id: i64,
    pub channel_id: i64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub model: String,
    pub token_name: String,
    pub quota: u64,
    pub content: String,
}

/// Balance bookkeeping shared by every relay worker. Each method is one atomic operation on
/// the backing store.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    async fn consume_token_quota(&self, token_id: i64, quota: u64) -> Result<(), LedgerError>;

    async fn refresh_user_quota_cache(&self, user_id: i64) -> Result<(), LedgerError>;

    async fn record_consume_log(&self, entry: ConsumeLogEntry) -> Result<(), LedgerError>;

    /// Adds to the user's used quota and bumps its request count.
    async fn add_user_used_quota(&self, user_id: i64, quota: u64) -> Result<(), LedgerError>;

    async fn add_channel_used_quota(&self, channel_id: i64, quota: u64)
    -> Result<(), LedgerError>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub token_consumed: HashMap<i64, u64>,
    pub token_remaining: HashMap<i64, u64>,
    /// Charges that exceeded the token's remaining balance.
    pub token_overdraft: HashMap<i64, u64>,
    pub user_used_quota: HashMap<i64, u64>,
    pub user_request_count: HashMap<i64, u64>,
    pub user_cache_refreshes: HashMap<i64, u64>,
    pub channel_used_quota: HashMap<i64, u64>,
    pub logs: Vec<ConsumeLogEntry>,
}

/// Ledger kept in process memory. Tokens without a configured balance are unlimited.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerSnapshot>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_token_balance(&self, token_id: i64, remaining: u64) {
        self.state
            .lock()
            .await
            .token_remaining
            .insert(token_id, remaining);
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl QuotaLedger for MemoryLedger {
    async fn consume_token_quota(&self, token_id: i64, quota: u64) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        // The debit always lands; a short balance bottoms out at zero and the shortfall is
        // kept as overdraft.
        let mut shortfall = 0;
        if let Some(remaining) = state.token_remaining.get_mut(&token_id) {
            shortfall = quota.saturating_sub(*remaining);
            *remaining = remaining.saturating_sub(quota);
        }
        if shortfall > 0 {
            let overdraft = state.token_overdraft.entry(token_id).or_insert(0);
            *overdraft = overdraft.saturating_add(shortfall);
        }
        let consumed = state.token_consumed.entry(token_id).or_insert(0);
        *consumed = consumed.saturating_add(quota);
        Ok(())
    }

    async fn refresh_user_quota_cache(&self, user_id: i64) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let refreshes = state.user_cache_refreshes.entry(user_id).or_insert(0);
        *refreshes = refreshes.saturating_add(1);
        Ok(())
    }

    async fn record_consume_log(&self, entry: ConsumeLogEntry) -> Result<(), LedgerError> {
        self.state.lock().await.logs.push(entry);
        Ok(())
    }

    async fn add_user_used_quota(&self, user_id: i64, quota: u64) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let used = state.user_used_quota.entry(user_id).or_insert(0);
        *used = used.saturating_add(quota);
        let count = state.user_request_count.entry(user_id).or_insert(0);
        *count = count.saturating_add(1);
        Ok(())
    }

    async fn add_channel_used_quota(
        &self,
        channel_id: i64,
        quota: u64,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let used = state.channel_used_quota.entry(channel_id).or_insert(0);
        *used = used.saturating_add(quota);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_tokens_accumulate() {
        let ledger = MemoryLedger::new();
        ledger.consume_token_quota(1, 10).await.unwrap();
        ledger.consume_token_quota(1, 5).await.unwrap();
        assert_eq!(ledger.snapshot().await.token_consumed.get(&1), Some(&15));
    }

    #[tokio::test]
    async fn bounded_tokens_bottom_out_and_record_overdraft() {
        let ledger = MemoryLedger::new();
        ledger.set_token_balance(1, 8).await;
        ledger.consume_token_quota(1, 5).await.unwrap();
        ledger.consume_token_quota(1, 5).await.unwrap();
        ledger.consume_token_quota(1, 5).await.unwrap();

        let snapshot = ledger.snapshot().await;
        assert_eq!(snapshot.token_remaining.get(&1), Some(&0));
        assert_eq!(snapshot.token_consumed.get(&1), Some(&15));
        assert_eq!(snapshot.token_overdraft.get(&1), Some(&7));
    }

    #[tokio::test]
    async fn user_used_quota_counts_requests() {
        let ledger = MemoryLedger::new();
        ledger.add_user_used_quota(9, 100).await.unwrap();
        ledger.add_user_used_quota(9, 0).await.unwrap();
        let snapshot = ledger.snapshot().await;
        assert_eq!(snapshot.user_used_quota.get(&9), Some(&100));
        assert_eq!(snapshot.user_request_count.get(&9), Some(&2));
    }
}
