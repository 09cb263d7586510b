use super::config::RetryConfig;

pub(crate) const RETRY_QUERY_PARAM: &str = "retry";

/// Remaining attempt budget of one relay request, plus the target it replays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryContext {
    remaining: u32,
    path: String,
    query: Option<String>,
}

impl RetryContext {
    pub fn new(remaining: u32, path: impl Into<String>, query: Option<String>) -> Self {
        Self {
            remaining,
            path: path.into(),
            query: query.filter(|query| !query.is_empty()),
        }
    }

    /// Builds the context for an incoming request. The client-supplied `retry` parameter only
    /// counts when the config allows overriding; it is never forwarded upstream.
    pub fn from_request(config: &RetryConfig, path: &str, raw_query: Option<&str>) -> Self {
        let requested = raw_query.and_then(retry_from_query);
        let remaining = match requested {
            Some(value) if config.allow_client_override => value.min(config.max_client_retries),
            _ => config.times,
        };
        Self::new(remaining, path, raw_query.and_then(strip_retry_param))
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Path and query to replay against the next channel.
    pub fn path_and_query(&self) -> String {
        match self.query.as_deref() {
            Some(query) => format!("{}?{query}", self.path),
            None => self.path.clone(),
        }
    }

    /// Spends one unit of budget. Returns `false` once the budget is exhausted.
    pub fn try_consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

fn retry_from_query(query: &str) -> Option<u32> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(name, _)| *name == RETRY_QUERY_PARAM)
        .and_then(|(_, value)| value.trim().parse::<i64>().ok())
        .map(|value| value.clamp(0, i64::from(u32::MAX)) as u32)
}

fn strip_retry_param(query: &str) -> Option<String> {
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| pair.split('=').next() != Some(RETRY_QUERY_PARAM))
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept.join("&"))
    }
}
