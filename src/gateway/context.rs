use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use super::config::TokenConfig;

/// Caller identity attached to a request by the authentication layer in front of the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayContext {
    pub token_id: i64,
    pub token_name: String,
    pub user_id: i64,
    pub group: String,
}

impl RelayContext {
    pub fn new(
        token_id: i64,
        token_name: impl Into<String>,
        user_id: i64,
        group: impl Into<String>,
    ) -> Self {
        Self {
            token_id,
            token_name: token_name.into(),
            user_id,
            group: group.into(),
        }
    }
}

/// Resolves bearer tokens from a fixed table. Requests with unknown tokens pass through
/// without a context and are rejected by the relay handlers.
#[derive(Clone, Debug, Default)]
pub struct StaticTokenResolver {
    tokens: Arc<HashMap<String, RelayContext>>,
}

impl StaticTokenResolver {
    pub fn new(tokens: &[TokenConfig]) -> Self {
        let tokens = tokens
            .iter()
            .map(|token| {
                (
                    token.key.clone(),
                    RelayContext::new(token.token_id, &token.name, token.user_id, &token.group),
                )
            })
            .collect();
        Self {
            tokens: Arc::new(tokens),
        }
    }

    pub fn resolve(&self, headers: &HeaderMap) -> Option<RelayContext> {
        let token = extract_bearer(headers)?;
        self.tokens.get(&token).cloned()
    }
}

/// Middleware for `axum::middleware::from_fn_with_state`.
pub async fn resolve_relay_context(
    State(resolver): State<StaticTokenResolver>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(ctx) = resolver.resolve(req.headers()) {
        req.extensions_mut().insert(ctx);
    }
    next.run(req).await
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}
