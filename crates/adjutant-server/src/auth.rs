//! Bearer token gate for `/api`, `/ws` and `/mcp`.
//!
//! Browsers cannot set headers on a WebSocket handshake, so upgrades may
//! pass the key as a `token` query parameter instead.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

/// The expected API key.
#[derive(Debug, Clone)]
pub struct ApiKey {
    key: Arc<[u8]>,
}

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into().into_bytes().into(),
        }
    }

    /// Compare without short-circuiting on the first differing byte.
    fn verify(&self, provided: &[u8]) -> bool {
        if self.key.len() != provided.len() {
            return false;
        }
        self.key
            .iter()
            .zip(provided)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// The percent-decoded `token` query parameter, if any.
fn query_token(uri: &Uri) -> Option<String> {
    Query::<TokenQuery>::try_from_uri(uri).ok()?.0.token
}

fn unauthorized(code: &'static str, error: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": error, "code": code })),
    )
        .into_response()
}

/// Reject requests without the configured key. `/health` is always open.
pub async fn require_api_key(State(key): State<ApiKey>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if path == "/health" {
        return next.run(request).await;
    }

    let verified = match bearer_token(request.headers()) {
        Some(token) => Some(key.verify(token.as_bytes())),
        None if path.starts_with("/ws") => {
            query_token(request.uri()).map(|token| key.verify(token.as_bytes()))
        }
        None => None,
    };
    match verified {
        Some(true) => next.run(request).await,
        Some(false) => {
            tracing::warn!(%path, "Invalid API key");
            unauthorized("INVALID_API_KEY", "Invalid API key")
        }
        None => {
            tracing::warn!(%path, "Missing API key");
            unauthorized(
                "MISSING_API_KEY",
                "Missing Authorization header. Use: Authorization: Bearer <key>",
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_exact_key_only() {
        let key = ApiKey::new("s3cret");
        assert!(key.verify(b"s3cret"));
        assert!(!key.verify(b"s3cres"));
        assert!(!key.verify(b""));
        assert!(!key.verify(b"s3cret-longer"));
    }

    #[test]
    fn extracts_bearer_tokens() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert("authorization", "Basic dXNlcjpwYXNz".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
    }

    #[test]
    fn extracts_query_tokens() {
        let uri = |s: &str| s.parse::<Uri>().unwrap();
        assert_eq!(
            query_token(&uri("/ws/chat?agentId=a1&token=abc")).as_deref(),
            Some("abc")
        );
        assert_eq!(query_token(&uri("/ws/chat?agentId=a1")), None);
        assert_eq!(query_token(&uri("/ws/chat")), None);
    }

    #[test]
    fn query_tokens_are_percent_decoded() {
        let uri: Uri = "/ws/status?token=a%2Bb%26c%3D".parse().unwrap();
        let token = query_token(&uri).unwrap();
        assert_eq!(token, "a+b&c=");
        assert!(ApiKey::new("a+b&c=").verify(token.as_bytes()));
    }
}
