//! Bearer-token authentication through the protocol's `AuthPort`.

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use melony_protocol::{AuthPort, MelonyError, MelonyResult, Principal};

/// Accepts exactly one shared token.
#[derive(Debug, Clone)]
pub struct StaticTokenAuth {
    token: String,
    subject: String,
}

impl StaticTokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            subject: "api-client".to_owned(),
        }
    }
}

#[async_trait]
impl AuthPort for StaticTokenAuth {
    async fn authenticate(&self, credential: &str) -> MelonyResult<Principal> {
        if !self.token.is_empty() && credential == self.token {
            Ok(Principal {
                subject: self.subject.clone(),
            })
        } else {
            Err(MelonyError::Unauthorized("invalid bearer token".to_owned()))
        }
    }
}

/// The credential of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}
