//! Access checks for thread streams and reads.
//!
//! The authentication protocol itself lives elsewhere; this module only
//! carries the opaque bearer token it produces to an [`Authorizer`].

use std::collections::HashSet;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use skein_core::ids::ThreadId;

/// Opaque caller identity taken from `Authorization: Bearer <token>`.
#[derive(Clone, PartialEq, Eq)]
pub struct Principal(String);

impl Principal {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))?
            .trim();
        (!token.is_empty()).then(|| Self(token.to_owned()))
    }
}

impl std::fmt::Debug for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Principal(..)")
    }
}

pub trait Authorizer: Send + Sync {
    /// Whether requests without a principal are rejected outright.
    fn requires_principal(&self) -> bool {
        false
    }

    fn authorize(&self, principal: Option<&Principal>, thread_id: &ThreadId) -> bool;
}

/// Lets everyone read everything.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _: Option<&Principal>, _: &ThreadId) -> bool {
        true
    }
}

/// Accepts a fixed set of bearer tokens for every thread.
pub struct StaticTokens {
    tokens: HashSet<String>,
}

impl StaticTokens {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl Authorizer for StaticTokens {
    fn requires_principal(&self) -> bool {
        true
    }

    fn authorize(&self, principal: Option<&Principal>, _: &ThreadId) -> bool {
        principal.is_some_and(|p| self.tokens.contains(p.token()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("access denied")]
    Denied,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Missing => StatusCode::UNAUTHORIZED,
            Self::Denied => StatusCode::FORBIDDEN,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Resolve the caller and check access to `thread_id`.
pub fn check(
    authorizer: &dyn Authorizer,
    headers: &HeaderMap,
    thread_id: &ThreadId,
) -> Result<Option<Principal>, AuthError> {
    let principal = Principal::from_headers(headers);
    if principal.is_none() && authorizer.requires_principal() {
        return Err(AuthError::Missing);
    }
    if !authorizer.authorize(principal.as_ref(), thread_id) {
        tracing::debug!(thread_id = %thread_id, "thread access denied");
        return Err(AuthError::Denied);
    }
    Ok(principal)
}

/// For reads that span every thread, such as aggregated metrics.
pub fn require_principal(authorizer: &dyn Authorizer, headers: &HeaderMap) -> Result<Option<Principal>, AuthError> {
    let principal = Principal::from_headers(headers);
    if !authorizer.requires_principal() {
        return Ok(principal);
    }
    match principal {
        None => Err(AuthError::Missing),
        Some(p) if authorizer.authorize(Some(&p), &ThreadId::from("*")) => Ok(Some(p)),
        Some(_) => Err(AuthError::Denied),
    }
}
