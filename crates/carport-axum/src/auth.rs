//! Bearer token extractor
//!
//! Callers present `Authorization: Bearer <token>`. The state decides which
//! tokens are valid and who they belong to through [`TokenValidator`]; when no
//! tokens are configured every request is let through anonymously.
//!
//! # Example
//!
//! ```no_run
//! use axum::{Router, routing::get};
//! use carport_axum::auth::{ExtractCaller, StaticTokens};
//!
//! async fn handler(ExtractCaller(caller): ExtractCaller) -> String {
//!     format!("hello {}", caller.unwrap_or_else(|| "anonymous".into()))
//! }
//!
//! # fn build() -> Router {
//! let tokens: StaticTokens = "ci:s3cret".parse().unwrap();
//! Router::new().route("/", get(handler)).with_state(tokens)
//! # }
//! ```

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::str::FromStr;

use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Maps bearer tokens to caller ids
pub trait TokenValidator {
    /// Caller id for `token`, or `None` if it is not accepted
    fn validate(&self, token: &str) -> Option<String>;

    /// Whether requests must carry a token at all
    fn is_enabled(&self) -> bool;
}

/// State that can authenticate callers
pub trait CallerAuth {
    /// Validator in use
    type Validator: TokenValidator;

    /// The validator to check tokens against
    fn validator(&self) -> &Self::Validator;
}

/// Fixed token set, parsed from `name:token` pairs separated by commas
///
/// An empty set disables authentication.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: BTreeMap<String, String>,
}

impl StaticTokens {
    /// No tokens, auth disabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `caller`
    pub fn with_token(mut self, caller: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), caller.into());
        self
    }

    /// Number of accepted tokens
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// True when auth is disabled
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl FromStr for StaticTokens {
    type Err = Infallible;

    /// Entries without a `name:` prefix are named after their position
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = Self::new();
        for (i, entry) in s.split(',').map(str::trim).filter(|e| !e.is_empty()).enumerate() {
            tokens = match entry.split_once(':') {
                Some((caller, token)) => tokens.with_token(caller.trim(), token.trim()),
                None => tokens.with_token(format!("token-{}", i), entry),
            };
        }
        Ok(tokens)
    }
}

impl TokenValidator for StaticTokens {
    fn validate(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }

    fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }
}

impl CallerAuth for StaticTokens {
    type Validator = Self;

    fn validator(&self) -> &Self::Validator {
        self
    }
}

/// Extracts the authenticated caller id
///
/// `None` when authentication is disabled.
pub struct ExtractCaller(pub Option<String>);

/// Why a request was not authenticated
#[derive(Debug, Error, miette::Diagnostic)]
pub enum AuthError {
    /// No Authorization header
    #[error("missing Authorization header")]
    MissingAuthHeader,

    /// Authorization header is not `Bearer <token>`
    #[error("invalid Authorization header format")]
    InvalidAuthHeader,

    /// Token is not one we accept
    #[error("unknown bearer token")]
    UnknownToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        tracing::warn!("authentication failed: {}", self);

        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer")],
            Json(json!({
                "ok": false,
                "error": "Unauthorized",
                "message": self.to_string(),
                "retryable": false,
            })),
        )
            .into_response()
    }
}

impl<S> FromRequestParts<S> for ExtractCaller
where
    S: CallerAuth + Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let validator = state.validator();
        if !validator.is_enabled() {
            return Ok(ExtractCaller(None));
        }

        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .ok_or(AuthError::MissingAuthHeader)?;

        let token = auth_header
            .to_str()
            .map_err(|_| AuthError::InvalidAuthHeader)?
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidAuthHeader)?;

        validator
            .validate(token.trim())
            .map(|caller| ExtractCaller(Some(caller)))
            .ok_or(AuthError::UnknownToken)
    }
}
