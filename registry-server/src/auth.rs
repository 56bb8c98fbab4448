//! Publisher allow-list gate for mutating endpoints.
//!
//! Allow-listed identities log in and receive the shared publisher token.
//! Mutating handlers take a [`Publisher`] extractor, which rejects the request
//! before the body is read unless it carries that token as the `AuthSession`
//! cookie or as a bearer token.
//!
//! The token is a single process-wide value: it is not bound to an identity
//! and does not expire.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{error::AppError, state::AppState};

/// Name of the session cookie npm clients and browsers send back.
pub const SESSION_COOKIE: &str = "AuthSession";

#[derive(Debug, Default)]
pub struct AuthGate {
    publishers: HashSet<String>,
    token: OnceLock<String>,
}

impl AuthGate {
    pub fn new<I, S>(publishers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AuthGate {
            publishers: publishers.into_iter().map(Into::into).collect(),
            token: OnceLock::new(),
        }
    }

    pub fn is_publisher(&self, identity: &str) -> bool {
        self.publishers.contains(identity)
    }

    /// Grant the publisher token to an allow-listed identity.
    pub fn login(&self, identity: &str) -> Result<String, AppError> {
        if !self.is_publisher(identity) {
            warn!(user = %identity, "Login refused for identity outside allow-list");
            return Err(AppError::Unauthorized(format!(
                "'{}' is not an allowed publisher",
                identity
            )));
        }

        let token = self
            .token
            .get_or_init(|| Uuid::new_v4().to_string())
            .clone();
        info!(user = %identity, "Publisher logged in");
        Ok(token)
    }

    /// True only for the issued publisher token.
    pub fn authorize(&self, token: Option<&str>) -> bool {
        match (self.token.get(), token) {
            (Some(issued), Some(presented)) => issued == presented,
            _ => false,
        }
    }

    /// Check request headers for the publisher token.
    pub fn require(&self, headers: &HeaderMap) -> Result<(), AppError> {
        if self.authorize(token_from_headers(headers).as_deref()) {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                "A publisher session is required".to_string(),
            ))
        }
    }
}

/// Extract bearer token from Authorization header
fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

fn extract_session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

/// The session token carried by a request, cookie first.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    extract_session_cookie(headers).or_else(|| extract_bearer_token(headers))
}

/// `Set-Cookie` value for a freshly issued token.
pub fn session_cookie(token: &str) -> String {
    format!("{}={}; Path=/; HttpOnly", SESSION_COOKIE, token)
}

/// Proof that the request carries the publisher token.
#[derive(Debug, Clone, Copy)]
pub struct Publisher;

impl FromRequestParts<Arc<AppState>> for Publisher {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        state.auth.require(&parts.headers).map(|()| Publisher)
    }
}
