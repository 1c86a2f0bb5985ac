//! Identity resolution for upgrade requests.
//!
//! Courier does not authenticate anyone itself. A proxy in front of it does
//! that and forwards the principal in a trusted header; this module only
//! reads it back.

use crate::config::IdentityConfig;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use courier_core::Identity;
use thiserror::Error;

/// Identity resolution errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The request carries no identity.
    #[error("Missing identity")]
    Missing,

    /// The identity header is not valid UTF-8.
    #[error("Malformed identity header")]
    Malformed,

    /// The configured header name is not a valid HTTP header name.
    #[error("Invalid identity header name: {0}")]
    InvalidHeaderName(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

/// Maps an HTTP request to the identity it acts for.
pub trait IdentityResolver: Send + Sync {
    /// Resolve the caller's identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the request carries no usable identity.
    fn resolve(
        &self,
        headers: &HeaderMap,
        query_identity: Option<&str>,
    ) -> Result<Identity, AuthError>;
}

/// Reads the identity from a trusted header, optionally falling back to a
/// query parameter.
#[derive(Debug, Clone)]
pub struct HeaderIdentity {
    header: HeaderName,
    allow_query_param: bool,
}

impl HeaderIdentity {
    /// Build a resolver from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured header name is invalid.
    pub fn from_config(config: &IdentityConfig) -> Result<Self, AuthError> {
        let header = HeaderName::try_from(config.header.as_str())
            .map_err(|_| AuthError::InvalidHeaderName(config.header.clone()))?;
        Ok(Self {
            header,
            allow_query_param: config.allow_query_param,
        })
    }
}

impl IdentityResolver for HeaderIdentity {
    fn resolve(
        &self,
        headers: &HeaderMap,
        query_identity: Option<&str>,
    ) -> Result<Identity, AuthError> {
        if let Some(value) = headers.get(&self.header) {
            let identity = value.to_str().map_err(|_| AuthError::Malformed)?.trim();
            if !identity.is_empty() {
                return Ok(identity.to_string());
            }
        }

        if self.allow_query_param {
            if let Some(identity) = query_identity.map(str::trim) {
                if !identity.is_empty() {
                    return Ok(identity.to_string());
                }
            }
        }

        Err(AuthError::Missing)
    }
}
