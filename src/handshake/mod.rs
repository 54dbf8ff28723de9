//! Request capability the session layer drives, and the errors it can raise.
//!
//! HTTP plumbing (connections, headers, retries on the wire) belongs to the
//! caller. The core only needs something that can deliver a JSON request to
//! the device's `/xled/v1/` API and hand back the decoded body.

use async_trait::async_trait;
use thiserror::Error;

use crate::messages::{ApplicationReply, Token};

pub mod transport;

/// Errors raised while authenticating or talking to the device API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// `login` or `verify` failed; callers decide whether to retry.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// The device answered the challenge with an unexpected digest.
    #[error("challenge-response mismatch: expected {expected}, device sent {received}")]
    Integrity { expected: String, received: String },
    /// Token lifetime elapsed and automatic refresh is disabled.
    #[error("authentication token expired")]
    TokenExpired,
    /// The device rejected the token (HTTP 401).
    #[error("authentication token rejected by device")]
    InvalidToken,
    #[error("transport error: {0}")]
    Transport(String),
    /// The call went through but the application code was not a success.
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One call against the device API, path relative to `/xled/v1/`.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub token: Option<Token>,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: None,
            token: None,
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            body: Some(body),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }
}

/// Capability to send a request and decode the JSON reply.
///
/// Implementations attach `token` as the `X-Auth-Token` header, map HTTP 401
/// to [`AuthError::InvalidToken`] and other transport failures to
/// [`AuthError::Transport`]. Application codes are left to the caller.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<ApplicationReply, AuthError>;
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for std::sync::Arc<T> {
    async fn send(&self, request: HttpRequest) -> Result<ApplicationReply, AuthError> {
        (**self).send(request).await
    }
}
