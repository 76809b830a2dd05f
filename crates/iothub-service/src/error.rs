use std::time::Duration;

use crate::transport::TransportError;

/// A boxed error type for external capabilities (token sources, transports).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `connect` has not succeeded yet.
    #[error("not connected")]
    NotConnected,

    /// The primary connection was closed or its token renewal failed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The client itself was closed and cannot be reused.
    #[error("client is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("token generation failed: {0}")]
    Token(BoxError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Event endpoint discovery received a message instead of a link redirect.
    #[error("expected a link redirect, received a message")]
    RedirectExpected,

    #[error("malformed redirect: {0}")]
    InvalidRedirect(String),

    #[error("request failed: code = {status}, body = {body:?}")]
    Rest { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, Error>;
