use std::time::Duration;
use thiserror::Error;

/// Errors produced by the panel console and auth layers.
#[derive(Debug, Error)]
pub enum PanelError {
    /// Unknown process id. Surfaced immediately, never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing, expired or invalid session.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Login throttle is active for the caller's address.
    #[error("rate limited: retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// A single subscriber overflowed or a command could not be forwarded.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Read/write error on one connection.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl PanelError {
    /// Whether the error only affects the current delivery and the
    /// connection may carry on.
    pub fn is_transient(&self) -> bool {
        matches!(self, PanelError::Delivery(_))
    }
}

pub type PanelResult<T> = Result<T, PanelError>;
