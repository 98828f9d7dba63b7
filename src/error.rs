//! Error taxonomy for the screenshot pipeline
//!
//! Only [`ServiceError`] is ever shown to a client. Store and rate-limit
//! failures degrade the request instead of failing it.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use thiserror::Error;

/// Rejection of an inbound request before any downstream work happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Missing url parameter")]
    MissingUrl,

    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    #[error("Unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid {param} parameter: {value:?} is not a number")]
    NotANumber { param: &'static str, value: String },

    #[error("Invalid {param} parameter: {value} is outside {min}..={max}")]
    OutOfRange {
        param: &'static str,
        value: u64,
        min: u32,
        max: u32,
    },
}

/// Failure talking to the blob store. Never fatal to a request.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Store transport error: {0}")]
    Transport(String),

    #[error("Store access denied: {0}")]
    AccessDenied(String),

    #[error("Store body error: {0}")]
    Body(String),

    #[error("Store error: {0}")]
    Other(String),
}

/// Failure anywhere between engine acquisition and JPEG capture.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("Renderer launch failed: {0}")]
    Launch(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    #[error("Screenshot capture failed: {0}")]
    Capture(String),

    #[error("Renderer pool is shut down")]
    PoolClosed,
}

impl RenderError {
    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::Launch(_) => "launch",
            RenderError::Navigation(_) => "navigation",
            RenderError::Timeout { .. } => "timeout",
            RenderError::Capture(_) => "capture",
            RenderError::PoolClosed => "pool_closed",
        }
    }
}

/// Failure of the rate-limit counter store.
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// User-visible outcome of a failed screenshot request.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    InvalidInput(#[from] ValidationError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ServiceError::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let body = match &self {
            ServiceError::InvalidInput(e) => e.to_string(),
            // Cause is logged by the orchestrator, never sent to the client.
            ServiceError::Render(_) => "Internal Server Error".to_string(),
        };

        (
            self.status(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response()
    }
}
