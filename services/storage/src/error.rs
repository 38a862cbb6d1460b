//! Error taxonomy for the object broker and its HTTP mapping.

use crate::config::ConfigError;
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors produced by broker operations.
///
/// The HTTP boundary matches on every variant, so adding one forces the
/// status mapping below to be revisited.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Object key absent, or the path lies outside the managed namespace
    #[error("Object not found")]
    NotFound,

    /// Policy evaluation rejected the request
    #[error("Access denied")]
    AccessDenied,

    /// Backend call failed or the object body could not be streamed
    #[error("Storage backend error: {0:#}")]
    Transport(#[source] anyhow::Error),

    /// Backend credentials missing or invalid
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

impl BrokerError {
    /// Map to an HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BrokerError::NotFound => StatusCode::NOT_FOUND,
            BrokerError::AccessDenied => StatusCode::FORBIDDEN,
            BrokerError::Transport(_) | BrokerError::Configuration(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::NotFound => "NOT_FOUND",
            BrokerError::AccessDenied => "ACCESS_DENIED",
            BrokerError::Transport(_) => "BACKEND_ERROR",
            BrokerError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();

        // Backend details stay in the logs; callers get a generic message.
        let message = match &self {
            BrokerError::NotFound | BrokerError::AccessDenied => self.to_string(),
            BrokerError::Transport(_) | BrokerError::Configuration(_) => {
                error!(error = %self, "Failed to serve object request");
                "Failed to serve object".to_string()
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                code: self.code().to_string(),
            }),
        )
            .into_response()
    }
}
