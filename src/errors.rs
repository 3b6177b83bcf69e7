use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::models::SandboxProviderKind;

/// Shown to the client when a session could not be resumed.
pub const CONNECT_FAILED_MESSAGE: &str = "Failed to connect to sandbox";
/// Shown to the client when a provider call timed out.
pub const TIMED_OUT_MESSAGE: &str = "Sandbox connection timed out";
/// Fallback for everything that is not safe to show verbatim.
pub const GENERIC_ERROR_MESSAGE: &str = "Terminal error";

/// Failures raised by a sandbox session provider or its transport.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("sandbox provider '{0}' is not supported by this deployment")]
    Unsupported(SandboxProviderKind),
    #[error("sandbox provider is misconfigured: {0}")]
    Misconfigured(String),
    #[error("sandbox request timed out: {0}")]
    Timeout(String),
    #[error("sandbox {0} not found")]
    NotFound(String),
    #[error("pty {0} not found")]
    PtyNotFound(u32),
    #[error("sandbox request failed with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("sandbox request failed: {0}")]
    Transport(String),
}

impl ProviderError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::Timeout(_))
    }

    /// Errors that mean the deployment cannot serve this provider at all.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProviderError::Unsupported(_) | ProviderError::Misconfigured(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ProviderError::Timeout(error.to_string())
        } else if let Some(status) = error.status() {
            ProviderError::Status {
                status: status.as_u16(),
                message: error.to_string(),
            }
        } else {
            ProviderError::Transport(error.to_string())
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Safe to show to the end user verbatim.
    #[error("{0}")]
    UserFacing(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("thread api request failed: {0}")]
    ThreadApi(String),
    #[error("invalid channel: {0}")]
    InvalidChannel(String),
    #[error("invalid client message: {0}")]
    Protocol(String),
}

impl RelayError {
    pub fn user_facing(message: impl Into<String>) -> Self {
        RelayError::UserFacing(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RelayError::Provider(error) if error.is_timeout())
    }

    /// Retrying cannot help: the provider is unsupported or misconfigured.
    pub fn is_configuration(&self) -> bool {
        matches!(self, RelayError::Provider(error) if error.is_configuration())
    }

    /// The string placed in `state.error` when this error reaches the top of a
    /// message handler. Internal details never leave the process.
    pub fn user_message(&self) -> String {
        match self {
            RelayError::UserFacing(message) => message.clone(),
            RelayError::Provider(error) if error.is_timeout() => TIMED_OUT_MESSAGE.to_string(),
            RelayError::Provider(error) if error.is_configuration() => {
                CONNECT_FAILED_MESSAGE.to_string()
            }
            _ => GENERIC_ERROR_MESSAGE.to_string(),
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(error: reqwest::Error) -> Self {
        RelayError::ThreadApi(error.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match self {
            RelayError::InvalidChannel(_) | RelayError::Protocol(_) => StatusCode::BAD_REQUEST,
            RelayError::Provider(_) | RelayError::ThreadApi(_) => StatusCode::BAD_GATEWAY,
            RelayError::UserFacing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let code = match status.as_u16() {
            400 => "bad_request",
            502 => "upstream_failed",
            _ => "internal_error",
        }
        .to_string();

        let body = ErrorBody {
            code,
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
