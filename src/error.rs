//! HTTP-facing error taxonomy.
//!
//! Handlers return [`ApiError`]; each variant maps to one status code and a
//! short plain-text body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::forward::ForwardError;
use crate::tasks::task::TaskError;
use crate::tasks::RegistryError;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed body or missing parameter.
    #[error("{0}")]
    Validation(String),
    /// Request refused by policy (forbidden command).
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    /// Task registry is full.
    #[error("{0}")]
    Capacity(String),
    /// Backend dial or transport failure.
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Capacity(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self::Capacity(e.to_string())
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<ForwardError> for ApiError {
    fn from(e: ForwardError) -> Self {
        match e {
            ForwardError::MissingTargetName => Self::Validation(e.to_string()),
            ForwardError::UnknownTarget(_) => Self::NotFound(e.to_string()),
            ForwardError::InvalidTarget(_) => Self::Internal(e.to_string()),
            ForwardError::Upstream(_) | ForwardError::Handshake(_) => {
                Self::BadGateway(e.to_string())
            }
        }
    }
}
