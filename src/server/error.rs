use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::error::Error;

/// Server error type that maps to HTTP status codes.
#[derive(Debug)]
pub enum ServerError {
    NotFound(String),
    /// A path component below the root resolved to a file.
    NotADirectory(String),
    Forbidden(String),
    /// The requested range lies outside a file of this size.
    RangeNotSatisfiable(u64),
    Internal(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::NotADirectory(msg) => write!(f, "not a directory: {msg}"),
            Self::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            Self::RangeNotSatisfiable(size) => write!(f, "range not satisfiable for size {size}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) | Self::NotADirectory(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(status = %status, error = %self);
        } else {
            tracing::debug!(status = %status, error = %self);
        }
        match self {
            Self::RangeNotSatisfiable(size) => (
                status,
                [(header::CONTENT_RANGE, format!("bytes */{size}"))],
                status.to_string(),
            )
                .into_response(),
            other => (status, other.to_string()).into_response(),
        }
    }
}

impl From<Error> for ServerError {
    fn from(e: Error) -> Self {
        match e.root_cause() {
            Error::NotFound(_) => Self::NotFound(e.to_string()),
            Error::NotADirectory(path) => Self::NotADirectory(path.clone()),
            _ => Self::Internal(e.to_string()),
        }
    }
}
