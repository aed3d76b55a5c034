//! Mapping from the domain error taxonomy to HTTP statuses.
//!
//! Clients branch on the `error` code, never on the message. Fatal errors keep their detail in
//! the log and answer with a generic message.

use domains::{DomainError, ErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// Header carrying the authenticated user id, set by the session layer in front of this service.
pub const CALLER_HEADER: &str = "x-agora-uid";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("missing or malformed x-agora-uid header")]
    MissingCaller,

    #[error("bad request: {0}")]
    BadRequest(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Domain(err) => match err.kind() {
                ErrorKind::Validation => 400,
                ErrorKind::Conflict => 409,
                ErrorKind::Authorization => 403,
                ErrorKind::NotFound => 404,
                ErrorKind::Fatal => 500,
            },
            ApiError::MissingCaller => 401,
            ApiError::BadRequest(_) => 400,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Domain(err) => err.code(),
            ApiError::MissingCaller => "auth_required",
            ApiError::BadRequest(_) => "bad_request",
        }
    }

    pub fn body(&self) -> ErrorBody {
        let message = match self {
            ApiError::Domain(err) if err.kind() == ErrorKind::Fatal => {
                error!(error = %err, code = err.code(), "request failed");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        ErrorBody {
            error: self.code().to_string(),
            message,
        }
    }
}

#[cfg(feature = "web-axum")]
impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = axum::http::StatusCode::from_u16(self.status())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        (status, axum::Json(self.body())).into_response()
    }
}
