//! HTTP error surface.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

/// The Basic auth realm advertised on 401 responses.
pub const REALM: &str = "Git Repositories";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("repository not found")]
    NotFound,

    /// Anonymous caller needs credentials (or presented bad ones).
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated caller lacks the capability.
    #[error("forbidden")]
    Forbidden,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound => (StatusCode::NOT_FOUND, "repository not found\n").into_response(),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(
                    header::WWW_AUTHENTICATE,
                    format!("Basic realm=\"{REALM}\""),
                )],
                "authorization required\n",
            )
                .into_response(),
            Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden\n").into_response(),
            Self::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, format!("bad request: {msg}\n")).into_response()
            }
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error\n").into_response()
            }
        }
    }
}

impl From<crate::broker::BrokerError> for ApiError {
    fn from(err: crate::broker::BrokerError) -> Self {
        Self::Internal(err.into())
    }
}

impl From<crate::pktline::ProtocolError> for ApiError {
    fn from(err: crate::pktline::ProtocolError) -> Self {
        Self::Internal(err.into())
    }
}
