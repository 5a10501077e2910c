use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::rate_limit::RateLimitDecision;

/// Error body returned by every endpoint on failure.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// One of `VALIDATION_ERROR`, `RATE_LIMITED`, `NOT_FOUND`, `INTERNAL_ERROR`
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("{0}")]
    Validation(String),
    #[error("rate limit exceeded")]
    RateLimited(RateLimitDecision),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntakeError {
    pub fn status(&self) -> StatusCode {
        match self {
            IntakeError::Validation(_) => StatusCode::BAD_REQUEST,
            IntakeError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            IntakeError::NotFound(_) => StatusCode::NOT_FOUND,
            IntakeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Attach `X-RateLimit-*` headers to a response.
pub fn with_rate_limit_headers(mut response: Response, decision: &RateLimitDecision) -> Response {
    for (name, value) in decision.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            IntakeError::Validation(message) => (
                status,
                Json(ErrorBody {
                    code: "VALIDATION_ERROR",
                    message,
                }),
            )
                .into_response(),
            IntakeError::RateLimited(decision) => {
                let response = (
                    status,
                    Json(ErrorBody {
                        code: "RATE_LIMITED",
                        message: format!(
                            "Rate limit exceeded. Try again after {}",
                            decision.reset
                        ),
                    }),
                )
                    .into_response();
                with_rate_limit_headers(response, &decision)
            }
            IntakeError::NotFound(message) => (
                status,
                Json(ErrorBody {
                    code: "NOT_FOUND",
                    message,
                }),
            )
                .into_response(),
            IntakeError::Internal(e) => {
                error!("Internal error: {:#}", e);
                (
                    status,
                    Json(ErrorBody {
                        code: "INTERNAL_ERROR",
                        message: "Internal server error".into(),
                    }),
                )
                    .into_response()
            }
        }
    }
}
