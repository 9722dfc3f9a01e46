/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ringlink_protocol::{ErrorBody, ErrorCategory};
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("missing or unknown credential")]
    Unauthenticated,
    #[error("validation failed: {0}")]
    Validation(String),
    /// Unknown call or caller is not a participant. Both look the same to the client.
    #[error("call not found")]
    NotFound,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("rate limited")]
    RateLimited,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::Unauthenticated => ErrorCategory::AuthenticationFailed,
            RelayError::Validation(_) | RelayError::InvalidState(_) => ErrorCategory::InvalidParameters,
            RelayError::NotFound => ErrorCategory::NotFound,
            RelayError::RateLimited | RelayError::Internal(_) => ErrorCategory::Unavailable,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            RelayError::Validation(_) | RelayError::InvalidState(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound => StatusCode::NOT_FOUND,
            RelayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Internal(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        if let RelayError::Internal(e) = &self {
            error!("internal relay error: {e:#}");
        }
        let body = ErrorBody {
            error: self.category().message().to_string(),
        };
        (self.status(), axum::Json(body)).into_response()
    }
}
