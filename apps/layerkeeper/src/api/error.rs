//! # Error Responses
//!
//! Maps [`AppError`] onto HTTP status codes.
//!
//! | Error | Status |
//! |---|---|
//! | `NotFound` | 404 |
//! | `InvalidState`, `TraitCycle` | 409 |
//! | `InvalidId`, bad input | 400 |
//! | `ConstraintViolation` | 422 |
//! | `TransientStore` | 503 |
//! | `Serialization`, I/O, config | 500 |

use super::types::ErrorResponse;
use crate::error::AppError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use layerkeeper_core::StoreError;

/// Error returned by every fallible handler.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            AppError::Store(e) => match e {
                StoreError::NotFound(_) => StatusCode::NOT_FOUND,
                StoreError::InvalidState(_) | StoreError::TraitCycle(_) => StatusCode::CONFLICT,
                StoreError::InvalidId { .. } => StatusCode::BAD_REQUEST,
                StoreError::ConstraintViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                StoreError::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
                StoreError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Input(_) => StatusCode::BAD_REQUEST,
            AppError::Io(_) | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        Self(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(AppError::Store(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, status = status.as_u16(), "request rejected");
        }
        (status, Json(ErrorResponse::new(self.0.to_string()))).into_response()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_statuses() {
        let cases = [
            (StoreError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (StoreError::InvalidState("x".into()), StatusCode::CONFLICT),
            (
                StoreError::InvalidId {
                    kind: "layer",
                    id: "".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                StoreError::ConstraintViolation("x".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                StoreError::TransientStore("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[test]
    fn input_errors_are_bad_requests() {
        let error = ApiError::from(AppError::Input("bad".into()));
        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
    }
}
