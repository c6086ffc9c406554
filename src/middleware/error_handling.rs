use crate::error::AppError;
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

/// JSON error envelope returned to clients on every failure path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    pub error_type: String,
    pub code: String,
    /// Whether retrying the operation (with the same idempotency key for
    /// sends) can succeed.
    pub retryable: bool,
}

pub fn map_error(err: &AppError) -> (StatusCode, ErrorResponse) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let (error_type, code) = match err {
        AppError::Validation(_) => ("validation_error", "INVALID_REQUEST"),
        AppError::Unauthorized => ("authentication_error", "INVALID_CREDENTIALS"),
        AppError::Forbidden => ("authorization_error", "NOT_A_PARTICIPANT"),
        AppError::NotFound => ("not_found_error", "NOT_FOUND"),
        AppError::TransientStore(_) => ("transient_error", "STORE_UNAVAILABLE"),
        AppError::Database(_) => ("server_error", "DATABASE_ERROR"),
        AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => {
            ("server_error", "INTERNAL_SERVER_ERROR")
        }
    };

    let response = ErrorResponse {
        error: match status {
            StatusCode::BAD_REQUEST => "Bad Request",
            StatusCode::UNAUTHORIZED => "Unauthorized",
            StatusCode::FORBIDDEN => "Forbidden",
            StatusCode::NOT_FOUND => "Not Found",
            StatusCode::SERVICE_UNAVAILABLE => "Service Unavailable",
            StatusCode::INTERNAL_SERVER_ERROR => "Internal Server Error",
            _ => "Error",
        }
        .to_string(),
        message: err.to_string(),
        status: status.as_u16(),
        error_type: error_type.to_string(),
        code: code.to_string(),
        retryable: err.is_retryable(),
    };

    (status, response)
}

pub fn into_response(err: AppError) -> impl IntoResponse {
    let (status, response) = map_error(&err);
    (status, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_validation_error_to_400() {
        let (status, body) = map_error(&AppError::Validation("empty content".into()));
        assert_eq!(status.as_u16(), 400);
        assert_eq!(body.error_type, "validation_error");
        assert!(!body.retryable);
    }

    #[test]
    fn maps_transient_store_error_to_503_retryable() {
        let (status, body) = map_error(&AppError::TransientStore("pool exhausted".into()));
        assert_eq!(status.as_u16(), 503);
        assert!(body.retryable);
    }

    #[test]
    fn maps_auth_error_to_401() {
        let (status, body) = map_error(&AppError::Unauthorized);
        assert_eq!(status.as_u16(), 401);
        assert_eq!(body.error_type, "authentication_error");
        assert!(!body.retryable);
    }
}
