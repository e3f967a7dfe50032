//! Error types and HTTP error response handling.
//!
//! This module defines application-level errors and how they are converted
//! into HTTP responses with appropriate status codes and JSON bodies.
//!
//! Note that the Payme callback protocol has its own error contract
//! (numeric codes, trilingual messages) which is handled separately in
//! `services::payme_service` / `handlers::payme`; `AppError` covers
//! everything outside that protocol.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::services::billz_order::DispatchError;

/// Application-wide error type.
///
/// # Error Categories
///
/// - **Database Errors**: Any sqlx::Error from database operations
/// - **Validation Errors**: Invalid request data
/// - **Dispatch Errors**: Billz order creation failures on the direct path
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Database operation failed (e.g., connection error, query error).
    ///
    /// This wraps any sqlx::Error using the `#[from]` attribute, which
    /// automatically implements `From<sqlx::Error> for AppError`.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Request body or parameters are invalid.
    ///
    /// Returns HTTP 400 Bad Request.
    /// The String contains details about what was invalid.
    #[error("Invalid request")]
    InvalidRequest(String),

    /// Billz order dispatch failed on the synchronous (cash-order) path.
    ///
    /// Returns HTTP 502 Bad Gateway.
    #[error("Order dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Convert AppError into an HTTP response.
///
/// # Response Format
///
/// All errors return JSON in this format:
/// ```json
/// {
///   "error": {
///     "code": "error_type",
///     "message": "Human-readable error message"
///   }
/// }
/// ```
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Map each error variant to (HTTP status, error code, message)
        let (status, code, message) = match self {
            AppError::InvalidRequest(ref msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", msg.clone())
            }
            AppError::Dispatch(ref err) => (
                StatusCode::BAD_GATEWAY,
                "dispatch_failed",
                err.to_string(),
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An internal error occurred".to_string(),
            ),
        };

        // Build JSON response body
        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
