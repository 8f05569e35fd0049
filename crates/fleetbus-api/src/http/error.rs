//! Application error type mapping to HTTP status codes and `{error}` bodies.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use fleetbus_types::error::{BrainError, BusError, SessionError};
use fleetbus_types::hub::ErrorBody;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Missing or malformed input.
    BadRequest(String),
    /// Forged, unknown, or unsafe session id.
    Forbidden(String),
    NotFound,
    RateLimited,
    BrainUnavailable,
    Internal(String),
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Missing => AppError::BadRequest(e.to_string()),
            SessionError::InvalidId(_) | SessionError::Unknown(_) => {
                AppError::Forbidden("Invalid session".to_string())
            }
        }
    }
}

impl From<BrainError> for AppError {
    fn from(e: BrainError) -> Self {
        match e {
            BrainError::Unavailable => AppError::BrainUnavailable,
            BrainError::Failed(msg) => AppError::Internal(msg),
        }
    }
}

impl From<BusError> for AppError {
    fn from(e: BusError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<JsonRejection> for AppError {
    fn from(e: JsonRejection) -> Self {
        AppError::BadRequest(e.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()),
            AppError::BrainUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "Brain not available".to_string())
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_errors_map_to_400_and_403() {
        let missing = AppError::from(SessionError::Missing).into_response();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let forged = AppError::from(SessionError::InvalidId("../x".into())).into_response();
        assert_eq!(forged.status(), StatusCode::FORBIDDEN);

        let unknown = AppError::from(SessionError::Unknown("S-9".into())).into_response();
        assert_eq!(unknown.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn missing_brain_is_503() {
        let response = AppError::from(BrainError::Unavailable).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
