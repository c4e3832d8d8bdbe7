// src/api/error.rs
// Centralized HTTP-facing error type. Internal modules return their own
// thiserror taxonomies (DispatchError, AiError, StorageError, DecodeError);
// this is the only place those convert into an HTTP response.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use tracing::error;

use crate::ports::ai::AiError;
use crate::ports::messaging::DispatchError;
use crate::ports::storage::StorageError;
use crate::webhook::DecodeError;

#[derive(Debug)]
pub struct ApiError {
    pub message: String,
    pub status_code: StatusCode,
    pub error_code: Option<String>,
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            error_code: Some("INTERNAL_ERROR".to_string()),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::BAD_REQUEST,
            error_code: Some("BAD_REQUEST".to_string()),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::UNAUTHORIZED,
            error_code: Some("UNAUTHORIZED".to_string()),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::FORBIDDEN,
            error_code: Some("FORBIDDEN".to_string()),
        }
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::BAD_GATEWAY,
            error_code: Some("BAD_GATEWAY".to_string()),
        }
    }

    pub fn custom(status_code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code,
            error_code: None,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": true,
            "message": self.message,
            "status": self.status_code.as_u16(),
        });
        if let Some(error_code) = self.error_code {
            body["error_code"] = json!(error_code);
        }
        (self.status_code, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<DecodeError> for ApiError {
    fn from(error: DecodeError) -> Self {
        match error {
            DecodeError::InvalidJson => ApiError::bad_request("invalid JSON body"),
            DecodeError::UnsafeId(detail) => ApiError::bad_request(detail),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        error!(%error, "messaging dispatch failed");
        ApiError::bad_gateway(error.to_string())
    }
}

impl From<AiError> for ApiError {
    fn from(error: AiError) -> Self {
        error!(%error, "ai queue call failed");
        ApiError::bad_gateway(error.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        error!(%error, "storage call failed");
        ApiError::internal(error.to_string())
    }
}

impl From<crate::dialog::DialogError> for ApiError {
    fn from(error: crate::dialog::DialogError) -> Self {
        use crate::dialog::DialogError;
        match error {
            DialogError::Storage(e) => e.into(),
            DialogError::Ai(e) => e.into(),
            DialogError::Dispatch(e) => e.into(),
        }
    }
}

/// Extension trait for `Option<T>` to build an `ApiError` directly from a
/// `None` case at the handler boundary.
pub trait IntoApiErrorOption<T> {
    fn ok_or_unauthorized(self, message: &str) -> Result<T, ApiError>;
}

impl<T> IntoApiErrorOption<T> for Option<T> {
    fn ok_or_unauthorized(self, message: &str) -> Result<T, ApiError> {
        self.ok_or_else(|| ApiError::unauthorized(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_unsafe_id_maps_to_bad_request() {
        let api_error: ApiError = DecodeError::UnsafeId("bad chat id".into()).into();
        assert_eq!(api_error.status_code, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn dispatch_error_maps_to_bad_gateway() {
        let api_error: ApiError = DispatchError::Transport("boom".into()).into();
        assert_eq!(api_error.status_code, StatusCode::BAD_GATEWAY);
    }
}
