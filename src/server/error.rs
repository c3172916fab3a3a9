//! HTTP error mapping (OpenAI-style error bodies).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::adapters::AdapterError;
use crate::inference::engine::EngineError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("Unknown persona: {0}")]
    UnknownPersona(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Too many queued requests")]
    Busy,

    #[error("Request timed out")]
    Timeout,

    #[error("{0}")]
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Adapter(e) => ApiError::Adapter(e),
            EngineError::UnknownPersona(name) => ApiError::UnknownPersona(name),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    code: &'static str,
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            ApiError::Adapter(e) => match e {
                AdapterError::FileNotFound(_) => {
                    (StatusCode::NOT_FOUND, "invalid_request_error", "file_not_found")
                }
                AdapterError::NotFound(_) => {
                    (StatusCode::NOT_FOUND, "invalid_request_error", "adapter_not_found")
                }
                AdapterError::LoadFailed { .. } => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "invalid_request_error",
                    "adapter_load_failed",
                ),
                AdapterError::ApplyFailed { .. } => {
                    (StatusCode::CONFLICT, "engine_error", "adapter_apply_failed")
                }
                AdapterError::AlreadyActive { .. } => {
                    (StatusCode::CONFLICT, "invalid_request_error", "adapter_already_active")
                }
                AdapterError::InvalidScale(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_request_error", "invalid_scale")
                }
                AdapterError::InvalidName(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_request_error", "invalid_name")
                }
            },
            ApiError::UnknownPersona(_) => {
                (StatusCode::NOT_FOUND, "invalid_request_error", "persona_not_found")
            }
            ApiError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", "bad_request")
            }
            ApiError::Busy => (StatusCode::SERVICE_UNAVAILABLE, "server_error", "busy"),
            ApiError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "server_error", "timeout"),
            ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error", "internal_error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, code) = self.parts();
        let body = ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                kind,
                code,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::Adapter(AdapterError::NotFound("x".into())), StatusCode::NOT_FOUND),
            (
                ApiError::Adapter(AdapterError::LoadFailed {
                    path: "a.gguf".into(),
                    reason: "bad magic".into(),
                }),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ApiError::Adapter(AdapterError::ApplyFailed {
                    name: "a".into(),
                    reason: "budget".into(),
                }),
                StatusCode::CONFLICT,
            ),
            (ApiError::Adapter(AdapterError::InvalidScale(f32::NAN)), StatusCode::BAD_REQUEST),
            (ApiError::Busy, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
