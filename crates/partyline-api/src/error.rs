//! Error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use partyline_core::{BatchError, IngestError, QueueError, TriggerError};
use serde::Serialize;
use tracing::error;

/// Error body returned by every endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Handler error carrying its status code
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }
}

impl From<partyline_common::Error> for ApiError {
    fn from(e: partyline_common::Error) -> Self {
        let status =
            StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Request failed: {}", e);
        }
        Self::new(status, &e.code().to_ascii_lowercase(), e.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        partyline_common::Error::from(e).into()
    }
}

impl From<BatchError> for ApiError {
    fn from(e: BatchError) -> Self {
        partyline_common::Error::from(e).into()
    }
}

impl From<TriggerError> for ApiError {
    fn from(e: TriggerError) -> Self {
        partyline_common::Error::from(e).into()
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::InvalidPayload(message) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_payload", message)
            }
            other => partyline_common::Error::from(other).into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let e = ApiError::from(partyline_common::Error::Database("down".into()));
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(e.body.error, "database_error");

        let e = ApiError::from(QueueError::InvalidRetention);
        assert_eq!(e.status, StatusCode::UNPROCESSABLE_ENTITY);

        let e = ApiError::from(IngestError::InvalidPayload("eof".into()));
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
    }
}
