//! HTTP error responses in the wire envelope.

use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use axum::response::IntoResponse;
use matchlog_server_primitives::{ApiEnvelope, ErrorReason};
use serde::Serialize;

/// A successful response: `200` with the `{success: true, data}` envelope.
#[derive(Debug)]
pub struct ApiResponse<T: Serialize> {
    pub payload: T,
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response<Body> {
        let envelope = ApiEnvelope::success(self.payload);
        match serde_json::to_string(&envelope) {
            Ok(body) => match Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
            {
                Ok(response) => response,
                Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            },
            Err(_) => ApiError::server_error("response serialization failed").into_response(),
        }
    }
}

/// A failed response: maps onto `{success: false, reason, details?}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub reason: ErrorReason,
    pub details: Option<String>,
}

impl ApiError {
    pub fn bad_request(details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            reason: ErrorReason::BadRequest,
            details: Some(details.into()),
        }
    }

    pub fn bad_signature() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            reason: ErrorReason::BadSignature,
            details: None,
        }
    }

    pub fn forbidden() -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            reason: ErrorReason::Forbidden,
            details: None,
        }
    }

    pub fn incorrect_code() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            reason: ErrorReason::IncorrectCode,
            details: None,
        }
    }

    pub fn stale() -> Self {
        Self {
            status: StatusCode::CONFLICT,
            reason: ErrorReason::Stale,
            details: None,
        }
    }

    /// The refusal for writes against a tombstoned id. The reason set is
    /// closed, so this rides `stale` with a distinguishing detail.
    pub fn tombstoned() -> Self {
        Self {
            status: StatusCode::CONFLICT,
            reason: ErrorReason::Stale,
            details: Some("deleted".to_owned()),
        }
    }

    pub fn server_error(details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            reason: ErrorReason::ServerError,
            details: Some(details.into()),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.status, self.reason)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response<Body> {
        let envelope: ApiEnvelope<()> = ApiEnvelope::failure(self.reason, self.details);
        let body = serde_json::to_string(&envelope)
            .unwrap_or_else(|_| r#"{"success":false,"reason":"server_error"}"#.to_owned());

        match Response::builder()
            .status(self.status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
        {
            Ok(response) => response,
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

impl From<matchlog_store::StoreError> for ApiError {
    fn from(err: matchlog_store::StoreError) -> Self {
        Self::server_error(err.to_string())
    }
}

impl From<matchlog_crdt::CrdtError> for ApiError {
    fn from(err: matchlog_crdt::CrdtError) -> Self {
        Self::bad_request(err.to_string())
    }
}
