//! API error envelope

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use openapi_server::models::{ErrorBody, ErrorResponse};
use serde_json::json;
use thiserror::Error;

use crate::deploy::admission::AdmissionError;
use crate::errors::ServiceError;

/// Errors returned by the HTTP routes
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("too many live streams (limit {limit})")]
    TooManyStreams { limit: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Admission(AdmissionError::DuplicateTarget { .. }) => {
                (StatusCode::CONFLICT, "DUPLICATE_TARGET")
            }
            ApiError::Admission(AdmissionError::CapacityExceeded { .. }) => {
                (StatusCode::TOO_MANY_REQUESTS, "CAPACITY_EXCEEDED")
            }
            ApiError::Service(ServiceError::NotFound(_)) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Service(ServiceError::Timeout(_)) => {
                (StatusCode::GATEWAY_TIMEOUT, "UPSTREAM_TIMEOUT")
            }
            ApiError::Service(ServiceError::Rejected(_)) => {
                (StatusCode::BAD_GATEWAY, "UPSTREAM_REJECTED")
            }
            ApiError::Service(ServiceError::InvalidResponse(_)) => {
                (StatusCode::BAD_GATEWAY, "UPSTREAM_INVALID_RESPONSE")
            }
            ApiError::Service(ServiceError::Connectivity(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "UPSTREAM_UNAVAILABLE")
            }
            ApiError::TooManyStreams { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "TOO_MANY_STREAMS")
            }
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::Admission(AdmissionError::DuplicateTarget { existing, target }) => Some(json!({
                "existing_deploy_id": existing,
                "target": target,
            })),
            ApiError::Admission(AdmissionError::CapacityExceeded { limit }) => {
                Some(json!({ "limit": limit }))
            }
            ApiError::TooManyStreams { limit } => Some(json!({ "limit": limit })),
            ApiError::Service(e) => Some(json!({ "kind": e.code() })),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: self.to_string(),
                details: self.details(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
