//! Response envelope shared by every endpoint.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::ExecutionError;
use crate::types::ids;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct Metadata {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(request_id: &str, data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: Metadata {
                request_id: request_id.to_string(),
                timestamp: Utc::now(),
            },
            pagination: None,
        }
    }

    pub fn ok_paginated(request_id: &str, data: T, pagination: Pagination) -> Self {
        let mut envelope = Self::ok(request_id, data);
        envelope.pagination = Some(pagination);
        envelope
    }
}

impl Envelope<Value> {
    pub fn failure(request_id: &str, code: &str, message: &str, details: Option<Value>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
                details,
            }),
            metadata: Metadata {
                request_id: request_id.to_string(),
                timestamp: Utc::now(),
            },
            pagination: None,
        }
    }
}

/// Map core error kinds onto HTTP statuses.
pub fn status_for(error: &ExecutionError) -> StatusCode {
    match error {
        ExecutionError::Validation(_)
        | ExecutionError::WorkflowGraphInvalid(_)
        | ExecutionError::ParameterUnbound(_) => StatusCode::BAD_REQUEST,
        ExecutionError::Unauthorized => StatusCode::UNAUTHORIZED,
        ExecutionError::Forbidden => StatusCode::FORBIDDEN,
        ExecutionError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        ExecutionError::OrganizationLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        ExecutionError::SessionAcquisitionTimeout(_) | ExecutionError::Timeout => {
            StatusCode::GATEWAY_TIMEOUT
        }
        ExecutionError::Storage(_) | ExecutionError::BlobStore(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(request_id: &str, error: &ExecutionError) -> Response {
    let details = match error {
        ExecutionError::RateLimited { retry_after_secs } => {
            Some(serde_json::json!({ "retry_after": retry_after_secs }))
        }
        _ => None,
    };
    (
        status_for(error),
        Json(Envelope::failure(
            request_id,
            error.code(),
            &error.to_string(),
            details,
        )),
    )
        .into_response()
}

pub fn not_found(request_id: &str, code: &str, message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(Envelope::failure(request_id, code, message, None)),
    )
        .into_response()
}

/// Request id: propagated from the caller's header when present.
pub fn request_id_from(headers: &axum::http::HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(String::from)
        .unwrap_or_else(ids::request_id)
}
