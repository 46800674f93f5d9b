use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use fleet_coordination::{CoordinationError, LockError};
use serde::Serialize;

use crate::{ConvergenceError, ReindexingError};

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub retryable: bool,
    pub retry_after_seconds: u32,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("urn:fleet:problem:{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
            retryable: false,
            retry_after_seconds: 0,
        }
    }

    fn set_retry_after_seconds(&mut self, seconds: u32) {
        self.retry_after_seconds = seconds;
        if seconds > 0 {
            self.retryable = true;
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, code, message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }

    pub fn gateway_timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, code, message)
    }

    pub fn with_retry_after_seconds(mut self, seconds: u32) -> Self {
        self.problem.set_retry_after_seconds(seconds);
        self
    }
}

impl From<ReindexingError> for ApiError {
    fn from(e: ReindexingError) -> Self {
        let message = e.to_string();
        match e {
            ReindexingError::ApplicationNotFound(_) => Self::not_found("application_not_found", message),
            ReindexingError::UnknownCluster { .. } => Self::bad_request("unknown_cluster", message),
            ReindexingError::UnknownDocumentType { .. } => {
                Self::bad_request("unknown_document_type", message)
            }
            ReindexingError::LockNotHeld { .. } => Self::internal("lock_not_held", message),
            ReindexingError::Lock(LockError::Timeout { .. }) => {
                Self::service_unavailable("lock_timeout", message).with_retry_after_seconds(1)
            }
            ReindexingError::Lock(LockError::Deadlock { .. }) => Self::internal("deadlock", message),
            ReindexingError::Lock(LockError::Backend { .. }) => {
                Self::service_unavailable("coordination_unavailable", message).with_retry_after_seconds(1)
            }
            ReindexingError::Coordination(CoordinationError::Conflict { .. }) => {
                Self::conflict("version_conflict", message)
            }
            ReindexingError::Coordination(_) => Self::internal("coordination_error", message),
        }
    }
}

impl From<ConvergenceError> for ApiError {
    fn from(e: ConvergenceError) -> Self {
        let message = e.to_string();
        match e {
            ConvergenceError::UnknownService(_) => Self::not_found("service_not_found", message),
            ConvergenceError::Timeout { .. } => Self::gateway_timeout("service_timeout", message),
            ConvergenceError::Request { .. } | ConvergenceError::InvalidResponse { .. } => {
                Self::bad_gateway("service_unreachable", message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
