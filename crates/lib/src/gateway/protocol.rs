//! Gateway REST envelope and the stable error-code vocabulary.
//!
//! Every `/api/*` response body is `{ success, status, message?, data, error }`. Clients branch
//! on `error.code`, never on upstream error shapes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingCredentials,
    InvalidCredentials,
    AuthenticationFailed,
    MissingFields,
    InvalidRequest,
    BadRequest,
    PasswordChangeFailed,
    SignupFailed,
    StaffNotFound,
    StaffExists,
    StaffFetchFailed,
    AddStaffFailed,
    EditStaffFailed,
    PatientNotFound,
    PatientExists,
    PatientsFetchFailed,
    AddPatientFailed,
    EditPatientFailed,
    DeletePatientFailed,
    MissingStaffUuid,
    DashboardFetchFailed,
    ChatSessionFailed,
    MessageSendFailed,
    ChemoLogFailed,
    BackendError,
    UpstreamRequestFailed,
    RouteNotFound,
    InternalError,
    /// A code sent by a newer gateway.
    #[serde(other)]
    Unknown,
}

/// Per-route translation from upstream HTTP status to an error code.
#[derive(Debug, Clone, Copy)]
pub struct ErrorMapping {
    rules: &'static [(u16, ErrorCode)],
    fallback: ErrorCode,
}

impl ErrorMapping {
    pub const fn new(rules: &'static [(u16, ErrorCode)], fallback: ErrorCode) -> Self {
        Self { rules, fallback }
    }

    pub const fn always(code: ErrorCode) -> Self {
        Self::new(&[], code)
    }

    pub fn code_for(&self, status: u16) -> ErrorCode {
        self.rules
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, code)| *code)
            .unwrap_or(self.fallback)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub message: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T = Value> {
    pub success: bool,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(status: u16, data: T) -> Self {
        Self {
            success: true,
            status,
            message: None,
            data: Some(data),
            error: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn fail(status: u16, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::fail_with_details(status, code, message, None)
    }

    pub fn fail_with_details(
        status: u16,
        code: ErrorCode,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Self {
        Self {
            success: false,
            status,
            message: None,
            data: None,
            error: Some(ApiError {
                message: message.into(),
                code,
                details,
            }),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiEnvelope<T> {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}
