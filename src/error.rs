//! Error types shared by the external clients, the lock and the HTTP surface.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Failure returned by the Service Bus and secret store clients.
///
/// The variant decides what the orchestrator is allowed to do next: only
/// [`ClientError::Transient`] is ever retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("unknown failure: {0}")]
    Unknown(String),
}

/// Coarse classification of a [`ClientError`], used in step details and audit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Permission,
    Transient,
    Invalid,
    Unknown,
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Permission(_) => ErrorKind::Permission,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Invalid(_) => ErrorKind::Invalid,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Map a non-success HTTP status from an Azure API onto the taxonomy.
    ///
    /// `context` names the request (e.g. `"regenerate FunctionAppAccess"`), and
    /// `body` is the decoded response body if there was one.
    pub fn from_status(status: u16, context: &str, body: &Value) -> Self {
        let message = format!("{} (HTTP {}): {}", context, status, azure_error_message(body));
        match status {
            404 => Self::NotFound(message),
            401 | 403 => Self::Permission(message),
            408 | 429 | 500..=599 => Self::Transient(message),
            400 | 409 | 422 => Self::Invalid(message),
            _ => Self::Unknown(message),
        }
    }

    /// Map a transport-level `reqwest` failure onto the taxonomy.
    pub fn from_transport(context: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Transient(format!("{}: {}", context, err))
        } else if err.is_decode() {
            Self::Unknown(format!("{}: malformed response: {}", context, err))
        } else {
            Self::Unknown(format!("{}: {}", context, err))
        }
    }
}

/// Pull `code: message` out of an ARM / Key Vault error envelope.
pub(crate) fn azure_error_message(body: &Value) -> String {
    let err = body
        .get("error")
        .or_else(|| body.get("Error"))
        .unwrap_or(body);
    let code = err["code"].as_str().unwrap_or("Unknown");
    let message = err["message"].as_str().unwrap_or("no error detail");
    format!("{}: {}", code, message)
}

/// Failure returned by a [`crate::lock::RotationLock`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("rotation already in progress for rule '{rule}'")]
    AlreadyLocked { rule: String },

    #[error("lease token for rule '{rule}' is not the current holder")]
    StaleToken { rule: String },

    #[error("lease for rule '{rule}' expired before it was refreshed")]
    LeaseLost { rule: String },
}

/// Errors surfaced by the HTTP trigger surface.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("unknown authorization rule: {0}")]
    UnknownRule(String),

    #[error("authorization rule '{0}' is not enabled for rotation")]
    RuleDisabled(String),

    #[error("secret rotation is disabled")]
    RotationDisabled,

    #[error("malformed request body: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::UnknownRule(_) => StatusCode::NOT_FOUND,
            Self::RuleDisabled(_) => StatusCode::CONFLICT,
            Self::RotationDisabled => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": status.as_u16()
        });
        (status, axum::Json(body)).into_response()
    }
}
