use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Server-side classification of a failed `/exec/{action}` request.
///
/// Every variant maps to exactly one HTTP status code; the mapping lives on
/// this type so the server and client agree on it without duplicating a
/// status-code table.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AppserverError {
    #[error("request is missing or carries an unsupported content type")]
    RequestInvalidTypeHeader,

    #[error("request body could not be decoded: {reason}")]
    RequestInvalidBody { reason: String },

    #[error("validation failed")]
    ValidationFailed {
        errors: Vec<String>,
        received: Value,
    },

    #[error("authentication is required for this action")]
    AuthenticationRequired,

    #[error("permission denied")]
    PermissionDenied,

    #[error("action not found: {0}")]
    NotFound(String),

    #[error("{message}")]
    HandledError {
        code: String,
        message: String,
        #[serde(default)]
        payload: Option<Value>,
        status: u16,
    },

    #[error("internal server error")]
    InternalServerError,
}

impl AppserverError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RequestInvalidTypeHeader | Self::RequestInvalidBody { .. } => 400,
            Self::ValidationFailed { .. } => 422,
            Self::AuthenticationRequired => 401,
            Self::PermissionDenied => 403,
            Self::NotFound(_) => 404,
            Self::HandledError { status, .. } => *status,
            Self::InternalServerError => 500,
        }
    }

    pub fn handled(code: impl Into<String>, message: impl Into<String>, status: u16) -> Self {
        Self::HandledError {
            code: code.into(),
            message: message.into(),
            payload: None,
            status,
        }
    }
}

/// Client-side reconstruction of the same taxonomy from an HTTP response's
/// status code and decoded body.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RpcError {
    #[error("request invalid: {0}")]
    RequestInvalidBody(String),

    #[error("validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<String>, received: Value },

    /// Raised for both a 401 (no/invalid token) and a 403 (valid token,
    /// insufficient permission) response — the client never needs to tell
    /// the two apart, it just sheds the stale token and surfaces one error.
    #[error("permission denied")]
    PermissionDenied,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{message}")]
    HandledError {
        code: String,
        message: String,
        payload: Option<Value>,
    },

    #[error("server error ({code}): {message}")]
    ServerError {
        code: String,
        message: String,
        payload: Option<Value>,
    },

    #[error("unexpected status {status}")]
    Unexpected { status: u16 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl RpcError {
    /// Reconstructs an [`RpcError`] from a response's status code and the
    /// server's decoded error payload, if any.
    pub fn from_status(status: u16, body: Option<&AppserverError>) -> Self {
        match (status, body) {
            (401, _) | (403, _) => Self::PermissionDenied,
            (404, Some(AppserverError::NotFound(action))) => Self::NotFound(action.clone()),
            (404, _) => Self::NotFound(String::new()),
            (422, Some(AppserverError::ValidationFailed { errors, received })) => {
                Self::ValidationFailed {
                    errors: errors.clone(),
                    received: received.clone(),
                }
            }
            (_, Some(AppserverError::HandledError { code, message, payload, .. })) => {
                Self::HandledError {
                    code: code.clone(),
                    message: message.clone(),
                    payload: payload.clone(),
                }
            }
            (400, _) | (500, _) => {
                let (code, message, payload) = server_error_fields(status, body);
                Self::ServerError { code, message, payload }
            }
            (status, _) => Self::Unexpected { status },
        }
    }
}

/// Pulls a `(code, message, payload)` triple out of whatever shape the
/// decoded body actually has, for the 400/500 `ServerError` arm.
fn server_error_fields(status: u16, body: Option<&AppserverError>) -> (String, String, Option<Value>) {
    match body {
        Some(AppserverError::RequestInvalidBody { reason }) => {
            ("requestInvalidBody".to_owned(), reason.clone(), None)
        }
        Some(AppserverError::InternalServerError) => (
            "internalServerError".to_owned(),
            "internal server error".to_owned(),
            None,
        ),
        Some(other) => (other.to_string(), other.to_string(), None),
        None => (status.to_string(), format!("server responded with status {status}"), None),
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum StorageError {
    #[error("item already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: expected_rev={expected} actual_rev={actual}")]
    Conflict { expected: u64, actual: u64 },
    #[error("io error: {0}")]
    Io(String),
    #[error("serialize error: {0}")]
    Serialize(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Raised by server *construction*, not request handling — configuration
/// mistakes an operator makes while wiring up an [`RpcServer`] (see
/// `whispr_server::RpcServer::register`).
#[derive(Clone, Debug, Error, PartialEq)]
pub enum GatewayError {
    #[error("action already registered: {0}")]
    DuplicateAction(String),
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}
