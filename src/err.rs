use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;

use gradebook::auth::AuthError;
use gradebook::io::StorageError;
use gradebook::repository::RecordError;
use serde::Serialize;

pub async fn handler404(path: Uri) -> Error {
    Error::NotFound {
        message: format!("Invalid path: {}", path),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error")]
pub enum Error {
    NotFound { message: String },
    Conflict { message: String },
    InvalidPayload { message: String },
    AuthenticationFailure { message: String },
    InternalError { kind: &'static str, message: String },
}

impl Error {
    pub fn unauthorized<S: Into<String>>(msg: S) -> Error {
        Error::AuthenticationFailure {
            message: msg.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
            Error::AuthenticationFailure { .. } => StatusCode::UNAUTHORIZED,
            Error::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        log::error!("Storage failure: {}", err);
        Self::InternalError {
            kind: "StorageError",
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        log::error!("Blocking task failed: {}", err);
        Self::InternalError {
            kind: "JoinError",
            message: err.to_string(),
        }
    }
}

impl From<RecordError> for Error {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::NotFound(message) => Self::NotFound { message },
            RecordError::Conflict(message) => Self::Conflict { message },
            RecordError::InvalidInput(message) => Self::InvalidPayload { message },
            RecordError::Storage(err) => err.into(),
            RecordError::Cipher(err) => Self::InternalError {
                kind: "CipherError",
                message: err.to_string(),
            },
        }
    }
}

impl From<AuthError> for Error {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredential => Self::unauthorized(err.to_string()),
            AuthError::Hashing(message) => Self::InternalError {
                kind: "HashingError",
                message,
            },
            AuthError::Storage(err) => err.into(),
        }
    }
}
