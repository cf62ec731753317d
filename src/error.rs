use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    SessionClosed,
    IdGeneration,
    ConnectTimeout,
    ConnectFailed,
    HandshakeFailed,
    IoError,
    RemoteClosed,
    CommandTimeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)?;
        if let Some(details) = &self.details {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Api(ApiError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ApiError> for GatewayError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

impl GatewayError {
    /// Error code of the failure, folding raw IO errors into `IoError`.
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Api(api) => api.error_code.clone(),
            GatewayError::Io(_) => ErrorCode::IoError,
        }
    }

    pub fn into_api(self) -> ApiError {
        match self {
            GatewayError::Api(api) => api,
            GatewayError::Io(err) => ApiError::new(ErrorCode::IoError, err.to_string()),
        }
    }
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::SessionClosed => "SESSION_CLOSED",
            ErrorCode::IdGeneration => "ID_GENERATION",
            ErrorCode::ConnectTimeout => "CONNECT_TIMEOUT",
            ErrorCode::ConnectFailed => "CONNECT_FAILED",
            ErrorCode::HandshakeFailed => "HANDSHAKE_FAILED",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::RemoteClosed => "REMOTE_CLOSED",
            ErrorCode::CommandTimeout => "COMMAND_TIMEOUT",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
