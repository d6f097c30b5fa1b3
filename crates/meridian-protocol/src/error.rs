//! Service error types and their JSON-RPC / HTTP mappings.

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Standard JSON-RPC 2.0 error codes plus Meridian server errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // JSON-RPC 2.0 standard errors
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,

    // Server errors
    ServerError,
    ServerNotInitialized,
    ServerShuttingDown,
    HandlerPanicked,
    Rejected,

    // Custom code
    Custom(i32),
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerError => -32000,
            Self::ServerNotInitialized => -32001,
            Self::ServerShuttingDown => -32002,
            Self::HandlerPanicked => -32003,
            Self::Rejected => -32004,
            Self::Custom(c) => *c,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32000 => Self::ServerError,
            -32001 => Self::ServerNotInitialized,
            -32002 => Self::ServerShuttingDown,
            -32003 => Self::HandlerPanicked,
            -32004 => Self::Rejected,
            c => Self::Custom(c),
        }
    }

    /// HTTP status used when this error is rendered by the built-in encoder.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::ParseError | Self::InvalidRequest | Self::InvalidParams => StatusCode::BAD_REQUEST,
            Self::MethodNotFound => StatusCode::NOT_FOUND,
            Self::Rejected => StatusCode::FORBIDDEN,
            Self::ServerNotInitialized | Self::ServerShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError
            | Self::ServerError
            | Self::HandlerPanicked
            | Self::Custom(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON-RPC 2.0 error object, used as the error half of every handler result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ServiceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorCode::MethodNotFound, format!("Method not found: {method}"))
    }

    pub fn route_not_found(verb: &str, path: &str) -> Self {
        Self::new(ErrorCode::MethodNotFound, format!("No route for {verb} {path}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError, message)
    }

    pub fn not_initialized() -> Self {
        Self::new(ErrorCode::ServerNotInitialized, "Server is not initialized")
    }

    pub fn shutting_down() -> Self {
        Self::new(ErrorCode::ServerShuttingDown, "Server is shutting down")
    }

    /// Error produced when a handler panicked; carries the panic payload's description.
    pub fn panicked(description: impl Into<String>) -> Self {
        let description = description.into();
        Self::new(ErrorCode::HandlerPanicked, format!("Handler panicked: {description}"))
            .with_data(serde_json::Value::String(description))
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Rejected, message)
    }

    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_code(self.code)
    }

    pub fn http_status(&self) -> StatusCode {
        self.error_code().http_status()
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Service Error [{}]: {}", self.code, self.message)
    }
}

impl std::error::Error for ServiceError {}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_params(err.to_string())
    }
}
