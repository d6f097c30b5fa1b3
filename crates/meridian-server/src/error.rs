//! Process-level server errors.
//!
//! Response-level failures are [`meridian_protocol::ServiceError`]s; these
//! are the errors registration and lifecycle calls return.

/// Error returned by an [`crate::Initializer`] hook.
pub type InitError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("service {0} is already registered")]
    DuplicateService(String),

    #[error("invalid descriptor for service {service:?}: {reason}")]
    InvalidDescriptor { service: String, reason: String },

    #[error("invalid route {pattern:?} for {service}/{method}: {reason}")]
    InvalidRoute {
        service: String,
        method: String,
        pattern: String,
        reason: String,
    },

    #[error("unknown middleware {name:?} referenced by {service}/{method}")]
    UnknownMiddleware {
        name: String,
        service: String,
        method: String,
    },

    #[error("initializer {index} failed: {message}")]
    Initializer { index: usize, message: String },

    #[error("server already started")]
    AlreadyStarted,

    #[error("server is not running")]
    NotRunning,

    #[error("transport: {0}")]
    Transport(String),
}

impl From<meridian_transport::TransportError> for ServerError {
    fn from(err: meridian_transport::TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}
