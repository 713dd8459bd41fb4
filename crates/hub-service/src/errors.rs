//! Hub error types.
//!
//! Errors map to the `error` frame sent back to the requesting client.
//! Internal details are logged server-side but not exposed to clients.

use crate::media::EngineError;
use thiserror::Error;

/// Error taxonomy as seen by operators and clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed message, wrong state, duplicate register, unknown id.
    Protocol,
    /// Capability mismatch or negotiation failure in the media engine.
    Resource,
    /// The media engine failed; the process shuts down.
    EngineFatal,
    /// Recording subsystem failure; isolated to one session.
    Recording,
    /// Anything else (channel failures, bugs).
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Protocol => "protocol",
            ErrorKind::Resource => "resource",
            ErrorKind::EngineFatal => "engine_fatal",
            ErrorKind::Recording => "recording",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Hub error type.
///
/// Maps to client-facing error codes:
/// - `Unauthorized`: `UNAUTHORIZED` (2)
/// - `PermissionDenied`: `FORBIDDEN` (3)
/// - `ResourceNotFound`: `NOT_FOUND` (4)
/// - `AlreadyRegistered`, `OperationInProgress`: `CONFLICT` (5)
/// - `Internal`, `EngineFatal`, `Recording`, `Config`: `INTERNAL_ERROR` (6)
/// - `CapacityExceeded`: `CAPACITY_EXCEEDED` (7)
/// - `InvalidMessage`, `NotRegistered`: `INVALID_REQUEST` (8)
/// - `EngineRejected`: `REJECTED` (9)
/// - `Timeout`: `TIMEOUT` (10)
#[derive(Debug, Error)]
pub enum HubError {
    /// Frame could not be parsed or carried an invalid payload.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Request requires a registered identity.
    #[error("Client is not registered")]
    NotRegistered,

    /// Second `register` on an already registered identity.
    #[error("Client is already registered as {0}")]
    AlreadyRegistered(String),

    /// Credential check failed.
    #[error("Unauthorized")]
    Unauthorized,

    /// Role does not allow this request.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Stale id or resource not owned by the caller.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Engine refused the request (capabilities, negotiation, state).
    #[error("Engine rejected request: {0}")]
    EngineRejected(String),

    /// An operation with the same discriminator is already pending.
    #[error("Operation already in progress: {0}")]
    OperationInProgress(String),

    /// Pending operation exceeded its deadline.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Hub is at its connection limit.
    #[error("Hub at capacity")]
    CapacityExceeded,

    /// Media engine failed irrecoverably.
    #[error("Media engine failure: {0}")]
    EngineFatal(String),

    /// Recording subsystem failure.
    #[error("Recording error: {0}")]
    Recording(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::InvalidMessage(_)
            | HubError::NotRegistered
            | HubError::AlreadyRegistered(_)
            | HubError::Unauthorized
            | HubError::PermissionDenied(_)
            | HubError::ResourceNotFound(_)
            | HubError::OperationInProgress(_)
            | HubError::Timeout(_)
            | HubError::CapacityExceeded => ErrorKind::Protocol,
            HubError::EngineRejected(_) => ErrorKind::Resource,
            HubError::EngineFatal(_) => ErrorKind::EngineFatal,
            HubError::Recording(_) => ErrorKind::Recording,
            HubError::Config(_) | HubError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the client-facing error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            HubError::Unauthorized => 2,
            HubError::PermissionDenied(_) => 3,
            HubError::ResourceNotFound(_) => 4,
            HubError::AlreadyRegistered(_) | HubError::OperationInProgress(_) => 5,
            HubError::Internal(_)
            | HubError::EngineFatal(_)
            | HubError::Recording(_)
            | HubError::Config(_) => 6,
            HubError::CapacityExceeded => 7,
            HubError::InvalidMessage(_) | HubError::NotRegistered => 8,
            HubError::EngineRejected(_) => 9,
            HubError::Timeout(_) => 10,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            HubError::Internal(_) | HubError::Config(_) | HubError::Recording(_) => {
                "An internal error occurred".to_string()
            }
            HubError::EngineFatal(_) => "Media server failure, please reconnect".to_string(),
            HubError::CapacityExceeded => "Server is at capacity, please try again".to_string(),
            HubError::Unauthorized => "Invalid or missing access token".to_string(),
            HubError::NotRegistered => "Client is not registered".to_string(),
            HubError::InvalidMessage(msg)
            | HubError::PermissionDenied(msg)
            | HubError::ResourceNotFound(msg)
            | HubError::EngineRejected(msg)
            | HubError::OperationInProgress(msg)
            | HubError::Timeout(msg) => msg.clone(),
            HubError::AlreadyRegistered(role) => format!("Already registered as {role}"),
        }
    }
}

impl From<EngineError> for HubError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(msg) => HubError::ResourceNotFound(msg),
            EngineError::Rejected(msg) => HubError::EngineRejected(msg),
            EngineError::Fatal(msg) => HubError::EngineFatal(msg),
        }
    }
}
