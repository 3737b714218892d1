use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Application mismatch: expected {expected}, got {actual}")]
    ApplicationMismatch { expected: String, actual: String },

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error("Session does not exist: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Media resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Media file not found: {0}")]
    MediaNotFound(String),

    #[error("Hash mismatch: expected {expected}, actual {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Pool server {number} unreachable: {reason}")]
    PoolUnreachable { number: u32, reason: String },

    #[error("Command queue '{queue}' is full (maximum {max} items)")]
    QueueOverflow { queue: String, max: usize },

    #[error("Peer answered with {code:?}: {description}")]
    Remote { code: ErrorCode, description: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// The code that represents this error on the wire.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            PoolError::Protocol(_) | PoolError::Json(_) => ErrorCode::ProtocolError,
            PoolError::ApplicationMismatch { .. } => ErrorCode::ApplicationMismatch,
            PoolError::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            PoolError::SessionNotFound(_) => ErrorCode::SessionDoesNotExist,
            PoolError::SessionExists(_) => ErrorCode::SessionAlreadyExists,
            PoolError::Auth(_) => ErrorCode::AuthenticationFailed,
            PoolError::UnknownCommand(_) => ErrorCode::UnknownCommand,
            PoolError::InvalidRequest(_)
            | PoolError::ResourceNotFound(_)
            | PoolError::HashMismatch { .. } => ErrorCode::InvalidParameter,
            PoolError::MediaNotFound(_) => ErrorCode::MediaFileNotFound,
            PoolError::PoolUnreachable { .. } => ErrorCode::PoolUnreachable,
            PoolError::QueueOverflow { .. } => ErrorCode::QueueOverflow,
            PoolError::Processing(_) | PoolError::Io(_) => ErrorCode::ProcessingFailed,
            PoolError::Remote { code, .. } => *code,
            PoolError::Config(_)
            | PoolError::Crypto(_)
            | PoolError::Timeout(_)
            | PoolError::Internal(_) => ErrorCode::TechnicalError,
        }
    }

    /// Soft failures are logged and absorbed by pool checks instead of being
    /// surfaced to the caller.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            PoolError::PoolUnreachable { .. } | PoolError::Timeout(_) | PoolError::Io(_)
        )
    }

    /// Failures worth another attempt on a later cycle: the peer could not
    /// be reached or it lost our session again right after re-establishing.
    pub fn is_retryable(&self) -> bool {
        self.is_unreachable()
            || matches!(
                self,
                PoolError::Remote {
                    code: ErrorCode::SessionDoesNotExist,
                    ..
                }
            )
    }
}

/// Error codes carried in the error block of a response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    TechnicalError,
    ProtocolError,
    ApplicationMismatch,
    VersionMismatch,
    SessionDoesNotExist,
    SessionAlreadyExists,
    AuthenticationFailed,
    UnknownCommand,
    InvalidParameter,
    MediaFileNotFound,
    ProcessingFailed,
    PoolUnreachable,
    QueueOverflow,
}

impl ErrorCode {
    pub fn headline(&self) -> &'static str {
        match self {
            ErrorCode::TechnicalError => "A technical error occurred",
            ErrorCode::ProtocolError => "The request could not be read",
            ErrorCode::ApplicationMismatch => "The client application is not supported",
            ErrorCode::VersionMismatch => "The client version is not supported",
            ErrorCode::SessionDoesNotExist => "The session does not exist",
            ErrorCode::SessionAlreadyExists => "The session already exists",
            ErrorCode::AuthenticationFailed => "Authentication failed",
            ErrorCode::UnknownCommand => "The command is not supported",
            ErrorCode::InvalidParameter => "The request contains invalid parameters",
            ErrorCode::MediaFileNotFound => "The media file does not exist",
            ErrorCode::ProcessingFailed => "The request could not be processed",
            ErrorCode::PoolUnreachable => "A media pool server could not be reached",
            ErrorCode::QueueOverflow => "The media pool is busy",
        }
    }

    pub fn message_parts(&self) -> Vec<String> {
        let parts: &[&str] = match self {
            ErrorCode::SessionDoesNotExist => &["Please log in again."],
            ErrorCode::ApplicationMismatch | ErrorCode::VersionMismatch => {
                &["Please update your client application."]
            }
            ErrorCode::InvalidParameter => &["Please check your input and try again."],
            ErrorCode::QueueOverflow | ErrorCode::PoolUnreachable => {
                &["Please try again later."]
            }
            ErrorCode::MediaFileNotFound => &[],
            _ => &[
                "Please try again later.",
                "If the problem persists, contact your administrator.",
            ],
        };
        parts.iter().map(|part| part.to_string()).collect()
    }
}
