//! Stable error codes sent to clients.

use crate::transcribe::TranscribeError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Protocol,
    AuthFailed,
    ModelNotFound,
    RateLimited,
    Timeout,
    Network,
    MalformedResponse,
    RequestRejected,
    InvalidAudio,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Protocol => "protocol-error",
            ErrorCode::AuthFailed => "auth-failed",
            ErrorCode::ModelNotFound => "model-not-found",
            ErrorCode::RateLimited => "rate-limited",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Network => "network-error",
            ErrorCode::MalformedResponse => "malformed-response",
            ErrorCode::RequestRejected => "request-rejected",
            ErrorCode::InvalidAudio => "invalid-audio",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&TranscribeError> for ErrorCode {
    fn from(err: &TranscribeError) -> Self {
        match err {
            TranscribeError::Authentication(_) => ErrorCode::AuthFailed,
            TranscribeError::ModelNotFound(_) => ErrorCode::ModelNotFound,
            TranscribeError::RateLimited { .. } => ErrorCode::RateLimited,
            TranscribeError::Timeout => ErrorCode::Timeout,
            TranscribeError::Network(_) => ErrorCode::Network,
            TranscribeError::MalformedResponse(_) => ErrorCode::MalformedResponse,
            TranscribeError::Rejected(_) => ErrorCode::RequestRejected,
            TranscribeError::InvalidAudio(_) => ErrorCode::InvalidAudio,
        }
    }
}
