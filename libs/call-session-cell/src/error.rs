// libs/call-session-cell/src/error.rs
use thiserror::Error;

use crate::models::FailureReason;

#[derive(Error, Debug)]
pub enum CallSessionError {
    #[error("Permission to use camera or microphone was denied")]
    PermissionDenied,

    #[error("Media device unavailable: {message}")]
    DeviceUnavailable { message: String },

    #[error("Signaling error: {message}")]
    SignalingError { message: String },

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Operation not allowed while session is {status}")]
    InvalidState { status: String },

    #[error("Session already started")]
    AlreadyStarted,

    #[error("No active video sender to replace the track on")]
    NoActiveVideoSender,

    #[error("Renegotiation failed: {message}")]
    RenegotiationFailed { message: String },

    #[error("Chat message is empty")]
    EmptyMessage,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CallSessionError {
    pub fn signaling(message: impl Into<String>) -> Self {
        CallSessionError::SignalingError {
            message: message.into(),
        }
    }

    pub fn invalid_state(status: impl ToString) -> Self {
        CallSessionError::InvalidState {
            status: status.to_string(),
        }
    }

    /// Errors the session survives without leaving its current status.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CallSessionError::RenegotiationFailed { .. }
                | CallSessionError::NoActiveVideoSender
                | CallSessionError::EmptyMessage
        )
    }

    /// Reason code reported when this error ends the session.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            CallSessionError::PermissionDenied => Some(FailureReason::MediaDenied),
            CallSessionError::DeviceUnavailable { .. } => Some(FailureReason::MediaUnavailable),
            CallSessionError::SignalingError { .. } | CallSessionError::Serialization(_) => {
                Some(FailureReason::SignalingError)
            }
            CallSessionError::ConnectionLost => Some(FailureReason::ConnectionLost),
            _ => None,
        }
    }
}

pub type CallSessionResult<T> = Result<T, CallSessionError>;
