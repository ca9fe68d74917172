//! Signaling errors

use crate::domain::shared::value_objects::SessionId;
use thiserror::Error;

/// Signaling result type
pub type Result<T> = std::result::Result<T, SignalingError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Message received in a phase that does not permit it
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// PBX authentication or resource allocation failed
    #[error("Telephony unavailable: {0}")]
    TelephonyUnavailable(String),

    #[error("Session already exists: {0}")]
    DuplicateSession(SessionId),

    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// Outbound send to a client failed
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl SignalingError {
    /// Stable code carried in `call_error` messages
    pub fn code(&self) -> &'static str {
        match self {
            SignalingError::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            SignalingError::TelephonyUnavailable(_) => "TELEPHONY_UNAVAILABLE",
            SignalingError::DuplicateSession(_) => "DUPLICATE_SESSION",
            SignalingError::NotFound(_) => "SESSION_NOT_FOUND",
            SignalingError::TransportError(_) => "TRANSPORT_ERROR",
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        SignalingError::ProtocolViolation(message.into())
    }

    pub fn telephony(message: impl Into<String>) -> Self {
        SignalingError::TelephonyUnavailable(message.into())
    }
}
