//! Signaling wire messages exchanged with browser clients

use serde::{Deserialize, Serialize};

/// Opaque ICE candidate as produced by the browser (`RTCIceCandidateInit`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(serde_json::Value);

impl IceCandidate {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Signaling message types, both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Register a user with the directory
    Register {
        username: String,
        password: String,
    },
    /// SDP offer
    Offer {
        sdp: String,
    },
    /// SDP answer
    Answer {
        sdp: String,
    },
    /// Trickled ICE candidate
    #[serde(rename = "icecandidate")]
    IceCandidate {
        candidate: IceCandidate,
    },
    /// Counterpart left the call
    Hangup,
    /// Offer/answer failure, sent to the originating client only
    CallError {
        code: String,
        message: String,
    },
    RegistrationSuccess {
        username: String,
    },
    RegistrationError {
        message: String,
    },
}

impl SignalingMessage {
    /// Wire name of the message, safe to log
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Register { .. } => "register",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "icecandidate",
            SignalingMessage::Hangup => "hangup",
            SignalingMessage::CallError { .. } => "call_error",
            SignalingMessage::RegistrationSuccess { .. } => "registration_success",
            SignalingMessage::RegistrationError { .. } => "registration_error",
        }
    }
}
