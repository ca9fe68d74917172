//! Domain layer - signaling core and the ports it depends on
//!
//! This layer contains:
//! - Session entity, registry and the signaling state machine
//! - Telephony control port (PBX channel/bridge allocation)
//! - User directory port
//! - Shared identifiers and errors

pub mod shared;
pub mod signaling;
pub mod telephony;
pub mod user;

// Re-export commonly used types
pub use shared::{Result, SignalingError};
