//! Infrastructure layer - adapters for external systems
//!
//! - PBX control plane (ARI over HTTP)
//! - User directory

pub mod telephony;
pub mod user_directory;

pub use telephony::{AriClient, AriError};
pub use user_directory::InMemoryUserDirectory;
