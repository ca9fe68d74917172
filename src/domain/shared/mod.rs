//! Shared kernel - identifiers and errors used across the signaling core

pub mod error;
pub mod value_objects;

pub use error::{Result, SignalingError};
pub use value_objects::*;
