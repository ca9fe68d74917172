//! Webphone - WebRTC call signaling relay bridged to a PBX
//!
//! Browser clients exchange offers, answers and trickled ICE candidates over
//! a WebSocket. Each offer allocates a channel and a bridge on the PBX through
//! its REST control interface; the relay pairs callers with callees and tears
//! everything down when either side goes away.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use domain::shared::error::{Result, SignalingError};
