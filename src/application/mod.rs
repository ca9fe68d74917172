//! Application layer - relay orchestration
//!
//! Connects transports to the signaling core: routes inbound client messages
//! through the state machine and carries out the effects it produces.

pub mod metrics;
pub mod relay_router;

pub use relay_router::{RelayRouter, RouterSettings};
