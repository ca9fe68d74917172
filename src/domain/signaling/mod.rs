//! Signaling bounded context - per-client call setup state

pub mod message;
pub mod registry;
pub mod session;
pub mod state_machine;
pub mod transport;

pub use message::{IceCandidate, SignalingMessage};
pub use registry::SessionRegistry;
pub use session::{Phase, Role, Session};
pub use state_machine::{Effect, SignalingStateMachine, Teardown};
pub use transport::Transport;
