//! API interface implementations

pub mod metrics_handler;
pub mod router;
pub mod user_dto;
pub mod user_handler;
pub mod webrtc_signaling;

pub use metrics_handler::init_metrics;
pub use router::build_router;
pub use user_handler::AppState;
