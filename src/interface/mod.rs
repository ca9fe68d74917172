//! Interface layer - External interfaces
//!
//! This layer handles:
//! - Signaling WebSocket
//! - Registration REST endpoints
//! - Health and Prometheus metrics
//! - Request/response formatting

pub mod api;
