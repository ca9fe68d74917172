//! Transport port - one duplex message channel per connected client

use crate::domain::shared::error::{Result, SignalingError};
use crate::domain::signaling::message::SignalingMessage;
use tokio::sync::mpsc;

/// Outbound half of a client connection
///
/// Sends never block; a failed send means the client is gone.
pub trait Transport: Send + Sync {
    fn send(&self, message: SignalingMessage) -> Result<()>;
}

impl Transport for mpsc::UnboundedSender<SignalingMessage> {
    fn send(&self, message: SignalingMessage) -> Result<()> {
        mpsc::UnboundedSender::send(self, message)
            .map_err(|e| SignalingError::TransportError(format!("connection closed: {}", e)))
    }
}
