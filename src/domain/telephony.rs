//! Telephony control port
//!
//! The PBX allocates a call leg ("channel") and a mixing "bridge" for each
//! offering session. The signaling core talks to it only through
//! [`TelephonyControl`]; the HTTP adapter lives in the infrastructure layer.

use crate::domain::shared::error::Result;
use crate::domain::shared::value_objects::{BridgeId, ChannelId};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

/// PBX resources owned by one session
///
/// A bridge is only ever recorded together with the channel attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelephonyLeg {
    pub channel_id: ChannelId,
    pub bridge_id: Option<BridgeId>,
}

impl TelephonyLeg {
    pub fn new(channel_id: ChannelId, bridge_id: BridgeId) -> Self {
        Self {
            channel_id,
            bridge_id: Some(bridge_id),
        }
    }

    pub fn channel_only(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            bridge_id: None,
        }
    }
}

/// PBX control plane operations
///
/// Every operation fails with `SignalingError::TelephonyUnavailable`.
/// Implementations re-authenticate at most once per operation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelephonyControl: Send + Sync {
    /// Create a call leg towards `endpoint`
    async fn allocate_channel(&self, endpoint: &str) -> Result<ChannelId>;

    /// Create a mixing bridge
    async fn allocate_bridge(&self) -> Result<BridgeId>;

    /// Continue the channel in the dialplan into the bridge
    async fn attach_channel_to_bridge(&self, channel: &ChannelId, bridge: &BridgeId) -> Result<()>;

    /// Best-effort teardown; step failures are logged, never returned
    async fn release(&self, channel: Option<ChannelId>, bridge: Option<BridgeId>);
}

/// Allocate channel and bridge and attach them
///
/// On failure whatever was already allocated is released before the error
/// is returned.
pub async fn establish_leg(control: &dyn TelephonyControl, endpoint: &str) -> Result<TelephonyLeg> {
    let channel = control.allocate_channel(endpoint).await?;
    debug!("Allocated channel {} for endpoint {}", channel, endpoint);

    let bridge = match control.allocate_bridge().await {
        Ok(bridge) => bridge,
        Err(e) => {
            warn!("Bridge allocation failed, releasing channel {}: {}", channel, e);
            control.release(Some(channel), None).await;
            return Err(e);
        }
    };

    if let Err(e) = control.attach_channel_to_bridge(&channel, &bridge).await {
        warn!("Attaching channel {} to bridge {} failed: {}", channel, bridge, e);
        control.release(Some(channel), Some(bridge)).await;
        return Err(e);
    }

    Ok(TelephonyLeg::new(channel, bridge))
}
