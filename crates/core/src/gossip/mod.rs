//! Outbound channel-policy announcements and the lower-layer link seam.
//!
//! The status manager talks to the rest of the node through the two traits
//! here: [`LinkEligibility`] answers whether a channel's link is currently
//! able to forward, and [`ChannelAnnouncer`] carries status-change decisions
//! out to the gossip layer. [`GossipAnnouncer`] is the local implementation
//! that turns decisions into graph deltas with monotonically increasing
//! per-channel timestamps.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::topology::{
    ChannelPoint, ChannelUpdateInfo, ClosedChannelInfo, GraphDelta, NodeId, NodeUpdateInfo,
    TopologyPublisher,
};

/// Lower-layer readiness of a channel to forward payments, independent of
/// peer-connection status.
pub trait LinkEligibility: Send + Sync {
    fn eligible_to_forward(&self, channel: &ChannelPoint) -> Result<bool, EligibilityError>;
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("link eligibility query failed: {0}")]
pub struct EligibilityError(pub String);

/// Outbound seam to the gossip layer: request that a channel's policy be
/// (re)announced with the given disabled flag. Fire-and-forget; invoking it
/// twice with the same value must produce at most one observable flip
/// downstream.
pub trait ChannelAnnouncer: Send + Sync {
    fn announce(&self, channel: &ChannelPoint, disabled: bool) -> Result<(), AnnounceError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AnnounceError {
    #[error("channel {0} is not registered with the announcer")]
    UnknownChannel(ChannelPoint),
}

struct AnnouncedChannel {
    connecting_node: NodeId,
    capacity_sat: u64,
    last_timestamp: i64,
    last_disabled: Option<bool>,
}

/// Local announcer: builds channel updates for channels registered with it
/// and feeds them into the topology publisher.
///
/// Update timestamps are clamped to `max(now, last + 1)` so that two updates
/// for the same channel from this node never share a timestamp, even when
/// issued within the same second.
pub struct GossipAnnouncer {
    local_node: NodeId,
    publisher: Arc<TopologyPublisher>,
    channels: Mutex<HashMap<ChannelPoint, AnnouncedChannel>>,
}

impl GossipAnnouncer {
    pub fn new(local_node: NodeId, publisher: Arc<TopologyPublisher>) -> Self {
        Self {
            local_node,
            publisher,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Make a channel announceable. Typically called when the funding flow
    /// confirms the channel.
    pub fn register_channel(
        &self,
        channel: ChannelPoint,
        connecting_node: NodeId,
        capacity_sat: u64,
    ) {
        self.channels.lock().insert(
            channel,
            AnnouncedChannel {
                connecting_node,
                capacity_sat,
                last_timestamp: 0,
                last_disabled: None,
            },
        );
    }

    /// Publish the closure of a channel and stop tracking it.
    pub fn announce_channel_closed(&self, channel: ChannelPoint, closed_height: u32) {
        let removed = self.channels.lock().remove(&channel);
        let capacity_sat = removed.map(|c| c.capacity_sat).unwrap_or_default();
        self.publisher
            .publish(GraphDelta::from_closed_channel(ClosedChannelInfo {
                channel,
                capacity_sat,
                closed_height,
            }));
    }

    /// Publish a refreshed announcement for a node learned by the gossip
    /// ingestion side.
    pub fn announce_node(&self, update: NodeUpdateInfo) {
        self.publisher.publish(GraphDelta::from_node_update(update));
    }
}

impl ChannelAnnouncer for GossipAnnouncer {
    fn announce(&self, channel: &ChannelPoint, disabled: bool) -> Result<(), AnnounceError> {
        let mut channels = self.channels.lock();
        let entry = channels
            .get_mut(channel)
            .ok_or(AnnounceError::UnknownChannel(*channel))?;
        if entry.last_disabled == Some(disabled) {
            tracing::trace!(%channel, disabled, "suppressing duplicate channel update");
            return Ok(());
        }
        let timestamp = chrono::Utc::now().timestamp().max(entry.last_timestamp + 1);
        entry.last_timestamp = timestamp;
        entry.last_disabled = Some(disabled);
        let update = ChannelUpdateInfo {
            channel: *channel,
            advertising_node: self.local_node,
            connecting_node: entry.connecting_node,
            capacity_sat: entry.capacity_sat,
            disabled,
            timestamp,
        };
        drop(channels);
        tracing::debug!(%channel, disabled, timestamp, "announcing channel update");
        self.publisher.publish(GraphDelta::from_channel_update(update));
        Ok(())
    }
}
