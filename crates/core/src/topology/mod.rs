//! Local view of the shared channel graph.
//!
//! Holds the identity and delta types describing incremental changes to the
//! graph, plus the publisher that fans those deltas out to any number of
//! independently-paced subscribers.

use std::fmt::Display;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tokio::sync::mpsc;

mod subscription;

pub use subscription::{TopologyStreamError, TopologySubscription, SUBSCRIBER_BUFFER};

/// Funding outpoint identifying a channel: the funding transaction id plus
/// the index of the funding output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelPoint {
    txid: [u8; 32],
    index: u32,
}

impl ChannelPoint {
    pub fn new(txid: [u8; 32], index: u32) -> Self {
        Self { txid, index }
    }

    pub fn txid(&self) -> &[u8; 32] {
        &self.txid
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Display for ChannelPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.txid.iter() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ":{}", self.index)
    }
}

/// Identity of a network participant: a 33-byte compressed public key.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(#[serde_as(as = "[_; 33]")] [u8; 33]);

impl NodeId {
    pub fn new(key: [u8; 33]) -> Self {
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A policy update for one direction of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelUpdateInfo {
    pub channel: ChannelPoint,
    /// Node whose policy this update describes.
    pub advertising_node: NodeId,
    /// The other endpoint of the channel.
    pub connecting_node: NodeId,
    pub capacity_sat: u64,
    pub disabled: bool,
    /// Unix seconds; strictly increasing per channel per advertising node.
    pub timestamp: i64,
}

/// A refreshed announcement of a node's presence in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdateInfo {
    pub node: NodeId,
    pub alias: String,
    pub addresses: Vec<String>,
}

/// Notice that a channel has been removed from the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedChannelInfo {
    pub channel: ChannelPoint,
    pub capacity_sat: u64,
    pub closed_height: u32,
}

/// An immutable batch of incremental changes to the local graph view.
///
/// Deltas reach subscribers exactly as batched here; consumers may process
/// the entries inside one batch in any order, but batches themselves are
/// never reordered or coalesced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDelta {
    pub channel_updates: Vec<ChannelUpdateInfo>,
    pub node_updates: Vec<NodeUpdateInfo>,
    pub closed_channels: Vec<ClosedChannelInfo>,
}

impl GraphDelta {
    pub fn from_channel_update(update: ChannelUpdateInfo) -> Self {
        Self {
            channel_updates: vec![update],
            ..Default::default()
        }
    }

    pub fn from_node_update(update: NodeUpdateInfo) -> Self {
        Self {
            node_updates: vec![update],
            ..Default::default()
        }
    }

    pub fn from_closed_channel(closed: ClosedChannelInfo) -> Self {
        Self {
            closed_channels: vec![closed],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channel_updates.is_empty()
            && self.node_updates.is_empty()
            && self.closed_channels.is_empty()
    }
}

type UpstreamSender = mpsc::UnboundedSender<Result<GraphDelta, TopologyStreamError>>;

/// Fan-out hub for graph deltas.
///
/// The graph-ingestion side pushes each learned delta through
/// [`Self::publish`]; every live subscription gets its own upstream channel,
/// so a slow subscriber only ever stalls its own delivery task, never the
/// publisher or its siblings.
pub struct TopologyPublisher {
    subscribers: Mutex<Vec<UpstreamSender>>,
}

impl TopologyPublisher {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber and return its consumable half.
    pub fn subscribe(&self) -> TopologySubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        TopologySubscription::spawn(rx)
    }

    /// Push a delta to every live subscriber, pruning the ones that went away.
    pub fn publish(&self, delta: GraphDelta) {
        if delta.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(Ok(delta.clone())).is_ok());
        tracing::trace!(
            subscribers = subscribers.len(),
            channel_updates = delta.channel_updates.len(),
            node_updates = delta.node_updates.len(),
            closed_channels = delta.closed_channels.len(),
            "published graph delta"
        );
    }

    /// Surface an upstream failure to every subscriber and drop them.
    ///
    /// Each subscription observes the error at most once, then terminates.
    pub fn fail(&self, error: TopologyStreamError) {
        let mut subscribers = self.subscribers.lock();
        for tx in subscribers.drain(..) {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Terminate all subscriptions cleanly (end of stream, no error).
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

impl Default for TopologyPublisher {
    fn default() -> Self {
        Self::new()
    }
}
