//! Core runtime pieces of a Lumen node: liveness management for local
//! payment channels and distribution of channel-graph updates to
//! subscribers.
//!
//! The [`chan_status::ChanStatusManager`] consumes peer connect/disconnect
//! events from the transport layer and channel open/close events from the
//! funding layer, decides per channel whether it should be advertised as
//! usable, and pushes the resulting policy flips through the
//! [`gossip::ChannelAnnouncer`] seam. Announcements absorbed into the local
//! graph view surface to interested observers through
//! [`topology::TopologyPublisher`] subscriptions.

/// Channel liveness tracking and advertised-status decisions.
pub mod chan_status;

/// Peer node configuration.
pub mod config;

/// Outbound channel-policy announcements and the lower-layer link seam.
pub mod gossip;

/// Local view of the channel graph and update distribution to subscribers.
pub mod topology;

/// Tracing and loging infrastructure.
pub mod tracing;

pub use chan_status::{ChanStatusConfig, ChanStatusManager, StatusAction};
pub use config::set_logger;
pub use topology::{GraphDelta, TopologyPublisher, TopologySubscription};
