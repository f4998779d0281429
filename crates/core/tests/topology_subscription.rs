use std::sync::Arc;
use std::time::Duration;

use lumen::gossip::{ChannelAnnouncer, GossipAnnouncer};
use lumen::topology::{
    ChannelPoint, ChannelUpdateInfo, GraphDelta, NodeId, NodeUpdateInfo, TopologyPublisher,
    TopologyStreamError, TopologySubscription, SUBSCRIBER_BUFFER,
};
use testresult::TestResult;
use tracing::level_filters::LevelFilter;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

fn sequenced_delta(seq: i64) -> GraphDelta {
    GraphDelta::from_channel_update(ChannelUpdateInfo {
        channel: ChannelPoint::new([1; 32], 0),
        advertising_node: NodeId::new([1; 33]),
        connecting_node: NodeId::new([2; 33]),
        capacity_sat: 100_000,
        disabled: false,
        timestamp: seq,
    })
}

async fn expect_delta(sub: &mut TopologySubscription) -> anyhow::Result<GraphDelta> {
    tokio::time::timeout(WAIT_TIMEOUT, sub.next_update())
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for a delta"))?
        .ok_or_else(|| anyhow::anyhow!("subscription ended early"))
}

/// Two concurrent subscribers observe the full, identically-ordered delta
/// sequence even when one of them is artificially stalled.
#[tokio::test(flavor = "multi_thread")]
async fn stalled_subscriber_still_sees_the_full_ordered_sequence() -> TestResult {
    lumen::config::set_logger(Some(LevelFilter::INFO));
    let publisher = Arc::new(TopologyPublisher::new());
    let mut prompt = publisher.subscribe();
    let mut stalled = publisher.subscribe();

    let total = (SUBSCRIBER_BUFFER * 3) as i64;
    for seq in 0..total {
        publisher.publish(sequenced_delta(seq));
    }
    publisher.close();

    // The prompt reader drains immediately.
    for seq in 0..total {
        let delta = expect_delta(&mut prompt).await?;
        assert_eq!(delta.channel_updates[0].timestamp, seq);
    }
    assert!(prompt.next_update().await.is_none());

    // The stalled reader sits on a full buffer for a while, then drains the
    // identical sequence.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for seq in 0..total {
        let delta = expect_delta(&mut stalled).await?;
        assert_eq!(delta.channel_updates[0].timestamp, seq);
    }
    assert!(stalled.next_update().await.is_none());

    Ok(())
}

/// A subscriber that never drains does not block the publisher or a sibling
/// subscription.
#[tokio::test(flavor = "multi_thread")]
async fn slow_consumer_backpressure_is_isolated() -> TestResult {
    lumen::config::set_logger(Some(LevelFilter::INFO));
    let publisher = Arc::new(TopologyPublisher::new());
    let _stuck = publisher.subscribe();
    let mut live = publisher.subscribe();

    // Publish far beyond the subscriber buffer; publish never blocks and the
    // live subscription keeps flowing.
    let total = (SUBSCRIBER_BUFFER * 5) as i64;
    for seq in 0..total {
        publisher.publish(sequenced_delta(seq));
    }
    for seq in 0..total {
        let delta = expect_delta(&mut live).await?;
        assert_eq!(delta.channel_updates[0].timestamp, seq);
    }

    Ok(())
}

/// After cancel() nothing further is delivered, even while upstream keeps
/// producing, and cancellation is idempotent.
#[tokio::test(flavor = "multi_thread")]
async fn cancellation_is_immediate_and_final() -> TestResult {
    lumen::config::set_logger(Some(LevelFilter::INFO));
    let publisher = Arc::new(TopologyPublisher::new());
    let mut sub = publisher.subscribe();

    publisher.publish(sequenced_delta(0));
    expect_delta(&mut sub).await?;

    sub.cancel();
    sub.cancel();
    for seq in 1..100 {
        publisher.publish(sequenced_delta(seq));
    }

    assert!(sub.next_update().await.is_none());
    assert!(sub.next_error().await.is_none());
    assert!(sub.is_cancelled());

    // The delivery task released its upstream resources.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(publisher.subscriber_count(), 0);

    Ok(())
}

/// Upstream failure surfaces exactly one error after the already-queued
/// deltas; clean termination surfaces none.
#[tokio::test(flavor = "multi_thread")]
async fn upstream_termination_semantics() -> TestResult {
    lumen::config::set_logger(Some(LevelFilter::INFO));

    // Clean close: stream ends, no error.
    let publisher = Arc::new(TopologyPublisher::new());
    let mut sub = publisher.subscribe();
    publisher.publish(sequenced_delta(0));
    publisher.close();
    expect_delta(&mut sub).await?;
    assert!(sub.next_update().await.is_none());
    assert!(sub.next_error().await.is_none());

    // Failure: queued deltas first, then exactly one error.
    let publisher = Arc::new(TopologyPublisher::new());
    let mut sub = publisher.subscribe();
    publisher.publish(sequenced_delta(0));
    publisher.publish(sequenced_delta(1));
    publisher.fail(TopologyStreamError::Upstream("gossip feed lost".into()));

    expect_delta(&mut sub).await?;
    expect_delta(&mut sub).await?;
    assert!(sub.next_update().await.is_none());
    let err = tokio::time::timeout(WAIT_TIMEOUT, sub.next_error())
        .await?
        .expect("one stream error");
    assert_eq!(err, TopologyStreamError::Upstream("gossip feed lost".into()));
    assert!(sub.next_error().await.is_none());

    Ok(())
}

/// Node announcements and channel closures flow through the same pipeline,
/// in publish order.
#[tokio::test(flavor = "multi_thread")]
async fn node_and_closure_deltas_flow_in_order() -> TestResult {
    lumen::config::set_logger(Some(LevelFilter::INFO));
    let publisher = Arc::new(TopologyPublisher::new());
    let announcer = GossipAnnouncer::new(NodeId::new([1; 33]), publisher.clone());
    let mut sub = publisher.subscribe();

    let channel = ChannelPoint::new([4; 32], 1);
    announcer.register_channel(channel, NodeId::new([2; 33]), 500_000);

    announcer.announce_node(NodeUpdateInfo {
        node: NodeId::new([2; 33]),
        alias: "carol".into(),
        addresses: vec!["192.168.1.1:9735".into()],
    });
    announcer.announce(&channel, false).ok();
    announcer.announce_channel_closed(channel, 4_242);
    publisher.close();

    let first = expect_delta(&mut sub).await?;
    assert_eq!(first.node_updates[0].alias, "carol");

    let second = expect_delta(&mut sub).await?;
    assert_eq!(second.channel_updates[0].capacity_sat, 500_000);

    let third = expect_delta(&mut sub).await?;
    assert_eq!(third.closed_channels[0].channel, channel);
    assert_eq!(third.closed_channels[0].closed_height, 4_242);

    assert!(sub.next_update().await.is_none());
    Ok(())
}
