//! Per-subscriber delivery of graph deltas.
//!
//! Bridges the continuous upstream push stream into a bounded, cancelable
//! sequence. One delivery task runs per subscription; the only state shared
//! with other subscriptions is the immutable deltas themselves.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, watch};

use super::GraphDelta;

/// Capacity of each subscriber's update buffer. A subscriber that stops
/// draining blocks its own delivery task once the buffer fills; deltas are
/// never dropped on its behalf.
pub const SUBSCRIBER_BUFFER: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyStreamError {
    #[error("topology stream failed upstream: {0}")]
    Upstream(String),
}

/// Consumable half of a topology subscription.
///
/// `next_update` yields deltas in exact upstream order until the stream ends
/// cleanly, fails, or the subscription is cancelled. A failed stream leaves
/// at most one error in `next_error`. After [`Self::cancel`] neither method
/// yields anything further.
pub struct TopologySubscription {
    updates: mpsc::Receiver<GraphDelta>,
    errors: mpsc::Receiver<TopologyStreamError>,
    cancel: watch::Sender<bool>,
}

impl TopologySubscription {
    pub(super) fn spawn(
        upstream: mpsc::UnboundedReceiver<Result<GraphDelta, TopologyStreamError>>,
    ) -> Self {
        let (update_tx, updates) = mpsc::channel(SUBSCRIBER_BUFFER);
        let (error_tx, errors) = mpsc::channel(1);
        let (cancel, cancelled) = watch::channel(false);
        crate::config::GlobalExecutor::spawn(deliver(upstream, update_tx, error_tx, cancelled));
        Self {
            updates,
            errors,
            cancel,
        }
    }

    /// Next delta, or `None` once the subscription has terminated.
    pub async fn next_update(&mut self) -> Option<GraphDelta> {
        if *self.cancel.borrow() {
            return None;
        }
        self.updates.recv().await
    }

    /// The terminal stream error, if the upstream failed. Yields at most one
    /// value over the lifetime of the subscription.
    pub async fn next_error(&mut self) -> Option<TopologyStreamError> {
        if *self.cancel.borrow() {
            return None;
        }
        self.errors.recv().await
    }

    /// Cancel the subscription. Idempotent; unblocks the delivery task and
    /// makes subsequent `next_update`/`next_error` calls return `None`
    /// immediately.
    pub fn cancel(&self) {
        // send_replace updates the flag even if the delivery task (the only
        // receiver) has already exited.
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

impl futures::Stream for TopologySubscription {
    type Item = GraphDelta;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<GraphDelta>> {
        let this = self.get_mut();
        if *this.cancel.borrow() {
            return Poll::Ready(None);
        }
        this.updates.poll_recv(cx)
    }
}

/// Delivery loop: move deltas from the upstream channel into the bounded
/// subscriber buffer.
///
/// The cancellation signal is checked before each blocking upstream receive,
/// again right after one completes, and raced against the (possibly
/// blocking) enqueue. A cancellation therefore cannot be missed while the
/// loop is parked on either side, and a received delta is only abandoned
/// when the subscription itself is going away.
async fn deliver(
    mut upstream: mpsc::UnboundedReceiver<Result<GraphDelta, TopologyStreamError>>,
    updates: mpsc::Sender<GraphDelta>,
    errors: mpsc::Sender<TopologyStreamError>,
    mut cancelled: watch::Receiver<bool>,
) {
    loop {
        if *cancelled.borrow() {
            return;
        }
        let item = tokio::select! {
            biased;
            // Resolves on cancel or when the subscription handle is dropped.
            _ = cancelled.changed() => return,
            item = upstream.recv() => item,
        };
        // Upstream closed: clean end of stream, no error emitted.
        let Some(item) = item else { return };
        if *cancelled.borrow() {
            return;
        }
        match item {
            Ok(delta) => {
                tokio::select! {
                    biased;
                    _ = cancelled.changed() => return,
                    permit = updates.reserve() => match permit {
                        Ok(permit) => permit.send(delta),
                        // Subscriber dropped its receiving half.
                        Err(_) => return,
                    },
                }
            }
            Err(error) => {
                tracing::debug!(%error, "topology stream terminated with error");
                let _ = errors.try_send(error);
                return;
            }
        }
    }
}
