//! Channel liveness tracking and advertised-status decisions.
//!
//! Decides, per local channel, whether it should be advertised to the
//! network as usable, based on peer connectivity, link readiness and
//! operator override, and requests a (re)announcement whenever the
//! advertised value actually flips. Flips triggered by connectivity changes
//! are debounced through the enable/disable timeouts; operator actions apply
//! immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::config::{
    GlobalExecutor, DEFAULT_CHAN_DISABLE_TIMEOUT, DEFAULT_CHAN_ENABLE_TIMEOUT,
    DEFAULT_CHAN_STATUS_SAMPLE_INTERVAL,
};
use crate::gossip::{ChannelAnnouncer, LinkEligibility};
use crate::topology::{ChannelPoint, NodeId};

mod timer;

use timer::{TimerHandle, TimerScheduler};

/// Size of the manager's event funnel. Events are small and processing is
/// quick; the bound only guards against a stalled driver.
const EVENT_QUEUE: usize = 64;

/// Operator-issued status action for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    Enable,
    Disable,
    Auto,
}

/// Override state of a channel record.
///
/// `ManualDisable` is a sticky lock: connectivity changes cannot re-enable
/// the channel until the operator issues `Auto` (or `Enable`). `ManualEnable`
/// is a one-time nudge: the next disconnect consumes it and reverts the
/// record to automatic management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusMode {
    Auto,
    ManualEnable,
    ManualDisable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerDirection {
    Enable,
    Disable,
}

#[derive(Debug, thiserror::Error)]
pub enum ChanStatusError {
    #[error("no channel tracked with outpoint {0}")]
    UnknownChannel(ChannelPoint),
    #[error("channel status manager is exiting")]
    ManagerExiting,
}

/// Snapshot of a channel's liveness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub advertised_disabled: bool,
    pub peer_connected: bool,
    pub link_eligible: bool,
}

#[derive(Debug, Clone)]
pub struct ChanStatusConfig {
    /// Wait after a peer reconnects before the channel is re-advertised as
    /// usable.
    pub chan_enable_timeout: Duration,
    /// Wait after a peer disconnects before the channel is advertised as
    /// unusable.
    pub chan_disable_timeout: Duration,
    /// Period between link-eligibility sampling passes.
    pub chan_status_sample_interval: Duration,
}

impl Default for ChanStatusConfig {
    fn default() -> Self {
        Self {
            chan_enable_timeout: DEFAULT_CHAN_ENABLE_TIMEOUT,
            chan_disable_timeout: DEFAULT_CHAN_DISABLE_TIMEOUT,
            chan_status_sample_interval: DEFAULT_CHAN_STATUS_SAMPLE_INTERVAL,
        }
    }
}

#[derive(Debug)]
enum StatusEvent {
    PeerConnected(NodeId),
    PeerDisconnected(NodeId),
    ChannelOpened {
        channel: ChannelPoint,
        peer: NodeId,
        connected: bool,
    },
    ChannelClosed(ChannelPoint),
    SetMode {
        channel: ChannelPoint,
        action: StatusAction,
        reply: oneshot::Sender<Result<(), ChanStatusError>>,
    },
    Query {
        channel: ChannelPoint,
        reply: oneshot::Sender<Result<ChannelStatus, ChanStatusError>>,
    },
    TimerFired {
        channel: ChannelPoint,
        generation: u64,
        direction: TimerDirection,
    },
    Shutdown,
}

/// Cloneable handle to the channel status manager.
///
/// All operations funnel into a single driver task, so no two evaluations of
/// the same channel ever run concurrently regardless of caller threading.
/// Transport-layer connect/disconnect events may be delivered more than
/// once; the manager is idempotent on duplicates.
#[derive(Clone)]
pub struct ChanStatusManager {
    events: mpsc::Sender<StatusEvent>,
}

impl ChanStatusManager {
    pub fn start(
        config: ChanStatusConfig,
        oracle: Arc<dyn LinkEligibility>,
        announcer: Arc<dyn ChannelAnnouncer>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let driver = StatusDriver {
            channels: HashMap::new(),
            timers: TimerScheduler::new(&config),
            oracle,
            announcer,
            events: events_tx.clone(),
        };
        GlobalExecutor::spawn(driver.run(events_rx));
        Self { events: events_tx }
    }

    pub async fn peer_connected(&self, peer: NodeId) -> Result<(), ChanStatusError> {
        self.send(StatusEvent::PeerConnected(peer)).await
    }

    pub async fn peer_disconnected(&self, peer: NodeId) -> Result<(), ChanStatusError> {
        self.send(StatusEvent::PeerDisconnected(peer)).await
    }

    /// Start tracking a channel confirmed by the funding flow. The record is
    /// created in automatic mode, advertised enabled.
    pub async fn channel_opened(
        &self,
        channel: ChannelPoint,
        peer: NodeId,
        connected: bool,
    ) -> Result<(), ChanStatusError> {
        self.send(StatusEvent::ChannelOpened {
            channel,
            peer,
            connected,
        })
        .await
    }

    /// Stop tracking a channel whose closure reached finality.
    pub async fn channel_closed(&self, channel: ChannelPoint) -> Result<(), ChanStatusError> {
        self.send(StatusEvent::ChannelClosed(channel)).await
    }

    /// Apply an operator action to a channel and re-evaluate immediately.
    pub async fn set_mode(
        &self,
        channel: ChannelPoint,
        action: StatusAction,
    ) -> Result<(), ChanStatusError> {
        let (reply, response) = oneshot::channel();
        self.send(StatusEvent::SetMode {
            channel,
            action,
            reply,
        })
        .await?;
        response.await.map_err(|_| ChanStatusError::ManagerExiting)?
    }

    /// Current liveness snapshot of a tracked channel.
    pub async fn status(&self, channel: ChannelPoint) -> Result<ChannelStatus, ChanStatusError> {
        let (reply, response) = oneshot::channel();
        self.send(StatusEvent::Query { channel, reply }).await?;
        response.await.map_err(|_| ChanStatusError::ManagerExiting)?
    }

    /// Stop the driver task. Pending timers are aborted.
    pub async fn shutdown(&self) {
        let _ = self.events.send(StatusEvent::Shutdown).await;
    }

    async fn send(&self, event: StatusEvent) -> Result<(), ChanStatusError> {
        self.events
            .send(event)
            .await
            .map_err(|_| ChanStatusError::ManagerExiting)
    }
}

struct PendingTimer {
    direction: TimerDirection,
    generation: u64,
    handle: TimerHandle,
}

struct ChannelStatusRecord {
    peer: NodeId,
    mode: StatusMode,
    advertised_disabled: bool,
    peer_connected: bool,
    link_eligible: bool,
    /// Bumped by every event that supersedes an armed timer; a firing whose
    /// generation no longer matches is discarded.
    generation: u64,
    pending: Option<PendingTimer>,
    /// The enable timer fired while the link was not yet ready; the sampler
    /// completes the flip as soon as eligibility returns.
    awaiting_eligibility: bool,
    last_change: Instant,
}

/// Desired advertised-disabled value for the given inputs. Pure; the rest of
/// the state machine decides when (and whether) the flip is applied.
fn evaluate(mode: StatusMode, peer_connected: bool, link_eligible: bool) -> bool {
    match mode {
        StatusMode::ManualDisable => true,
        StatusMode::ManualEnable if peer_connected => false,
        StatusMode::ManualEnable | StatusMode::Auto => !(peer_connected && link_eligible),
    }
}

fn query_oracle(oracle: &dyn LinkEligibility, channel: &ChannelPoint) -> bool {
    match oracle.eligible_to_forward(channel) {
        Ok(eligible) => eligible,
        Err(err) => {
            // Fail safe toward disabled; retried on the next sample tick.
            tracing::debug!(%channel, %err, "eligibility query failed, treating link as not ready");
            false
        }
    }
}

struct StatusDriver {
    channels: HashMap<ChannelPoint, ChannelStatusRecord>,
    timers: TimerScheduler,
    oracle: Arc<dyn LinkEligibility>,
    announcer: Arc<dyn ChannelAnnouncer>,
    events: mpsc::Sender<StatusEvent>,
}

impl StatusDriver {
    async fn run(mut self, mut events: mpsc::Receiver<StatusEvent>) {
        tracing::debug!("channel status manager started");
        let mut sampler = self.timers.periodic();
        // Consume the interval's immediate first tick.
        sampler.tick().await;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(StatusEvent::Shutdown) | None => break,
                    Some(event) => self.handle_event(event),
                },
                _ = sampler.tick() => self.sample_channels(),
            }
        }
        tracing::debug!("channel status manager exiting");
    }

    fn handle_event(&mut self, event: StatusEvent) {
        match event {
            StatusEvent::PeerConnected(peer) => self.on_peer_connected(peer),
            StatusEvent::PeerDisconnected(peer) => self.on_peer_disconnected(peer),
            StatusEvent::ChannelOpened {
                channel,
                peer,
                connected,
            } => self.on_channel_opened(channel, peer, connected),
            StatusEvent::ChannelClosed(channel) => self.on_channel_closed(channel),
            StatusEvent::SetMode {
                channel,
                action,
                reply,
            } => {
                let _ = reply.send(self.on_set_mode(channel, action));
            }
            StatusEvent::Query { channel, reply } => {
                let _ = reply.send(self.on_query(channel));
            }
            StatusEvent::TimerFired {
                channel,
                generation,
                direction,
            } => self.on_timer_fired(channel, generation, direction),
            StatusEvent::Shutdown => unreachable!("handled by the event loop"),
        }
    }

    fn on_peer_connected(&mut self, peer: NodeId) {
        for (channel, record) in self.channels.iter_mut() {
            if record.peer != peer || record.peer_connected {
                continue;
            }
            tracing::debug!(%channel, %peer, "peer connected");
            record.peer_connected = true;
            record.generation += 1;
            cancel_pending(channel, record);
            record.awaiting_eligibility = false;
            if record.advertised_disabled && record.mode != StatusMode::ManualDisable {
                arm_timer(
                    &self.timers,
                    &self.events,
                    *channel,
                    record,
                    TimerDirection::Enable,
                );
            }
        }
    }

    fn on_peer_disconnected(&mut self, peer: NodeId) {
        for (channel, record) in self.channels.iter_mut() {
            if record.peer != peer || !record.peer_connected {
                continue;
            }
            tracing::debug!(%channel, %peer, "peer disconnected");
            record.peer_connected = false;
            record.generation += 1;
            cancel_pending(channel, record);
            record.awaiting_eligibility = false;
            if record.mode == StatusMode::ManualEnable {
                // The one-time manual nudge is consumed by the disconnect.
                record.mode = StatusMode::Auto;
            }
            if !record.advertised_disabled {
                arm_timer(
                    &self.timers,
                    &self.events,
                    *channel,
                    record,
                    TimerDirection::Disable,
                );
            }
        }
    }

    fn on_channel_opened(&mut self, channel: ChannelPoint, peer: NodeId, connected: bool) {
        let link_eligible = query_oracle(&*self.oracle, &channel);
        let mut record = ChannelStatusRecord {
            peer,
            mode: StatusMode::Auto,
            advertised_disabled: false,
            peer_connected: connected,
            link_eligible,
            generation: 0,
            pending: None,
            awaiting_eligibility: false,
            last_change: Instant::now(),
        };
        // A channel born unhealthy goes through the normal debounce path.
        if evaluate(record.mode, record.peer_connected, record.link_eligible) {
            arm_timer(
                &self.timers,
                &self.events,
                channel,
                &mut record,
                TimerDirection::Disable,
            );
        }
        tracing::info!(%channel, %peer, connected, "tracking channel status");
        self.channels.insert(channel, record);
    }

    fn on_channel_closed(&mut self, channel: ChannelPoint) {
        if self.channels.remove(&channel).is_some() {
            tracing::info!(%channel, "channel closed, dropping status record");
        }
    }

    fn on_set_mode(
        &mut self,
        channel: ChannelPoint,
        action: StatusAction,
    ) -> Result<(), ChanStatusError> {
        let Some(record) = self.channels.get_mut(&channel) else {
            return Err(ChanStatusError::UnknownChannel(channel));
        };
        record.mode = match action {
            StatusAction::Enable => StatusMode::ManualEnable,
            StatusAction::Disable => StatusMode::ManualDisable,
            StatusAction::Auto => StatusMode::Auto,
        };
        record.generation += 1;
        cancel_pending(&channel, record);
        record.awaiting_eligibility = false;
        tracing::info!(%channel, ?action, "operator status action");
        // Operator actions apply without debounce.
        let desired = evaluate(record.mode, record.peer_connected, record.link_eligible);
        if desired != record.advertised_disabled {
            apply_flip(&*self.announcer, channel, record, desired);
        }
        Ok(())
    }

    fn on_query(&self, channel: ChannelPoint) -> Result<ChannelStatus, ChanStatusError> {
        let record = self
            .channels
            .get(&channel)
            .ok_or(ChanStatusError::UnknownChannel(channel))?;
        Ok(ChannelStatus {
            advertised_disabled: record.advertised_disabled,
            peer_connected: record.peer_connected,
            link_eligible: record.link_eligible,
        })
    }

    fn on_timer_fired(
        &mut self,
        channel: ChannelPoint,
        generation: u64,
        direction: TimerDirection,
    ) {
        let Some(record) = self.channels.get_mut(&channel) else {
            return;
        };
        if record.generation != generation {
            tracing::debug!(
                %channel,
                generation,
                current = record.generation,
                "discarding stale status timer"
            );
            return;
        }
        record.pending = None;
        match direction {
            TimerDirection::Disable => {
                let desired = evaluate(record.mode, record.peer_connected, record.link_eligible);
                if desired && !record.advertised_disabled {
                    apply_flip(&*self.announcer, channel, record, true);
                }
            }
            TimerDirection::Enable => {
                if record.mode == StatusMode::ManualDisable {
                    return;
                }
                // Re-query at fire time: the link may have become ready (or
                // stopped being ready) while the timer was pending.
                record.link_eligible = query_oracle(&*self.oracle, &channel);
                let desired = evaluate(record.mode, record.peer_connected, record.link_eligible);
                if !desired {
                    if record.advertised_disabled {
                        apply_flip(&*self.announcer, channel, record, false);
                    }
                } else if record.peer_connected {
                    // Enable timeout served, link not ready yet; the sampler
                    // completes the flip once it is.
                    record.awaiting_eligibility = true;
                }
            }
        }
    }

    /// Periodic pass: refresh eligibility for every record and re-evaluate.
    fn sample_channels(&mut self) {
        for (channel, record) in self.channels.iter_mut() {
            record.link_eligible = query_oracle(&*self.oracle, channel);
            let desired = evaluate(record.mode, record.peer_connected, record.link_eligible);
            if desired == record.advertised_disabled {
                continue;
            }
            if record.pending.is_some() {
                // A debounce timer is already in flight for this record.
                continue;
            }
            if !desired && record.awaiting_eligibility {
                // The enable timeout was already served; the link just became
                // ready, so the flip completes now.
                record.awaiting_eligibility = false;
                apply_flip(&*self.announcer, *channel, record, false);
                continue;
            }
            let direction = if desired {
                TimerDirection::Disable
            } else {
                TimerDirection::Enable
            };
            arm_timer(&self.timers, &self.events, *channel, record, direction);
        }
    }
}

/// Announce a flip and record it. A failed announcement leaves the
/// advertised value unchanged; the sampler re-arms a retry on a later pass.
fn apply_flip(
    announcer: &dyn ChannelAnnouncer,
    channel: ChannelPoint,
    record: &mut ChannelStatusRecord,
    disabled: bool,
) {
    match announcer.announce(&channel, disabled) {
        Ok(()) => {
            record.advertised_disabled = disabled;
            tracing::info!(
                %channel,
                disabled,
                stable_for = ?record.last_change.elapsed(),
                "channel status change announced"
            );
            record.last_change = Instant::now();
        }
        Err(err) => {
            tracing::warn!(%channel, disabled, %err, "failed to announce status change");
        }
    }
}

fn cancel_pending(channel: &ChannelPoint, record: &mut ChannelStatusRecord) {
    if let Some(pending) = record.pending.take() {
        pending.handle.cancel();
        tracing::debug!(
            %channel,
            direction = ?pending.direction,
            generation = pending.generation,
            "cancelled pending status timer"
        );
    }
}

fn arm_timer(
    timers: &TimerScheduler,
    events: &mpsc::Sender<StatusEvent>,
    channel: ChannelPoint,
    record: &mut ChannelStatusRecord,
    direction: TimerDirection,
) {
    let handle = timers.after(direction, channel, record.generation, events.clone());
    record.pending = Some(PendingTimer {
        direction,
        generation: record.generation,
        handle,
    });
    tracing::debug!(
        %channel,
        ?direction,
        generation = record.generation,
        "armed status timer"
    );
}
