//! Timer primitives for the status manager.
//!
//! Wraps the three configured durations and exposes abortable one-shot
//! timers plus the periodic sampling signal. Durations are fixed for the
//! lifetime of a manager instance.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::config::GlobalExecutor;
use crate::topology::ChannelPoint;

use super::{ChanStatusConfig, StatusEvent, TimerDirection};

pub(super) struct TimerScheduler {
    enable_timeout: Duration,
    disable_timeout: Duration,
    sample_interval: Duration,
}

impl TimerScheduler {
    pub fn new(config: &ChanStatusConfig) -> Self {
        Self {
            enable_timeout: config.chan_enable_timeout,
            disable_timeout: config.chan_disable_timeout,
            sample_interval: config.chan_status_sample_interval,
        }
    }

    /// Arm a one-shot that re-injects a `TimerFired` event tagged with the
    /// generation it was armed under. The event is discarded by the driver
    /// if a newer event superseded the timer in the meantime.
    pub fn after(
        &self,
        direction: TimerDirection,
        channel: ChannelPoint,
        generation: u64,
        events: mpsc::Sender<StatusEvent>,
    ) -> TimerHandle {
        let delay = match direction {
            TimerDirection::Enable => self.enable_timeout,
            TimerDirection::Disable => self.disable_timeout,
        };
        let task = GlobalExecutor::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events
                .send(StatusEvent::TimerFired {
                    channel,
                    generation,
                    direction,
                })
                .await;
        });
        TimerHandle { task }
    }

    /// Recurring sampling signal. Missed ticks are skipped, not bursted.
    pub fn periodic(&self) -> Interval {
        let mut interval = interval(self.sample_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }
}

/// Aborts the underlying timer task when cancelled or dropped. A timer that
/// already fired is harmless; its generation tag no longer matches.
pub(super) struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(millis: u64) -> TimerScheduler {
        TimerScheduler::new(&ChanStatusConfig {
            chan_enable_timeout: Duration::from_millis(millis),
            chan_disable_timeout: Duration::from_millis(millis),
            chan_status_sample_interval: Duration::from_millis(millis),
        })
    }

    fn test_channel() -> ChannelPoint {
        ChannelPoint::new([1; 32], 0)
    }

    #[tokio::test]
    async fn one_shot_fires_with_its_generation() {
        let (tx, mut rx) = mpsc::channel(4);
        let timers = scheduler(10);
        let _handle = timers.after(TimerDirection::Disable, test_channel(), 42, tx);

        match rx.recv().await {
            Some(StatusEvent::TimerFired {
                channel,
                generation,
                direction,
            }) => {
                assert_eq!(channel, test_channel());
                assert_eq!(generation, 42);
                assert_eq!(direction, TimerDirection::Disable);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_timers_never_fire() {
        let (tx, mut rx) = mpsc::channel(4);
        let timers = scheduler(20);
        let handle = timers.after(TimerDirection::Enable, test_channel(), 1, tx);
        handle.cancel();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_the_handle_aborts_the_timer() {
        let (tx, mut rx) = mpsc::channel(4);
        let timers = scheduler(20);
        drop(timers.after(TimerDirection::Enable, test_channel(), 1, tx));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
