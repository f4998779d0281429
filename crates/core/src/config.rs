//! Peer node configuration.

use std::{future::Future, sync::atomic::AtomicBool, time::Duration};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

use crate::chan_status::ChanStatusConfig;

/// Default wait after a peer reconnects before a channel is re-advertised as
/// usable, giving the link time to finish its own initialization.
pub const DEFAULT_CHAN_ENABLE_TIMEOUT: Duration = Duration::from_secs(19 * 60);
/// Default wait after a peer disconnects before a channel is advertised as
/// unusable.
pub const DEFAULT_CHAN_DISABLE_TIMEOUT: Duration = Duration::from_secs(20 * 60);
/// Default period between link-eligibility sampling passes.
pub const DEFAULT_CHAN_STATUS_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

// Initialize the executor once.
static ASYNC_RT: Lazy<Option<Runtime>> = Lazy::new(GlobalExecutor::initialize_async_rt);

#[derive(clap::Parser, Debug, Clone, Serialize, Deserialize)]
pub struct ConfigArgs {
    /// Time to wait after a peer reconnects before re-enabling a channel, in
    /// milliseconds.
    #[arg(long = "chan-enable-timeout-ms", env = "CHAN_ENABLE_TIMEOUT_MS")]
    #[serde(
        rename = "chan-enable-timeout-ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub chan_enable_timeout_ms: Option<u64>,

    /// Time to wait after a peer disconnects before disabling a channel, in
    /// milliseconds.
    #[arg(long = "chan-disable-timeout-ms", env = "CHAN_DISABLE_TIMEOUT_MS")]
    #[serde(
        rename = "chan-disable-timeout-ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub chan_disable_timeout_ms: Option<u64>,

    /// Period between link-eligibility sampling passes, in milliseconds.
    #[arg(
        long = "chan-status-sample-interval-ms",
        env = "CHAN_STATUS_SAMPLE_INTERVAL_MS"
    )]
    #[serde(
        rename = "chan-status-sample-interval-ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub chan_status_sample_interval_ms: Option<u64>,

    #[serde(with = "serde_log_level_filter")]
    #[clap(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: tracing::level_filters::LevelFilter,
}

impl Default for ConfigArgs {
    fn default() -> Self {
        Self {
            chan_enable_timeout_ms: None,
            chan_disable_timeout_ms: None,
            chan_status_sample_interval_ms: None,
            log_level: tracing::level_filters::LevelFilter::INFO,
        }
    }
}

impl ConfigArgs {
    /// Resolve defaults and validate, producing the runtime configuration.
    pub fn build(self) -> std::io::Result<Config> {
        let chan_status = ChanStatusConfig {
            chan_enable_timeout: self
                .chan_enable_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CHAN_ENABLE_TIMEOUT),
            chan_disable_timeout: self
                .chan_disable_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CHAN_DISABLE_TIMEOUT),
            chan_status_sample_interval: self
                .chan_status_sample_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CHAN_STATUS_SAMPLE_INTERVAL),
        };
        for (name, duration) in [
            ("chan-enable-timeout-ms", chan_status.chan_enable_timeout),
            ("chan-disable-timeout-ms", chan_status.chan_disable_timeout),
            (
                "chan-status-sample-interval-ms",
                chan_status.chan_status_sample_interval,
            ),
        ] {
            if duration.is_zero() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{name} must be greater than zero"),
                ));
            }
        }
        Ok(Config {
            chan_status,
            log_level: self.log_level,
        })
    }
}

mod serde_log_level_filter {
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::level_filters::LevelFilter;

    pub fn serialize<S>(level: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&level.to_string().to_lowercase())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = <&str>::deserialize(deserializer)?;
        level
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("unknown log level: {level}")))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub chan_status: ChanStatusConfig,
    pub log_level: tracing::level_filters::LevelFilter,
}

pub(crate) struct GlobalExecutor;

impl GlobalExecutor {
    /// Returns the runtime handle if it was initialized or none if it was already
    /// running on the background.
    pub(crate) fn initialize_async_rt() -> Option<Runtime> {
        if tokio::runtime::Handle::try_current().is_ok() {
            None
        } else {
            let mut builder = tokio::runtime::Builder::new_multi_thread();
            builder.enable_all().thread_name("lumen-node");
            if cfg!(debug_assertions) {
                builder.worker_threads(2).max_blocking_threads(2);
            }
            Some(builder.build().expect("failed to build tokio runtime"))
        }
    }

    #[inline]
    pub fn spawn<R: Send + 'static>(
        f: impl Future<Output = R> + Send + 'static,
    ) -> tokio::task::JoinHandle<R> {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(f)
        } else if let Some(rt) = &*ASYNC_RT {
            rt.spawn(f)
        } else {
            unreachable!("the executor must have been initialized")
        }
    }
}

pub fn set_logger(level: Option<tracing::level_filters::LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        crate::tracing::tracer::init_tracer(level).expect("failed tracing initialization")
    }
    #[cfg(not(feature = "trace"))]
    {
        let _ = level;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_applies_defaults() {
        let config = ConfigArgs::default().build().unwrap();
        assert_eq!(
            config.chan_status.chan_enable_timeout,
            DEFAULT_CHAN_ENABLE_TIMEOUT
        );
        assert_eq!(
            config.chan_status.chan_disable_timeout,
            DEFAULT_CHAN_DISABLE_TIMEOUT
        );
        assert_eq!(
            config.chan_status.chan_status_sample_interval,
            DEFAULT_CHAN_STATUS_SAMPLE_INTERVAL
        );
    }

    #[test]
    fn build_rejects_zero_durations() {
        let args = ConfigArgs {
            chan_disable_timeout_ms: Some(0),
            ..Default::default()
        };
        let err = args.build().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn overrides_take_precedence() {
        let args = ConfigArgs {
            chan_enable_timeout_ms: Some(3_000),
            chan_disable_timeout_ms: Some(6_000),
            chan_status_sample_interval_ms: Some(500),
            ..Default::default()
        };
        let config = args.build().unwrap();
        assert_eq!(
            config.chan_status.chan_enable_timeout,
            Duration::from_secs(3)
        );
        assert_eq!(
            config.chan_status.chan_disable_timeout,
            Duration::from_secs(6)
        );
        assert_eq!(
            config.chan_status.chan_status_sample_interval,
            Duration::from_millis(500)
        );
    }
}
