//! Watchdog devices used as the fencing trigger
//!
//! A watchdog must be fed periodically. Once feeding stops, the device resets
//! the machine after its timeout. Two variants implement [`Watchdog`]:
//!
//! - [`LinuxWatchdog`]: a `/dev/watchdog` style kernel device
//! - [`FakeWatchdog`]: in-memory stand-in for tests and dry runs
//!
//! The variant is chosen once at startup from [`WatchdogMode`].

mod fake;
mod linux;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

pub use fake::FakeWatchdog;
pub use linux::LinuxWatchdog;

/// Default device path
pub const DEFAULT_WATCHDOG_PATH: &str = "/dev/watchdog";

/// Capability interface over a watchdog device
pub trait Watchdog: Send + Sync {
    /// Reset the device's timeout window. A no-op once stopped.
    fn feed(&self) -> Result<()>;

    /// Time after the last feed at which the device resets the machine
    fn timeout(&self) -> Duration;

    /// Stop feeding for good. The machine resets one timeout later.
    fn stop(&self);

    fn is_stopped(&self) -> bool;

    /// Turn the device off on graceful shutdown so the next agent start does not
    /// race a pending reset.
    fn disarm(&self) -> Result<()>;
}

/// How the watchdog is chosen at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WatchdogMode {
    /// Use the device when present, otherwise run without a watchdog
    Auto,
    /// Require the device
    Device,
    /// Use the in-memory fake
    Fake,
    /// Never use a watchdog; fencing falls back to software reboot
    None,
}

/// Open the watchdog selected by `mode`
pub fn select_watchdog(
    mode: WatchdogMode,
    path: &Path,
    fake_timeout: Duration,
) -> Result<Option<Arc<dyn Watchdog>>> {
    match mode {
        WatchdogMode::None => {
            info!("Watchdog disabled by configuration");
            Ok(None)
        }
        WatchdogMode::Fake => {
            info!("Using fake watchdog with timeout {:?}", fake_timeout);
            Ok(Some(Arc::new(FakeWatchdog::new(fake_timeout))))
        }
        WatchdogMode::Device => {
            let dog = LinuxWatchdog::open(path)?;
            Ok(Some(Arc::new(dog)))
        }
        WatchdogMode::Auto => {
            if !path.exists() {
                warn!(
                    "Watchdog device {} not found, fencing will use software reboot",
                    path.display()
                );
                return Ok(None);
            }
            match LinuxWatchdog::open(path) {
                Ok(dog) => Ok(Some(Arc::new(dog))),
                Err(e) => {
                    warn!("Failed to open watchdog {}: {}", path.display(), e);
                    Ok(None)
                }
            }
        }
    }
}

/// Interval at which the feed loop feeds a device with the given timeout
pub fn feed_interval(timeout: Duration) -> Duration {
    (timeout / 3).max(Duration::from_millis(100))
}

/// Start feeding `watchdog` on its own schedule until it is stopped or the
/// process shuts down.
pub fn start(watchdog: Arc<dyn Watchdog>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = feed_interval(watchdog.timeout());
        let mut ticker = tokio::time::interval(interval);

        info!(
            timeout_secs = watchdog.timeout().as_secs(),
            interval_ms = interval.as_millis() as u64,
            "Starting watchdog feed loop"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if watchdog.is_stopped() {
                        warn!("Watchdog feeding stopped, waiting for reset");
                        return;
                    }
                    if let Err(e) = watchdog.feed() {
                        error!("Failed to feed watchdog: {}", e);
                    } else {
                        debug!("Watchdog fed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if watchdog.is_stopped() {
            return;
        }
        match watchdog.disarm() {
            Ok(()) => info!("Watchdog disarmed on shutdown"),
            Err(e) => error!("Failed to disarm watchdog: {}", e),
        }
    })
}

pub(crate) fn device_error(path: &Path, e: std::io::Error) -> Error {
    Error::WatchdogError(format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_interval_is_a_third_of_timeout() {
        assert_eq!(feed_interval(Duration::from_secs(60)), Duration::from_secs(20));
        assert_eq!(feed_interval(Duration::ZERO), Duration::from_millis(100));
    }

    #[test]
    fn test_select_missing_device_in_auto_mode() {
        let dog = select_watchdog(
            WatchdogMode::Auto,
            Path::new("/nonexistent/watchdog"),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(dog.is_none());
    }

    #[test]
    fn test_select_missing_device_is_an_error_in_device_mode() {
        let result = select_watchdog(
            WatchdogMode::Device,
            Path::new("/nonexistent/watchdog"),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(Error::WatchdogError(_))));
    }

    #[test]
    fn test_select_fake_exposes_timeout() {
        let dog = select_watchdog(
            WatchdogMode::Fake,
            Path::new(DEFAULT_WATCHDOG_PATH),
            Duration::from_secs(7),
        )
        .unwrap()
        .unwrap();
        assert_eq!(dog.timeout(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_loop_feeds_until_stopped() {
        let fake = Arc::new(FakeWatchdog::new(Duration::from_secs(3)));
        let (_tx, rx) = watch::channel(false);
        let handle = start(fake.clone(), rx);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let fed = fake.feed_count();
        assert!(fed >= 3, "fed {} times", fed);

        fake.stop();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(handle.is_finished());
        assert_eq!(fake.feed_count(), fed);
        assert!(!fake.is_disarmed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disarms_when_not_fencing() {
        let fake = Arc::new(FakeWatchdog::new(Duration::from_secs(3)));
        let (tx, rx) = watch::channel(false);
        let handle = start(fake.clone(), rx);

        tokio::time::sleep(Duration::from_secs(2)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(fake.is_disarmed());
    }
}
