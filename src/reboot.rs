//! Self-fencing trigger
//!
//! Rebooting means engaging the mechanism that will force the node down: stop
//! feeding the watchdog, or when no watchdog exists, ask the kernel to reboot.
//! Success cannot mean "the node rebooted" since that is not observable from
//! the node itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::watchdog::Watchdog;

/// Engages self-fencing
pub trait Rebooter: Send + Sync {
    /// Returns an error only when fencing could not even be attempted
    fn reboot(&self) -> Result<()>;
}

/// Rebooter that owns the process' watchdog
pub struct WatchdogRebooter {
    watchdog: Option<Arc<dyn Watchdog>>,
    software_reboot_enabled: bool,
    engaged: AtomicBool,
}

impl WatchdogRebooter {
    pub fn new(watchdog: Option<Arc<dyn Watchdog>>, software_reboot_enabled: bool) -> Self {
        Self {
            watchdog,
            software_reboot_enabled,
            engaged: AtomicBool::new(false),
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }
}

impl Rebooter for WatchdogRebooter {
    fn reboot(&self) -> Result<()> {
        if self.engaged.load(Ordering::SeqCst) {
            info!("Reboot already engaged");
            return Ok(());
        }

        if let Some(watchdog) = &self.watchdog {
            info!(
                "Stopping watchdog feeding, node resets within {:?}",
                watchdog.timeout()
            );
            watchdog.stop();
            self.engaged.store(true, Ordering::SeqCst);
            return Ok(());
        }

        if !self.software_reboot_enabled {
            return Err(Error::RebootError(
                "no watchdog available and software reboot is disabled".to_string(),
            ));
        }

        warn!("No watchdog available, rebooting via reboot(2)");
        self.engaged.store(true, Ordering::SeqCst);
        if let Err(e) = software_reboot() {
            error!("Software reboot failed: {}", e);
            self.engaged.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }
}

fn software_reboot() -> Result<()> {
    // SAFETY: sync(2) and reboot(2) take no pointers.
    unsafe {
        libc::sync();
        if libc::reboot(libc::RB_AUTOBOOT) != 0 {
            return Err(Error::RebootError(
                std::io::Error::last_os_error().to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::FakeWatchdog;
    use std::time::Duration;

    #[test]
    fn test_reboot_stops_watchdog_feeding() {
        let dog = Arc::new(FakeWatchdog::new(Duration::from_secs(5)));
        let rebooter = WatchdogRebooter::new(Some(dog.clone()), false);

        rebooter.reboot().unwrap();
        assert!(dog.is_stopped());
        assert!(rebooter.is_engaged());

        // second call is a no-op
        rebooter.reboot().unwrap();
        assert!(dog.is_stopped());
    }

    #[test]
    fn test_reboot_without_watchdog_or_software_reboot_fails() {
        let rebooter = WatchdogRebooter::new(None, false);
        assert!(matches!(rebooter.reboot(), Err(Error::RebootError(_))));
        assert!(!rebooter.is_engaged());
    }
}
