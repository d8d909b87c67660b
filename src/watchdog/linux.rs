//! Kernel watchdog device (`/dev/watchdog`)

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::info;

use super::{device_error, Watchdog};
use crate::error::{Error, Result};

// _IOR('W', 5, int) and _IOR('W', 7, int) from linux/watchdog.h
const WDIOC_KEEPALIVE: libc::c_ulong = 0x8004_5705;
const WDIOC_GETTIMEOUT: libc::c_ulong = 0x8004_5707;

/// Written before close to turn the device off
const MAGIC_CLOSE: &[u8] = b"V";

/// Watchdog backed by a kernel device. Opening the device arms it.
#[derive(Debug)]
pub struct LinuxWatchdog {
    path: PathBuf,
    file: Mutex<Option<File>>,
    timeout: Duration,
    stopped: AtomicBool,
}

impl LinuxWatchdog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| device_error(path, e))?;

        let mut secs: libc::c_int = 0;
        // SAFETY: fd is open for the lifetime of `file`, secs is a valid c_int.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), WDIOC_GETTIMEOUT as _, &mut secs) };
        if rc != 0 {
            return Err(device_error(path, std::io::Error::last_os_error()));
        }
        if secs <= 0 {
            return Err(Error::WatchdogError(format!(
                "{} reported invalid timeout {}",
                path.display(),
                secs
            )));
        }

        info!(
            "Opened watchdog {} with timeout {}s",
            path.display(),
            secs
        );

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Some(file)),
            timeout: Duration::from_secs(secs as u64),
            stopped: AtomicBool::new(false),
        })
    }

    fn lock_file(&self) -> std::sync::MutexGuard<'_, Option<File>> {
        match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Watchdog for LinuxWatchdog {
    fn feed(&self) -> Result<()> {
        let guard = self.lock_file();
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        let file = guard
            .as_ref()
            .ok_or_else(|| Error::WatchdogError(format!("{} is closed", self.path.display())))?;

        let mut dummy: libc::c_int = 0;
        // SAFETY: fd is open while the guard is held.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), WDIOC_KEEPALIVE as _, &mut dummy) };
        if rc != 0 {
            return Err(device_error(&self.path, std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn stop(&self) {
        let _guard = self.lock_file();
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn disarm(&self) -> Result<()> {
        let mut guard = self.lock_file();
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::WatchdogError(
                "refusing to disarm a stopped watchdog".to_string(),
            ));
        }
        if let Some(mut file) = guard.take() {
            file.write_all(MAGIC_CLOSE)
                .map_err(|e| device_error(&self.path, e))?;
        }
        Ok(())
    }
}
