//! In-memory watchdog

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::Watchdog;
use crate::error::Result;

/// Watchdog that only records what happened to it
#[derive(Debug)]
pub struct FakeWatchdog {
    timeout: Duration,
    feeds: AtomicU64,
    last_feed: Mutex<Option<Instant>>,
    stopped: AtomicBool,
    disarmed: AtomicBool,
}

impl FakeWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            feeds: AtomicU64::new(0),
            last_feed: Mutex::new(None),
            stopped: AtomicBool::new(false),
            disarmed: AtomicBool::new(false),
        }
    }

    pub fn feed_count(&self) -> u64 {
        self.feeds.load(Ordering::SeqCst)
    }

    pub fn last_feed(&self) -> Option<Instant> {
        self.last_feed.lock().ok().and_then(|guard| *guard)
    }

    pub fn is_disarmed(&self) -> bool {
        self.disarmed.load(Ordering::SeqCst)
    }
}

impl Watchdog for FakeWatchdog {
    fn feed(&self) -> Result<()> {
        let mut last = match self.last_feed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        *last = Some(Instant::now());
        self.feeds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn stop(&self) {
        let _guard = self.last_feed.lock();
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn disarm(&self) -> Result<()> {
        self.disarmed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
