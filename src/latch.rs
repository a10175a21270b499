use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// How long a stop-aware wait blocks before looking at the stop flag again.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// One-shot countdown barrier.
///
/// Waiters block until the count reaches zero. Every wait is bounded so that
/// callers can also watch a stop flag.
#[derive(Debug)]
pub struct CountDownLatch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.zero.notify_all();
            }
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Waits up to `timeout` for the count to reach zero. Returns whether it did.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.zero.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    /// Waits for zero, waking every [`POLL_INTERVAL`] to check `stop`.
    /// Returns `false` if stopped first.
    pub fn wait_or_stop(&self, stop: &AtomicBool) -> bool {
        loop {
            if self.wait_timeout(POLL_INTERVAL) {
                return true;
            }
            if stop.load(Ordering::Acquire) {
                return false;
            }
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }
}
