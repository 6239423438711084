//! Time source for rate limiting and backoff.
//!
//! Everything that waits goes through a [`Clock`] so tests can swap in
//! [`ManualClock`] and observe request timing without sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Longest single sleep between cancel checks.
const CANCEL_POLL: Duration = Duration::from_millis(100);

pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Simulated clock: `sleep` advances time instantly.
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += duration;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.lock().map(|now| *now).unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Sleep for `duration` in short slices, stopping early once `cancel` is set.
/// Returns `false` if the wait was cut short.
pub fn sleep_unless_cancelled(clock: &dyn Clock, duration: Duration, cancel: Option<&AtomicBool>) -> bool {
    let is_cancelled = || cancel.is_some_and(|c| c.load(Ordering::SeqCst));
    let mut remaining = duration;
    while !remaining.is_zero() {
        if is_cancelled() {
            return false;
        }
        let slice = remaining.min(CANCEL_POLL);
        clock.sleep(slice);
        remaining -= slice;
    }
    !is_cancelled()
}
