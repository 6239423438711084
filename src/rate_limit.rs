//! Per-provider rate limiting on top of `governor`.
//!
//! Each provider gets a direct (unkeyed) GCRA limiter allowing `burst` requests
//! at once and refilling at `requests_per_second`, so over any one-second window
//! a provider sees at most `rate + burst` requests. Limiters read time from the
//! injected [`Clock`], which lets tests drive them with [`ManualClock`].
//!
//! [`ManualClock`]: crate::clock::ManualClock

use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{sleep_unless_cancelled, Clock};
use crate::config::RateLimitConfig;

/// Adapts the crate clock to `governor`'s clock trait.
#[derive(Clone)]
struct LimiterClock(Arc<dyn Clock>);

impl governor::clock::Clock for LimiterClock {
    type Instant = Duration;

    fn now(&self) -> Duration {
        self.0.now()
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, LimiterClock, NoOpMiddleware<Duration>>;

/// Build the quota for a config. Out-of-range rates fall back to one request
/// per second.
fn quota_for(config: &RateLimitConfig) -> Quota {
    let burst = NonZeroU32::new(config.burst.max(1)).unwrap_or(NonZeroU32::MIN);
    let period = Duration::try_from_secs_f64(1.0 / config.requests_per_second)
        .ok()
        .and_then(Quota::with_period);
    match period {
        Some(quota) => quota.allow_burst(burst),
        None => Quota::per_second(NonZeroU32::MIN).allow_burst(burst),
    }
}

pub struct ProviderLimiter {
    limiter: DirectLimiter,
    clock: Arc<dyn Clock>,
}

impl ProviderLimiter {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let limiter = RateLimiter::direct_with_clock(quota_for(config), LimiterClock(clock.clone()));
        Self { limiter, clock }
    }

    /// Take a permit now, or report how long until one frees up.
    pub fn check(&self) -> Result<(), Duration> {
        self.limiter
            .check()
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// Wait (via the clock) for a permit. Returns `false` if `cancel` was set
    /// before one was granted.
    pub fn acquire(&self, cancel: &AtomicBool) -> bool {
        loop {
            match self.check() {
                Ok(()) => return true,
                Err(wait) => {
                    let wait = wait.max(Duration::from_millis(1));
                    if !sleep_unless_cancelled(self.clock.as_ref(), wait, Some(cancel)) {
                        return false;
                    }
                }
            }
        }
    }
}

/// One limiter per provider, created for a run and dropped with it.
pub struct RateLimiters {
    limiters: HashMap<String, Arc<ProviderLimiter>>,
    default: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiters {
    pub fn new(default: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            limiters: HashMap::new(),
            default,
            clock,
        }
    }

    /// Register a provider with its own limit, replacing any earlier limiter.
    pub fn register(&mut self, provider: &str, limit: Option<&RateLimitConfig>) -> Arc<ProviderLimiter> {
        let config = limit.unwrap_or(&self.default);
        let limiter = Arc::new(ProviderLimiter::new(config, self.clock.clone()));
        self.limiters.insert(provider.to_string(), limiter.clone());
        limiter
    }

    pub fn get(&self, provider: &str) -> Option<Arc<ProviderLimiter>> {
        self.limiters.get(provider).cloned()
    }
}
