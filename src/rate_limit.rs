//! Sliding-window admission control with an externally triggered cooldown.
//!
//! The limiter is shared process-wide by everything that dispatches calls to
//! the generation backend. All state sits behind one mutex, so
//! [`RateLimiter::try_acquire`] checks and records atomically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::RateLimitConfig;
use crate::error::{CoreError, CoreResult};
use crate::util::now_millis;

/// Source of the current time in milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        now_millis()
    }
}

/// Clock advanced by hand, for deterministic limiter tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by_ms: i64) {
        self.now.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    /// Request timestamps, oldest first.
    requests: VecDeque<i64>,
    cooldown_until: Option<i64>,
}

impl LimiterState {
    fn prune(&mut self, now: i64, window_ms: i64) {
        while let Some(&oldest) = self.requests.front() {
            if now - oldest >= window_ms {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }

    fn cooldown_remaining(&mut self, now: i64) -> i64 {
        match self.cooldown_until {
            Some(until) if until > now => until - now,
            Some(_) => {
                self.cooldown_until = None;
                0
            }
            None => 0,
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(LimiterState::default()),
        }
    }

    // A poisoned lock only means another caller panicked mid-update; the
    // timestamp list is still usable.
    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admits(&self, state: &mut LimiterState, now: i64) -> bool {
        if state.cooldown_remaining(now) > 0 {
            return false;
        }
        state.prune(now, self.config.window_ms);
        state.requests.len() < self.config.max_requests
    }

    pub fn can_make_request(&self) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        self.admits(&mut state, now)
    }

    /// Records a dispatched call. Call once, right before the gated call.
    pub fn record_request(&self) {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        state.prune(now, self.config.window_ms);
        state.requests.push_back(now);
    }

    /// Check and record under one lock acquisition.
    pub fn try_acquire(&self) -> CoreResult<()> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        if self.admits(&mut state, now) {
            state.requests.push_back(now);
            return Ok(());
        }

        let retry_after = self.time_until_reset_locked(&mut state, now);
        Err(CoreError::RateLimited {
            retry_after: Duration::from_millis(u64::try_from(retry_after).unwrap_or(0)),
        })
    }

    pub fn activate_cooldown(&self) {
        let now = self.clock.now_ms();
        let until = now + self.config.cooldown_ms;
        let mut state = self.lock();
        state.cooldown_until = Some(state.cooldown_until.map_or(until, |current| current.max(until)));
        warn!(cooldown_ms = self.config.cooldown_ms, "upstream throttled, cooling down");
    }

    /// Milliseconds until a request could be admitted; 0 when one could go now.
    pub fn time_until_reset(&self) -> i64 {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        self.time_until_reset_locked(&mut state, now)
    }

    fn time_until_reset_locked(&self, state: &mut LimiterState, now: i64) -> i64 {
        let cooldown = state.cooldown_remaining(now);
        state.prune(now, self.config.window_ms);

        let window = if state.requests.len() >= self.config.max_requests {
            state
                .requests
                .front()
                .map_or(0, |oldest| (oldest + self.config.window_ms - now).max(0))
        } else {
            0
        };

        cooldown.max(window)
    }

    pub fn remaining_requests(&self) -> usize {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        if state.cooldown_remaining(now) > 0 {
            return 0;
        }
        state.prune(now, self.config.window_ms);
        self.config.max_requests.saturating_sub(state.requests.len())
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.requests.clear();
        state.cooldown_until = None;
        info!("rate limiter reset");
    }
}
