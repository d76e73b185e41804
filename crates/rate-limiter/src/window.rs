//! Per-credential sliding windows
//!
//! Windows live in a `DashMap`. `check` holds the credential's shard lock for
//! the whole prune/compare/append sequence and never awaits, so two
//! concurrent requests for the same credential cannot both take the last
//! slot.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

/// Length of the trailing window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Slots left in the window after this request (0 when rejected)
    pub remaining: u32,
    /// Milliseconds until the oldest retained request leaves the window
    /// (0 when admitted)
    pub reset_ms: u64,
}

impl RateDecision {
    /// `reset_ms` rounded up to whole seconds, for `Retry-After`.
    pub fn retry_after_secs(&self) -> u64 {
        self.reset_ms.div_ceil(1000)
    }
}

/// Sliding-window rate limiter keyed by credential id.
///
/// A window never holds more than `limit` timestamps, so memory per key is
/// bounded by the configured limit.
pub struct RateLimiter {
    windows: DashMap<String, VecDeque<u64>>,
    window_ms: u64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_window(WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            window_ms: window.as_millis() as u64,
        }
    }

    /// Check and, if allowed, record a request for `key` at the current time.
    pub fn check(&self, key: &str, limit: u32) -> RateDecision {
        self.check_at(key, limit, now_millis())
    }

    /// Check against an explicit clock reading (unix milliseconds).
    pub fn check_at(&self, key: &str, limit: u32, now: u64) -> RateDecision {
        let mut window = self.windows.entry(key.to_owned()).or_default();
        prune(&mut window, now, self.window_ms);

        if window.len() >= limit as usize {
            let reset_ms = match window.front() {
                Some(oldest) => self.window_ms - now.saturating_sub(*oldest),
                None => self.window_ms,
            };
            debug!(key, limit, reset_ms, "rate limit exceeded");
            return RateDecision {
                allowed: false,
                remaining: 0,
                reset_ms,
            };
        }

        window.push_back(now);
        RateDecision {
            allowed: true,
            remaining: limit - window.len() as u32,
            reset_ms: 0,
        }
    }

    /// Drop expired timestamps everywhere and forget empty windows.
    ///
    /// Returns the number of windows removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(now_millis())
    }

    pub fn sweep_at(&self, now: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            prune(window, now, self.window_ms);
            !window.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of credentials currently tracked.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

/// Remove timestamps at least `window_ms` old.
fn prune(window: &mut VecDeque<u64>, now: u64, window_ms: u64) {
    while let Some(&oldest) = window.front() {
        if now.saturating_sub(oldest) >= window_ms {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
