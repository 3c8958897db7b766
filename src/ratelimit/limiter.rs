//! Per-source-key fixed-window rate limiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::window::RateWindow;
use crate::config::RateLimitingConfig;

/// Default number of requests allowed per window.
pub const DEFAULT_LIMIT: u64 = 50;
/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateDecision {
    Allow,
    Deny,
}

impl RateDecision {
    pub fn is_allowed(self) -> bool {
        self == RateDecision::Allow
    }

    /// HTTP status a gateway should answer a denied request with.
    pub const TOO_MANY_REQUESTS: u16 = 429;

    /// Fixed description carried by a denial.
    pub const DENY_DESCRIPTION: &'static str = "Too Many Requests";
}

impl From<bool> for RateDecision {
    fn from(allowed: bool) -> Self {
        if allowed {
            RateDecision::Allow
        } else {
            RateDecision::Deny
        }
    }
}

/// Bounds the request rate of each source key with a fixed window.
///
/// Windows for different keys live in separate map shards, so requests from
/// unrelated clients rarely contend. A burst straddling a window boundary can
/// see up to twice the limit admitted.
pub struct RateLimiter {
    /// Windows indexed by source key
    windows: DashMap<String, RateWindow>,
    /// Requests allowed per window
    limit: u64,
    /// Window length
    window: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            limit,
            window,
        }
    }

    pub fn with_config(config: &RateLimitingConfig) -> Self {
        Self::new(config.limit, config.window())
    }

    /// Record a request from `source_key` and report whether it may proceed.
    pub fn allow(&self, source_key: &str) -> bool {
        self.allow_at(source_key, Instant::now())
    }

    /// Same as [`allow`](Self::allow) with a caller-supplied clock reading.
    pub fn allow_at(&self, source_key: &str, now: Instant) -> bool {
        let allowed = match self.windows.get_mut(source_key) {
            Some(mut window) => window.hit(now, self.window, self.limit),
            None => self
                .windows
                .entry(source_key.to_string())
                .or_insert_with(|| RateWindow::new(now))
                .hit(now, self.window, self.limit),
        };

        if allowed {
            trace!(source = %source_key, "Request allowed");
        } else {
            debug!(source = %source_key, limit = self.limit, "Rate limit exceeded");
        }
        allowed
    }

    pub fn check(&self, source_key: &str) -> RateDecision {
        self.allow(source_key).into()
    }

    /// Get the request count of the current window for a key.
    ///
    /// Returns `None` if the key has never been seen.
    pub fn current_count(&self, source_key: &str) -> Option<u64> {
        self.windows.get(source_key).map(|w| w.request_count())
    }

    /// Drop windows that have run their course at `now`.
    ///
    /// The next request from an evicted key starts a fresh window, exactly as
    /// an expired window would have been reset, so eviction never changes an
    /// `allow` outcome. Returns the number of windows removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.is_expired(now, self.window));
        before.saturating_sub(self.windows.len())
    }

    /// Spawn a task that sweeps expired windows every `interval`.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = limiter.sweep_expired(Instant::now());
                if removed > 0 {
                    debug!(removed, remaining = limiter.window_count(), "Swept expired rate windows");
                }
            }
        })
    }

    /// Get the number of tracked source keys.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT, DEFAULT_WINDOW)
    }
}
