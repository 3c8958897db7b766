//! Fixed-window request counter.

use std::time::{Duration, Instant};

/// Requests seen from one source key in the current window.
///
/// A window is not synchronized on its own; the limiter mutates it while
/// holding the map entry for its key.
#[derive(Debug, Clone)]
pub struct RateWindow {
    /// Requests counted since `window_start`, denied ones included
    request_count: u64,
    /// When the current window began
    window_start: Instant,
}

impl RateWindow {
    /// Create an empty window starting at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            request_count: 0,
            window_start: now,
        }
    }

    /// Record one request at `now` and report whether it fits under `limit`.
    ///
    /// Once more than `window` has passed since the window began, the window
    /// restarts at `now` with this request as its first.
    pub fn hit(&mut self, now: Instant, window: Duration, limit: u64) -> bool {
        if self.is_expired(now, window) {
            self.request_count = 1;
            self.window_start = now;
            return true;
        }

        self.request_count = self.request_count.saturating_add(1);
        self.request_count <= limit
    }

    /// Whether the window has run its course at `now`.
    pub fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) > window
    }

    /// Get the current count.
    pub fn request_count(&self) -> u64 {
        self.request_count
    }
}
