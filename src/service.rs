//! Operations exposed to the request layer.
//!
//! A gateway extracts the client address, asks [`CounterService::check_rate`]
//! whether the request may proceed, and then calls one of the counter
//! operations. The store and limiter are owned by the caller and shared
//! through `Arc`, so several services (or handlers) can use the same state.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::error::{ClickrankError, Result};
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::store::{LeaderboardEntry, PersistentKeyCounter, Rank};

/// Longest accepted counter name.
pub const MAX_NAME_LEN: usize = 20;
/// Leaderboard size when the caller does not ask for one.
pub const DEFAULT_LEADERBOARD_LIMIT: usize = 10;

/// Result of a successful click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClickReport {
    #[serde(rename = "username")]
    pub name: String,
    pub count: u64,
    pub rank: Rank,
}

/// Top counters plus the grand total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Leaderboard {
    #[serde(rename = "top_users")]
    pub top: Vec<LeaderboardEntry>,
    #[serde(rename = "total_clicks")]
    pub total: u64,
}

/// Check that a name is 1 to 20 ASCII letters, digits or underscores.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(ClickrankError::Validation(format!(
            "name must be 1 to {} characters long",
            MAX_NAME_LEN
        )));
    }
    if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(ClickrankError::Validation(
            "name can only contain letters, numbers, and underscores".to_string(),
        ));
    }
    Ok(())
}

/// Counter and rate limiting operations behind one handle.
#[derive(Clone)]
pub struct CounterService {
    counter: Arc<PersistentKeyCounter>,
    limiter: Arc<RateLimiter>,
}

impl CounterService {
    pub fn new(counter: Arc<PersistentKeyCounter>, limiter: Arc<RateLimiter>) -> Self {
        Self { counter, limiter }
    }

    /// Decide whether a request from `source_key` may proceed.
    pub fn check_rate(&self, source_key: &str) -> RateDecision {
        self.limiter.check(source_key)
    }

    /// Count a click for `name` and report its new count and rank.
    #[instrument(skip(self))]
    pub fn increment_and_report(&self, name: &str) -> Result<ClickReport> {
        validate_name(name)?;

        let count = self.counter.increment(name)?;
        let rank = self.counter.rank(name)?;
        debug!(count, %rank, "Recorded click");

        Ok(ClickReport {
            name: name.to_string(),
            count,
            rank,
        })
    }

    /// Get the `limit` highest counters and the total of all counters.
    pub fn leaderboard(&self, limit: usize) -> Result<Leaderboard> {
        Ok(Leaderboard {
            top: self.counter.top_n(limit)?,
            total: self.counter.total_count()?,
        })
    }

    pub fn counter(&self) -> &Arc<PersistentKeyCounter> {
        &self.counter
    }
}
