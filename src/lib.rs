//! Clickrank - persistent click counters with rankings
//!
//! This crate keeps a durable per-name counter in SQLite, answers rank and
//! leaderboard queries over it, and throttles callers with a per-source
//! fixed-window rate limiter. Counters are flushed to disk by a background
//! task; a legacy flat-file format is imported once on startup.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod service;
pub mod store;
