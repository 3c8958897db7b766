//! Rate limiting logic and state management.

mod limiter;
mod window;

pub use limiter::{RateDecision, RateLimiter, DEFAULT_LIMIT, DEFAULT_WINDOW};
pub use window::RateWindow;
