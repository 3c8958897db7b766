//! Rank and leaderboard types.

use serde::{Serialize, Serializer};
use std::fmt;

/// Highest position reported as a number; anything below is `TenPlus`.
pub const MAX_REPORTED_RANK: u64 = 10;

/// Position of a name when all counters are ordered by count descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rank {
    /// 1-based position, at most [`MAX_REPORTED_RANK`]
    Position(u32),
    /// Ranked below the reported positions
    TenPlus,
    /// The name has no counter
    NotFound,
}

impl Rank {
    /// Build a rank from a 1-based position, capping it at "10+".
    pub fn from_position(position: u64) -> Self {
        if position > MAX_REPORTED_RANK {
            Rank::TenPlus
        } else {
            // position <= 10 always fits
            Rank::Position(position as u32)
        }
    }

    /// The numeric position, if one is reported.
    pub fn position(&self) -> Option<u32> {
        match self {
            Rank::Position(p) => Some(*p),
            _ => None,
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rank::Position(p) => write!(f, "{}", p),
            Rank::TenPlus => write!(f, "10+"),
            Rank::NotFound => write!(f, "not found"),
        }
    }
}

/// Serializes as a number, the string `"10+"`, or `-1` for an unknown name.
impl Serialize for Rank {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Rank::Position(p) => serializer.serialize_u32(*p),
            Rank::TenPlus => serializer.serialize_str("10+"),
            Rank::NotFound => serializer.serialize_i64(-1),
        }
    }
}

/// One row of the leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    #[serde(rename = "username")]
    pub name: String,
    #[serde(rename = "clicks")]
    pub count: u64,
    /// 1-based position, uncapped
    pub rank: u32,
}
