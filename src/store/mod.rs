//! Persistent counter storage.

mod counter;
mod migration;
mod rank;
mod sync;

pub use counter::PersistentKeyCounter;
pub use migration::{parse_line, LegacyMigrator, LineError, MigrationReport};
pub use rank::{LeaderboardEntry, Rank, MAX_REPORTED_RANK};
pub use sync::SyncTask;
