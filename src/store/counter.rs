//! SQLite-backed persistent counter store.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info, trace};

use super::migration::{LegacyMigrator, MigrationReport};
use super::rank::{LeaderboardEntry, Rank};
use crate::config::StorageConfig;
use crate::error::{ClickrankError, Result};

const SCHEMA: &str =
    "CREATE TABLE IF NOT EXISTS counters (name TEXT PRIMARY KEY, count INTEGER NOT NULL DEFAULT 0);";

const INCREMENT_SQL: &str = "INSERT INTO counters (name, count) VALUES (?1, 1)
     ON CONFLICT(name) DO UPDATE SET count = count + 1
     RETURNING count";

/// Entries with equal counts are ordered by insertion (rowid).
const RANK_SQL: &str = "SELECT 1 + (SELECT COUNT(*) FROM counters o
                       WHERE o.count > c.count OR (o.count = c.count AND o.rowid < c.rowid))
     FROM counters c WHERE c.name = ?1";

const TOP_N_SQL: &str = "SELECT name, count FROM counters ORDER BY count DESC, rowid ASC LIMIT ?1";

/// Durable, concurrency-safe named counters.
///
/// All access goes through a single connection behind a mutex. Writes land
/// in a transaction that stays open until [`flush`](Self::flush) commits
/// it, so increments between two flushes are only as durable as the
/// process. Reads share the connection and therefore see every increment
/// made so far, committed or not.
pub struct PersistentKeyCounter {
    conn: Mutex<Connection>,
    /// Increments inside the open write transaction; only changed under `conn`
    pending: AtomicU64,
    /// Database location, `None` when in memory
    path: Option<PathBuf>,
    /// Result of the startup import of the legacy file
    migration: MigrationReport,
}

impl std::fmt::Debug for PersistentKeyCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentKeyCounter")
            .field("path", &self.path)
            .field("migration", &self.migration)
            .finish()
    }
}

impl PersistentKeyCounter {
    /// Open (or create) the counter database and import the legacy file.
    ///
    /// The migration completes before this returns, so no other operation
    /// can observe a partially imported table.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        info!(
            db_path = %config.db_path.display(),
            journal_mode = config.journal_mode.pragma_value(),
            "Opening counter store"
        );

        let mut conn = Connection::open(&config.db_path)?;
        apply_pragmas(&conn, config)?;
        conn.execute_batch(SCHEMA)?;

        let migration = LegacyMigrator::new(&config.legacy_path).run(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            pending: AtomicU64::new(0),
            path: Some(config.db_path.clone()),
            migration,
        })
    }

    /// Create a store that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            pending: AtomicU64::new(0),
            path: None,
            migration: MigrationReport::default(),
        })
    }

    /// Add one to `name`'s counter, creating it at 1, and return the new count.
    ///
    /// The update is a single upsert statement, so concurrent increments of
    /// the same name never lose an update.
    pub fn increment(&self, name: &str) -> Result<u64> {
        let conn = self.conn.lock();
        if let Some(lost) = self.take_rolled_back(&conn) {
            error!(lost, "Pending increments were rolled back by the storage engine");
        }
        begin_if_idle(&conn)?;

        let count: i64 = conn
            .prepare_cached(INCREMENT_SQL)?
            .query_row(params![name], |row| row.get(0))?;
        self.pending.fetch_add(1, Ordering::Relaxed);

        trace!(name = %name, count, "Incremented counter");
        Ok(to_count(count))
    }

    /// Get the rank of `name` among all counters, highest count first.
    pub fn rank(&self, name: &str) -> Result<Rank> {
        let conn = self.conn.lock();
        let position: Option<i64> = conn
            .prepare_cached(RANK_SQL)?
            .query_row(params![name], |row| row.get(0))
            .optional()?;

        Ok(match position {
            Some(p) => Rank::from_position(to_count(p)),
            None => Rank::NotFound,
        })
    }

    /// Get the `n` highest counters with their 1-based ranks.
    pub fn top_n(&self, n: usize) -> Result<Vec<LeaderboardEntry>> {
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(TOP_N_SQL)?;

        let rows = stmt.query_map(params![limit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut entries = Vec::with_capacity(n.min(64));
        for (idx, row) in rows.enumerate() {
            let (name, count) = row?;
            entries.push(LeaderboardEntry {
                name,
                count: to_count(count),
                rank: idx as u32 + 1,
            });
        }
        Ok(entries)
    }

    /// Sum of all counters; 0 when there are none.
    pub fn total_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let total: i64 = conn
            .prepare_cached("SELECT COALESCE(SUM(count), 0) FROM counters")?
            .query_row([], |row| row.get(0))?;
        Ok(to_count(total))
    }

    /// Get a single counter.
    ///
    /// Returns `None` if the name has never been incremented.
    pub fn count(&self, name: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let count: Option<i64> = conn
            .prepare_cached("SELECT count FROM counters WHERE name = ?1")?
            .query_row(params![name], |row| row.get(0))
            .optional()?;
        Ok(count.map(to_count))
    }

    /// Number of distinct names.
    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let len: i64 = conn.query_row("SELECT COUNT(*) FROM counters", [], |row| row.get(0))?;
        Ok(usize::try_from(len).unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Commit pending increments to disk.
    ///
    /// A no-op when nothing is pending. If the commit fails with the
    /// transaction still open (a locked database, say) the writes stay
    /// pending and the next flush tries again. If SQLite rolled the
    /// transaction back instead, the lost increments are reported as
    /// [`ClickrankError::RolledBack`].
    pub fn flush(&self) -> Result<()> {
        let conn = self.conn.lock();
        if let Some(lost) = self.take_rolled_back(&conn) {
            error!(lost, "Pending increments were rolled back before they could be flushed");
            return Err(ClickrankError::RolledBack(lost));
        }
        if conn.is_autocommit() {
            return Ok(());
        }

        match conn.execute_batch("COMMIT") {
            Ok(()) => {
                let flushed = self.pending.swap(0, Ordering::Relaxed);
                debug!(flushed, "Flushed counter store");
                Ok(())
            }
            Err(e) => match self.take_rolled_back(&conn) {
                Some(lost) => {
                    error!(lost, error = %e, "Commit failed and rolled back pending increments");
                    Err(ClickrankError::RolledBack(lost))
                }
                None => Err(e.into()),
            },
        }
    }

    /// Claim the increments of a write transaction that no longer exists.
    ///
    /// SQLite ends a transaction on its own after errors such as a full disk
    /// or an I/O failure; the connection is then back in autocommit mode
    /// while increments are still counted as pending.
    fn take_rolled_back(&self, conn: &Connection) -> Option<u64> {
        if !conn.is_autocommit() {
            return None;
        }
        let lost = self.pending.swap(0, Ordering::Relaxed);
        (lost > 0).then_some(lost)
    }

    /// Whether increments are waiting for a flush.
    pub fn has_pending(&self) -> bool {
        !self.conn.lock().is_autocommit()
    }

    /// What the startup migration imported.
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }
}

impl Drop for PersistentKeyCounter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!(error = %e, "Failed to flush counter store on close");
        }
    }
}

/// Applies the SQLite pragmas required for durability.
fn apply_pragmas(conn: &Connection, config: &StorageConfig) -> Result<()> {
    let mode: String = conn.pragma_update_and_check(
        None,
        "journal_mode",
        config.journal_mode.pragma_value(),
        |row| row.get(0),
    )?;
    debug!(journal_mode = %mode, "Applied journal mode");

    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(config.busy_timeout())?;
    Ok(())
}

/// Open the write transaction that the next flush will commit.
fn begin_if_idle(conn: &Connection) -> Result<()> {
    if conn.is_autocommit() {
        conn.execute_batch("BEGIN")?;
    }
    Ok(())
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalMode;
    use std::fs;
    use std::sync::Arc;
    use std::thread;

    fn temp_config(tag: &str) -> StorageConfig {
        let dir = std::env::temp_dir();
        let id = uuid::Uuid::new_v4();
        StorageConfig {
            db_path: dir.join(format!("clickrank-{}-{}.db", tag, id)),
            legacy_path: dir.join(format!("clickrank-{}-{}.txt", tag, id)),
            journal_mode: JournalMode::Delete,
            ..StorageConfig::default()
        }
    }

    fn cleanup(config: &StorageConfig) {
        let _ = fs::remove_file(&config.db_path);
        let _ = fs::remove_file(&config.legacy_path);
    }

    #[test]
    fn test_increment_creates_then_adds_one() {
        let store = PersistentKeyCounter::open_in_memory().unwrap();

        assert_eq!(store.increment("alice").unwrap(), 1);
        assert_eq!(store.increment("alice").unwrap(), 2);
        assert_eq!(store.count("alice").unwrap(), Some(2));
        assert_eq!(store.count("bob").unwrap(), None);
    }

    #[test]
    fn test_alice_and_bob_scenario() {
        let store = PersistentKeyCounter::open_in_memory().unwrap();
        for _ in 0..3 {
            store.increment("alice").unwrap();
        }
        store.increment("bob").unwrap();

        assert_eq!(store.rank("alice").unwrap(), Rank::Position(1));
        assert_eq!(store.rank("bob").unwrap(), Rank::Position(2));
        assert_eq!(store.total_count().unwrap(), 4);
        assert_eq!(
            store.top_n(10).unwrap(),
            vec![
                LeaderboardEntry { name: "alice".to_string(), count: 3, rank: 1 },
                LeaderboardEntry { name: "bob".to_string(), count: 1, rank: 2 },
            ]
        );
    }

    #[test]
    fn test_rank_of_unknown_name() {
        let store = PersistentKeyCounter::open_in_memory().unwrap();
        assert_eq!(store.rank("ghost").unwrap(), Rank::NotFound);

        store.increment("alice").unwrap();
        assert_eq!(store.rank("ghost").unwrap(), Rank::NotFound);
    }

    #[test]
    fn test_rank_beyond_ten_is_capped() {
        let store = PersistentKeyCounter::open_in_memory().unwrap();
        // user_00 gets 12 clicks, user_11 gets 1
        for i in 0..12 {
            let name = format!("user_{:02}", i);
            for _ in 0..(12 - i) {
                store.increment(&name).unwrap();
            }
        }

        assert_eq!(store.rank("user_00").unwrap(), Rank::Position(1));
        assert_eq!(store.rank("user_09").unwrap(), Rank::Position(10));
        assert_eq!(store.rank("user_10").unwrap(), Rank::TenPlus);
        assert_eq!(store.rank("user_11").unwrap(), Rank::TenPlus);
    }

    #[test]
    fn test_strict_leader_ranks_first() {
        let store = PersistentKeyCounter::open_in_memory().unwrap();
        for i in 0..20 {
            store.increment(&format!("user_{}", i)).unwrap();
        }
        store.increment("late").unwrap();
        store.increment("late").unwrap();

        assert_eq!(store.rank("late").unwrap(), Rank::Position(1));
    }

    #[test]
    fn test_ties_follow_insertion_order() {
        let store = PersistentKeyCounter::open_in_memory().unwrap();
        store.increment("zed").unwrap();
        store.increment("amy").unwrap();

        assert_eq!(store.rank("zed").unwrap(), Rank::Position(1));
        assert_eq!(store.rank("amy").unwrap(), Rank::Position(2));

        let top = store.top_n(10).unwrap();
        assert_eq!(top[0].name, "zed");
        assert_eq!(top[1].name, "amy");
    }

    #[test]
    fn test_top_n_limits_and_ranks() {
        let store = PersistentKeyCounter::open_in_memory().unwrap();
        for (name, clicks) in [("a", 1), ("b", 4), ("c", 2), ("d", 3)] {
            for _ in 0..clicks {
                store.increment(name).unwrap();
            }
        }

        let top = store.top_n(2).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!((top[0].name.as_str(), top[0].count, top[0].rank), ("b", 4, 1));
        assert_eq!((top[1].name.as_str(), top[1].count, top[1].rank), ("d", 3, 2));
        assert!(store.top_n(0).unwrap().is_empty());
    }

    #[test]
    fn test_total_count_tracks_increments() {
        let store = PersistentKeyCounter::open_in_memory().unwrap();
        assert_eq!(store.total_count().unwrap(), 0);
        assert!(store.is_empty().unwrap());

        let mut expected = 0;
        for name in ["x", "y", "x", "z", "x"] {
            store.increment(name).unwrap();
            expected += 1;
            assert_eq!(store.total_count().unwrap(), expected);
        }
        assert_eq!(store.len().unwrap(), 3);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(PersistentKeyCounter::open_in_memory().unwrap());
        store.increment("shared").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..125 {
                        store.increment("shared").unwrap();
                        store.increment(&format!("own_{}", t)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.count("shared").unwrap(), Some(1001));
        assert_eq!(store.count("own_3").unwrap(), Some(125));
        assert_eq!(store.total_count().unwrap(), 2001);
    }

    #[test]
    fn test_flush_is_idempotent() {
        let store = PersistentKeyCounter::open_in_memory().unwrap();
        store.flush().unwrap();
        assert!(!store.has_pending());

        store.increment("alice").unwrap();
        assert!(store.has_pending());

        store.flush().unwrap();
        store.flush().unwrap();
        assert!(!store.has_pending());
        assert_eq!(store.count("alice").unwrap(), Some(1));
    }

    #[test]
    fn test_flushed_counts_survive_reopen() {
        let config = temp_config("reopen");
        {
            let store = PersistentKeyCounter::open(&config).unwrap();
            store.increment("alice").unwrap();
            store.increment("alice").unwrap();
            store.flush().unwrap();
        }

        let store = PersistentKeyCounter::open(&config).unwrap();
        assert_eq!(store.count("alice").unwrap(), Some(2));
        assert_eq!(store.increment("alice").unwrap(), 3);
        drop(store);
        cleanup(&config);
    }

    #[test]
    fn test_open_runs_legacy_migration() {
        let config = temp_config("legacy");
        fs::write(&config.legacy_path, "carol:5\ndave:2\n").unwrap();

        let store = PersistentKeyCounter::open(&config).unwrap();

        assert_eq!(store.migration_report().imported, 2);
        assert!(!config.legacy_path.exists());
        assert_eq!(store.rank("carol").unwrap(), Rank::Position(1));
        assert_eq!(store.increment("carol").unwrap(), 6);
        drop(store);
        cleanup(&config);
    }

    #[test]
    fn test_reopen_without_legacy_file_keeps_counts() {
        let config = temp_config("idempotent");
        fs::write(&config.legacy_path, "carol:5\n").unwrap();
        drop(PersistentKeyCounter::open(&config).unwrap());

        let store = PersistentKeyCounter::open(&config).unwrap();
        assert_eq!(*store.migration_report(), MigrationReport::default());
        assert_eq!(store.count("carol").unwrap(), Some(5));
        drop(store);
        cleanup(&config);
    }

    #[test]
    fn test_engine_rollback_is_reported_not_swallowed() {
        let store = PersistentKeyCounter::open_in_memory().unwrap();
        store.increment("alice").unwrap();
        store.increment("alice").unwrap();

        // SQLite ends the transaction itself after a full disk or I/O error.
        store.conn.lock().execute_batch("ROLLBACK").unwrap();

        let result = store.flush();
        assert!(matches!(result, Err(ClickrankError::RolledBack(2))), "got {:?}", result);
        assert_eq!(store.count("alice").unwrap(), None);

        // The loss is reported once; later flushes are clean again.
        store.flush().unwrap();
        assert_eq!(store.increment("alice").unwrap(), 1);
        store.flush().unwrap();
    }

    #[test]
    fn test_increment_after_engine_rollback_starts_fresh() {
        let store = PersistentKeyCounter::open_in_memory().unwrap();
        store.increment("bob").unwrap();
        store.conn.lock().execute_batch("ROLLBACK").unwrap();

        assert_eq!(store.increment("bob").unwrap(), 1);
        store.flush().unwrap();
        assert!(!store.has_pending());
    }

    #[test]
    fn test_locked_flush_keeps_writes_and_retries() {
        let mut config = temp_config("locked");
        config.busy_timeout_ms = 50;

        let store = PersistentKeyCounter::open(&config).unwrap();
        store.increment("alice").unwrap();
        store.increment("alice").unwrap();

        let reader = Connection::open(&config.db_path).unwrap();
        reader.execute_batch("BEGIN").unwrap();
        let _: i64 = reader
            .query_row("SELECT COUNT(*) FROM counters", [], |row| row.get(0))
            .unwrap();

        let result = store.flush();
        assert!(matches!(result, Err(ClickrankError::Storage(_))), "got {:?}", result);
        assert!(store.has_pending());
        assert_eq!(store.count("alice").unwrap(), Some(2));

        reader.execute_batch("COMMIT").unwrap();
        drop(reader);
        store.flush().unwrap();
        assert!(!store.has_pending());
        drop(store);

        let store = PersistentKeyCounter::open(&config).unwrap();
        assert_eq!(store.count("alice").unwrap(), Some(2));
        drop(store);
        cleanup(&config);
    }

    #[test]
    fn test_flush_racing_increments_persists_every_one() {
        use std::sync::atomic::AtomicBool;

        let config = temp_config("race");
        let store = Arc::new(PersistentKeyCounter::open(&config).unwrap());
        let done = Arc::new(AtomicBool::new(false));

        let flusher = {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    store.flush().unwrap();
                    thread::yield_now();
                }
            })
        };

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..250 {
                        store.increment("shared").unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Relaxed);
        flusher.join().unwrap();

        store.flush().unwrap();
        drop(store);

        let store = PersistentKeyCounter::open(&config).unwrap();
        assert_eq!(store.count("shared").unwrap(), Some(1000));
        drop(store);
        cleanup(&config);
    }
}
