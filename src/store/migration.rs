//! One-time import of the legacy `name:count` counter file.
//!
//! Older deployments kept counters in a flat text file, one `name:count`
//! pair per line. On startup the file is imported into the counter table
//! and then removed, so the import never runs twice for the same data.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Imported rows overwrite existing ones, so the last line for a name wins.
const IMPORT_SQL: &str = "INSERT INTO counters (name, count) VALUES (?1, ?2)
     ON CONFLICT(name) DO UPDATE SET count = excluded.count";

/// Why a legacy line was skipped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineError {
    #[error("line is not valid UTF-8")]
    Encoding,
    #[error("missing ':' separator")]
    MissingSeparator,
    #[error("more than one ':' on the line; names cannot contain ':'")]
    ExtraSeparator,
    #[error("empty name")]
    EmptyName,
    #[error("name contains whitespace")]
    WhitespaceInName,
    #[error("invalid count {0:?}")]
    InvalidCount(String),
}

/// Outcome of a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Lines written to the counter table
    pub imported: usize,
    /// Malformed lines that were logged and skipped
    pub skipped: usize,
    /// Whether the legacy file was deleted afterwards
    pub source_removed: bool,
}

/// Imports a legacy counter file into the counter table.
#[derive(Clone)]
pub struct LegacyMigrator {
    path: PathBuf,
    /// Deletes the legacy file once its rows are committed
    remove_source: fn(&Path) -> io::Result<()>,
}

impl std::fmt::Debug for LegacyMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyMigrator").field("path", &self.path).finish()
    }
}

impl LegacyMigrator {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            remove_source: |path| fs::remove_file(path),
        }
    }

    /// Import the legacy file, if present, and delete it.
    ///
    /// Malformed lines are skipped and the rest of the file is still
    /// imported. The import is committed before the file is removed; a
    /// failed removal is logged but does not fail the migration.
    pub fn run(&self, conn: &mut Connection) -> Result<MigrationReport> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No legacy counter file, skipping migration");
            return Ok(MigrationReport::default());
        }

        info!(path = %self.path.display(), "Migrating legacy counter file");
        let contents = fs::read(&self.path)?;
        let mut report = MigrationReport::default();

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(IMPORT_SQL)?;
            for (idx, raw) in contents.split(|b| *b == b'\n').enumerate() {
                match parse_line(raw) {
                    Ok(Some((name, count))) => {
                        stmt.execute(params![name, count])?;
                        report.imported += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            path = %self.path.display(),
                            line = idx + 1,
                            error = %e,
                            "Skipping malformed legacy counter line"
                        );
                        report.skipped += 1;
                    }
                }
            }
        }
        tx.commit()?;

        match (self.remove_source)(&self.path) {
            Ok(()) => report.source_removed = true,
            Err(e) => error!(
                path = %self.path.display(),
                error = %e,
                "Legacy counters imported but the file could not be removed; delete it manually"
            ),
        }

        info!(
            imported = report.imported,
            skipped = report.skipped,
            "Legacy migration complete"
        );
        Ok(report)
    }
}

/// Parse one `name:count` line. Blank lines yield `Ok(None)`.
///
/// Names are taken verbatim and may not contain whitespace; the count may
/// be padded.
pub fn parse_line(raw: &[u8]) -> std::result::Result<Option<(String, i64)>, LineError> {
    let line = std::str::from_utf8(raw).map_err(|_| LineError::Encoding)?;
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() {
        return Ok(None);
    }

    let mut parts = line.split(':');
    let name = parts.next().unwrap_or_default();
    let count = parts.next().ok_or(LineError::MissingSeparator)?.trim();
    if parts.next().is_some() {
        return Err(LineError::ExtraSeparator);
    }
    if name.is_empty() {
        return Err(LineError::EmptyName);
    }
    if name.chars().any(char::is_whitespace) {
        return Err(LineError::WhitespaceInName);
    }

    let count = count
        .parse::<u64>()
        .ok()
        .and_then(|c| i64::try_from(c).ok())
        .ok_or_else(|| LineError::InvalidCount(count.to_string()))?;

    Ok(Some((name.to_string(), count)))
}
