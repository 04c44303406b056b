//! Content-addressed cache table and the per-task cache-hit ledger

use rusqlite::{params, Connection, OptionalExtension};

use super::Database;
use crate::errors::StorageResult;
use crate::shared::unix_now;
use crate::vision::ImageFingerprint;

/// A fingerprint's canonical result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub fingerprint: ImageFingerprint,
    pub canonical_result_id: i64,
    pub verified: bool,
}

/// What an automated cache write did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Created,
    Updated,
    /// Entry is human-verified and was left untouched
    Protected,
}

/// Canonical result id and its `has_match` for a cached fingerprint
pub(crate) fn lookup(
    conn: &Connection,
    fingerprint: &ImageFingerprint,
) -> StorageResult<Option<(i64, bool)>> {
    Ok(conn
        .query_row(
            "SELECT c.canonical_result_id, r.has_match FROM cache_entries c \
             JOIN detection_results r ON r.id = c.canonical_result_id \
             WHERE c.fingerprint = ?",
            params![fingerprint.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

pub(crate) fn get_entry(
    conn: &Connection,
    fingerprint: &ImageFingerprint,
) -> StorageResult<Option<CacheEntry>> {
    Ok(conn
        .query_row(
            "SELECT canonical_result_id, verified FROM cache_entries WHERE fingerprint = ?",
            params![fingerprint.as_str()],
            |row| {
                Ok(CacheEntry {
                    fingerprint: fingerprint.clone(),
                    canonical_result_id: row.get(0)?,
                    verified: row.get(1)?,
                })
            },
        )
        .optional()?)
}

/// Point an unverified (or missing) entry at `result_id`.
///
/// The conflict clause only fires while `verified = 0`, so concurrent
/// writers can never replace a human-verified answer.
pub(crate) fn record_automated(
    conn: &Connection,
    fingerprint: &ImageFingerprint,
    result_id: i64,
) -> StorageResult<RecordOutcome> {
    let existed = get_entry(conn, fingerprint)?.is_some();
    let changed = conn.execute(
        "INSERT INTO cache_entries (fingerprint, canonical_result_id, verified, updated_at) \
         VALUES (?, ?, 0, ?) \
         ON CONFLICT(fingerprint) DO UPDATE SET \
             canonical_result_id = excluded.canonical_result_id, \
             updated_at = excluded.updated_at \
         WHERE cache_entries.verified = 0",
        params![fingerprint.as_str(), result_id, unix_now() as i64],
    )?;

    Ok(match (changed, existed) {
        (0, _) => RecordOutcome::Protected,
        (_, false) => RecordOutcome::Created,
        (_, true) => RecordOutcome::Updated,
    })
}

/// Point an entry at human-certified truth, regardless of its current state
pub(crate) fn point_verified(
    conn: &Connection,
    fingerprint: &ImageFingerprint,
    result_id: i64,
) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO cache_entries (fingerprint, canonical_result_id, verified, updated_at) \
         VALUES (?, ?, 1, ?) \
         ON CONFLICT(fingerprint) DO UPDATE SET \
             canonical_result_id = excluded.canonical_result_id, \
             verified = 1, \
             updated_at = excluded.updated_at",
        params![fingerprint.as_str(), result_id, unix_now() as i64],
    )?;
    Ok(())
}

/// Remember that `task_id` was served `result_id` from cache
pub(crate) fn add_ledger(conn: &Connection, task_id: &str, result_id: i64) -> StorageResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO cache_hit_ledger (task_id, result_id) VALUES (?, ?)",
        params![task_id, result_id],
    )?;
    Ok(())
}

pub(crate) fn ledger_result_ids(conn: &Connection, task_id: &str) -> StorageResult<Vec<i64>> {
    let mut stmt =
        conn.prepare("SELECT result_id FROM cache_hit_ledger WHERE task_id = ? ORDER BY result_id")?;
    let ids = stmt
        .query_map(params![task_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

impl Database {
    /// Get the cache entry for a fingerprint
    pub fn get_cache_entry(&self, fingerprint: &ImageFingerprint) -> StorageResult<Option<CacheEntry>> {
        self.with_conn(|conn| get_entry(conn, fingerprint))
    }

    /// Result ids served to a task from cache
    pub fn ledger_result_ids(&self, task_id: &str) -> StorageResult<Vec<i64>> {
        self.with_conn(|conn| ledger_result_ids(conn, task_id))
    }
}
