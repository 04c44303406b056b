//! SQLite database for persistent storage

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::StorageResult;

/// Database connection wrapper.
///
/// One connection guarded by a mutex; bulk writes go through
/// [`Database::transaction`] so they become visible all at once.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!("Opened database {:?} (journal_mode={})", path, mode);

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        info!("Database ready at {:?}", path);
        Ok(db)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StorageResult<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    pub fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                total INTEGER NOT NULL DEFAULT 0,
                executed INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL DEFAULT 0,
                fail INTEGER NOT NULL DEFAULT 0,
                exception INTEGER NOT NULL DEFAULT 0,
                cache_hit INTEGER NOT NULL DEFAULT 0,
                matched INTEGER NOT NULL DEFAULT 0,
                match_rate REAL NOT NULL DEFAULT 0,
                verified_count INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                created_at INTEGER NOT NULL,
                finished_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS detection_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT REFERENCES tasks(id),
                image_path TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                texts TEXT NOT NULL,
                confidences TEXT NOT NULL,
                languages TEXT NOT NULL,
                has_match INTEGER NOT NULL,
                round_hit INTEGER,
                hit_reason TEXT,
                processing_time_ms INTEGER NOT NULL DEFAULT 0,
                verified INTEGER NOT NULL DEFAULT 0,
                verify_outcome TEXT,
                corrected_origin_id INTEGER UNIQUE REFERENCES detection_results(id),
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_results_task ON detection_results(task_id);
            CREATE INDEX IF NOT EXISTS idx_results_fingerprint ON detection_results(fingerprint);

            CREATE TABLE IF NOT EXISTS cache_entries (
                fingerprint TEXT PRIMARY KEY,
                canonical_result_id INTEGER NOT NULL REFERENCES detection_results(id),
                verified INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cache_hit_ledger (
                task_id TEXT NOT NULL REFERENCES tasks(id),
                result_id INTEGER NOT NULL REFERENCES detection_results(id),
                PRIMARY KEY (task_id, result_id)
            );
            "#,
        )?;
        Ok(())
    }

    /// Run `f` against the connection
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside a transaction, committing only if it succeeds
    pub(crate) fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StorageError;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("langscan.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());

        let tables: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
                     AND name IN ('tasks', 'detection_results', 'cache_entries', 'cache_hit_ledger')",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn test_schema_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.init_schema().unwrap();
        db.init_schema().unwrap();
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let db = Database::open_in_memory().unwrap();

        let result: StorageResult<()> = db.transaction(|tx| {
            tx.execute(
                "INSERT INTO tasks (id, name, status, created_at) VALUES ('t1', 'x', 'pending', 0)",
                [],
            )?;
            Err(StorageError::TaskNotFound("forced".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }
}
