//! Task rows: creation, status transitions and final statistics

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::Database;
use crate::errors::{StorageError, StorageResult};
use crate::shared::{unix_now, BatchStats, Task, TaskStatus};

const TASK_COLUMNS: &str = "id, name, status, total, executed, success, fail, exception, \
     cache_hit, matched, match_rate, verified_count, error, created_at, finished_at";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(2)?;
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        total: row.get::<_, i64>(3)? as u64,
        executed: row.get::<_, i64>(4)? as u64,
        success: row.get::<_, i64>(5)? as u64,
        fail: row.get::<_, i64>(6)? as u64,
        exception: row.get::<_, i64>(7)? as u64,
        cache_hit: row.get::<_, i64>(8)? as u64,
        matched: row.get::<_, i64>(9)? as u64,
        match_rate: row.get(10)?,
        verified_count: row.get::<_, i64>(11)? as u64,
        error: row.get(12)?,
        created_at: row.get::<_, i64>(13)? as u64,
        finished_at: row.get::<_, Option<i64>>(14)?.map(|t| t as u64),
    })
}

pub(crate) fn get_task(conn: &Connection, id: &str) -> StorageResult<Option<Task>> {
    let sql = format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS);
    Ok(conn.query_row(&sql, params![id], row_to_task).optional()?)
}

pub(crate) fn set_verified_count(conn: &Connection, id: &str, count: u64) -> StorageResult<()> {
    conn.execute(
        "UPDATE tasks SET verified_count = ? WHERE id = ?",
        params![count as i64, id],
    )?;
    Ok(())
}

impl Database {
    /// Create a pending task
    pub fn create_task(&self, name: &str) -> StorageResult<Task> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = unix_now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, name, status, created_at) VALUES (?, ?, ?, ?)",
                params![id, name, TaskStatus::Pending.as_str(), created_at as i64],
            )?;
            get_task(conn, &id)?.ok_or_else(|| StorageError::TaskNotFound(id.clone()))
        })
    }

    /// Get a task by ID
    pub fn get_task(&self, id: &str) -> StorageResult<Option<Task>> {
        self.with_conn(|conn| get_task(conn, id))
    }

    /// All tasks, newest first
    pub fn list_tasks(&self) -> StorageResult<Vec<Task>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM tasks ORDER BY created_at DESC, rowid DESC",
                TASK_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map([], row_to_task)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }

    /// Move a task to `running` and record its image count
    pub fn mark_task_running(&self, id: &str, total: u64) -> StorageResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = ?, total = ? WHERE id = ?",
                params![TaskStatus::Running.as_str(), total as i64, id],
            )?;
            if changed == 0 {
                return Err(StorageError::TaskNotFound(id.to_string()));
            }
            Ok(())
        })
    }

    /// Persist final statistics and status
    pub fn finish_task(&self, stats: &BatchStats) -> StorageResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = ?, total = ?, executed = ?, success = ?, fail = ?, \
                 exception = ?, cache_hit = ?, matched = ?, match_rate = ?, error = ?, finished_at = ? \
                 WHERE id = ?",
                params![
                    stats.status.as_str(),
                    stats.total as i64,
                    stats.executed as i64,
                    stats.success as i64,
                    stats.fail as i64,
                    stats.exception as i64,
                    stats.cache_hit as i64,
                    stats.matched as i64,
                    stats.match_rate,
                    stats.error,
                    unix_now() as i64,
                    stats.task_id,
                ],
            )?;
            if changed == 0 {
                return Err(StorageError::TaskNotFound(stats.task_id.clone()));
            }
            Ok(())
        })
    }
}
