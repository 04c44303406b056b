//! Shared progress counters
//!
//! Counters live in a hash-style key/value store so observers outside the
//! batch (another thread, another process with a shared backend) can read
//! them while the batch runs.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::shared::{match_rate, Progress, ReportKind, TaskStatus};

/// Hash-style key/value store with atomic increments
pub trait ProgressStore: Send + Sync {
    /// Overwrite fields of a hash
    fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    /// Add `delta` to one field, returning the new value
    fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    /// Add several deltas as one atomic update
    fn hash_increment_many(&self, key: &str, deltas: &[(&str, i64)]) -> Result<()>;

    /// All fields of a hash (empty if absent)
    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;
}

/// Process-local progress store
#[derive(Default)]
pub struct InMemoryProgressStore {
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn add(hash: &mut HashMap<String, String>, field: &str, delta: i64) -> i64 {
    let current = hash
        .get(field)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);
    let next = current + delta;
    hash.insert(field.to_string(), next.to_string());
    next
}

impl ProgressStore for InMemoryProgressStore {
    fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut hashes = self.hashes.lock();
        let hash = hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut hashes = self.hashes.lock();
        Ok(add(hashes.entry(key.to_string()).or_default(), field, delta))
    }

    fn hash_increment_many(&self, key: &str, deltas: &[(&str, i64)]) -> Result<()> {
        let mut hashes = self.hashes.lock();
        let hash = hashes.entry(key.to_string()).or_default();
        for (field, delta) in deltas {
            add(hash, field, *delta);
        }
        Ok(())
    }

    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.hashes.lock().get(key).cloned().unwrap_or_default())
    }
}

/// Typed view of one task's counters
#[derive(Clone)]
pub struct ProgressCounters {
    store: Arc<dyn ProgressStore>,
    key: String,
}

impl ProgressCounters {
    pub fn new(store: Arc<dyn ProgressStore>, task_id: &str) -> Self {
        Self {
            store,
            key: progress_key(task_id),
        }
    }

    /// Write a complete snapshot
    pub fn init(&self, progress: &Progress) -> Result<()> {
        self.store.hash_set(
            &self.key,
            &[
                ("total", progress.total.to_string()),
                ("executed", progress.executed.to_string()),
                ("success", progress.success.to_string()),
                ("fail", progress.fail.to_string()),
                ("exception", progress.exception.to_string()),
                ("cache_hit", progress.cache_hit.to_string()),
                ("matched", progress.matched.to_string()),
                ("status", progress.status.as_str().to_string()),
            ],
        )
    }

    /// Book one processed image
    pub fn record(&self, kind: ReportKind) -> Result<()> {
        let deltas: &[(&str, i64)] = match kind {
            ReportKind::Success { matched: true } => &[("executed", 1), ("success", 1), ("matched", 1)],
            ReportKind::Success { matched: false } => &[("executed", 1), ("success", 1)],
            ReportKind::Fail => &[("executed", 1), ("fail", 1)],
            ReportKind::Exception => &[("executed", 1), ("exception", 1)],
        };
        self.store.hash_increment_many(&self.key, deltas)
    }

    /// Move successes whose results were lost over to `exception`
    pub fn rebook_lost(&self, lost: u64, matched: u64) -> Result<()> {
        self.store.hash_increment_many(
            &self.key,
            &[
                ("success", -(lost as i64)),
                ("matched", -(matched as i64)),
                ("exception", lost as i64),
            ],
        )
    }

    pub fn set_status(&self, status: TaskStatus) -> Result<()> {
        self.store
            .hash_set(&self.key, &[("status", status.as_str().to_string())])
    }

    /// Current counters, or `None` if this process never tracked the task
    pub fn snapshot(&self) -> Result<Option<Progress>> {
        let fields = self.store.hash_get_all(&self.key)?;
        if fields.is_empty() {
            return Ok(None);
        }

        let count = |name: &str| -> u64 {
            fields
                .get(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };
        let status = fields
            .get("status")
            .and_then(|s| TaskStatus::parse(s))
            .unwrap_or(TaskStatus::Running);

        let total = count("total");
        let matched = count("matched");
        Ok(Some(Progress {
            total,
            executed: count("executed"),
            success: count("success"),
            fail: count("fail"),
            exception: count("exception"),
            cache_hit: count("cache_hit"),
            matched,
            match_rate: match_rate(matched, total),
            status,
        }))
    }
}

/// Store key holding a task's counters
pub fn progress_key(task_id: &str) -> String {
    format!("progress:{}", task_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn counters() -> ProgressCounters {
        ProgressCounters::new(Arc::new(InMemoryProgressStore::new()), "task-1")
    }

    #[test]
    fn test_snapshot_absent() {
        assert!(counters().snapshot().unwrap().is_none());
    }

    #[test]
    fn test_record_kinds() {
        let counters = counters();
        counters
            .init(&Progress {
                total: 4,
                executed: 0,
                success: 0,
                fail: 0,
                exception: 0,
                cache_hit: 0,
                matched: 0,
                match_rate: 0.0,
                status: TaskStatus::Running,
            })
            .unwrap();

        counters.record(ReportKind::Success { matched: true }).unwrap();
        counters.record(ReportKind::Success { matched: false }).unwrap();
        counters.record(ReportKind::Fail).unwrap();
        counters.record(ReportKind::Exception).unwrap();

        let progress = counters.snapshot().unwrap().unwrap();
        assert_eq!(progress.executed, 4);
        assert_eq!(progress.success, 2);
        assert_eq!(progress.fail, 1);
        assert_eq!(progress.exception, 1);
        assert_eq!(progress.matched, 1);
        assert!((progress.match_rate - 0.25).abs() < 1e-9);
        assert_eq!(progress.status, TaskStatus::Running);

        counters.rebook_lost(1, 1).unwrap();
        let progress = counters.snapshot().unwrap().unwrap();
        assert_eq!(progress.executed, 4);
        assert_eq!(progress.success, 1);
        assert_eq!(progress.exception, 2);
        assert_eq!(progress.matched, 0);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(InMemoryProgressStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        store
                            .hash_increment_many("k", &[("executed", 1), ("success", 1)])
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let fields = store.hash_get_all("k").unwrap();
        assert_eq!(fields["executed"], "4000");
        assert_eq!(fields["success"], "4000");
        assert_eq!(store.hash_increment("k", "executed", -1).unwrap(), 3999);
    }

    #[test]
    fn test_status_update() {
        let counters = counters();
        counters.set_status(TaskStatus::Completed).unwrap();
        let progress = counters.snapshot().unwrap().unwrap();
        assert_eq!(progress.status, TaskStatus::Completed);
        assert_eq!(progress.total, 0);
    }
}
