//! Result Cache
//!
//! Content-addressed cache from image fingerprint to canonical result id.
//! Human-verified entries are never replaced by automated writes; only
//! [`VerificationEngine`] may repoint them.

pub mod verification;

pub use verification::{VerificationEngine, VerificationReport};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::errors::StorageResult;
use crate::shared::{DetectionRecord, StoredResult};
use crate::storage::{cache_entries, results, CacheEntry, Database, RecordOutcome};
use crate::vision::ImageFingerprint;

/// A cache hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedResult {
    pub result_id: i64,
    pub has_match: bool,
}

/// Fingerprint cache plus per-task hit ledger
#[derive(Clone)]
pub struct ResultCache {
    db: Arc<Database>,
}

impl ResultCache {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Batched existence check.
    ///
    /// Every hit is also recorded in `task_id`'s ledger so the task can
    /// later reconstruct its full result set.
    pub fn lookup(
        &self,
        task_id: &str,
        fingerprints: &HashSet<ImageFingerprint>,
    ) -> StorageResult<HashMap<ImageFingerprint, CachedResult>> {
        self.db.transaction(|tx| {
            let mut hits = HashMap::new();
            for fingerprint in fingerprints {
                if let Some((result_id, has_match)) = cache_entries::lookup(tx, fingerprint)? {
                    cache_entries::add_ledger(tx, task_id, result_id)?;
                    hits.insert(
                        fingerprint.clone(),
                        CachedResult {
                            result_id,
                            has_match,
                        },
                    );
                }
            }
            debug!("Cache lookup: {}/{} fingerprints hit", hits.len(), fingerprints.len());
            Ok(hits)
        })
    }

    /// Point the cache at a freshly computed result, unless the entry is verified
    pub fn record(&self, fingerprint: &ImageFingerprint, result_id: i64) -> StorageResult<RecordOutcome> {
        let outcome = self
            .db
            .with_conn(|conn| cache_entries::record_automated(conn, fingerprint, result_id))?;
        log_protected(fingerprint, result_id, outcome);
        Ok(outcome)
    }

    /// Insert fresh results for a task and record each in the cache, atomically
    pub fn persist_fresh(&self, task_id: &str, records: &[DetectionRecord]) -> StorageResult<Vec<i64>> {
        self.db.transaction(|tx| {
            let mut ids = Vec::with_capacity(records.len());
            for record in records {
                let id = results::insert_result(tx, Some(task_id), record)?;
                let outcome = cache_entries::record_automated(tx, &record.fingerprint, id)?;
                log_protected(&record.fingerprint, id, outcome);
                ids.push(id);
            }
            Ok(ids)
        })
    }

    /// Current entry for a fingerprint
    pub fn entry(&self, fingerprint: &ImageFingerprint) -> StorageResult<Option<CacheEntry>> {
        self.db.get_cache_entry(fingerprint)
    }

    /// A task's fresh results together with the results it was served from cache
    pub fn task_results(&self, task_id: &str) -> StorageResult<Vec<StoredResult>> {
        self.db.with_conn(|conn| {
            let mut by_id = BTreeMap::new();
            for result in results::results_for_task(conn, task_id)?
                .into_iter()
                .chain(results::ledger_results(conn, task_id)?)
            {
                by_id.entry(result.id).or_insert(result);
            }
            Ok(by_id.into_values().collect())
        })
    }
}

fn log_protected(fingerprint: &ImageFingerprint, result_id: i64, outcome: RecordOutcome) {
    if outcome == RecordOutcome::Protected {
        debug!(
            "Cache entry {} is human-verified, ignoring automated result {}",
            fingerprint, result_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn record(name: &str, fingerprint: &ImageFingerprint, texts: &[&str]) -> DetectionRecord {
        DetectionRecord {
            image_path: PathBuf::from(name),
            fingerprint: fingerprint.clone(),
            texts: texts.iter().map(|t| t.to_string()).collect(),
            confidences: vec![0.9; texts.len()],
            languages: BTreeMap::from([("ch".to_string(), !texts.is_empty())]),
            has_match: !texts.is_empty(),
            round_hit: if texts.is_empty() { None } else { Some(1) },
            hit_reason: None,
            processing_time: Duration::from_millis(3),
        }
    }

    fn setup() -> (Arc<Database>, ResultCache) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cache = ResultCache::new(db.clone());
        (db, cache)
    }

    #[test]
    fn test_persist_then_lookup() {
        let (db, cache) = setup();
        let first = db.create_task("first").unwrap();
        let second = db.create_task("second").unwrap();

        let hit_fp = ImageFingerprint::from_bytes(b"menu");
        let miss_fp = ImageFingerprint::from_bytes(b"unseen");
        let ids = cache
            .persist_fresh(&first.id, &[record("menu.png", &hit_fp, &["菜单"])])
            .unwrap();

        let wanted = HashSet::from([hit_fp.clone(), miss_fp.clone()]);
        let hits = cache.lookup(&second.id, &wanted).unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(
            hits.get(&hit_fp),
            Some(&CachedResult {
                result_id: ids[0],
                has_match: true
            })
        );
        assert!(!hits.contains_key(&miss_fp));
        assert_eq!(db.ledger_result_ids(&second.id).unwrap(), ids);
    }

    #[test]
    fn test_unverified_entry_follows_newest_result() {
        let (db, cache) = setup();
        let task = db.create_task("t").unwrap();
        let fp = ImageFingerprint::from_bytes(b"shot");

        let old = cache.persist_fresh(&task.id, &[record("a.png", &fp, &[])]).unwrap();
        let new = cache.persist_fresh(&task.id, &[record("b.png", &fp, &["开始"])]).unwrap();

        let entry = cache.entry(&fp).unwrap().unwrap();
        assert_ne!(old[0], new[0]);
        assert_eq!(entry.canonical_result_id, new[0]);
        assert!(!entry.verified);
    }

    #[test]
    fn test_record_outcomes() {
        let (db, cache) = setup();
        let task = db.create_task("t").unwrap();
        let fp = ImageFingerprint::from_bytes(b"shot");
        let ids = cache
            .persist_fresh(&task.id, &[record("a.png", &fp, &["开始"]), record("b.png", &fp, &[])])
            .unwrap();

        assert_eq!(cache.record(&fp, ids[0]).unwrap(), RecordOutcome::Updated);
        let fresh_fp = ImageFingerprint::from_bytes(b"other");
        assert_eq!(cache.record(&fresh_fp, ids[1]).unwrap(), RecordOutcome::Created);
    }

    #[test]
    fn test_task_results_union_without_duplicates() {
        let (db, cache) = setup();
        let first = db.create_task("first").unwrap();
        let second = db.create_task("second").unwrap();

        let shared = ImageFingerprint::from_bytes(b"shared");
        let own = ImageFingerprint::from_bytes(b"own");
        cache
            .persist_fresh(&first.id, &[record("shared.png", &shared, &["开始"])])
            .unwrap();

        // Looking up twice must not duplicate ledger rows
        let wanted = HashSet::from([shared.clone()]);
        cache.lookup(&second.id, &wanted).unwrap();
        cache.lookup(&second.id, &wanted).unwrap();
        cache
            .persist_fresh(&second.id, &[record("own.png", &own, &[])])
            .unwrap();

        let results = cache.task_results(&second.id).unwrap();
        assert_eq!(results.len(), 2);
        let fingerprints: HashSet<_> = results.iter().map(|r| r.fingerprint.clone()).collect();
        assert_eq!(fingerprints, HashSet::from([shared, own]));
    }
}
