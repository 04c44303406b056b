//! Human verification
//!
//! Applies a batch of corrections in one transaction. Readers never see a
//! fingerprint pointing at a half-written shadow.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::{StorageError, StorageResult};
use crate::shared::{Correction, VerifyOutcome};
use crate::storage::{cache_entries, results, tasks, Database};

/// Summary of an applied correction batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Corrections that were applied
    pub applied: usize,
    /// Result ids that no longer exist
    pub skipped: Vec<i64>,
    pub shadows_created: usize,
    pub shadows_updated: usize,
}

/// Applies human corrections and repoints the cache to the best-known truth
pub struct VerificationEngine {
    db: Arc<Database>,
}

impl VerificationEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Apply `corrections` on behalf of `task_id`.
    ///
    /// Unknown result ids are skipped and reported; everything else commits
    /// together or not at all. The verified count of `task_id` and of every
    /// task owning or reusing a corrected result is recomputed.
    pub fn verify(&self, task_id: &str, corrections: &[Correction]) -> StorageResult<VerificationReport> {
        let report = self.db.transaction(|tx| {
            if tasks::get_task(tx, task_id)?.is_none() {
                return Err(StorageError::TaskNotFound(task_id.to_string()));
            }

            let mut report = VerificationReport::default();
            let mut touched = BTreeSet::from([task_id.to_string()]);
            for correction in corrections {
                let Some(result) = results::get_result(tx, correction.result_id)? else {
                    warn!("Skipping correction for missing result {}", correction.result_id);
                    report.skipped.push(correction.result_id);
                    continue;
                };

                match correction.outcome {
                    VerifyOutcome::Correct => {
                        results::mark_verified(tx, result.id, VerifyOutcome::Correct)?;
                        cache_entries::point_verified(tx, &result.fingerprint, result.id)?;
                    }
                    VerifyOutcome::Incorrect => {
                        let texts = correction.corrected_texts.clone().unwrap_or_default();
                        let has_match = texts.iter().any(|t| !t.trim().is_empty());

                        // A shadow corrected again is rewritten in place
                        let existing = if result.corrected_origin_id.is_some() {
                            Some(result.clone())
                        } else {
                            results::mark_verified(tx, result.id, VerifyOutcome::Incorrect)?;
                            match results::find_shadow(tx, result.id)? {
                                Some(id) => results::get_result(tx, id)?,
                                None => None,
                            }
                        };

                        let shadow_id = match existing {
                            Some(shadow) => {
                                results::update_shadow(tx, &shadow, &texts, has_match)?;
                                report.shadows_updated += 1;
                                shadow.id
                            }
                            None => {
                                report.shadows_created += 1;
                                results::insert_shadow(tx, &result, &texts, has_match)?
                            }
                        };
                        cache_entries::point_verified(tx, &result.fingerprint, shadow_id)?;
                    }
                }
                touched.extend(results::tasks_referencing(tx, result.id)?);
                report.applied += 1;
            }

            for owner in &touched {
                let verified = results::count_verified(tx, owner)?;
                tasks::set_verified_count(tx, owner, verified)?;
            }
            Ok(report)
        })?;

        info!(
            "Verification for task {}: {} applied, {} skipped, {} shadows created, {} updated",
            task_id,
            report.applied,
            report.skipped.len(),
            report.shadows_created,
            report.shadows_updated
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResultCache;
    use crate::shared::DetectionRecord;
    use crate::vision::ImageFingerprint;
    use std::collections::{BTreeMap, HashSet};
    use std::path::PathBuf;
    use std::time::Duration;

    struct Fixture {
        db: Arc<Database>,
        cache: ResultCache,
        verifier: VerificationEngine,
        task_id: String,
        result_id: i64,
        fingerprint: ImageFingerprint,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cache = ResultCache::new(db.clone());
        let verifier = VerificationEngine::new(db.clone());
        let task_id = db.create_task("qa").unwrap().id;
        let fingerprint = ImageFingerprint::from_bytes(b"restart-button");

        let record = DetectionRecord {
            image_path: PathBuf::from("restart.png"),
            fingerprint: fingerprint.clone(),
            texts: vec!["重新开姑".to_string()],
            confidences: vec![0.81],
            languages: BTreeMap::from([("ch".to_string(), true)]),
            has_match: true,
            round_hit: Some(3),
            hit_reason: None,
            processing_time: Duration::from_millis(120),
        };
        let result_id = cache.persist_fresh(&task_id, &[record]).unwrap()[0];

        Fixture {
            db,
            cache,
            verifier,
            task_id,
            result_id,
            fingerprint,
        }
    }

    fn incorrect(result_id: i64, texts: &[&str]) -> Correction {
        Correction {
            result_id,
            outcome: VerifyOutcome::Incorrect,
            corrected_texts: Some(texts.iter().map(|t| t.to_string()).collect()),
        }
    }

    fn shadow_count(db: &Database) -> i64 {
        db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM detection_results WHERE task_id IS NULL",
                [],
                |row| row.get(0),
            )?)
        })
        .unwrap()
    }

    #[test]
    fn test_incorrect_creates_shadow_and_repoints_cache() {
        let f = fixture();
        let report = f
            .verifier
            .verify(&f.task_id, &[incorrect(f.result_id, &["重新开始"])])
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.shadows_created, 1);
        assert_eq!(shadow_count(&f.db), 1);

        let entry = f.cache.entry(&f.fingerprint).unwrap().unwrap();
        assert!(entry.verified);
        assert_ne!(entry.canonical_result_id, f.result_id);

        let shadow = f.db.get_result(entry.canonical_result_id).unwrap().unwrap();
        assert!(shadow.has_match);
        assert!(shadow.task_id.is_none());
        assert_eq!(shadow.corrected_origin_id, Some(f.result_id));
        assert_eq!(shadow.texts, vec!["重新开始".to_string()]);

        // A later task is served the corrected texts
        let later = f.db.create_task("later").unwrap();
        let hits = f
            .cache
            .lookup(&later.id, &HashSet::from([f.fingerprint.clone()]))
            .unwrap();
        assert_eq!(hits[&f.fingerprint].result_id, shadow.id);
    }

    #[test]
    fn test_repeated_correction_updates_shadow_in_place() {
        let f = fixture();
        f.verifier
            .verify(&f.task_id, &[incorrect(f.result_id, &["重新开始"])])
            .unwrap();
        let report = f
            .verifier
            .verify(&f.task_id, &[incorrect(f.result_id, &["  "])])
            .unwrap();

        assert_eq!(report.shadows_updated, 1);
        assert_eq!(shadow_count(&f.db), 1);

        let entry = f.cache.entry(&f.fingerprint).unwrap().unwrap();
        let shadow = f.db.get_result(entry.canonical_result_id).unwrap().unwrap();
        assert!(!shadow.has_match);
    }

    #[test]
    fn test_correct_marks_original_verified() {
        let f = fixture();
        let report = f
            .verifier
            .verify(
                &f.task_id,
                &[Correction {
                    result_id: f.result_id,
                    outcome: VerifyOutcome::Correct,
                    corrected_texts: None,
                }],
            )
            .unwrap();
        assert_eq!(report.applied, 1);

        let entry = f.cache.entry(&f.fingerprint).unwrap().unwrap();
        assert_eq!(entry.canonical_result_id, f.result_id);
        assert!(entry.verified);

        let original = f.db.get_result(f.result_id).unwrap().unwrap();
        assert!(original.verified);
        assert_eq!(f.db.get_task(&f.task_id).unwrap().unwrap().verified_count, 1);
    }

    #[test]
    fn test_correction_through_cache_updates_owner() {
        let f = fixture();
        let later = f.db.create_task("later").unwrap();
        f.cache
            .lookup(&later.id, &HashSet::from([f.fingerprint.clone()]))
            .unwrap();

        f.verifier
            .verify(
                &later.id,
                &[Correction {
                    result_id: f.result_id,
                    outcome: VerifyOutcome::Correct,
                    corrected_texts: None,
                }],
            )
            .unwrap();

        assert_eq!(f.db.get_task(&later.id).unwrap().unwrap().verified_count, 1);
        assert_eq!(f.db.get_task(&f.task_id).unwrap().unwrap().verified_count, 1);
    }

    #[test]
    fn test_verified_entry_survives_rerun() {
        let f = fixture();
        f.verifier
            .verify(&f.task_id, &[incorrect(f.result_id, &["重新开始"])])
            .unwrap();
        let before = f.cache.entry(&f.fingerprint).unwrap().unwrap();

        let rerun = DetectionRecord {
            image_path: PathBuf::from("restart.png"),
            fingerprint: f.fingerprint.clone(),
            texts: Vec::new(),
            confidences: Vec::new(),
            languages: BTreeMap::new(),
            has_match: false,
            round_hit: None,
            hit_reason: None,
            processing_time: Duration::ZERO,
        };
        f.cache.persist_fresh(&f.task_id, &[rerun]).unwrap();

        assert_eq!(f.cache.entry(&f.fingerprint).unwrap().unwrap(), before);
    }

    #[test]
    fn test_missing_ids_are_skipped() {
        let f = fixture();
        let report = f
            .verifier
            .verify(
                &f.task_id,
                &[incorrect(9999, &["x"]), incorrect(f.result_id, &["重新开始"])],
            )
            .unwrap();

        assert_eq!(report.skipped, vec![9999]);
        assert_eq!(report.applied, 1);
    }

    #[test]
    fn test_unknown_task_changes_nothing() {
        let f = fixture();
        let result = f
            .verifier
            .verify("no-such-task", &[incorrect(f.result_id, &["重新开始"])]);
        assert!(matches!(result, Err(StorageError::TaskNotFound(_))));

        assert_eq!(shadow_count(&f.db), 0);
        assert!(!f.cache.entry(&f.fingerprint).unwrap().unwrap().verified);
    }
}
