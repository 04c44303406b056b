//! Detection result rows, including verification shadows

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::Database;
use crate::errors::StorageResult;
use crate::shared::{unix_now, DetectionRecord, StoredResult, VerifyOutcome};
use crate::vision::ImageFingerprint;

const RESULT_COLUMNS: &str = "id, task_id, image_path, fingerprint, texts, confidences, languages, \
     has_match, round_hit, hit_reason, processing_time_ms, verified, verify_outcome, corrected_origin_id";

/// Decode a JSON text column
fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_result(row: &Row<'_>) -> rusqlite::Result<StoredResult> {
    let image_path: String = row.get(2)?;
    let fingerprint: String = row.get(3)?;
    let outcome: Option<String> = row.get(12)?;
    Ok(StoredResult {
        id: row.get(0)?,
        task_id: row.get(1)?,
        image_path: PathBuf::from(image_path),
        fingerprint: ImageFingerprint::from_hex(fingerprint),
        texts: json_column(row, 4)?,
        confidences: json_column(row, 5)?,
        languages: json_column(row, 6)?,
        has_match: row.get(7)?,
        round_hit: row.get::<_, Option<i64>>(8)?.map(|r| r as usize),
        hit_reason: row.get(9)?,
        processing_time_ms: row.get::<_, i64>(10)? as u64,
        verified: row.get(11)?,
        verify_outcome: outcome.as_deref().and_then(VerifyOutcome::parse),
        corrected_origin_id: row.get(13)?,
    })
}

/// Insert a freshly computed result, returning its id
pub(crate) fn insert_result(
    conn: &Connection,
    task_id: Option<&str>,
    record: &DetectionRecord,
) -> StorageResult<i64> {
    conn.execute(
        "INSERT INTO detection_results (task_id, image_path, fingerprint, texts, confidences, \
         languages, has_match, round_hit, hit_reason, processing_time_ms, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            task_id,
            record.image_path.to_string_lossy().into_owned(),
            record.fingerprint.as_str(),
            serde_json::to_string(&record.texts)?,
            serde_json::to_string(&record.confidences)?,
            serde_json::to_string(&record.languages)?,
            record.has_match,
            record.round_hit.map(|r| r as i64),
            record.hit_reason,
            record.processing_time.as_millis() as i64,
            unix_now() as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn get_result(conn: &Connection, id: i64) -> StorageResult<Option<StoredResult>> {
    let sql = format!("SELECT {} FROM detection_results WHERE id = ?", RESULT_COLUMNS);
    Ok(conn.query_row(&sql, params![id], row_to_result).optional()?)
}

/// Results produced by a task's own detection runs
pub(crate) fn results_for_task(conn: &Connection, task_id: &str) -> StorageResult<Vec<StoredResult>> {
    let sql = format!(
        "SELECT {} FROM detection_results WHERE task_id = ? ORDER BY id",
        RESULT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let results = stmt
        .query_map(params![task_id], row_to_result)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(results)
}

/// Results referenced by a task's cache-hit ledger
pub(crate) fn ledger_results(conn: &Connection, task_id: &str) -> StorageResult<Vec<StoredResult>> {
    let sql = format!(
        "SELECT {} FROM detection_results WHERE id IN \
         (SELECT result_id FROM cache_hit_ledger WHERE task_id = ?) ORDER BY id",
        RESULT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let results = stmt
        .query_map(params![task_id], row_to_result)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(results)
}

/// The shadow correcting `origin_id`, if one was created
pub(crate) fn find_shadow(conn: &Connection, origin_id: i64) -> StorageResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM detection_results WHERE corrected_origin_id = ?",
            params![origin_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Create an orphan result holding human-corrected texts
pub(crate) fn insert_shadow(
    conn: &Connection,
    origin: &StoredResult,
    texts: &[String],
    has_match: bool,
) -> StorageResult<i64> {
    let confidences = vec![1.0f32; texts.len()];
    let languages = language_flags(&origin.languages, has_match);
    conn.execute(
        "INSERT INTO detection_results (task_id, image_path, fingerprint, texts, confidences, \
         languages, has_match, round_hit, hit_reason, processing_time_ms, verified, verify_outcome, \
         corrected_origin_id, created_at) \
         VALUES (NULL, ?, ?, ?, ?, ?, ?, NULL, 'human correction', 0, 1, ?, ?, ?)",
        params![
            origin.image_path.to_string_lossy().into_owned(),
            origin.fingerprint.as_str(),
            serde_json::to_string(texts)?,
            serde_json::to_string(&confidences)?,
            serde_json::to_string(&languages)?,
            has_match,
            VerifyOutcome::Correct.as_str(),
            origin.id,
            unix_now() as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Replace the texts of an existing shadow in place
pub(crate) fn update_shadow(
    conn: &Connection,
    shadow: &StoredResult,
    texts: &[String],
    has_match: bool,
) -> StorageResult<()> {
    let confidences = vec![1.0f32; texts.len()];
    conn.execute(
        "UPDATE detection_results SET texts = ?, confidences = ?, languages = ?, has_match = ? \
         WHERE id = ?",
        params![
            serde_json::to_string(texts)?,
            serde_json::to_string(&confidences)?,
            serde_json::to_string(&language_flags(&shadow.languages, has_match))?,
            has_match,
            shadow.id,
        ],
    )?;
    Ok(())
}

/// Every language of a result flagged with the corrected match state
fn language_flags(languages: &BTreeMap<String, bool>, has_match: bool) -> BTreeMap<String, bool> {
    languages.keys().map(|lang| (lang.clone(), has_match)).collect()
}

/// Record a human verdict on a result
pub(crate) fn mark_verified(conn: &Connection, id: i64, outcome: VerifyOutcome) -> StorageResult<()> {
    conn.execute(
        "UPDATE detection_results SET verified = 1, verify_outcome = ? WHERE id = ?",
        params![outcome.as_str(), id],
    )?;
    Ok(())
}

/// Number of a task's results (fresh or served from cache) that carry a human verdict
pub(crate) fn count_verified(conn: &Connection, task_id: &str) -> StorageResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM detection_results WHERE verified = 1 AND (task_id = ?1 \
         OR id IN (SELECT result_id FROM cache_hit_ledger WHERE task_id = ?1))",
        params![task_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Tasks whose verified count depends on a result: its owner and every
/// task it was served to from the cache
pub(crate) fn tasks_referencing(conn: &Connection, result_id: i64) -> StorageResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT task_id FROM detection_results WHERE id = ?1 AND task_id IS NOT NULL \
         UNION SELECT task_id FROM cache_hit_ledger WHERE result_id = ?1",
    )?;
    let ids = stmt
        .query_map(params![result_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

impl Database {
    /// Get a result by ID
    pub fn get_result(&self, id: i64) -> StorageResult<Option<StoredResult>> {
        self.with_conn(|conn| get_result(conn, id))
    }

    /// Results freshly computed by a task
    pub fn results_for_task(&self, task_id: &str) -> StorageResult<Vec<StoredResult>> {
        self.with_conn(|conn| results_for_task(conn, task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn record(name: &str, texts: &[&str]) -> DetectionRecord {
        DetectionRecord {
            image_path: PathBuf::from(name),
            fingerprint: ImageFingerprint::from_bytes(name.as_bytes()),
            texts: texts.iter().map(|t| t.to_string()).collect(),
            confidences: vec![0.9; texts.len()],
            languages: BTreeMap::from([("ch".to_string(), !texts.is_empty())]),
            has_match: !texts.is_empty(),
            round_hit: if texts.is_empty() { None } else { Some(2) },
            hit_reason: None,
            processing_time: Duration::from_millis(42),
        }
    }

    #[test]
    fn test_insert_and_read_back() {
        let db = Database::open_in_memory().unwrap();
        let task = db.create_task("t").unwrap();
        let id = db
            .with_conn(|conn| insert_result(conn, Some(&task.id), &record("a.png", &["开始游戏"])))
            .unwrap();

        let stored = db.get_result(id).unwrap().unwrap();
        assert_eq!(stored.task_id.as_deref(), Some(task.id.as_str()));
        assert_eq!(stored.texts, vec!["开始游戏".to_string()]);
        assert_eq!(stored.round_hit, Some(2));
        assert_eq!(stored.processing_time_ms, 42);
        assert!(stored.has_match);
        assert!(!stored.verified);
        assert_eq!(stored.languages.get("ch"), Some(&true));

        assert_eq!(db.results_for_task(&task.id).unwrap().len(), 1);
        assert!(db.get_result(id + 100).unwrap().is_none());
    }

    #[test]
    fn test_shadow_rows() {
        let db = Database::open_in_memory().unwrap();
        let task = db.create_task("t").unwrap();
        let origin_id = db
            .with_conn(|conn| insert_result(conn, Some(&task.id), &record("a.png", &["开始"])))
            .unwrap();
        let origin = db.get_result(origin_id).unwrap().unwrap();

        let shadow_id = db
            .with_conn(|conn| {
                assert!(find_shadow(conn, origin_id)?.is_none());
                let texts = vec!["重新开始".to_string()];
                let id = insert_shadow(conn, &origin, &texts, true)?;
                assert_eq!(find_shadow(conn, origin_id)?, Some(id));
                Ok(id)
            })
            .unwrap();

        let shadow = db.get_result(shadow_id).unwrap().unwrap();
        assert!(shadow.task_id.is_none());
        assert!(shadow.verified);
        assert_eq!(shadow.corrected_origin_id, Some(origin_id));
        assert_eq!(shadow.fingerprint, origin.fingerprint);
        assert_eq!(shadow.languages, BTreeMap::from([("ch".to_string(), true)]));

        db.with_conn(|conn| update_shadow(conn, &shadow, &[], false))
            .unwrap();
        let shadow = db.get_result(shadow_id).unwrap().unwrap();
        assert!(shadow.texts.is_empty());
        assert!(!shadow.has_match);
        assert_eq!(shadow.languages, BTreeMap::from([("ch".to_string(), false)]));

        // Shadows are orphans and never show up as a task's own results
        assert_eq!(db.results_for_task(&task.id).unwrap().len(), 1);
    }

    #[test]
    fn test_mark_verified_counts() {
        let db = Database::open_in_memory().unwrap();
        let task = db.create_task("t").unwrap();
        let id = db
            .with_conn(|conn| insert_result(conn, Some(&task.id), &record("a.png", &[])))
            .unwrap();

        db.with_conn(|conn| {
            assert_eq!(count_verified(conn, &task.id)?, 0);
            mark_verified(conn, id, VerifyOutcome::Correct)?;
            assert_eq!(count_verified(conn, &task.id)?, 1);
            Ok(())
        })
        .unwrap();

        let stored = db.get_result(id).unwrap().unwrap();
        assert_eq!(stored.verify_outcome, Some(VerifyOutcome::Correct));
    }
}
