//! Data model shared between the detection, cache, batch and storage layers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::vision::ImageFingerprint;

/// Lifecycle of a batch task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Whether the task has stopped changing
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A persisted batch task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub total: u64,
    pub executed: u64,
    pub success: u64,
    pub fail: u64,
    pub exception: u64,
    pub cache_hit: u64,
    pub matched: u64,
    pub match_rate: f64,
    /// Results of this task confirmed or corrected by a human
    pub verified_count: u64,
    /// Fatal startup error, if the task failed
    pub error: Option<String>,
    /// Unix timestamp (seconds)
    pub created_at: u64,
    pub finished_at: Option<u64>,
}

/// Outcome of detection for one image, before it is persisted
#[derive(Debug, Clone)]
pub struct DetectionRecord {
    pub image_path: PathBuf,
    pub fingerprint: ImageFingerprint,
    /// Texts kept by the hitting round (empty on a miss)
    pub texts: Vec<String>,
    /// Recognition score for each kept text
    pub confidences: Vec<f32>,
    /// Target language -> whether it was found
    pub languages: BTreeMap<String, bool>,
    pub has_match: bool,
    /// 1-based index of the round that hit
    pub round_hit: Option<usize>,
    /// Why the round counted as a hit
    pub hit_reason: Option<String>,
    pub processing_time: Duration,
}

/// Human verdict on an automated result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyOutcome {
    Correct,
    Incorrect,
}

impl VerifyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyOutcome::Correct => "correct",
            VerifyOutcome::Incorrect => "incorrect",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "correct" => Some(VerifyOutcome::Correct),
            "incorrect" => Some(VerifyOutcome::Incorrect),
            _ => None,
        }
    }
}

/// A detection result row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResult {
    pub id: i64,
    /// Owning task, `None` for verification shadows
    pub task_id: Option<String>,
    pub image_path: PathBuf,
    pub fingerprint: ImageFingerprint,
    pub texts: Vec<String>,
    pub confidences: Vec<f32>,
    pub languages: BTreeMap<String, bool>,
    pub has_match: bool,
    pub round_hit: Option<usize>,
    pub hit_reason: Option<String>,
    pub processing_time_ms: u64,
    pub verified: bool,
    pub verify_outcome: Option<VerifyOutcome>,
    /// For shadows: the automated result this one corrects
    pub corrected_origin_id: Option<i64>,
}

impl StoredResult {
    /// Export form of the row
    pub fn to_record(&self) -> ResultRecord {
        ResultRecord {
            id: self.id,
            image_path: self.image_path.clone(),
            texts: self.texts.clone(),
            confidences: self.confidences.clone(),
            languages: self.languages.clone(),
            has_match: self.has_match,
            round_hit: self.round_hit,
            processing_time_ms: self.processing_time_ms,
        }
    }
}

/// Persisted record format handed to reporting collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: i64,
    pub image_path: PathBuf,
    pub texts: Vec<String>,
    pub confidences: Vec<f32>,
    pub languages: BTreeMap<String, bool>,
    pub has_match: bool,
    pub round_hit: Option<usize>,
    pub processing_time_ms: u64,
}

/// One human correction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub result_id: i64,
    pub outcome: VerifyOutcome,
    #[serde(default)]
    pub corrected_texts: Option<Vec<String>>,
}

/// Final statistics of a batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    pub task_id: String,
    pub status: TaskStatus,
    pub total: u64,
    pub executed: u64,
    pub success: u64,
    pub fail: u64,
    pub exception: u64,
    /// Images answered from the cache (included in `success`)
    pub cache_hit: u64,
    pub matched: u64,
    pub match_rate: f64,
    pub elapsed_ms: u64,
    /// Round index -> number of images whose first hit came from it
    pub round_histogram: BTreeMap<usize, u64>,
    /// Detected images whose results could not be stored (included in `exception`)
    #[serde(default)]
    pub persist_failed: u64,
    pub error: Option<String>,
}

impl BatchStats {
    /// Zeroed statistics for a task about to run
    pub fn empty(task_id: &str, total: u64) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Running,
            total,
            executed: 0,
            success: 0,
            fail: 0,
            exception: 0,
            cache_hit: 0,
            matched: 0,
            match_rate: 0.0,
            elapsed_ms: 0,
            round_histogram: BTreeMap::new(),
            persist_failed: 0,
            error: None,
        }
    }
}

/// Progress snapshot for external observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: u64,
    pub executed: u64,
    pub success: u64,
    pub fail: u64,
    pub exception: u64,
    pub cache_hit: u64,
    pub matched: u64,
    pub match_rate: f64,
    pub status: TaskStatus,
}

/// Ratio guarded against empty batches
pub fn match_rate(matched: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        matched as f64 / total as f64
    }
}

/// Current Unix timestamp in seconds
pub fn unix_now() -> u64 {
    use std::time::SystemTime;

    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
