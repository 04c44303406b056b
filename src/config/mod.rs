//! Application Configuration
//!
//! Settings stored in TOML format. Every section falls back to its
//! defaults, so a partial file only needs the values it changes.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::detection::DetectionSettings;
use crate::engine::{LimitType, RoundParams, DEFAULT_POOL_CAPACITY};
use crate::vision::FilterPolicy;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// General settings
    pub general: GeneralConfig,
    /// Recognition engine settings
    pub engine: EngineConfig,
    /// Round schedule
    pub detection: DetectionConfig,
    /// Batch execution settings
    pub batch: BatchConfig,
    /// Storage settings
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Filter policy, explicit or inferred from the language
    pub fn filter_policy(&self) -> FilterPolicy {
        self.general
            .filter
            .unwrap_or_else(|| FilterPolicy::for_language(&self.general.language))
    }

    /// Detection settings for a batch run
    pub fn detection_settings(&self) -> DetectionSettings {
        DetectionSettings {
            language: self.general.language.clone(),
            filter: self.filter_policy(),
            rounds: self.detection.rounds.clone(),
        }
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Engine language code
    pub language: String,
    /// Explicit text filter (inferred from `language` when unset)
    pub filter: Option<FilterPolicy>,
    /// File extensions treated as screenshots
    pub image_extensions: Vec<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            language: "ch".to_string(),
            filter: None,
            image_extensions: ["png", "jpg", "jpeg", "bmp", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Recognition engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Recognizer executable
    pub program: PathBuf,
    /// Extra arguments passed before the engine flags
    pub args: Vec<String>,
    /// Maximum number of live engine handles
    pub pool_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("langscan-engine"),
            args: Vec::new(),
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

/// Round schedule settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Rounds in escalation order
    pub rounds: Vec<RoundParams>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            rounds: default_rounds(),
        }
    }
}

/// Batch execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Fixed worker count; derived from hardware when unset
    pub max_workers: Option<usize>,
    /// Accelerator memory budget per worker
    pub gpu_memory_per_worker_mb: u64,
    /// Bound of the worker -> collector queue
    pub result_queue_capacity: usize,
    /// Flush buffered results after this many items
    pub flush_size: usize,
    /// Flush buffered results after this long without a flush
    pub flush_interval_ms: u64,
    /// Period of the progress log line
    pub progress_interval_ms: u64,
    /// Serve previously seen fingerprints from the result cache
    pub use_cache: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            gpu_memory_per_worker_mb: 2048,
            result_queue_capacity: 256,
            flush_size: 50,
            flush_interval_ms: 2000,
            progress_interval_ms: 5000,
            use_cache: true,
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file; `<data_dir>/langscan.db` when unset
    pub database_path: Option<PathBuf>,
}

/// Seven-round escalation, cheap and precise first
pub fn default_rounds() -> Vec<RoundParams> {
    #[allow(clippy::too_many_arguments)]
    fn round(
        limit_type: LimitType,
        limit_side_len: u32,
        det_thresh: f32,
        box_thresh: f32,
        unclip_ratio: f32,
        rec_score_thresh: f32,
        use_angle_cls: bool,
        use_unwarp: bool,
    ) -> RoundParams {
        RoundParams {
            limit_type,
            limit_side_len,
            det_thresh,
            box_thresh,
            unclip_ratio,
            rec_score_thresh,
            use_angle_cls,
            use_unwarp,
        }
    }

    use LimitType::{Max, Min};
    vec![
        round(Max, 960, 0.30, 0.60, 1.5, 0.90, false, false),
        round(Max, 1280, 0.30, 0.60, 1.6, 0.85, false, false),
        round(Max, 1600, 0.25, 0.50, 1.8, 0.80, true, false),
        round(Max, 2048, 0.20, 0.50, 2.0, 0.75, true, false),
        round(Min, 736, 0.20, 0.40, 2.0, 0.70, true, false),
        round(Max, 2560, 0.15, 0.35, 2.2, 0.65, true, true),
        round(Max, 3200, 0.10, 0.30, 2.5, 0.60, true, true),
    ]
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    if config.detection.rounds.is_empty() {
        anyhow::bail!("Configuration {:?} defines no detection rounds", path);
    }
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
