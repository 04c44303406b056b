//! Storage Layer
//!
//! Handles persistence of tasks, detection results, the result cache and
//! detection profiles using SQLite and JSON files.

pub mod cache_entries;
pub mod database;
pub mod profiles;
pub mod results;
pub mod tasks;

pub use cache_entries::{CacheEntry, RecordOutcome};
pub use database::Database;
pub use profiles::{load_profile, save_profile, DetectionProfile};

use anyhow::Result;
use std::path::PathBuf;

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "langscan", "langscan")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;

    let data_dir = proj_dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "langscan", "langscan")
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

    let config_dir = proj_dirs.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}
