//! Detection profile storage and loading
//!
//! A profile bundles a language, an optional filter override and a round
//! schedule so one run can use a different escalation than the config.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::engine::RoundParams;
use crate::vision::FilterPolicy;

/// A detection profile definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionProfile {
    /// Profile identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Engine language code
    pub language: String,
    /// Explicit filter; inferred from `language` when absent
    #[serde(default)]
    pub filter: Option<FilterPolicy>,
    /// Ordered round schedule, cheapest first
    pub rounds: Vec<RoundParams>,
}

impl DetectionProfile {
    /// Filter policy this profile detects with
    pub fn filter_policy(&self) -> FilterPolicy {
        self.filter
            .unwrap_or_else(|| FilterPolicy::for_language(&self.language))
    }
}

/// Load a detection profile from file
pub fn load_profile(path: &Path) -> Result<DetectionProfile> {
    let content = std::fs::read_to_string(path)?;
    let profile: DetectionProfile = serde_json::from_str(&content)?;
    if profile.rounds.is_empty() {
        anyhow::bail!("Profile {:?} defines no detection rounds", path);
    }
    Ok(profile)
}

/// Save a detection profile to file
pub fn save_profile(profile: &DetectionProfile, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(profile)?;
    std::fs::write(path, content)?;
    Ok(())
}
