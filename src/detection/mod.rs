//! Detection Layer
//!
//! Multi-round escalation: every image is tried against an ordered list of
//! increasingly permissive configurations, stopping at the first round
//! whose kept detections are non-empty.

pub mod round;

pub use round::{RoundHit, RoundRunner};

use image::DynamicImage;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::engine::{EngineInstanceKey, EngineInstancePool, RoundParams};
use crate::errors::DetectError;
use crate::shared::DetectionRecord;
use crate::storage::DetectionProfile;
use crate::vision::{load_image, FilterPolicy, ImageFingerprint, TextFilter};

/// What a batch detects with
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    /// Engine language code
    pub language: String,
    pub filter: FilterPolicy,
    /// Rounds in escalation order
    pub rounds: Vec<RoundParams>,
}

impl DetectionSettings {
    /// Distinct engine keys the schedule needs, in first-use order
    pub fn engine_keys(&self) -> Vec<EngineInstanceKey> {
        let mut keys: Vec<EngineInstanceKey> = Vec::new();
        for params in &self.rounds {
            let key = params.engine_key(&self.language);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

impl From<&DetectionProfile> for DetectionSettings {
    fn from(profile: &DetectionProfile) -> Self {
        Self {
            language: profile.language.clone(),
            filter: profile.filter_policy(),
            rounds: profile.rounds.clone(),
        }
    }
}

/// Runs the round schedule with early stop
pub struct MultiRoundDetector {
    runner: RoundRunner,
    rounds: Vec<RoundParams>,
    /// First hit per fingerprint; later hits never overwrite it
    first_hits: Mutex<HashMap<ImageFingerprint, RoundHit>>,
}

impl MultiRoundDetector {
    /// Create a detector using the built-in filter policy of `settings`
    pub fn new(pool: Arc<EngineInstancePool>, settings: &DetectionSettings) -> Self {
        Self::with_filter(
            pool,
            settings.language.clone(),
            settings.rounds.clone(),
            Arc::new(settings.filter),
        )
    }

    /// Create a detector with a custom text filter
    pub fn with_filter(
        pool: Arc<EngineInstancePool>,
        language: String,
        rounds: Vec<RoundParams>,
        filter: Arc<dyn TextFilter>,
    ) -> Self {
        Self {
            runner: RoundRunner::new(pool, language, filter),
            rounds,
            first_hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn rounds(&self) -> &[RoundParams] {
        &self.rounds
    }

    /// Run rounds until one hits.
    ///
    /// Returns `Ok(None)` on a final miss. A round whose inference raises
    /// counts as a miss; an engine that cannot be built aborts the image.
    pub fn detect(
        &self,
        image: &DynamicImage,
        fingerprint: &ImageFingerprint,
    ) -> Result<Option<RoundHit>, DetectError> {
        for (index, params) in self.rounds.iter().enumerate() {
            let round = index + 1;
            match self.runner.run(round, params, image) {
                Ok(Some(hit)) => {
                    debug!("Image {} hit at round {}: {}", fingerprint, round, hit.reason);
                    self.first_hits
                        .lock()
                        .entry(fingerprint.clone())
                        .or_insert_with(|| hit.clone());
                    return Ok(Some(hit));
                }
                Ok(None) => {
                    debug!("Image {} missed round {}", fingerprint, round);
                }
                Err(e @ DetectError::RoundExecution { .. }) => {
                    warn!("Image {}: {}, trying next round", fingerprint, e);
                }
                Err(e) => return Err(e),
            }
        }

        debug!("Image {} missed all {} rounds", fingerprint, self.rounds.len());
        Ok(None)
    }

    /// Decode an image file and detect it into a result record
    pub fn detect_path(
        &self,
        path: &Path,
        fingerprint: &ImageFingerprint,
    ) -> Result<DetectionRecord, DetectError> {
        let start = Instant::now();
        let image = load_image(path)?;
        let hit = self.detect(&image, fingerprint)?;

        let has_match = hit.is_some();
        let (texts, confidences, round_hit, hit_reason) = match hit {
            Some(hit) => (hit.texts, hit.scores, Some(hit.round), Some(hit.reason)),
            None => (Vec::new(), Vec::new(), None, None),
        };

        Ok(DetectionRecord {
            image_path: path.to_path_buf(),
            fingerprint: fingerprint.clone(),
            texts,
            confidences,
            languages: BTreeMap::from([(self.runner.language().to_string(), has_match)]),
            has_match,
            round_hit,
            hit_reason,
            processing_time: start.elapsed(),
        })
    }

    /// First recorded hit for a fingerprint
    pub fn first_hit(&self, fingerprint: &ImageFingerprint) -> Option<RoundHit> {
        self.first_hits.lock().get(fingerprint).cloned()
    }

    /// Round index -> number of fingerprints whose first hit came from it
    pub fn round_histogram(&self) -> BTreeMap<usize, u64> {
        let mut histogram = BTreeMap::new();
        for hit in self.first_hits.lock().values() {
            *histogram.entry(hit.round).or_insert(0) += 1;
        }
        histogram
    }
}
