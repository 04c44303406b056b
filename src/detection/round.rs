//! Single-round execution
//!
//! One image against one parameter configuration: acquire the pooled
//! handle, pre-scale, predict, then keep only detections that pass the
//! language filter and the round's recognition threshold.

use image::DynamicImage;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

use crate::engine::{EngineInstancePool, RoundParams, TextDetection};
use crate::errors::{DetectError, EngineError};
use crate::vision::{prescale, TextFilter};

/// Kept detections of the first round that hit
#[derive(Debug, Clone, PartialEq)]
pub struct RoundHit {
    /// 1-based round index
    pub round: usize,
    pub texts: Vec<String>,
    pub scores: Vec<f32>,
    /// Human-readable reason the round counted as a hit
    pub reason: String,
}

/// Runs one round for one image
pub struct RoundRunner {
    pool: Arc<EngineInstancePool>,
    language: String,
    filter: Arc<dyn TextFilter>,
}

impl RoundRunner {
    pub fn new(pool: Arc<EngineInstancePool>, language: impl Into<String>, filter: Arc<dyn TextFilter>) -> Self {
        Self {
            pool,
            language: language.into(),
            filter,
        }
    }

    /// Engine language code
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Execute round `round` (1-based) and return its hit, if any.
    ///
    /// - Handle construction or reconfiguration failure: [`DetectError::EngineInit`]
    /// - Inference failure: [`DetectError::RoundExecution`]
    pub fn run(
        &self,
        round: usize,
        params: &RoundParams,
        image: &DynamicImage,
    ) -> Result<Option<RoundHit>, DetectError> {
        let key = params.engine_key(&self.language);
        let handle = self.pool.acquire(&key).map_err(|source| DetectError::EngineInit {
            key: key.clone(),
            source,
        })?;

        let start = Instant::now();
        let scaled = prescale(image, params);
        let detections = handle.run(params, &scaled).map_err(|source| match source {
            EngineError::Configuration(_) => DetectError::EngineInit {
                key: key.clone(),
                source,
            },
            source => DetectError::RoundExecution { round, source },
        })?;

        let (texts, scores) = self.keep(params, detections);
        trace!(
            "Round {} ({}x{}) kept {} texts in {:?}",
            round,
            scaled.width(),
            scaled.height(),
            texts.len(),
            start.elapsed()
        );

        if texts.is_empty() {
            return Ok(None);
        }

        let reason = format!(
            "{} text(s) passed filter {} with score >= {:.2} at {} limit {}",
            texts.len(),
            self.filter.name(),
            params.rec_score_thresh,
            params.limit_type.as_str(),
            params.limit_side_len
        );
        Ok(Some(RoundHit {
            round,
            texts,
            scores,
            reason,
        }))
    }

    fn keep(&self, params: &RoundParams, detections: Vec<TextDetection>) -> (Vec<String>, Vec<f32>) {
        detections
            .into_iter()
            .filter(|d| d.score >= params.rec_score_thresh && self.filter.accepts(&d.text))
            .map(|d| (d.text.trim().to_string(), d.score))
            .unzip()
    }
}
