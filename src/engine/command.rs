//! External recognizer adapter
//!
//! Drives a recognizer executable (typically a small wrapper script around
//! an OCR toolkit) through its command line. Construction runs a warm-up
//! invocation so missing models fail fast; each `predict` hands the
//! pre-scaled image over as a temporary PNG and reads JSON from stdout.

use image::{DynamicImage, ImageFormat};
use serde::Deserialize;
use std::path::PathBuf;
use std::process::{Command, Output};
use tracing::debug;

use super::{EngineFactory, EngineInstanceKey, RecognitionEngine, RoundParams, TextDetection};
use crate::errors::EngineError;

/// One detection as printed by the recognizer
#[derive(Debug, Deserialize)]
struct WireDetection {
    #[serde(default)]
    points: Vec<[f32; 2]>,
    text: String,
    score: f32,
}

/// Builds [`CommandEngine`]s for pool keys
#[derive(Debug, Clone)]
pub struct CommandEngineFactory {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandEngineFactory {
    /// Create a factory for `program`, passing `args` before the generated flags
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn base_command(&self, key: &EngineInstanceKey) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).args(key_flags(key));
        command
    }
}

impl EngineFactory for CommandEngineFactory {
    fn construct(&self, key: &EngineInstanceKey) -> Result<Box<dyn RecognitionEngine>, EngineError> {
        let output = self
            .base_command(key)
            .arg("--warmup")
            .output()
            .map_err(|e| {
                EngineError::Construction(format!("cannot start {:?}: {}", self.program, e))
            })?;

        if !output.status.success() {
            return Err(EngineError::Construction(format!(
                "warm-up for {} exited with {}: {}",
                key,
                output.status,
                stderr_tail(&output)
            )));
        }

        Ok(Box::new(CommandEngine {
            factory: self.clone(),
            key: key.clone(),
        }))
    }
}

/// Engine handle backed by an external recognizer process.
///
/// Every prediction spawns its own process, so concurrent callers do not
/// contend on the handle.
pub struct CommandEngine {
    factory: CommandEngineFactory,
    key: EngineInstanceKey,
}

impl RecognitionEngine for CommandEngine {
    fn configure(&self, params: &RoundParams) -> Result<(), EngineError> {
        if params.use_angle_cls != self.key.use_angle_cls || params.use_unwarp != self.key.use_unwarp {
            return Err(EngineError::Configuration(format!(
                "round flags (cls={}, unwarp={}) do not match engine {}",
                params.use_angle_cls, params.use_unwarp, self.key
            )));
        }
        Ok(())
    }

    fn predict(
        &self,
        params: &RoundParams,
        image: &DynamicImage,
    ) -> Result<Vec<TextDetection>, EngineError> {
        let file = tempfile::Builder::new()
            .prefix("langscan-")
            .suffix(".png")
            .tempfile()?;
        image
            .save_with_format(file.path(), ImageFormat::Png)
            .map_err(|e| EngineError::Inference(format!("cannot stage image: {}", e)))?;

        let output = self
            .factory
            .base_command(&self.key)
            .args(param_flags(params))
            .arg("--image")
            .arg(file.path())
            .output()?;

        if !output.status.success() {
            return Err(EngineError::Inference(format!(
                "recognizer exited with {}: {}",
                output.status,
                stderr_tail(&output)
            )));
        }

        let detections = parse_detections(&output.stdout)?;
        debug!("Recognizer returned {} detections", detections.len());
        Ok(detections)
    }
}

fn key_flags(key: &EngineInstanceKey) -> Vec<String> {
    vec![
        "--lang".to_string(),
        key.language.clone(),
        "--use-angle-cls".to_string(),
        key.use_angle_cls.to_string(),
        "--use-unwarp".to_string(),
        key.use_unwarp.to_string(),
    ]
}

fn param_flags(params: &RoundParams) -> Vec<String> {
    vec![
        "--det-limit-type".to_string(),
        params.limit_type.as_str().to_string(),
        "--det-limit-side-len".to_string(),
        params.limit_side_len.to_string(),
        "--det-db-thresh".to_string(),
        params.det_thresh.to_string(),
        "--det-db-box-thresh".to_string(),
        params.box_thresh.to_string(),
        "--det-db-unclip-ratio".to_string(),
        params.unclip_ratio.to_string(),
    ]
}

/// Parse the recognizer's stdout (a JSON array, empty output meaning no text)
fn parse_detections(stdout: &[u8]) -> Result<Vec<TextDetection>, EngineError> {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(vec![]);
    }

    let wire: Vec<WireDetection> =
        serde_json::from_str(trimmed).map_err(|e| EngineError::Output(e.to_string()))?;

    Ok(wire
        .into_iter()
        .map(|d| TextDetection {
            polygon: d.points.into_iter().map(|[x, y]| (x, y)).collect(),
            text: d.text,
            score: d.score,
        })
        .collect())
}

fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
    tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
}
