//! Message types passed from detection workers to the collector

use std::path::PathBuf;

use crate::errors::DetectError;
use crate::shared::DetectionRecord;
use crate::vision::ImageFingerprint;

/// Result of processing one image, sent over the result queue
#[derive(Debug)]
pub struct WorkerReport {
    /// Image that was processed
    pub image_path: PathBuf,
    /// Fingerprint computed before dispatch
    pub fingerprint: ImageFingerprint,
    /// Detection outcome or the per-image error
    pub outcome: Result<DetectionRecord, DetectError>,
}

/// How the collector books a report into the progress counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// Detection ran to completion (hit or miss)
    Success { matched: bool },
    /// Image could not be read
    Fail,
    /// Engine or unexpected failure
    Exception,
}

impl WorkerReport {
    /// Classify the report for progress bookkeeping
    pub fn kind(&self) -> ReportKind {
        match &self.outcome {
            Ok(record) => ReportKind::Success {
                matched: record.has_match,
            },
            Err(e) if e.is_read_failure() => ReportKind::Fail,
            Err(_) => ReportKind::Exception,
        }
    }
}
