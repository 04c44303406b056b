//! Result collector
//!
//! Drains worker reports, books every item into the progress counters and
//! writes successful records to storage in batches, flushing when the
//! buffer reaches `flush_size` or `flush_interval` has passed. A failed
//! write keeps the buffer for the next flush; whatever is still unwritten
//! at shutdown is rebooked as `exception`.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::progress::ProgressCounters;
use crate::cache::ResultCache;
use crate::shared::{DetectionRecord, ReportKind, WorkerReport};
use crate::vision::ImageFingerprint;

/// Counts booked by the collector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorSummary {
    pub success: u64,
    pub fail: u64,
    pub exception: u64,
    pub matched: u64,
    /// Records written to storage
    pub persisted: u64,
    /// Records that could not be written (counted in `exception`)
    pub persist_failed: u64,
}

pub(crate) struct Collector {
    task_id: String,
    cache: ResultCache,
    counters: ProgressCounters,
    flush_size: usize,
    flush_interval: Duration,
    buffer: Vec<DetectionRecord>,
    last_flush: Instant,
    /// Set while the store rejects writes; retries then wait for the interval
    failing: bool,
    /// Extra paths sharing a fingerprint with a detected image
    duplicates: HashMap<ImageFingerprint, Vec<PathBuf>>,
    summary: CollectorSummary,
}

impl Collector {
    pub(crate) fn new(
        task_id: &str,
        cache: ResultCache,
        counters: ProgressCounters,
        flush_size: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            cache,
            counters,
            flush_size: flush_size.max(1),
            flush_interval: flush_interval.max(Duration::from_millis(1)),
            buffer: Vec::new(),
            last_flush: Instant::now(),
            failing: false,
            duplicates: HashMap::new(),
            summary: CollectorSummary::default(),
        }
    }

    /// Book the outcome of each detected fingerprint for these paths too
    pub(crate) fn with_duplicates(mut self, duplicates: HashMap<ImageFingerprint, Vec<PathBuf>>) -> Self {
        self.duplicates = duplicates;
        self
    }

    /// Drain `results` until every sender is gone
    pub(crate) fn run(mut self, results: Receiver<WorkerReport>) -> CollectorSummary {
        loop {
            let wait = self.flush_interval.saturating_sub(self.last_flush.elapsed());
            match results.recv_timeout(wait) {
                Ok(report) => self.push(report),
                Err(RecvTimeoutError::Timeout) => self.flush(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.finish()
    }

    /// Book one report, flushing if a threshold was reached
    pub(crate) fn push(&mut self, report: WorkerReport) {
        let kind = report.kind();
        let copies = self.duplicates.remove(&report.fingerprint).unwrap_or_default();
        for _ in 0..=copies.len() {
            self.book(kind);
        }

        match report.outcome {
            Ok(record) => {
                for path in copies {
                    self.buffer.push(DetectionRecord {
                        image_path: path,
                        ..record.clone()
                    });
                }
                self.buffer.push(record);
            }
            Err(e) => {
                warn!("Image {:?} failed: {}", report.image_path, e);
                if !copies.is_empty() {
                    warn!("{} identical images share that outcome", copies.len());
                }
            }
        }

        let full = !self.failing && self.buffer.len() >= self.flush_size;
        if full || self.last_flush.elapsed() >= self.flush_interval {
            self.flush();
        }
    }

    /// Flush the remainder and return the totals
    pub(crate) fn finish(mut self) -> CollectorSummary {
        self.flush();

        if !self.buffer.is_empty() {
            let lost = self.buffer.len() as u64;
            let matched = self.buffer.iter().filter(|r| r.has_match).count() as u64;
            error!(
                "Task {}: {} results could not be stored, counting them as exceptions",
                self.task_id, lost
            );
            self.summary.success -= lost;
            self.summary.matched -= matched;
            self.summary.exception += lost;
            self.summary.persist_failed = lost;
            if let Err(e) = self.counters.rebook_lost(lost, matched) {
                warn!("Failed to update progress counters: {}", e);
            }
        }
        self.summary
    }

    fn book(&mut self, kind: ReportKind) {
        match kind {
            ReportKind::Success { matched } => {
                self.summary.success += 1;
                if matched {
                    self.summary.matched += 1;
                }
            }
            ReportKind::Fail => self.summary.fail += 1,
            ReportKind::Exception => self.summary.exception += 1,
        }
        if let Err(e) = self.counters.record(kind) {
            warn!("Failed to update progress counters: {}", e);
        }
    }

    fn flush(&mut self) {
        self.last_flush = Instant::now();
        if self.buffer.is_empty() {
            return;
        }

        match self.cache.persist_fresh(&self.task_id, &self.buffer) {
            Ok(ids) => {
                self.summary.persisted += ids.len() as u64;
                self.buffer.clear();
                self.failing = false;
                debug!("Flushed {} results for task {}", ids.len(), self.task_id);
            }
            Err(e) => {
                self.failing = true;
                error!(
                    "Failed to persist {} results for task {}, will retry: {}",
                    self.buffer.len(),
                    self.task_id,
                    e
                );
            }
        }
    }
}
