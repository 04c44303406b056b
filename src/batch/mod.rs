//! Batch Execution
//!
//! Drives one task over a set of screenshots: fingerprints every image,
//! answers known fingerprints from the result cache, and runs the rest
//! through a fixed pool of detection workers feeding a single collector.

pub mod collector;
pub mod progress;

pub use collector::CollectorSummary;
pub use progress::{progress_key, InMemoryProgressStore, ProgressCounters, ProgressStore};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, tick, unbounded};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::cache::ResultCache;
use crate::config::BatchConfig;
use crate::detection::{DetectionSettings, MultiRoundDetector};
use crate::engine::EngineInstancePool;
use crate::errors::DetectError;
use crate::shared::{match_rate, BatchStats, Progress, TaskStatus, WorkerReport};
use crate::storage::Database;
use crate::vision::{fingerprint_file, ImageFingerprint};

use collector::Collector;

/// Runs batches against shared resources
pub struct BatchExecutor {
    db: Arc<Database>,
    pool: Arc<EngineInstancePool>,
    progress: Arc<dyn ProgressStore>,
    config: BatchConfig,
}

impl BatchExecutor {
    pub fn new(
        db: Arc<Database>,
        pool: Arc<EngineInstancePool>,
        progress: Arc<dyn ProgressStore>,
        config: BatchConfig,
    ) -> Self {
        Self {
            db,
            pool,
            progress,
            config,
        }
    }

    /// Process `image_paths` for `task_id` and persist the final statistics.
    ///
    /// Once the task is marked running it always ends `completed` or
    /// `failed`; an internal error is recorded on the task and returned.
    pub fn run(
        &self,
        task_id: &str,
        image_paths: &[PathBuf],
        settings: &DetectionSettings,
    ) -> Result<BatchStats> {
        let start = Instant::now();
        let total = image_paths.len() as u64;
        self.db
            .mark_task_running(task_id, total)
            .with_context(|| format!("Cannot start task {}", task_id))?;
        info!("Task {}: {} images, {} rounds", task_id, total, settings.rounds.len());

        let counters = ProgressCounters::new(self.progress.clone(), task_id);
        match self.execute(task_id, image_paths, settings, &counters) {
            Ok(stats) => self.finish(stats, &counters, start),
            Err(e) => {
                error!("Task {} failed: {:#}", task_id, e);
                let mut stats = BatchStats::empty(task_id, total);
                if let Ok(Some(progress)) = counters.snapshot() {
                    stats.executed = progress.executed;
                    stats.success = progress.success;
                    stats.fail = progress.fail;
                    stats.exception = progress.exception;
                    stats.cache_hit = progress.cache_hit;
                    stats.matched = progress.matched;
                }
                stats.status = TaskStatus::Failed;
                stats.error = Some(format!("{:#}", e));
                if let Err(finish_error) = self.finish(stats, &counters, start) {
                    error!("Cannot record failure of task {}: {:#}", task_id, finish_error);
                }
                Err(e)
            }
        }
    }

    fn execute(
        &self,
        task_id: &str,
        image_paths: &[PathBuf],
        settings: &DetectionSettings,
        counters: &ProgressCounters,
    ) -> Result<BatchStats> {
        let total = image_paths.len() as u64;

        // Fingerprint everything up front; unreadable files are failures
        let mut unreadable = 0u64;
        let mut fingerprinted: Vec<(PathBuf, ImageFingerprint)> = Vec::with_capacity(image_paths.len());
        for path in image_paths {
            match fingerprint_file(path) {
                Ok(fp) => fingerprinted.push((path.clone(), fp)),
                Err(e) => {
                    warn!("{}", e);
                    unreadable += 1;
                }
            }
        }

        // Split hits from misses before any worker starts
        let cache = ResultCache::new(self.db.clone());
        let hits = if self.config.use_cache {
            let wanted: HashSet<ImageFingerprint> =
                fingerprinted.iter().map(|(_, fp)| fp.clone()).collect();
            cache.lookup(task_id, &wanted)?
        } else {
            HashMap::new()
        };

        let mut cache_hit = 0u64;
        let mut cached_matched = 0u64;
        let mut misses = Vec::new();
        let mut duplicates: HashMap<ImageFingerprint, Vec<PathBuf>> = HashMap::new();
        let mut queued = HashSet::new();
        for (path, fp) in fingerprinted {
            match hits.get(&fp) {
                Some(hit) => {
                    cache_hit += 1;
                    if hit.has_match {
                        cached_matched += 1;
                    }
                }
                // Identical screenshots are detected once
                None if !queued.insert(fp.clone()) => duplicates.entry(fp).or_default().push(path),
                None => misses.push((path, fp)),
            }
        }
        let duplicate_count: usize = duplicates.values().map(Vec::len).sum();
        info!(
            "Task {}: {} cache hits, {} to detect, {} duplicates, {} unreadable",
            task_id,
            cache_hit,
            misses.len(),
            duplicate_count,
            unreadable
        );

        let initial = Progress {
            total,
            executed: cache_hit + unreadable,
            success: cache_hit,
            fail: unreadable,
            exception: 0,
            cache_hit,
            matched: cached_matched,
            match_rate: match_rate(cached_matched, total),
            status: TaskStatus::Running,
        };
        if let Err(e) = counters.init(&initial) {
            warn!("Failed to initialize progress counters: {}", e);
        }

        let mut stats = BatchStats::empty(task_id, total);
        stats.executed = initial.executed;
        stats.success = initial.success;
        stats.fail = initial.fail;
        stats.cache_hit = cache_hit;
        stats.matched = cached_matched;

        if !misses.is_empty() {
            if let Err(message) = self.probe_engines(settings) {
                error!("Task {} failed: {}", task_id, message);
                stats.status = TaskStatus::Failed;
                stats.error = Some(message);
                return Ok(stats);
            }

            let detector = Arc::new(MultiRoundDetector::new(self.pool.clone(), settings));
            let collector = Collector::new(
                task_id,
                cache,
                counters.clone(),
                self.config.flush_size,
                Duration::from_millis(self.config.flush_interval_ms),
            )
            .with_duplicates(duplicates);

            let workers = self.worker_count(misses.len());
            info!("Task {}: detecting with {} worker(s)", task_id, workers);
            let summary = if workers <= 1 {
                run_inline(&detector, misses, collector)
            } else {
                self.run_threaded(task_id, &detector, misses, collector, counters, workers)?
            };

            stats.success += summary.success;
            stats.fail += summary.fail;
            stats.exception += summary.exception;
            stats.matched += summary.matched;
            stats.executed += summary.success + summary.fail + summary.exception;
            stats.persist_failed = summary.persist_failed;
            stats.round_histogram = detector.round_histogram();
        }

        stats.status = TaskStatus::Completed;
        Ok(stats)
    }

    /// Live counters, falling back to the persisted task row
    pub fn get_progress(&self, task_id: &str) -> Result<Option<Progress>> {
        let counters = ProgressCounters::new(self.progress.clone(), task_id);
        if let Some(progress) = counters.snapshot()? {
            return Ok(Some(progress));
        }

        Ok(self.db.get_task(task_id)?.map(|task| Progress {
            total: task.total,
            executed: task.executed,
            success: task.success,
            fail: task.fail,
            exception: task.exception,
            cache_hit: task.cache_hit,
            matched: task.matched,
            match_rate: task.match_rate,
            status: task.status,
        }))
    }

    /// Build every engine the schedule needs; fatal only if none can be built
    fn probe_engines(&self, settings: &DetectionSettings) -> std::result::Result<(), String> {
        let keys = settings.engine_keys();
        if keys.is_empty() {
            return Err("No detection rounds configured".to_string());
        }

        let mut failures = Vec::new();
        for key in &keys {
            if let Err(e) = self.pool.acquire(key) {
                warn!("Engine {} unavailable: {}", key, e);
                failures.push(format!("{}: {}", key, e));
            }
        }

        if failures.len() == keys.len() {
            return Err(format!("No recognition engine could be constructed ({})", failures.join("; ")));
        }
        Ok(())
    }

    /// Worker threads to use for `pending` images
    fn worker_count(&self, pending: usize) -> usize {
        let wanted = self
            .config
            .max_workers
            .filter(|&n| n > 0)
            .or_else(|| gpu_worker_budget(self.config.gpu_memory_per_worker_mb))
            .unwrap_or_else(|| {
                thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            });
        wanted.clamp(1, pending.max(1))
    }

    fn run_threaded(
        &self,
        task_id: &str,
        detector: &Arc<MultiRoundDetector>,
        misses: Vec<(PathBuf, ImageFingerprint)>,
        collector: Collector,
        counters: &ProgressCounters,
        workers: usize,
    ) -> Result<CollectorSummary> {
        let (work_tx, work_rx) = unbounded();
        for item in misses {
            // Receiver is alive, send cannot fail
            let _ = work_tx.send(item);
        }
        drop(work_tx);

        let (result_tx, result_rx) = bounded::<WorkerReport>(self.config.result_queue_capacity.max(1));

        let collector_handle = thread::Builder::new()
            .name("collector".to_string())
            .spawn(move || collector.run(result_rx))
            .context("Failed to spawn collector thread")?;

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let reporter_handle = {
            let counters = counters.clone();
            let task_id = task_id.to_string();
            let ticker = tick(Duration::from_millis(self.config.progress_interval_ms.max(1)));
            let spawned = thread::Builder::new()
                .name("progress".to_string())
                .spawn(move || loop {
                    let stop = crossbeam_channel::select! {
                        recv(ticker) -> _ => {
                            match counters.snapshot() {
                                Ok(Some(p)) => info!(
                                    "Task {}: {}/{} executed, {} matched ({:.1}%)",
                                    task_id, p.executed, p.total, p.matched, p.match_rate * 100.0
                                ),
                                Ok(None) => {}
                                Err(e) => debug!("Progress snapshot failed: {}", e),
                            }
                            false
                        }
                        recv(stop_rx) -> _ => true,
                    };
                    if stop {
                        break;
                    }
                });
            match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("Progress reporter disabled: {}", e);
                    None
                }
            }
        };

        let mut worker_handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let detector = detector.clone();
            let spawned = thread::Builder::new()
                .name(format!("detect-{}", index))
                .spawn(move || {
                    while let Ok((path, fingerprint)) = work_rx.try_recv() {
                        let report = process_image(&detector, path, fingerprint);
                        if result_tx.send(report).is_err() {
                            break;
                        }
                    }
                });
            match spawned {
                Ok(handle) => worker_handles.push(handle),
                Err(e) => warn!("Failed to spawn worker {}: {}", index, e),
            }
        }

        if worker_handles.is_empty() {
            warn!("No worker threads available, detecting on the calling thread");
            while let Ok((path, fingerprint)) = work_rx.try_recv() {
                if result_tx.send(process_image(detector, path, fingerprint)).is_err() {
                    break;
                }
            }
        }
        drop(result_tx);

        for handle in worker_handles {
            if handle.join().is_err() {
                error!("Detection worker terminated abnormally");
            }
        }

        let summary = collector_handle
            .join()
            .map_err(|_| anyhow!("Collector thread panicked"))?;

        if let Some(handle) = reporter_handle {
            let _ = stop_tx.send(());
            let _ = handle.join();
        }
        Ok(summary)
    }

    fn finish(&self, mut stats: BatchStats, counters: &ProgressCounters, start: Instant) -> Result<BatchStats> {
        stats.match_rate = match_rate(stats.matched, stats.total);
        stats.elapsed_ms = start.elapsed().as_millis() as u64;

        self.db.finish_task(&stats)?;
        if let Err(e) = counters.set_status(stats.status) {
            warn!("Failed to publish final status: {}", e);
        }

        info!(
            "Task {} {}: {}/{} executed, success={} fail={} exception={} cache_hit={} matched={} ({:.1}%) in {} ms",
            stats.task_id,
            stats.status.as_str(),
            stats.executed,
            stats.total,
            stats.success,
            stats.fail,
            stats.exception,
            stats.cache_hit,
            stats.matched,
            stats.match_rate * 100.0,
            stats.elapsed_ms
        );
        Ok(stats)
    }
}

/// Detect one image, turning a panic into an `exception` report
fn process_image(detector: &MultiRoundDetector, path: PathBuf, fingerprint: ImageFingerprint) -> WorkerReport {
    let outcome = catch_unwind(AssertUnwindSafe(|| detector.detect_path(&path, &fingerprint)))
        .unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            Err(DetectError::Unexpected(message))
        });
    WorkerReport {
        image_path: path,
        fingerprint,
        outcome,
    }
}

/// Single-worker mode: no threads, no queues
fn run_inline(
    detector: &MultiRoundDetector,
    misses: Vec<(PathBuf, ImageFingerprint)>,
    mut collector: Collector,
) -> CollectorSummary {
    for (path, fingerprint) in misses {
        collector.push(process_image(detector, path, fingerprint));
    }
    collector.finish()
}

/// Workers that fit in free accelerator memory, if an NVIDIA GPU is present
fn gpu_worker_budget(per_worker_mb: u64) -> Option<usize> {
    if per_worker_mb == 0 {
        return None;
    }

    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let free_mb: u64 = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<u64>().ok())
        .sum();
    let workers = (free_mb / per_worker_mb) as usize;
    debug!("GPU free memory {} MB -> {} worker(s)", free_mb, workers);
    (workers > 0).then_some(workers)
}

/// Screenshots under `dir` (recursive), sorted by path
pub fn collect_images(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("{:?} is not a directory", dir);
    }

    let mut images = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current).with_context(|| format!("Cannot read {:?}", current))? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| extensions.iter().any(|wanted| wanted.eq_ignore_ascii_case(e)))
                .unwrap_or(false);
            if matches {
                images.push(path);
            }
        }
    }

    images.sort();
    Ok(images)
}
