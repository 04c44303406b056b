//! Application Coordinator
//!
//! Owns the process-wide resources (database, engine pool, progress
//! store) and hands them to the batch executor and verification engine.
//! Constructed once by the entry point and passed around by reference.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::batch::{collect_images, BatchExecutor, InMemoryProgressStore, ProgressStore};
use crate::cache::{ResultCache, VerificationEngine, VerificationReport};
use crate::config::AppConfig;
use crate::detection::DetectionSettings;
use crate::engine::{CommandEngineFactory, EngineFactory, EngineInstancePool};
use crate::shared::{BatchStats, Correction, Progress, ResultRecord, Task};
use crate::storage::{get_data_dir, Database};

/// Main application coordinator
pub struct LangScanApp {
    config: AppConfig,
    db: Arc<Database>,
    pool: Arc<EngineInstancePool>,
    executor: BatchExecutor,
}

impl LangScanApp {
    /// Open the configured database and engine adapter
    pub fn new(config: AppConfig) -> Result<Self> {
        let db_path = match &config.storage.database_path {
            Some(path) => path.clone(),
            None => get_data_dir()?.join("langscan.db"),
        };
        let db = Database::open(&db_path)
            .with_context(|| format!("Failed to open database {:?}", db_path))?;

        let factory = CommandEngineFactory::new(config.engine.program.clone(), config.engine.args.clone());
        Ok(Self::with_resources(
            config,
            Arc::new(db),
            Arc::new(factory),
            Arc::new(InMemoryProgressStore::new()),
        ))
    }

    /// Assemble from explicit resources
    pub fn with_resources(
        config: AppConfig,
        db: Arc<Database>,
        factory: Arc<dyn EngineFactory>,
        progress: Arc<dyn ProgressStore>,
    ) -> Self {
        let pool = Arc::new(EngineInstancePool::with_capacity(factory, config.engine.pool_capacity));
        let executor = BatchExecutor::new(db.clone(), pool.clone(), progress, config.batch.clone());
        Self {
            config,
            db,
            pool,
            executor,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Create a pending task
    pub fn create_task(&self, name: &str) -> Result<Task> {
        Ok(self.db.create_task(name)?)
    }

    /// Run a batch for an existing task
    pub fn run_batch(
        &self,
        task_id: &str,
        image_paths: &[PathBuf],
        settings: &DetectionSettings,
    ) -> Result<BatchStats> {
        self.executor.run(task_id, image_paths, settings)
    }

    /// Create a task for every screenshot under `dir` and run it
    pub fn run_directory(&self, name: &str, dir: &Path, settings: &DetectionSettings) -> Result<BatchStats> {
        let images = collect_images(dir, &self.config.general.image_extensions)?;
        let task = self.create_task(name)?;
        info!("Created task {} ({}) for {} images in {:?}", task.id, name, images.len(), dir);
        self.run_batch(&task.id, &images, settings)
    }

    /// Live or persisted progress of a task
    pub fn get_progress(&self, task_id: &str) -> Result<Option<Progress>> {
        self.executor.get_progress(task_id)
    }

    /// Apply human corrections
    pub fn verify(&self, task_id: &str, corrections: &[Correction]) -> Result<VerificationReport> {
        Ok(VerificationEngine::new(self.db.clone()).verify(task_id, corrections)?)
    }

    /// A task's full result set in export form
    pub fn task_results(&self, task_id: &str) -> Result<Vec<ResultRecord>> {
        let results = ResultCache::new(self.db.clone()).task_results(task_id)?;
        Ok(results.iter().map(|r| r.to_record()).collect())
    }

    /// All tasks, newest first
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.db.list_tasks()?)
    }

    /// Drop every pooled engine handle
    pub fn reset_engines(&self) {
        self.pool.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{detection, FakeFactory};
    use crate::shared::{TaskStatus, VerifyOutcome};
    use tempfile::tempdir;

    fn app(factory: FakeFactory) -> LangScanApp {
        let mut config = AppConfig::default();
        config.batch.max_workers = Some(2);
        LangScanApp::with_resources(
            config,
            Arc::new(Database::open_in_memory().unwrap()),
            Arc::new(factory),
            Arc::new(InMemoryProgressStore::new()),
        )
    }

    #[test]
    fn test_directory_run_and_correction() {
        let dir = tempdir().unwrap();
        for i in 0..3u8 {
            image::RgbImage::from_pixel(8, 8, image::Rgb([i, 0, 0]))
                .save(dir.path().join(format!("shot-{}.png", i)))
                .unwrap();
        }
        let app = app(FakeFactory::returning(vec![detection("重新开姑", 0.95)]));
        let settings = app.config().detection_settings();

        let stats = app.run_directory("smoke", dir.path(), &settings).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.matched, 3);

        let progress = app.get_progress(&stats.task_id).unwrap().unwrap();
        assert_eq!(progress.status, TaskStatus::Completed);

        let records = app.task_results(&stats.task_id).unwrap();
        assert_eq!(records.len(), 3);

        let report = app
            .verify(
                &stats.task_id,
                &[Correction {
                    result_id: records[0].id,
                    outcome: VerifyOutcome::Incorrect,
                    corrected_texts: Some(vec!["重新开始".to_string()]),
                }],
            )
            .unwrap();
        assert_eq!(report.shadows_created, 1);

        let tasks = app.list_tasks().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].verified_count, 1);
    }

    #[test]
    fn test_reset_engines() {
        let dir = tempdir().unwrap();
        image::RgbImage::new(8, 8).save(dir.path().join("a.png")).unwrap();
        let app = app(FakeFactory::returning(Vec::new()));
        let settings = app.config().detection_settings();

        app.run_directory("once", dir.path(), &settings).unwrap();
        assert!(!app.pool.is_empty());

        app.reset_engines();
        assert!(app.pool.is_empty());
    }
}
