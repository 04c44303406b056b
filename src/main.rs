//! LangScan - batch target-language text detection for game QA screenshots

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use langscan::config::{self, AppConfig};
use langscan::detection::DetectionSettings;
use langscan::shared::Correction;
use langscan::storage::{self, load_profile};
use langscan::LangScanApp;

/// LangScan - find target-language text in game screenshots
#[derive(Parser, Debug)]
#[command(name = "langscan")]
#[command(about = "Batch target-language text detection for game QA screenshots")]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect every screenshot in a directory
    Run {
        /// Directory scanned recursively for images
        dir: PathBuf,

        /// Task name (defaults to the directory name)
        #[arg(short, long)]
        name: Option<String>,

        /// Fixed number of detection workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Detection profile (JSON) replacing the configured schedule
        #[arg(short, long)]
        profile: Option<PathBuf>,

        /// Detect every image even if its fingerprint is cached
        #[arg(long)]
        no_cache: bool,
    },

    /// Show progress of a task
    Progress {
        task: String,
    },

    /// Apply a JSON file of corrections to a task's results
    Verify {
        task: String,
        corrections: PathBuf,
    },

    /// Print a task's results as JSON
    Results {
        task: String,
    },

    /// List tasks
    Tasks,

    /// Write the default configuration file
    InitConfig,
}

fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    match args.command {
        Command::InitConfig => init_config(args.config),
        command => {
            let config = load_or_create_config(args.config.as_deref())?;
            run_command(command, config)
        }
    }
}

fn run_command(command: Command, mut config: AppConfig) -> Result<()> {
    match command {
        Command::Run {
            dir,
            name,
            workers,
            profile,
            no_cache,
        } => {
            if workers.is_some() {
                config.batch.max_workers = workers;
            }
            if no_cache {
                config.batch.use_cache = false;
            }
            let settings = match profile {
                Some(path) => {
                    let profile = load_profile(&path)
                        .with_context(|| format!("Failed to load profile {:?}", path))?;
                    info!("Using detection profile {} ({})", profile.name, profile.id);
                    DetectionSettings::from(&profile)
                }
                None => config.detection_settings(),
            };
            let name = name.unwrap_or_else(|| {
                dir.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "batch".to_string())
            });

            let app = LangScanApp::new(config)?;
            let stats = app.run_directory(&name, &dir, &settings)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Progress { task } => {
            let app = LangScanApp::new(config)?;
            match app.get_progress(&task)? {
                Some(progress) => println!("{}", serde_json::to_string_pretty(&progress)?),
                None => anyhow::bail!("Unknown task {}", task),
            }
        }
        Command::Verify { task, corrections } => {
            let content = std::fs::read_to_string(&corrections)
                .with_context(|| format!("Failed to read {:?}", corrections))?;
            let corrections: Vec<Correction> = serde_json::from_str(&content)?;

            let app = LangScanApp::new(config)?;
            let report = app.verify(&task, &corrections)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Results { task } => {
            let app = LangScanApp::new(config)?;
            let records = app.task_results(&task)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Tasks => {
            let app = LangScanApp::new(config)?;
            for task in app.list_tasks()? {
                println!(
                    "{}  {:<9}  {:>5}/{:<5}  matched={:<5} verified={:<5} {}",
                    task.id,
                    task.status.as_str(),
                    task.executed,
                    task.total,
                    task.matched,
                    task.verified_count,
                    task.name
                );
            }
        }
        Command::InitConfig => init_config(None)?,
    }

    Ok(())
}

/// Default config file location
fn default_config_path() -> Result<PathBuf> {
    Ok(storage::get_config_dir()?.join("config.toml"))
}

/// Load configuration from file or fall back to defaults
fn load_or_create_config(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        let config = config::load_config(path)
            .with_context(|| format!("Failed to load configuration {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(config_path) = default_config_path() {
        if config_path.exists() {
            let config = config::load_config(&config_path)?;
            info!("Loaded configuration from {:?}", config_path);
            return Ok(config);
        }
    }
    info!("Using default configuration");
    Ok(AppConfig::default())
}

fn init_config(explicit: Option<PathBuf>) -> Result<()> {
    let path = match explicit {
        Some(path) => path,
        None => default_config_path()?,
    };
    if path.exists() {
        anyhow::bail!("{:?} already exists", path);
    }
    config::save_config(&AppConfig::default(), &path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
