//! Track Minder - analysis job runner for an endless-jukebox player.
//!
//! Ingests recorded music (uploads or fetched video audio) and produces a
//! hierarchical musical analysis artifact: sections, bars, beats, tatums,
//! and short timbral/harmonic segments. The HTTP surface lives elsewhere
//! and drives the [`orchestrator::JobService`]; this binary hosts the
//! worker loop and a standalone analyzer command.

pub mod analysis;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod jobs;
pub mod orchestrator;
pub mod storage;
#[cfg(test)]
pub mod test_utils;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::analysis::Analyzer;
use crate::config::{AnalysisConfig, Calibration, Settings};
use crate::storage::Storage;
use crate::worker::Worker;

#[derive(Parser)]
#[command(name = "track-minder", about = "Musical analysis job runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the polling worker loop against the shared storage tree
    Worker {
        /// Number of concurrent worker loops
        #[arg(long, env = "WORKER_COUNT", default_value_t = 1)]
        workers: usize,
    },
    /// Analyze a single audio file and write the artifact JSON
    Analyze {
        /// Path to the input audio (wav/mp3/m4a/...)
        input: PathBuf,
        /// Path for the output JSON (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Path to a calibration JSON bundle
        #[arg(long)]
        calibration: Option<PathBuf>,
        /// Emit PROGRESS:<percent>:<stage> lines on stdout
        #[arg(long)]
        progress: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::from_default_env().add_directive("track_minder=info".parse().unwrap()))
        .init();

    match Cli::parse().command {
        Commands::Worker { workers } => run_workers(workers).await,
        Commands::Analyze {
            input,
            output,
            calibration,
            progress,
        } => run_analyze(input, output, calibration, progress),
    }
}

async fn run_workers(workers: usize) -> anyhow::Result<()> {
    let settings = Settings::from_env();
    let workers = workers.max(1);

    // Pin the numeric thread pool once at startup: each worker loop gets
    // an equal share of the cores.
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let threads = (cores / workers).max(1);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .context("Failed to configure the numeric thread pool")?;

    let storage = Storage::new(settings.storage_root.clone());
    storage.ensure_layout().context("Failed to create storage layout")?;
    let pool = jobs::init_db(&settings.db_url())
        .await
        .context("Failed to open the job store")?;

    let analyzer = Arc::new(Analyzer::new(AnalysisConfig::from_env())?);
    let poll = Duration::from_secs_f64(settings.poll_interval_s.max(0.1));

    tracing::info!(workers, threads_per_worker = threads, "Starting worker loops");
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let worker = Worker::new(
            pool.clone(),
            storage.clone(),
            Arc::clone(&analyzer),
            poll,
        );
        handles.push(tokio::spawn(async move { worker.run().await }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

fn run_analyze(
    input: PathBuf,
    output: Option<PathBuf>,
    calibration: Option<PathBuf>,
    progress: bool,
) -> anyhow::Result<()> {
    let mut analyzer = Analyzer::new(AnalysisConfig::from_env())?;
    if let Some(path) = calibration {
        let bundle = Calibration::load(&path)
            .with_context(|| format!("Failed to load calibration bundle {}", path.display()))?;
        analyzer = analyzer.with_calibration(bundle)?;
    }

    let progress_printer = |percent: u8, stage: &str| {
        println!("PROGRESS:{percent}:{stage}");
    };
    let callback: Option<analysis::ProgressFn> = progress.then_some(&progress_printer);

    let artifact = analyzer.analyze(&input, callback)?;
    let json = artifact.to_json()?;
    match output {
        Some(path) => {
            std::fs::write(&path, &json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        None => println!("{json}"),
    }
    Ok(())
}
