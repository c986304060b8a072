//! Worker: claims queued jobs and runs the analysis engine over them.
//!
//! The engine is linked, not a subprocess: analysis runs on a blocking
//! thread with a progress callback, and its 50..=100 scale is remapped
//! onto the job's progress column (26..=100; the download owns 0..=25).
//! A quiet engine still shows liveness through a small idle bump toward
//! the wait ceiling.
//!
//! Failures never leave `processing` rows behind: the error is logged to
//! `logs/<id>.log`, staging audio and any partial artifact are removed,
//! and the row is deleted.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlx::SqlitePool;
use tokio::time::Instant;
use tracing::{error, info};

use crate::analysis::Analyzer;
use crate::error::{Error, Result};
use crate::jobs::{self, Job, Status};
use crate::storage::Storage;

/// First progress value a processing job shows (download owns 0..=25).
const PROGRESS_START: i64 = 26;
/// Ceiling for idle bumps while the engine is quiet.
const PROGRESS_WAIT: i64 = 63;
/// Engine silence before a bump, in seconds.
const BUMP_IDLE_S: u64 = 3;

/// A single polling worker loop.
pub struct Worker {
    pool: SqlitePool,
    storage: Storage,
    analyzer: Arc<Analyzer>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        pool: SqlitePool,
        storage: Storage,
        analyzer: Arc<Analyzer>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            storage,
            analyzer,
            poll_interval,
        }
    }

    /// Poll forever, sleeping between empty claims.
    pub async fn run(&self) {
        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    error!(error = %e, "Worker iteration failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Claim and process at most one job. Returns whether one was claimed.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = jobs::claim_next(&self.pool).await? else {
            return Ok(false);
        };
        info!(job = %job.id, "Claimed job");
        if let Err(e) = self.process(&job).await {
            self.cleanup_failure(&job, &e).await;
            return Ok(true);
        }
        info!(job = %job.id, "Analysis complete");
        Ok(true)
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let input = self.resolve_input(job)?;
        let output = self.storage.root().join(&job.output_path);

        jobs::set_progress(&self.pool, &job.id, PROGRESS_START).await?;

        // Engine progress flows through a channel: the callback runs on the
        // blocking thread, the drainer writes the job row.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<i64>();
        let state = Arc::new(Mutex::new((PROGRESS_START, Instant::now())));

        let drain_pool = self.pool.clone();
        let drain_id = job.id.clone();
        let drain_state = Arc::clone(&state);
        let drainer = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                {
                    let mut state = drain_state.lock();
                    state.0 = progress;
                    state.1 = Instant::now();
                }
                let _ = jobs::set_progress(&drain_pool, &drain_id, progress).await;
            }
        });

        let bump_pool = self.pool.clone();
        let bump_id = job.id.clone();
        let bump_state = Arc::clone(&state);
        let bumper = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let (current, last_update) = *bump_state.lock();
                if current >= PROGRESS_WAIT {
                    break;
                }
                if last_update.elapsed() >= Duration::from_secs(BUMP_IDLE_S) {
                    let next = (current + 1).min(PROGRESS_WAIT);
                    {
                        let mut state = bump_state.lock();
                        state.0 = next;
                        state.1 = Instant::now();
                    }
                    let _ = jobs::set_progress(&bump_pool, &bump_id, next).await;
                }
            }
        });

        let analyzer = Arc::clone(&self.analyzer);
        let input_for_engine = input.clone();
        let result = tokio::task::spawn_blocking(move || {
            let callback = move |percent: u8, _stage: &str| {
                let _ = tx.send(map_engine_progress(percent));
            };
            analyzer.analyze(&input_for_engine, Some(&callback))
        })
        .await
        .map_err(|e| Error::analysis(format!("engine task panicked: {e}")))?;
        bumper.abort();
        let _ = drainer.await;

        let mut analysis = result?;
        analysis.overlay_track_metadata(job.track_title.as_deref(), job.track_artist.as_deref());

        let json = analysis
            .to_json()
            .map_err(|e| Error::analysis(format!("artifact serialization failed: {e}")))?;
        self.storage.write_atomic(&output, json.as_bytes())?;

        jobs::set_progress(&self.pool, &job.id, 100).await?;
        jobs::set_status(&self.pool, &job.id, Status::Complete, None).await?;
        Ok(())
    }

    /// Staged audio for the job, falling back to any `audio/<id>.*` file.
    fn resolve_input(&self, job: &Job) -> Result<std::path::PathBuf> {
        if !job.input_path.is_empty() {
            let path = self.storage.resolve(&job.input_path);
            if path.exists() {
                return Ok(path);
            }
        }
        self.storage
            .find_audio(&job.id)
            .ok_or_else(|| Error::analysis("staging audio is missing"))
    }

    /// Log, scrub files, delete the row.
    async fn cleanup_failure(&self, job: &Job, error: &Error) {
        let message = error.to_string();
        if let Err(e) = self.storage.write_failure_log(&job.id, &message) {
            error!(job = %job.id, error = %e, "Failed to write failure log");
        }
        self.storage.remove_media(&job.id);
        if let Err(e) = jobs::delete_job(&self.pool, &job.id).await {
            error!(job = %job.id, error = %e, "Failed to delete failed job");
        }
        info!(job = %job.id, error = %message, "Job failed and was removed");
    }
}

/// Remap the engine's 50..=100 progress onto the job's 26..=100 span.
fn map_engine_progress(value: u8) -> i64 {
    const ENGINE_START: f64 = 50.0;
    const ENGINE_END: f64 = 100.0;
    let value = value as f64;
    if value <= ENGINE_START {
        return PROGRESS_START;
    }
    if value >= ENGINE_END {
        return 100;
    }
    let scaled = PROGRESS_START as f64
        + (value - ENGINE_START) * (100.0 - PROGRESS_START as f64) / (ENGINE_END - ENGINE_START);
    scaled.round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analysis;
    use crate::config::AnalysisConfig;
    use crate::jobs::NewJob;
    use crate::test_utils::{sine_sweep, temp_pool, temp_storage, write_wav};

    fn test_worker(pool: &SqlitePool, storage: &Storage) -> Worker {
        let analyzer = Analyzer::new(AnalysisConfig::default()).unwrap();
        Worker::new(
            pool.clone(),
            storage.clone(),
            Arc::new(analyzer),
            Duration::from_millis(10),
        )
    }

    async fn staged_job(pool: &SqlitePool, storage: &Storage, id: &str, audio: &[f64]) {
        let rel = storage.audio_rel(id, "wav");
        write_wav(&storage.root().join(&rel), audio, 22050);
        jobs::create_job(
            pool,
            NewJob {
                id: id.to_string(),
                status: Some(Status::Queued),
                input_path: rel.to_string_lossy().into_owned(),
                output_path: storage.analysis_rel(id).to_string_lossy().into_owned(),
                track_title: Some("Stored Title".to_string()),
                track_artist: Some("Stored Artist".to_string()),
                progress: 25,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn idle_worker_claims_nothing() {
        let (pool, _db) = temp_pool().await;
        let (storage, _dir) = temp_storage();
        let worker = test_worker(&pool, &storage);
        assert!(!worker.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn successful_job_produces_artifact() {
        let (pool, _db) = temp_pool().await;
        let (storage, _dir) = temp_storage();
        staged_job(&pool, &storage, "work1", &sine_sweep(110.0, 880.0, 22050, 3.0)).await;

        let worker = test_worker(&pool, &storage);
        assert!(worker.run_once().await.unwrap());

        let job = jobs::get_job(&pool, "work1").await.unwrap().unwrap();
        assert_eq!(job.status, Status::Complete);
        assert_eq!(job.progress, 100);
        assert!(job.error.is_none());

        let artifact_path = storage.root().join(&job.output_path);
        let text = std::fs::read_to_string(&artifact_path).unwrap();
        let analysis: Analysis = serde_json::from_str(&text).unwrap();
        assert!(!analysis.beats.is_empty());
        // Stored metadata overlaid onto the artifact
        assert_eq!(analysis.track.title.as_deref(), Some("Stored Title"));
        assert_eq!(analysis.track.artist.as_deref(), Some("Stored Artist"));
    }

    #[tokio::test]
    async fn engine_failure_scrubs_the_job() {
        let (pool, _db) = temp_pool().await;
        let (storage, _dir) = temp_storage();
        // Garbage bytes that no decoder accepts
        let rel = storage.audio_rel("work2", "wav");
        std::fs::write(storage.root().join(&rel), b"not audio at all").unwrap();
        jobs::create_job(
            &pool,
            NewJob {
                id: "work2".to_string(),
                status: Some(Status::Queued),
                input_path: rel.to_string_lossy().into_owned(),
                output_path: storage.analysis_rel("work2").to_string_lossy().into_owned(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let worker = test_worker(&pool, &storage);
        assert!(worker.run_once().await.unwrap());

        // Row gone, log written, media scrubbed: no processing row survives
        assert!(jobs::get_job(&pool, "work2").await.unwrap().is_none());
        assert!(storage.log_path("work2").exists());
        assert!(!storage.root().join(&rel).exists());
        assert!(!storage.root().join("analysis/work2.json").exists());
    }

    #[tokio::test]
    async fn missing_audio_is_a_failure() {
        let (pool, _db) = temp_pool().await;
        let (storage, _dir) = temp_storage();
        jobs::create_job(
            &pool,
            NewJob {
                id: "work3".to_string(),
                status: Some(Status::Queued),
                input_path: "audio/work3.wav".to_string(),
                output_path: "analysis/work3.json".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let worker = test_worker(&pool, &storage);
        assert!(worker.run_once().await.unwrap());
        assert!(jobs::get_job(&pool, "work3").await.unwrap().is_none());
        let log = std::fs::read_to_string(storage.log_path("work3")).unwrap();
        assert!(log.contains("staging audio is missing"));
    }

    #[tokio::test]
    async fn two_workers_race_for_one_job() {
        let (pool, _db) = temp_pool().await;
        let (storage, _dir) = temp_storage();
        staged_job(&pool, &storage, "race1", &sine_sweep(110.0, 880.0, 22050, 2.0)).await;

        let left = test_worker(&pool, &storage);
        let right = test_worker(&pool, &storage);
        let (a, b) = tokio::join!(left.run_once(), right.run_once());
        let claimed = [a.unwrap(), b.unwrap()];
        assert_eq!(
            claimed.iter().filter(|&&c| c).count(),
            1,
            "exactly one worker claims the job"
        );

        let job = jobs::get_job(&pool, "race1").await.unwrap().unwrap();
        assert_eq!(job.status, Status::Complete);
    }

    #[test]
    fn engine_progress_mapping_spans_api_range() {
        assert_eq!(map_engine_progress(0), PROGRESS_START);
        assert_eq!(map_engine_progress(50), PROGRESS_START);
        assert_eq!(map_engine_progress(100), 100);
        let mid = map_engine_progress(75);
        assert!(mid > PROGRESS_START && mid < 100);
        // Monotone across the whole scale
        let mut prev = 0;
        for v in 0..=100u8 {
            let mapped = map_engine_progress(v);
            assert!(mapped >= prev);
            prev = mapped;
        }
    }
}
