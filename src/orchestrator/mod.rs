//! Orchestrator: translates HTTP-surface intents into job store mutations
//! and builds response payloads.
//!
//! This is the only component that creates jobs. It deduplicates requests
//! by track identity, recycles stalled downloads, gates uploads and
//! user submissions by configuration, and owns the artifact read path
//! (including the in-flight title/artist repair, which is never written
//! back).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::info;

use crate::config::{ALLOWED_UPLOAD_EXTS, Settings};
use crate::error::{Error, Result};
use crate::fetcher::{Fetcher, MediaSource};
use crate::jobs::{self, Job, NewJob, Status, TopTrack};
use crate::storage::Storage;

/// Seconds a `downloading` job may sit idle at full download progress
/// before a dedup lookup recycles it.
const STALE_DOWNLOAD_IDLE_S: i64 = 30;

/// Owner-window for unauthenticated deletes, in minutes.
const OWNER_DELETE_WINDOW_MIN: i64 = 30;

/// Request body for video-id submissions.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CreateVideoRequest {
    pub video_id: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    #[serde(default)]
    pub is_user_supplied: bool,
}

/// Status payload handed back to the HTTP layer.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum StatusPayload {
    /// Job is still moving through the pipeline (202)
    InProgress {
        id: String,
        youtube_id: Option<String>,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<i64>,
        message: String,
    },
    /// Analysis finished; `result` is the artifact (200)
    Complete {
        id: String,
        youtube_id: Option<String>,
        status: String,
        progress: i64,
        result: serde_json::Value,
    },
    /// Terminal failure (200, so players can render the message)
    Failed {
        id: String,
        youtube_id: Option<String>,
        status: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
}

impl StatusPayload {
    /// HTTP status the surface should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            StatusPayload::InProgress { .. } => 202,
            _ => 200,
        }
    }
}

/// Public configuration surfaced to the web app.
#[derive(Debug, Serialize)]
pub struct AppConfig {
    pub allow_user_upload: bool,
    pub allow_user_youtube: bool,
    pub allow_favorites_sync: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_upload_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_upload_exts: Option<Vec<String>>,
}

/// The job lifecycle surface used by the HTTP layer.
#[derive(Clone)]
pub struct JobService {
    pool: SqlitePool,
    storage: Storage,
    settings: Settings,
    fetcher: Fetcher,
}

impl JobService {
    pub fn new(
        pool: SqlitePool,
        storage: Storage,
        settings: Settings,
        source: Arc<dyn MediaSource>,
    ) -> Self {
        let fetcher = Fetcher::new(pool.clone(), storage.clone(), source);
        Self {
            pool,
            storage,
            settings,
            fetcher,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Create (or dedup onto) a job for a video id.
    pub async fn create_from_video(&self, request: CreateVideoRequest) -> Result<StatusPayload> {
        if request.video_id.trim().is_empty() {
            return Err(Error::invalid("video_id is required"));
        }
        if request.is_user_supplied && !self.settings.allow_user_youtube {
            return Err(Error::Forbidden);
        }

        let title = request.title.filter(|t| !t.is_empty());
        let artist = request.artist.filter(|a| !a.is_empty());

        // Dedup by (title, artist) first, then by video id. A row parked in
        // `failed` through the store API never satisfies dedup; the caller
        // gets a fresh job instead.
        if let (Some(title), Some(artist)) = (&title, &artist) {
            if let Some(existing) = self.live_job_by_track(title, artist).await? {
                if existing.status != Status::Failed {
                    return self.job_payload(&existing).await;
                }
            }
        }
        if let Some(existing) = self.live_job_by_video(&request.video_id).await? {
            if existing.status != Status::Failed {
                return self.job_payload(&existing).await;
            }
        }

        let job_id = jobs::new_job_id();
        let output_path = self.storage.analysis_rel(&job_id);
        jobs::create_job(
            &self.pool,
            NewJob {
                id: job_id.clone(),
                status: Some(Status::Downloading),
                input_path: String::new(),
                output_path: output_path.to_string_lossy().into_owned(),
                track_title: title,
                track_artist: artist,
                youtube_id: Some(request.video_id.clone()),
                progress: 0,
                is_user_supplied: request.is_user_supplied,
            },
        )
        .await?;
        info!(job = %job_id, video = %request.video_id, "Created download job");
        self.spawn_fetch(&job_id, &request.video_id);

        Ok(StatusPayload::InProgress {
            id: job_id,
            youtube_id: Some(request.video_id),
            status: Status::Downloading.to_string(),
            progress: None,
            message: progress_message(Status::Downloading, None).to_string(),
        })
    }

    /// Stream an uploaded file into staging and create a queued job.
    pub async fn create_from_upload(
        &self,
        file_name: &str,
        mut body: impl AsyncRead + Unpin,
    ) -> Result<StatusPayload> {
        if !self.settings.allow_user_upload {
            return Err(Error::Forbidden);
        }
        let ext = std::path::Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if !ALLOWED_UPLOAD_EXTS.contains(&ext.as_str()) {
            return Err(Error::invalid(format!(
                "unsupported file extension: {ext:?}"
            )));
        }

        let job_id = jobs::new_job_id();
        let rel_path = self.storage.audio_rel(&job_id, &ext);
        let abs_path = self.storage.root().join(&rel_path);
        if let Some(parent) = abs_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let limit = self.settings.max_upload_bytes;
        let mut file = tokio::fs::File::create(&abs_path).await?;
        let mut written: u64 = 0;
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = body.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            written += read as u64;
            if written > limit {
                drop(file);
                let _ = tokio::fs::remove_file(&abs_path).await;
                return Err(Error::UploadTooLarge { limit });
            }
            tokio::io::AsyncWriteExt::write_all(&mut file, &buffer[..read]).await?;
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;

        let stem = std::path::Path::new(file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("");
        let title = sanitize_title(stem);

        jobs::create_job(
            &self.pool,
            NewJob {
                id: job_id.clone(),
                status: Some(Status::Queued),
                input_path: rel_path.to_string_lossy().into_owned(),
                output_path: self
                    .storage
                    .analysis_rel(&job_id)
                    .to_string_lossy()
                    .into_owned(),
                track_title: Some(title),
                track_artist: Some(String::new()),
                youtube_id: None,
                progress: 25,
                is_user_supplied: true,
            },
        )
        .await?;
        info!(job = %job_id, bytes = written, "Upload staged and queued");

        Ok(StatusPayload::InProgress {
            id: job_id,
            youtube_id: None,
            status: Status::Queued.to_string(),
            progress: None,
            message: progress_message(Status::Queued, None).to_string(),
        })
    }

    /// Status payload for a job id.
    pub async fn status(&self, job_id: &str) -> Result<StatusPayload> {
        let job = jobs::get_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        self.job_payload(&job).await
    }

    /// Reconcile a job whose on-disk artifacts went missing.
    pub async fn repair(&self, job_id: &str) -> Result<StatusPayload> {
        let mut job = jobs::get_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        if job.status.is_active() {
            return self.job_payload(&job).await;
        }

        // Re-adopt a staged file that exists but fell off the row
        let mut audio_path = (!job.input_path.is_empty())
            .then(|| self.storage.resolve(&job.input_path))
            .filter(|p| p.exists());
        if audio_path.is_none() {
            if let Some(found) = self.storage.find_audio(job_id) {
                let rel = std::path::Path::new("audio").join(found.file_name().unwrap_or_default());
                jobs::set_input_path(&self.pool, job_id, &rel.to_string_lossy()).await?;
                job.input_path = rel.to_string_lossy().into_owned();
                audio_path = Some(found);
            }
        }

        let audio_missing = audio_path.is_none();
        let analysis_missing = !self.storage.resolve(&job.output_path).exists();

        if audio_missing {
            let Some(video_id) = job.youtube_id.clone() else {
                return Err(Error::invalid("job has no audio and no video id"));
            };
            jobs::set_progress(&self.pool, job_id, 0).await?;
            jobs::set_status(&self.pool, job_id, Status::Downloading, None).await?;
            self.spawn_fetch(job_id, &video_id);
        } else if analysis_missing {
            jobs::set_progress(&self.pool, job_id, 25).await?;
            jobs::set_status(&self.pool, job_id, Status::Queued, None).await?;
        }

        let job = jobs::get_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        self.job_payload(&job).await
    }

    /// Delete a job and every artifact it owns.
    ///
    /// Allowed with the admin key, or within the owner window (30 minutes
    /// of creation or completion).
    pub async fn delete(&self, job_id: &str, key: Option<&str>) -> Result<()> {
        let job = jobs::get_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        if !self.is_admin(key) && !within_owner_window(&job) {
            return Err(Error::Forbidden);
        }
        self.storage.remove_artifacts(job_id);
        jobs::delete_job(&self.pool, job_id).await?;
        info!(job = %job_id, "Job deleted");
        Ok(())
    }

    /// Public play-count bump.
    pub async fn increment_plays(&self, job_id: &str) -> Result<i64> {
        jobs::increment_plays(&self.pool, job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }

    /// Admin-only play-count overwrite.
    pub async fn set_play_count(&self, job_id: &str, count: i64, key: Option<&str>) -> Result<i64> {
        if !self.is_admin(key) {
            return Err(Error::Forbidden);
        }
        jobs::set_play_count(&self.pool, job_id, count)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }

    pub async fn top_tracks(&self, limit: i64) -> Result<Vec<TopTrack>> {
        Ok(jobs::top_tracks(&self.pool, limit.clamp(1, 50)).await?)
    }

    /// Dedup lookup by video id, recycling stale downloads on the way.
    pub async fn status_by_video(&self, video_id: &str) -> Result<StatusPayload> {
        let job = self
            .live_job_by_video(video_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(video_id.to_string()))?;
        self.job_payload(&job).await
    }

    /// Dedup lookup by (title, artist), recycling stale downloads.
    pub async fn status_by_track(&self, title: &str, artist: &str) -> Result<StatusPayload> {
        if title.is_empty() || artist.is_empty() {
            return Err(Error::invalid("title and artist are required"));
        }
        let job = self
            .live_job_by_track(title, artist)
            .await?
            .ok_or_else(|| Error::JobNotFound(format!("{title} - {artist}")))?;
        self.job_payload(&job).await
    }

    /// Absolute path of a job's staging audio, for raw serving.
    pub async fn audio_path(&self, job_id: &str) -> Result<std::path::PathBuf> {
        let job = jobs::get_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        let path = self.storage.resolve(&job.input_path);
        if job.input_path.is_empty() || !path.exists() {
            return Err(Error::JobNotFound(format!("{job_id} audio")));
        }
        Ok(path)
    }

    /// Absolute path of a job's failure log, for raw serving.
    pub fn log_path(&self, job_id: &str) -> Result<std::path::PathBuf> {
        let path = self.storage.log_path(job_id);
        if !path.exists() {
            return Err(Error::JobNotFound(format!("{job_id} log")));
        }
        Ok(path)
    }

    /// Flags and upload limits for the web app.
    pub fn app_config(&self) -> AppConfig {
        let uploads = self.settings.allow_user_upload;
        AppConfig {
            allow_user_upload: uploads,
            allow_user_youtube: self.settings.allow_user_youtube,
            allow_favorites_sync: self.settings.allow_favorites_sync,
            max_upload_size: uploads.then_some(self.settings.max_upload_bytes),
            allowed_upload_exts: uploads.then(|| {
                let mut exts: Vec<String> =
                    ALLOWED_UPLOAD_EXTS.iter().map(|e| e.to_string()).collect();
                exts.sort();
                exts
            }),
        }
    }

    fn is_admin(&self, key: Option<&str>) -> bool {
        match (&self.settings.admin_key, key) {
            (Some(expected), Some(given)) => expected == given,
            _ => false,
        }
    }

    fn spawn_fetch(&self, job_id: &str, video_id: &str) {
        let fetcher = self.fetcher.clone();
        let job_id = job_id.to_string();
        let video_id = video_id.to_string();
        tokio::spawn(async move {
            fetcher.run(&job_id, &video_id).await;
        });
    }

    async fn live_job_by_video(&self, video_id: &str) -> Result<Option<Job>> {
        let job = jobs::get_job_by_video(&self.pool, video_id).await?;
        self.recycle_if_stale(job).await
    }

    async fn live_job_by_track(&self, title: &str, artist: &str) -> Result<Option<Job>> {
        let job = jobs::get_job_by_track(&self.pool, title, artist).await?;
        self.recycle_if_stale(job).await
    }

    /// Drop a stalled `downloading` job so the caller can start fresh.
    async fn recycle_if_stale(&self, job: Option<Job>) -> Result<Option<Job>> {
        let Some(job) = job else {
            return Ok(None);
        };
        if !self.is_stale_download(&job) {
            return Ok(Some(job));
        }
        info!(job = %job.id, "Recycling stale download");
        jobs::delete_job(&self.pool, &job.id).await?;
        Ok(None)
    }

    fn is_stale_download(&self, job: &Job) -> bool {
        if job.status != Status::Downloading {
            return false;
        }
        if self.storage.log_path(&job.id).exists() {
            return true;
        }
        let Some(updated_at) = parse_timestamp(&job.updated_at) else {
            return false;
        };
        let age = Utc::now().signed_duration_since(updated_at).num_seconds();
        job.progress >= 25 && age > STALE_DOWNLOAD_IDLE_S
    }

    /// Build the status payload for a job row.
    async fn job_payload(&self, job: &Job) -> Result<StatusPayload> {
        if job.status.is_active() {
            let progress = (job.status == Status::Processing).then_some(job.progress);
            return Ok(StatusPayload::InProgress {
                id: job.id.clone(),
                youtube_id: job.youtube_id.clone(),
                status: job.status.to_string(),
                progress,
                message: progress_message(job.status, progress).to_string(),
            });
        }

        // The worker deletes its own failures, so a failed row only exists
        // when something outside it (an operator, another writer) parked one
        // via the store's `set_status`. It still gets the normalized payload.
        if job.status == Status::Failed {
            let (error, error_code) = normalize_error(job.error.as_deref().unwrap_or(""));
            return Ok(StatusPayload::Failed {
                id: job.id.clone(),
                youtube_id: job.youtube_id.clone(),
                status: Status::Failed.to_string(),
                error,
                error_code,
            });
        }

        // Complete: the artifact must exist and parse
        let artifact_path = self.storage.resolve(&job.output_path);
        let text = match tokio::fs::read_to_string(&artifact_path).await {
            Ok(text) => text,
            Err(_) => {
                return Ok(StatusPayload::Failed {
                    id: job.id.clone(),
                    youtube_id: job.youtube_id.clone(),
                    status: Status::Failed.to_string(),
                    error: "Analysis missing".to_string(),
                    error_code: Some("analysis_missing".to_string()),
                });
            }
        };
        let mut result: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| Error::analysis(format!("artifact unreadable: {e}")))?;

        // Repair empty title/artist in flight; never persisted back
        if job.track_title.is_some() || job.track_artist.is_some() {
            let track = result
                .as_object_mut()
                .map(|obj| obj.entry("track").or_insert_with(|| serde_json::json!({})));
            if let Some(serde_json::Value::Object(track)) = track {
                if let Some(title) = job.track_title.as_deref().filter(|t| !t.is_empty()) {
                    if track.get("title").and_then(|v| v.as_str()).is_none_or(str::is_empty) {
                        track.insert("title".into(), serde_json::Value::from(title));
                    }
                }
                if let Some(artist) = job.track_artist.as_deref().filter(|a| !a.is_empty()) {
                    if track.get("artist").and_then(|v| v.as_str()).is_none_or(str::is_empty) {
                        track.insert("artist".into(), serde_json::Value::from(artist));
                    }
                }
            }
        }

        Ok(StatusPayload::Complete {
            id: job.id.clone(),
            youtube_id: job.youtube_id.clone(),
            status: Status::Complete.to_string(),
            progress: job.progress,
            result,
        })
    }
}

/// Coarse user-facing message for an in-progress job.
fn progress_message(status: Status, progress: Option<i64>) -> &'static str {
    match status {
        Status::Downloading => "Fetching audio...",
        Status::Queued => "Queued...",
        Status::Processing => match progress {
            Some(p) if p >= 80 => "Wrapping up...",
            Some(p) if p >= 30 => "Analyzing audio...",
            _ => "Processing audio...",
        },
        _ => "",
    }
}

/// Map a raw failure string onto a small set of user-facing messages.
pub fn normalize_error(raw: &str) -> (String, Option<String>) {
    let lowered = raw.to_lowercase();
    if lowered.contains("engine exited") {
        return (
            "The analysis engine failed to process this track.".to_string(),
            Some("engine_error".to_string()),
        );
    }
    if lowered.contains("video unavailable") {
        return (
            "This video is unavailable.".to_string(),
            Some("video_unavailable".to_string()),
        );
    }
    if lowered.contains("http error 403") || lowered.contains("[download]") {
        return (
            "The download was blocked by the video source.".to_string(),
            Some("download_blocked".to_string()),
        );
    }
    if lowered.contains("sign in to confirm") {
        return (
            "The video source is rate-limiting requests. Please try again later.".to_string(),
            Some("rate_limited".to_string()),
        );
    }
    ("Analysis failed for this track.".to_string(), None)
}

/// Clean a user- or source-provided title for display and dedup.
///
/// Underscores and dashes become spaces, control characters are stripped,
/// whitespace collapses, and the result is trimmed to 200 characters
/// (`"Untitled"` when nothing survives).
pub fn sanitize_title(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| match c {
            '_' | '-' => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed: String = collapsed.chars().take(200).collect();
    if trimmed.is_empty() {
        "Untitled".to_string()
    } else {
        trimmed
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Whether the job was created or completed recently enough for an
/// unauthenticated delete.
fn within_owner_window(job: &Job) -> bool {
    let window = chrono::Duration::minutes(OWNER_DELETE_WINDOW_MIN);
    let now = Utc::now();
    if let Some(created) = parse_timestamp(&job.created_at) {
        if now.signed_duration_since(created) <= window {
            return true;
        }
    }
    if job.status == Status::Complete {
        if let Some(updated) = parse_timestamp(&job.updated_at) {
            if now.signed_duration_since(updated) <= window {
                return true;
            }
        }
    }
    false
}
