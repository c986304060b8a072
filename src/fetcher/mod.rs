//! Fetcher: turns a video id into a staged audio file and advances the job.
//!
//! The actual resolver is an external collaborator behind the
//! [`MediaSource`] trait; production uses yt-dlp for URL resolution and
//! streams the bytes here, so download progress (0..=25, linear in bytes
//! received) and failure cleanup live in one place. Tests plug in an
//! in-memory source.
//!
//! On any failure the job effectively disappears: a one-line log is
//! written, partial files are removed, and the row is deleted.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::SqlitePool;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::jobs::{self, Status};
use crate::orchestrator::sanitize_title;
use crate::storage::Storage;

/// Fetch-specific failure kinds.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The resolver could not produce a media stream
    #[error("resolver failed: {0}")]
    Resolve(String),

    /// The media host answered with a non-success status
    #[error("http error {status}")]
    Status { status: u16 },

    /// Transport-level failure
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The download finished but produced no bytes
    #[error("download produced no audio")]
    NoAudio,
}

/// A resolved, ready-to-stream media download.
pub struct ResolvedMedia {
    /// File extension for the staging file (no dot)
    pub ext: String,
    /// Title reported by the source, if any
    pub title: Option<String>,
    /// Total size when the source knows it
    pub total_bytes: Option<u64>,
    /// The audio byte stream
    pub stream: BoxStream<'static, Result<Vec<u8>, FetchError>>,
}

/// External video-to-audio resolver.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open(&self, video_id: &str) -> Result<ResolvedMedia, FetchError>;
}

/// Production resolver: yt-dlp for metadata/URL, reqwest for the bytes.
pub struct YtDlpSource {
    client: reqwest::Client,
    binary: String,
}

impl YtDlpSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            binary: "yt-dlp".to_string(),
        }
    }
}

impl Default for YtDlpSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for YtDlpSource {
    async fn open(&self, video_id: &str) -> Result<ResolvedMedia, FetchError> {
        let url = format!("https://www.youtube.com/watch?v={video_id}");
        let output = tokio::process::Command::new(&self.binary)
            .args(["-J", "--no-playlist", "-f", "bestaudio/best", &url])
            .output()
            .await
            .map_err(|e| FetchError::Resolve(format!("failed to run yt-dlp: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::Resolve(
                stderr.lines().last().unwrap_or("yt-dlp failed").to_string(),
            ));
        }

        let info: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| FetchError::Resolve(format!("unreadable yt-dlp output: {e}")))?;
        let media_url = info["url"]
            .as_str()
            .or_else(|| info["requested_downloads"][0]["url"].as_str())
            .ok_or_else(|| FetchError::Resolve("no media url in yt-dlp output".into()))?
            .to_string();
        let ext = info["ext"]
            .as_str()
            .or_else(|| info["requested_downloads"][0]["ext"].as_str())
            .unwrap_or("m4a")
            .to_string();
        let title = info["title"].as_str().map(|s| s.to_string());
        let total_bytes = info["filesize"]
            .as_u64()
            .or_else(|| info["filesize_approx"].as_u64());

        let response = self.client.get(&media_url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
            });
        }
        let total_bytes = total_bytes.or(response.content_length());
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(FetchError::from))
            .boxed();

        Ok(ResolvedMedia {
            ext,
            title,
            total_bytes,
            stream,
        })
    }
}

/// Drives downloads for `downloading` jobs.
#[derive(Clone)]
pub struct Fetcher {
    pool: SqlitePool,
    storage: Storage,
    source: Arc<dyn MediaSource>,
}

impl Fetcher {
    pub fn new(pool: SqlitePool, storage: Storage, source: Arc<dyn MediaSource>) -> Self {
        Self {
            pool,
            storage,
            source,
        }
    }

    /// Download audio for one job and advance it to `queued`.
    ///
    /// Any failure cleans up and deletes the row; this method never
    /// surfaces an error to the caller because there is no caller left —
    /// it runs as a spawned background task.
    pub async fn run(&self, job_id: &str, video_id: &str) {
        if let Err(e) = self.fetch(job_id, video_id).await {
            self.cleanup_failure(job_id, &e.to_string()).await;
        }
    }

    async fn fetch(&self, job_id: &str, video_id: &str) -> Result<(), FetchError> {
        let media = self.source.open(video_id).await?;
        let rel_path = self.storage.audio_rel(job_id, &media.ext);
        let abs_path = self.storage.root().join(&rel_path);
        let received = self.download(&abs_path, media.stream, media.total_bytes, job_id).await?;
        if received == 0 {
            return Err(FetchError::NoAudio);
        }

        jobs::set_input_path(&self.pool, job_id, &rel_path.to_string_lossy())
            .await
            .map_err(db_error)?;

        // User-supplied jobs without a title inherit the source title
        if let Some(job) = jobs::get_job(&self.pool, job_id).await.map_err(db_error)? {
            let untitled = job
                .track_title
                .as_deref()
                .is_none_or(|title| title.is_empty());
            if job.is_user_supplied && untitled {
                if let Some(title) = &media.title {
                    jobs::update_metadata(&self.pool, job_id, Some(&sanitize_title(title)), Some(""))
                        .await
                        .map_err(db_error)?;
                }
            }
        }

        jobs::set_progress(&self.pool, job_id, 25)
            .await
            .map_err(db_error)?;
        jobs::set_status(&self.pool, job_id, Status::Queued, None)
            .await
            .map_err(db_error)?;
        info!(job = %job_id, "Audio fetched and queued");
        Ok(())
    }

    /// Stream the download to disk, pushing quantized progress (0..=25).
    async fn download(
        &self,
        path: &PathBuf,
        mut stream: BoxStream<'static, Result<Vec<u8>, FetchError>>,
        total_bytes: Option<u64>,
        job_id: &str,
    ) -> Result<u64, FetchError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        let mut received: u64 = 0;
        let mut last_progress: i64 = -1;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(total) = total_bytes.filter(|&t| t > 0) {
                let ratio = (received as f64 / total as f64).clamp(0.0, 1.0);
                let progress = (ratio * 25.0).round() as i64;
                if progress != last_progress {
                    last_progress = progress;
                    let _ = jobs::set_progress(&self.pool, job_id, progress).await;
                }
            }
        }
        file.flush().await?;
        Ok(received)
    }

    /// Log, remove partial files, delete the row.
    async fn cleanup_failure(&self, job_id: &str, message: &str) {
        if let Err(e) = self.storage.write_failure_log(job_id, message) {
            tracing::warn!(job = %job_id, error = %e, "Failed to write failure log");
        }
        self.storage.remove_media(job_id);
        if let Err(e) = jobs::delete_job(&self.pool, job_id).await {
            tracing::warn!(job = %job_id, error = %e, "Failed to delete job row");
        }
        info!(job = %job_id, error = %message, "Fetch failed, job removed");
    }
}

fn db_error(e: sqlx::Error) -> FetchError {
    FetchError::Resolve(format!("job store update failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::NewJob;
    use crate::test_utils::{MockSource, temp_pool, temp_storage};

    async fn downloading_job(pool: &SqlitePool, id: &str, user_supplied: bool) {
        jobs::create_job(
            pool,
            NewJob {
                id: id.to_string(),
                status: Some(Status::Downloading),
                input_path: String::new(),
                output_path: format!("analysis/{id}.json"),
                youtube_id: Some("vid123".to_string()),
                is_user_supplied: user_supplied,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn successful_fetch_queues_job() {
        let (pool, _db_dir) = temp_pool().await;
        let (storage, _dir) = temp_storage();
        downloading_job(&pool, "fetch1", false).await;

        let source = MockSource::with_bytes(vec![1u8; 4096], Some(4096));
        let fetcher = Fetcher::new(pool.clone(), storage.clone(), Arc::new(source));
        fetcher.run("fetch1", "vid123").await;

        let job = jobs::get_job(&pool, "fetch1").await.unwrap().unwrap();
        assert_eq!(job.status, Status::Queued);
        assert_eq!(job.progress, 25);
        assert_eq!(job.input_path, "audio/fetch1.m4a");
        let audio = storage.root().join(&job.input_path);
        assert_eq!(std::fs::read(audio).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn unknown_total_still_completes_at_25() {
        let (pool, _db_dir) = temp_pool().await;
        let (storage, _dir) = temp_storage();
        downloading_job(&pool, "fetch2", false).await;

        let source = MockSource::with_bytes(vec![7u8; 1000], None);
        let fetcher = Fetcher::new(pool.clone(), storage, Arc::new(source));
        fetcher.run("fetch2", "vid123").await;

        let job = jobs::get_job(&pool, "fetch2").await.unwrap().unwrap();
        assert_eq!(job.status, Status::Queued);
        assert_eq!(job.progress, 25);
    }

    #[tokio::test]
    async fn failed_stream_removes_job_and_writes_log() {
        let (pool, _db_dir) = temp_pool().await;
        let (storage, _dir) = temp_storage();
        downloading_job(&pool, "fetch3", false).await;

        let source = MockSource::failing("video unavailable");
        let fetcher = Fetcher::new(pool.clone(), storage.clone(), Arc::new(source));
        fetcher.run("fetch3", "vid123").await;

        assert!(jobs::get_job(&pool, "fetch3").await.unwrap().is_none());
        assert!(!storage.audio_dir().join("fetch3.m4a").exists());
        let log = std::fs::read_to_string(storage.log_path("fetch3")).unwrap();
        assert!(log.contains("video unavailable"));
    }

    #[tokio::test]
    async fn empty_download_is_a_failure() {
        let (pool, _db_dir) = temp_pool().await;
        let (storage, _dir) = temp_storage();
        downloading_job(&pool, "fetch4", false).await;

        let source = MockSource::with_bytes(Vec::new(), Some(0));
        let fetcher = Fetcher::new(pool.clone(), storage.clone(), Arc::new(source));
        fetcher.run("fetch4", "vid123").await;

        assert!(jobs::get_job(&pool, "fetch4").await.unwrap().is_none());
        assert!(storage.log_path("fetch4").exists());
    }

    #[tokio::test]
    async fn user_supplied_job_inherits_source_title() {
        let (pool, _db_dir) = temp_pool().await;
        let (storage, _dir) = temp_storage();
        downloading_job(&pool, "fetch5", true).await;

        let source =
            MockSource::with_bytes(vec![1u8; 100], Some(100)).titled("My_Favorite--Song");
        let fetcher = Fetcher::new(pool.clone(), storage, Arc::new(source));
        fetcher.run("fetch5", "vid123").await;

        let job = jobs::get_job(&pool, "fetch5").await.unwrap().unwrap();
        assert_eq!(job.track_title.as_deref(), Some("My Favorite Song"));
        assert_eq!(job.track_artist.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn organic_job_keeps_caller_metadata() {
        let (pool, _db_dir) = temp_pool().await;
        let (storage, _dir) = temp_storage();
        jobs::create_job(
            &pool,
            NewJob {
                id: "fetch6".to_string(),
                status: Some(Status::Downloading),
                output_path: "analysis/fetch6.json".to_string(),
                track_title: Some("Given Title".to_string()),
                track_artist: Some("Given Artist".to_string()),
                youtube_id: Some("vid123".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let source = MockSource::with_bytes(vec![1u8; 100], Some(100)).titled("Source Title");
        let fetcher = Fetcher::new(pool.clone(), storage, Arc::new(source));
        fetcher.run("fetch6", "vid123").await;

        let job = jobs::get_job(&pool, "fetch6").await.unwrap().unwrap();
        assert_eq!(job.track_title.as_deref(), Some("Given Title"));
        assert_eq!(job.track_artist.as_deref(), Some("Given Artist"));
    }
}
