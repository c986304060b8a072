//! Test utilities and fixtures for track-minder tests.
//!
//! Provides temp job stores and storage trees, synthetic audio
//! generators, a WAV writer, and a mock media source so fetcher and
//! orchestrator tests never touch the network.

use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::sqlite::SqlitePool;
use tempfile::TempDir;

use crate::fetcher::{FetchError, MediaSource, ResolvedMedia};
use crate::jobs::{NewJob, Status};
use crate::storage::Storage;

/// Temporary job store with migrations applied.
///
/// Keep the `TempDir` alive for the duration of the test.
pub async fn temp_pool() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let db_path = dir.path().join("jobs.db");
    let db_url = format!("sqlite:{}", db_path.display());
    let pool = crate::jobs::init_db(&db_url)
        .await
        .expect("Failed to initialize test job store");
    (pool, dir)
}

/// Temporary storage tree with the standard layout created.
pub fn temp_storage() -> (Storage, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let storage = Storage::new(dir.path());
    storage.ensure_layout().expect("Failed to create layout");
    (storage, dir)
}

/// A minimal queued job for store tests.
pub fn queued_job(id: &str) -> NewJob {
    NewJob {
        id: id.to_string(),
        status: Some(Status::Queued),
        input_path: format!("audio/{id}.wav"),
        output_path: format!("analysis/{id}.json"),
        ..Default::default()
    }
}

/// A pure tone at the given frequency (amplitude 0.8).
pub fn sine_wave(freq: f64, sr: u32, seconds: f64) -> Vec<f64> {
    let count = (sr as f64 * seconds) as usize;
    (0..count)
        .map(|i| {
            let t = i as f64 / sr as f64;
            0.8 * (2.0 * std::f64::consts::PI * freq * t).sin()
        })
        .collect()
}

/// Two tones back to back: `f1` for the first half, `f2` for the second.
pub fn two_tone(f1: f64, f2: f64, sr: u32, seconds: f64) -> Vec<f64> {
    let count = (sr as f64 * seconds) as usize;
    let half = count / 2;
    (0..count)
        .map(|i| {
            let t = i as f64 / sr as f64;
            let freq = if i < half { f1 } else { f2 };
            0.8 * (2.0 * std::f64::consts::PI * freq * t).sin()
        })
        .collect()
}

/// A linear sine sweep from `f0` to `f1`.
pub fn sine_sweep(f0: f64, f1: f64, sr: u32, seconds: f64) -> Vec<f64> {
    let count = (sr as f64 * seconds) as usize;
    let rate = (f1 - f0) / seconds;
    (0..count)
        .map(|i| {
            let t = i as f64 / sr as f64;
            let phase = 2.0 * std::f64::consts::PI * (f0 * t + 0.5 * rate * t * t);
            0.8 * phase.sin()
        })
        .collect()
}

/// Write mono samples as a 16-bit PCM WAV file.
pub fn write_wav(path: &Path, samples: &[f64], sr: u32) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    let data_len = (samples.len() * 2) as u32;
    let mut bytes = Vec::with_capacity(44 + samples.len() * 2);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVE");
    bytes.extend_from_slice(b"fmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
    bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
    bytes.extend_from_slice(&sr.to_le_bytes());
    bytes.extend_from_slice(&(sr * 2).to_le_bytes()); // byte rate
    bytes.extend_from_slice(&2u16.to_le_bytes()); // block align
    bytes.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    std::fs::write(path, bytes).expect("Failed to write wav");
}

enum MockMode {
    Bytes { data: Vec<u8>, total: Option<u64> },
    Failing(String),
    Pending,
}

/// In-memory [`MediaSource`] for fetcher and orchestrator tests.
pub struct MockSource {
    mode: MockMode,
    title: Option<String>,
}

impl MockSource {
    /// Streams the given bytes in small chunks.
    pub fn with_bytes(data: Vec<u8>, total: Option<u64>) -> Self {
        Self {
            mode: MockMode::Bytes { data, total },
            title: None,
        }
    }

    /// Fails resolution with the given message.
    pub fn failing(message: &str) -> Self {
        Self {
            mode: MockMode::Failing(message.to_string()),
            title: None,
        }
    }

    /// Never resolves; jobs stay in `downloading`.
    pub fn pending() -> Self {
        Self {
            mode: MockMode::Pending,
            title: None,
        }
    }

    /// Attach a source-reported title.
    pub fn titled(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }
}

#[async_trait]
impl MediaSource for MockSource {
    async fn open(&self, _video_id: &str) -> Result<ResolvedMedia, FetchError> {
        match &self.mode {
            MockMode::Bytes { data, total } => {
                let chunks: Vec<Result<Vec<u8>, FetchError>> =
                    data.chunks(256).map(|c| Ok(c.to_vec())).collect();
                Ok(ResolvedMedia {
                    ext: "m4a".to_string(),
                    title: self.title.clone(),
                    total_bytes: *total,
                    stream: futures::stream::iter(chunks).boxed(),
                })
            }
            MockMode::Failing(message) => Err(FetchError::Resolve(message.clone())),
            MockMode::Pending => futures::future::pending().await,
        }
    }
}
