//! Shared storage tree for staging audio, finished artifacts, and failure
//! logs.
//!
//! Layout under the root:
//! - `audio/<job_id>.<ext>` — staging input
//! - `analysis/<job_id>.json` — completed artifact
//! - `logs/<job_id>.log` — failure log (presence implies a recent failure)
//!
//! Files are keyed by job id, so no two components ever target the same
//! file. Deletion is the only destructive operation and is always paired
//! with row deletion by the caller.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Handle to the storage tree rooted at a single directory.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Wrap an existing or to-be-created storage root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the `audio/`, `analysis/` and `logs/` subdirectories.
    pub fn ensure_layout(&self) -> Result<()> {
        for sub in ["audio", "analysis", "logs"] {
            std::fs::create_dir_all(self.root.join(sub))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.root.join("audio")
    }

    pub fn analysis_dir(&self) -> PathBuf {
        self.root.join("analysis")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Root-relative staging path for a job's audio file.
    pub fn audio_rel(&self, job_id: &str, ext: &str) -> PathBuf {
        PathBuf::from("audio").join(format!("{job_id}.{ext}"))
    }

    /// Root-relative artifact path for a job.
    pub fn analysis_rel(&self, job_id: &str) -> PathBuf {
        PathBuf::from("analysis").join(format!("{job_id}.json"))
    }

    pub fn log_path(&self, job_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{job_id}.log"))
    }

    /// Resolve a stored (normally root-relative) path to an absolute one.
    ///
    /// Older rows recorded absolute paths; when such a path no longer
    /// exists, fall back to the same file name under `audio/` then
    /// `analysis/`.
    pub fn resolve(&self, stored: &str) -> PathBuf {
        let path = Path::new(stored);
        if path.is_absolute() {
            if path.exists() {
                return path.to_path_buf();
            }
            if let Some(name) = path.file_name() {
                let audio = self.audio_dir().join(name);
                if audio.exists() {
                    return audio;
                }
                let analysis = self.analysis_dir().join(name);
                if analysis.exists() {
                    return analysis;
                }
            }
            return path.to_path_buf();
        }
        self.root.join(path)
    }

    /// Any staged audio file for the job, regardless of extension.
    pub fn find_audio(&self, job_id: &str) -> Option<PathBuf> {
        let mut matches = self.files_with_prefix(&self.audio_dir(), job_id);
        matches.sort();
        matches.into_iter().next()
    }

    /// Write a one-line failure log for a job.
    pub fn write_failure_log(&self, job_id: &str, message: &str) -> Result<()> {
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::write(self.log_path(job_id), format!("Job failed: {message}\n"))?;
        Ok(())
    }

    /// Append engine output below the failure line.
    pub fn write_failure_log_with_output(
        &self,
        job_id: &str,
        message: &str,
        output: &str,
    ) -> Result<()> {
        std::fs::create_dir_all(self.logs_dir())?;
        let mut body = format!("Job failed: {message}\n");
        if !output.is_empty() {
            body.push_str("\n--- Engine output ---\n");
            body.push_str(output);
            if !output.ends_with('\n') {
                body.push('\n');
            }
        }
        std::fs::write(self.log_path(job_id), body)?;
        Ok(())
    }

    /// Remove every file belonging to a job: staged audio (any extension),
    /// the artifact, the failure log, and any other `<id>.*` leftovers.
    pub fn remove_artifacts(&self, job_id: &str) {
        for dir in [self.audio_dir(), self.analysis_dir(), self.logs_dir()] {
            for path in self.files_with_prefix(&dir, job_id) {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove artifact");
                }
            }
        }
    }

    /// Remove staged audio and the artifact but keep the failure log.
    pub fn remove_media(&self, job_id: &str) {
        for dir in [self.audio_dir(), self.analysis_dir()] {
            for path in self.files_with_prefix(&dir, job_id) {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
                }
            }
        }
    }

    /// Files in `dir` named `<job_id>` or `<job_id>.<anything>`.
    fn files_with_prefix(&self, dir: &Path, job_id: &str) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|name| {
                            name == job_id
                                || name
                                    .strip_prefix(job_id)
                                    .is_some_and(|rest| rest.starts_with('.'))
                        })
            })
            .collect()
    }

    /// Write `bytes` to `path` atomically (temp file in the same directory,
    /// then rename) so readers never observe a partial artifact.
    pub fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        storage.ensure_layout().unwrap();
        (storage, dir)
    }

    #[test]
    fn layout_created() {
        let (storage, _dir) = temp_storage();
        assert!(storage.audio_dir().is_dir());
        assert!(storage.analysis_dir().is_dir());
        assert!(storage.logs_dir().is_dir());
    }

    #[test]
    fn resolve_relative_path() {
        let (storage, _dir) = temp_storage();
        let resolved = storage.resolve("audio/abc123.m4a");
        assert_eq!(resolved, storage.audio_dir().join("abc123.m4a"));
    }

    #[test]
    fn resolve_stale_absolute_path_falls_back_to_audio() {
        let (storage, _dir) = temp_storage();
        std::fs::write(storage.audio_dir().join("abc123.m4a"), b"x").unwrap();
        let resolved = storage.resolve("/somewhere/else/abc123.m4a");
        assert_eq!(resolved, storage.audio_dir().join("abc123.m4a"));
    }

    #[test]
    fn remove_artifacts_clears_prefixed_files_only() {
        let (storage, _dir) = temp_storage();
        std::fs::write(storage.audio_dir().join("abc123.m4a"), b"a").unwrap();
        std::fs::write(storage.audio_dir().join("abc123.part.m4a"), b"p").unwrap();
        std::fs::write(storage.audio_dir().join("abc1234.m4a"), b"other").unwrap();
        std::fs::write(storage.analysis_dir().join("abc123.json"), b"{}").unwrap();
        storage.write_failure_log("abc123", "boom").unwrap();

        storage.remove_artifacts("abc123");

        assert!(!storage.audio_dir().join("abc123.m4a").exists());
        assert!(!storage.audio_dir().join("abc123.part.m4a").exists());
        assert!(!storage.analysis_dir().join("abc123.json").exists());
        assert!(!storage.log_path("abc123").exists());
        // A different job id sharing a prefix is untouched
        assert!(storage.audio_dir().join("abc1234.m4a").exists());
    }

    #[test]
    fn remove_media_keeps_log() {
        let (storage, _dir) = temp_storage();
        std::fs::write(storage.audio_dir().join("abc123.m4a"), b"a").unwrap();
        storage.write_failure_log("abc123", "boom").unwrap();

        storage.remove_media("abc123");

        assert!(!storage.audio_dir().join("abc123.m4a").exists());
        assert!(storage.log_path("abc123").exists());
    }

    #[test]
    fn write_atomic_replaces_content() {
        let (storage, _dir) = temp_storage();
        let path = storage.analysis_dir().join("abc123.json");
        storage.write_atomic(&path, b"{\"a\":1}").unwrap();
        storage.write_atomic(&path, b"{\"a\":2}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn failure_log_contains_engine_output() {
        let (storage, _dir) = temp_storage();
        storage
            .write_failure_log_with_output("abc123", "engine exited with status 1", "stack trace")
            .unwrap();
        let body = std::fs::read_to_string(storage.log_path("abc123")).unwrap();
        assert!(body.starts_with("Job failed: engine exited"));
        assert!(body.contains("--- Engine output ---"));
        assert!(body.contains("stack trace"));
    }
}
