//! Crate-wide error type.
//!
//! Every subsystem funnels its failures into one [`Error`] enum so callers
//! can branch on kind — the HTTP layer maps `JobNotFound` to 404,
//! `Forbidden` to 403, and the validation variants to 4xx without string
//! matching, and the worker treats anything else as a job failure to log
//! and scrub. The fetcher has its own [`crate::fetcher::FetchError`]
//! (those failures are cleaned up in place, not surfaced) which folds in
//! here via `#[from]` for the few paths that do propagate.
//!
//! The binary entry point wraps these in `anyhow` for human-readable
//! output; library code sticks to the typed enum.

use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The input file could not be decoded to PCM
    #[error("Decode error for {path}: {message}")]
    Decode { path: PathBuf, message: String },

    /// The analysis pipeline could not produce an artifact
    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Fetch error: {0}")]
    Fetch(#[from] crate::fetcher::FetchError),

    /// Rejected before any state was created; maps to a 4xx
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Upload body crossed the configured ceiling
    #[error("file too large: limit is {limit} bytes")]
    UploadTooLarge { limit: u64 },

    /// Admin credential missing or wrong; maps to 403
    #[error("Admin key required")]
    Forbidden,

    /// No row (or no file) behind the requested id; maps to 404
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Shorthand constructors for the string-carrying variants.
impl Error {
    pub fn decode(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Decode {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn analysis(message: impl Into<String>) -> Self {
        Self::Analysis(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
