//! Configuration: environment settings, analysis tuning knobs, and the
//! optional calibration bundle.
//!
//! Runtime settings come from environment variables (the deployment story
//! is a handful of env vars next to a storage directory). Analysis knobs
//! live in [`AnalysisConfig`], a flat serde record so a calibration bundle
//! can override any subset of them. Calibration tables are validated for
//! shape when the bundle is loaded; a mis-shaped table is a load error,
//! never a mid-pipeline surprise.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default upload ceiling: 15 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 15 * 1024 * 1024;

/// Extensions accepted for direct uploads.
pub const ALLOWED_UPLOAD_EXTS: [&str; 7] = ["m4a", "webm", "mp3", "wav", "flac", "ogg", "aac"];

/// Runtime settings loaded from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of the shared storage tree (`audio/`, `analysis/`, `logs/`, jobs DB)
    pub storage_root: PathBuf,

    /// Whether direct file uploads are accepted
    pub allow_user_upload: bool,

    /// Whether user-submitted video ids are accepted
    pub allow_user_youtube: bool,

    /// Whether the favorites-sync surface is enabled
    pub allow_favorites_sync: bool,

    /// Admin credential for destructive/admin routes (None disables them)
    pub admin_key: Option<String>,

    /// Worker poll interval in seconds
    pub poll_interval_s: f64,

    /// Number of concurrent worker loops
    pub worker_count: usize,

    /// Upload size ceiling in bytes
    pub max_upload_bytes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("storage"),
            allow_user_upload: false,
            allow_user_youtube: false,
            allow_favorites_sync: false,
            admin_key: None,
            poll_interval_s: 1.0,
            worker_count: 1,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl Settings {
    /// Load settings from the environment.
    ///
    /// Boolean flags accept the tokens `1`, `true`, `yes`, `on`
    /// (case-insensitive); anything else is false. Numeric variables fall
    /// back to their defaults when unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            storage_root: env::var("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            allow_user_upload: env_bool("ALLOW_USER_UPLOAD"),
            allow_user_youtube: env_bool("ALLOW_USER_YOUTUBE"),
            allow_favorites_sync: env_bool("ALLOW_FAVORITES_SYNC"),
            admin_key: env::var("ADMIN_KEY").ok().filter(|k| !k.is_empty()),
            poll_interval_s: env_parse("POLL_INTERVAL_S", defaults.poll_interval_s),
            worker_count: env_parse("WORKER_COUNT", defaults.worker_count),
            max_upload_bytes: env_parse("MAX_UPLOAD_BYTES", defaults.max_upload_bytes),
        }
    }

    /// SQLite URL for the job store, colocated with the storage tree.
    pub fn db_url(&self) -> String {
        format!("sqlite:{}", self.storage_root.join("jobs.db").display())
    }
}

fn env_bool(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Which feature family feeds segment timbre vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimbreMode {
    /// MFCC sequence at the short (10 ms) hop
    #[default]
    Mfcc,
    /// Log-mel sequence projected by a configured PCA basis
    Pca,
}

/// A piecewise-linear value remap (`src` ascending, same length as `dst`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValueMap {
    pub src: Vec<f64>,
    pub dst: Vec<f64>,
}

/// Flat record of every numeric analysis parameter.
///
/// All fields have defaults so a calibration bundle can override any
/// subset. `SAMPLE_RATE` and `HOP_LENGTH` env vars are applied on top by
/// [`AnalysisConfig::from_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    // Signal
    pub sample_rate: u32,
    pub frame_length: usize,
    pub hop_length: usize,

    // Metric structure
    pub time_signature: usize,
    pub tatum_divisions: usize,

    // Beat tracking
    pub tempo_min_bpm: f64,
    pub tempo_max_bpm: f64,
    pub onset_percentile: f64,
    pub onset_min_spacing_s: f64,
    pub beat_snap_window_s: f64,
    /// Use the pretrained downbeat model instead of autocorrelation
    pub use_downbeat_model: bool,

    // MFCC / timbre
    pub mfcc_n_mfcc: usize,
    pub mfcc_n_mels: usize,
    pub mfcc_use_0th: bool,
    pub mfcc_window_ms: f64,
    pub mfcc_hop_ms: f64,
    pub timbre_mode: TimbreMode,
    pub timbre_unit_norm: bool,
    pub timbre_standardize: bool,
    pub timbre_scale: f64,
    pub timbre_pca_components: Option<Vec<Vec<f64>>>,
    pub timbre_pca_mean: Option<Vec<f64>>,
    pub timbre_calibration_matrix: Option<Vec<Vec<f64>>>,
    pub timbre_calibration_bias: Option<Vec<f64>>,

    // Novelty
    pub novelty_smooth_frames: usize,
    pub segment_selfsim_kernel_beats: usize,
    pub segment_selfsim_percentile: f64,
    pub segment_selfsim_min_spacing_beats: usize,
    pub section_selfsim_kernel_beats: usize,
    pub section_selfsim_percentile: f64,
    pub section_selfsim_min_spacing_beats: usize,
    pub beat_novelty_percentile: f64,
    pub beat_novelty_min_spacing: usize,

    // Segment boundaries
    pub boundary_model_weights: Option<Vec<f64>>,
    pub boundary_model_bias: Option<f64>,
    pub boundary_percentile: f64,
    pub boundary_min_spacing_s: f64,
    pub segment_min_duration_s: f64,
    pub target_segment_rate: Option<f64>,
    pub target_segment_rate_tolerance: f64,
    pub segment_snap_bar_window_s: f64,
    pub segment_snap_beat_window_s: f64,

    // Sections
    pub use_laplacian_sections: bool,
    pub laplacian_cqt_bins_per_octave: usize,
    pub laplacian_cqt_octaves: usize,
    pub laplacian_max_clusters: usize,
    pub target_section_rate: Option<f64>,
    pub target_section_rate_tolerance: f64,
    pub section_use_novelty: bool,
    pub section_novelty_percentile: f64,
    pub section_min_spacing_s: f64,
    pub section_snap_bar_window_s: f64,
    /// Uniform bin width used when no boundaries survive
    pub section_seconds: f64,
    /// Adjacent sections at or above this chroma cosine similarity merge (0 disables)
    pub section_merge_similarity: f64,

    // Pitch calibration
    pub pitch_scale: Option<Vec<f64>>,
    pub pitch_bias: Option<Vec<f64>>,
    pub pitch_calibration_matrix: Option<Vec<Vec<f64>>>,
    pub pitch_calibration_bias: Option<Vec<f64>>,

    // Per-field segment calibration
    pub segment_quantile_maps: Option<BTreeMap<String, ValueMap>>,
    pub segment_scalar_scale: Option<BTreeMap<String, f64>>,
    pub segment_scalar_bias: Option<BTreeMap<String, f64>>,

    // Piecewise time-warp of segment starts
    pub start_offset_map_src: Option<Vec<f64>>,
    pub start_offset_map_dst: Option<Vec<f64>>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            frame_length: 2048,
            hop_length: 512,
            time_signature: 4,
            tatum_divisions: 2,
            tempo_min_bpm: 60.0,
            tempo_max_bpm: 200.0,
            onset_percentile: 75.0,
            onset_min_spacing_s: 0.05,
            beat_snap_window_s: 0.07,
            use_downbeat_model: false,
            mfcc_n_mfcc: 12,
            mfcc_n_mels: 40,
            mfcc_use_0th: false,
            mfcc_window_ms: 25.0,
            mfcc_hop_ms: 10.0,
            timbre_mode: TimbreMode::Mfcc,
            timbre_unit_norm: false,
            timbre_standardize: false,
            timbre_scale: 1.0,
            timbre_pca_components: None,
            timbre_pca_mean: None,
            timbre_calibration_matrix: None,
            timbre_calibration_bias: None,
            novelty_smooth_frames: 8,
            segment_selfsim_kernel_beats: 8,
            segment_selfsim_percentile: 75.0,
            segment_selfsim_min_spacing_beats: 2,
            section_selfsim_kernel_beats: 32,
            section_selfsim_percentile: 80.0,
            section_selfsim_min_spacing_beats: 8,
            beat_novelty_percentile: 80.0,
            beat_novelty_min_spacing: 4,
            boundary_model_weights: None,
            boundary_model_bias: None,
            boundary_percentile: 90.0,
            boundary_min_spacing_s: 0.1,
            segment_min_duration_s: 0.25,
            target_segment_rate: Some(2.5),
            target_segment_rate_tolerance: 0.25,
            segment_snap_bar_window_s: 0.1,
            segment_snap_beat_window_s: 0.07,
            use_laplacian_sections: true,
            laplacian_cqt_bins_per_octave: 12,
            laplacian_cqt_octaves: 6,
            laplacian_max_clusters: 12,
            target_section_rate: Some(0.03),
            target_section_rate_tolerance: 0.25,
            section_use_novelty: true,
            section_novelty_percentile: 90.0,
            section_min_spacing_s: 8.0,
            section_snap_bar_window_s: 0.25,
            section_seconds: 30.0,
            section_merge_similarity: 0.0,
            pitch_scale: None,
            pitch_bias: None,
            pitch_calibration_matrix: None,
            pitch_calibration_bias: None,
            segment_quantile_maps: None,
            segment_scalar_scale: None,
            segment_scalar_bias: None,
            start_offset_map_src: None,
            start_offset_map_dst: None,
        }
    }
}

impl AnalysisConfig {
    /// Defaults with `SAMPLE_RATE` / `HOP_LENGTH` env overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.sample_rate = env_parse("SAMPLE_RATE", cfg.sample_rate);
        cfg.hop_length = env_parse("HOP_LENGTH", cfg.hop_length);
        cfg
    }

    /// Check shapes of every optional table against the configured sizes.
    pub fn validate(&self) -> Result<()> {
        let n = self.mfcc_n_mfcc;
        if let Some(weights) = &self.boundary_model_weights {
            if weights.len() != 3 {
                return Err(Error::config(format!(
                    "boundary model expects 3 weights, got {}",
                    weights.len()
                )));
            }
        }
        if let (Some(m), Some(b)) = (&self.timbre_calibration_matrix, &self.timbre_calibration_bias)
        {
            check_matrix("timbre_calibration_matrix", m, n, n)?;
            check_vector("timbre_calibration_bias", b, n)?;
        }
        if let (Some(c), Some(mean)) = (&self.timbre_pca_components, &self.timbre_pca_mean) {
            if c.is_empty() || c.iter().any(|row| row.len() != self.mfcc_n_mels) {
                return Err(Error::config(format!(
                    "timbre_pca_components rows must have {} columns",
                    self.mfcc_n_mels
                )));
            }
            check_vector("timbre_pca_mean", mean, self.mfcc_n_mels)?;
        }
        if let (Some(scale), Some(bias)) = (&self.pitch_scale, &self.pitch_bias) {
            check_vector("pitch_scale", scale, 12)?;
            check_vector("pitch_bias", bias, 12)?;
        }
        if let (Some(m), Some(b)) = (&self.pitch_calibration_matrix, &self.pitch_calibration_bias) {
            check_matrix("pitch_calibration_matrix", m, 12, 12)?;
            check_vector("pitch_calibration_bias", b, 12)?;
        }
        if let Some(maps) = &self.segment_quantile_maps {
            for (field, map) in maps {
                check_value_map(field, &map.src, &map.dst)?;
            }
        }
        if let (Some(src), Some(dst)) = (&self.start_offset_map_src, &self.start_offset_map_dst) {
            check_value_map("start_offset_map", src, dst)?;
        }
        Ok(())
    }
}

fn check_vector(name: &str, v: &[f64], len: usize) -> Result<()> {
    if v.len() != len {
        return Err(Error::config(format!(
            "{name} expects {len} entries, got {}",
            v.len()
        )));
    }
    Ok(())
}

fn check_matrix(name: &str, m: &[Vec<f64>], rows: usize, cols: usize) -> Result<()> {
    if m.len() != rows || m.iter().any(|row| row.len() != cols) {
        return Err(Error::config(format!("{name} expects a {rows}x{cols} matrix")));
    }
    Ok(())
}

fn check_value_map(name: &str, src: &[f64], dst: &[f64]) -> Result<()> {
    if src.len() < 2 || src.len() != dst.len() {
        return Err(Error::config(format!(
            "{name} needs matching src/dst of at least 2 points"
        )));
    }
    if src.windows(2).any(|w| w[1] < w[0]) {
        return Err(Error::config(format!("{name} src values must be ascending")));
    }
    Ok(())
}

/// Scalar affine map `y = a * x + b`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Affine {
    #[serde(default = "one")]
    pub a: f64,
    #[serde(default)]
    pub b: f64,
}

fn one() -> f64 {
    1.0
}

/// Per-coefficient timbre affine (`a`/`b` aligned with the timbre vector).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimbreMap {
    pub a: Vec<f64>,
    pub b: Vec<f64>,
}

/// Loudness affines for segment start/max values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoudnessMap {
    pub start: Option<Affine>,
    pub max: Option<Affine>,
}

/// Confidence CDF remap (`source` ascending, same length as `target`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceMap {
    pub source: Vec<f64>,
    pub target: Vec<f64>,
}

/// Pitch shaping: power compression plus per-class weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PitchMap {
    pub power: Option<f64>,
    pub weights: Option<Vec<f64>>,
    #[serde(default)]
    pub normalize: bool,
}

/// Optional calibration bundle remapping synthetic feature distributions
/// toward a reference distribution.
///
/// Loaded from JSON; the embedded `config` block (when present) replaces the
/// analysis configuration wholesale, with unset fields taking defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Calibration {
    pub timbre: Option<TimbreMap>,
    pub loudness: Option<LoudnessMap>,
    pub confidence: Option<ConfidenceMap>,
    pub pitch: Option<PitchMap>,
    pub config: Option<serde_json::Value>,
}

impl Calibration {
    /// Load and validate a calibration bundle from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let bundle: Self = serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("invalid calibration bundle: {e}")))?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Shape-check every table in the bundle.
    pub fn validate(&self) -> Result<()> {
        if let Some(timbre) = &self.timbre {
            if timbre.a.is_empty() || timbre.a.len() != timbre.b.len() {
                return Err(Error::config(
                    "timbre calibration needs matching non-empty a/b vectors",
                ));
            }
        }
        if let Some(confidence) = &self.confidence {
            check_value_map("confidence map", &confidence.source, &confidence.target)?;
        }
        if let Some(pitch) = &self.pitch {
            if let Some(weights) = &pitch.weights {
                check_vector("pitch weights", weights, 12)?;
            }
        }
        if let Some(cfg) = &self.config {
            self.analysis_config_from(cfg.clone())?.validate()?;
        }
        Ok(())
    }

    /// Analysis configuration carried by the bundle, or `base` when absent.
    pub fn analysis_config(&self, base: AnalysisConfig) -> Result<AnalysisConfig> {
        match &self.config {
            Some(value) => self.analysis_config_from(value.clone()),
            None => Ok(base),
        }
    }

    fn analysis_config_from(&self, value: serde_json::Value) -> Result<AnalysisConfig> {
        serde_json::from_value(value)
            .map_err(|e| Error::config(format!("invalid calibration config block: {e}")))
    }
}
