//! The analysis pipeline: decode → beats → features → segments → sections
//! → artifact assembly → calibration → rounding.
//!
//! [`Analyzer::analyze`] is a pure function of the input bytes and the
//! configuration: the same file and config always produce bit-identical
//! artifact JSON. Progress is reported through a callback on the engine's
//! 50..=100 scale; the worker remaps it onto the job's progress column.

pub mod artifact;
pub mod audio;
pub mod beats;
pub mod calibrate;
pub mod features;
pub mod sections;
pub mod segments;

use std::path::Path;

use ndarray::Array2;

pub use artifact::{Analysis, Event, Section, Segment, TrackInfo};
use beats::DownbeatModel;

use crate::config::{AnalysisConfig, Calibration, TimbreMode};
use crate::error::{Error, Result};

/// Progress callback: `(percent, stage)` with percent in 50..=100.
pub type ProgressFn<'a> = &'a (dyn Fn(u8, &str) + Send + Sync);

/// Per-frame and beat-synchronous features shared by the segment and
/// section stages.
pub struct FeatureBundle {
    /// Segmentation MFCC at the analysis hop (`n_mfcc x frames`)
    pub full_mfcc: Array2<f64>,
    /// Timbre features at the short hop (`N x frames`)
    pub full_timbre: Array2<f64>,
    /// Chroma at the analysis hop (`12 x frames`)
    pub full_chroma: Array2<f64>,
    pub beat_mfcc: Array2<f64>,
    pub beat_chroma: Array2<f64>,
    /// Checkerboard novelty over the beat-MFCC SSM, one value per beat
    pub beat_novelty: Vec<f64>,
    /// Checkerboard novelty over the beat-chroma SSM
    pub section_novelty: Vec<f64>,
    /// Onset peak times in seconds
    pub onset_peak_times: Vec<f64>,
    /// Frame MFCC novelty, max-normalized
    pub novelty_norm: Vec<f64>,
    /// Onset envelope, max-normalized, aligned with `novelty_norm`
    pub onset_norm: Vec<f64>,
    /// Smoothed average of the two curves above
    pub combined: Vec<f64>,
    /// Hop length of `full_timbre` in samples
    pub timbre_hop: usize,
}

/// The analysis engine, configured once and reused across jobs.
pub struct Analyzer {
    cfg: AnalysisConfig,
    calibration: Option<Calibration>,
    downbeat_model: Option<Box<dyn DownbeatModel>>,
}

impl Analyzer {
    /// Engine with the given knobs and no calibration.
    pub fn new(cfg: AnalysisConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            calibration: None,
            downbeat_model: None,
        })
    }

    /// Attach a calibration bundle; its embedded config block (when
    /// present) replaces the analysis knobs.
    pub fn with_calibration(mut self, calibration: Calibration) -> Result<Self> {
        calibration.validate()?;
        self.cfg = calibration.analysis_config(self.cfg)?;
        self.cfg.validate()?;
        self.calibration = Some(calibration);
        Ok(self)
    }

    /// Attach a pretrained downbeat model for the optional beat path.
    pub fn with_downbeat_model(mut self, model: Box<dyn DownbeatModel>) -> Self {
        self.downbeat_model = Some(model);
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.cfg
    }

    /// Run the full pipeline on one file.
    pub fn analyze(&self, path: &Path, progress: Option<ProgressFn>) -> Result<Analysis> {
        let cfg = &self.cfg;
        let report = |percent: u8, stage: &str| {
            if let Some(cb) = progress {
                cb(percent, stage);
            }
        };

        report(50, "load_audio");
        let decoded = audio::load_mono(path, cfg.sample_rate)?;
        let sr = decoded.sample_rate;
        let y: Vec<f64> = decoded.samples.iter().map(|&v| v as f64).collect();
        let duration = decoded.duration_s();
        if duration <= 0.0 {
            return Err(Error::analysis("empty audio"));
        }

        let onset_env = features::onset_envelope(&y, cfg.frame_length, cfg.hop_length);

        // Beat stage: downbeat model when configured, else autocorrelation grid
        let mut tempo;
        let mut beat_times: Vec<f64>;
        let mut downbeat_numbers: Option<Vec<usize>> = None;
        let mut model_confidences: Option<Vec<f64>> = None;
        if cfg.use_downbeat_model {
            let model = self
                .downbeat_model
                .as_ref()
                .ok_or_else(|| Error::analysis("downbeat model enabled but not provided"))?;
            let activations = model.activations(&y, sr)?;
            let tracked = beats::track_downbeats(&activations, cfg.tempo_min_bpm, cfg.tempo_max_bpm)
                .ok_or_else(|| Error::analysis("downbeat tracking produced no beats"))?;
            beat_times = tracked
                .times
                .iter()
                .cloned()
                .filter(|&t| t <= duration)
                .collect();
            tempo = if beat_times.is_empty() {
                120.0
            } else {
                (60.0 * beat_times.len() as f64 / duration)
                    .clamp(cfg.tempo_min_bpm, cfg.tempo_max_bpm)
            };
            downbeat_numbers = Some(tracked.beat_numbers);
            model_confidences = Some(tracked.confidences);
        } else {
            let grid = beats::beat_grid(
                &onset_env,
                sr,
                cfg.hop_length,
                duration,
                cfg.tempo_min_bpm,
                cfg.tempo_max_bpm,
            );
            tempo = grid.tempo;
            beat_times = grid.times;
        }
        report(60, "beats_track");

        if beat_times.is_empty() {
            // Last-ditch grid so every downstream stage has structure
            tempo = 120.0;
            beat_times = beats::uniform_grid(duration, tempo);
        }

        let (beat_times, beat_conf) = {
            let (snapped, onset_conf) = beats::snap_and_score(
                &beat_times,
                &onset_env,
                sr,
                cfg.hop_length,
                cfg.onset_percentile,
                cfg.onset_min_spacing_s,
                cfg.beat_snap_window_s,
            );
            // Model confidences win when the model produced the beats
            match model_confidences {
                Some(conf) if conf.len() == snapped.len() => (snapped, conf),
                _ => (snapped, onset_conf),
            }
        };
        report(65, "beats_snap");

        let beat_events = artifact::events_from_times(&beat_times, &beat_conf, duration);

        // Bars: model downbeats when available, else every Nth beat
        let (bar_starts, bar_conf): (Vec<f64>, Vec<f64>) = match &downbeat_numbers {
            Some(numbers) if numbers.len() == beat_times.len() => {
                let mut starts = Vec::new();
                let mut confs = Vec::new();
                for (idx, &number) in numbers.iter().enumerate() {
                    if number == 1 {
                        starts.push(beat_times[idx]);
                        confs.push(beat_conf.get(idx).copied().unwrap_or(0.0));
                    }
                }
                (starts, confs)
            }
            _ => (
                beat_times
                    .iter()
                    .step_by(cfg.time_signature.max(1))
                    .copied()
                    .collect(),
                beat_conf
                    .iter()
                    .step_by(cfg.time_signature.max(1))
                    .copied()
                    .collect(),
            ),
        };
        let mut bar_events = artifact::events_from_times(&bar_starts, &bar_conf, duration);
        artifact::close_last_event(&mut bar_events, duration);

        // Tatums: equal subdivisions of each beat interval
        let mut tatum_times = Vec::new();
        let mut tatum_conf = Vec::new();
        let divisions = cfg.tatum_divisions.max(1);
        for (idx, &start) in beat_times.iter().enumerate() {
            let end = beat_times.get(idx + 1).copied().unwrap_or(duration);
            if end <= start {
                continue;
            }
            let step = (end - start) / divisions as f64;
            for t in 0..divisions {
                tatum_times.push(start + t as f64 * step);
                tatum_conf.push(beat_conf.get(idx).copied().unwrap_or(0.0));
            }
        }
        let mut tatum_events = artifact::events_from_times(&tatum_times, &tatum_conf, duration);
        artifact::close_last_event(&mut tatum_events, duration);
        report(75, "beats");

        let bundle = build_feature_bundle(cfg, &y, sr, &beat_times, &onset_env);
        report(80, "features");

        let mut segment_list =
            segments::compute_segments(cfg, &y, sr, duration, &beat_times, &bar_starts, &bundle);
        report(85, "segments");
        calibrate::calibrate_segments(&mut segment_list, cfg, self.calibration.as_ref());
        calibrate::apply_time_warp(&mut segment_list, cfg, duration);
        calibrate::knit_segments(&mut segment_list, duration);
        report(90, "segments_final");

        let section_list = sections::compute_sections(
            cfg,
            &y,
            sr,
            duration,
            &beat_times,
            &bar_starts,
            &onset_env,
            &bundle,
            tempo,
        );
        report(95, "sections");

        let tags = audio::read_tags(path);
        let mut analysis = Analysis {
            track: TrackInfo {
                duration,
                tempo,
                time_signature: cfg.time_signature as i64,
                title: tags.title,
                artist: tags.artist,
            },
            sections: section_list,
            bars: bar_events,
            beats: beat_events,
            tatums: tatum_events,
            segments: segment_list,
        };
        analysis.round_for_output();
        report(100, "finalize");
        Ok(analysis)
    }
}

/// Compute the shared feature bundle for a decoded signal.
pub(crate) fn build_feature_bundle(
    cfg: &AnalysisConfig,
    y: &[f64],
    sr: u32,
    beat_times: &[f64],
    onset_env: &[f64],
) -> FeatureBundle {
    let timbre_frame = ((sr as f64 * cfg.mfcc_window_ms / 1000.0).round() as usize).max(256);
    let timbre_hop = ((sr as f64 * cfg.mfcc_hop_ms / 1000.0).round() as usize).max(1);

    let full_mfcc = features::mfcc_frames(
        y,
        sr,
        cfg.hop_length,
        cfg.frame_length,
        cfg.mfcc_n_mfcc,
        cfg.mfcc_n_mels,
        cfg.mfcc_use_0th,
    );
    let full_timbre = match cfg.timbre_mode {
        TimbreMode::Pca => features::log_mel_frames(y, sr, timbre_hop, timbre_frame, cfg.mfcc_n_mels),
        TimbreMode::Mfcc => features::mfcc_frames(
            y,
            sr,
            timbre_hop,
            timbre_frame,
            cfg.mfcc_n_mfcc,
            cfg.mfcc_n_mels,
            cfg.mfcc_use_0th,
        ),
    };
    let full_chroma = features::chroma_frames(y, sr, cfg.hop_length, cfg.frame_length);

    let beat_frames: Vec<usize> = beat_times
        .iter()
        .map(|&t| features::time_to_frame(t, sr, cfg.hop_length))
        .collect();
    let beat_mfcc = features::beat_sync_mean(&full_mfcc, &beat_frames);
    let beat_chroma = features::beat_sync_mean(&full_chroma, &beat_frames);
    let beat_novelty = features::novelty_from_ssm(
        &features::cosine_similarity_matrix(&beat_mfcc),
        cfg.segment_selfsim_kernel_beats,
    );
    let section_novelty = features::novelty_from_ssm(
        &features::cosine_similarity_matrix(&beat_chroma),
        cfg.section_selfsim_kernel_beats,
    );

    // Frame-to-frame MFCC novelty: 1 - cosine of successive columns
    let n_frames = full_mfcc.ncols();
    let mut novelty = vec![0.0f64; n_frames];
    for i in 1..n_frames {
        let prev = full_mfcc.column(i - 1);
        let curr = full_mfcc.column(i);
        let denom = prev.dot(&prev).sqrt() * curr.dot(&curr).sqrt() + features::EPS;
        novelty[i] = 1.0 - prev.dot(&curr) / denom;
    }

    let aligned = novelty.len().min(onset_env.len());
    let novelty_norm = normalize_slice(&novelty[..aligned]);
    let onset_norm = normalize_slice(&onset_env[..aligned]);
    let averaged: Vec<f64> = novelty_norm
        .iter()
        .zip(&onset_norm)
        .map(|(n, o)| 0.5 * (n + o))
        .collect();
    let combined = features::box_smooth(&averaged, cfg.novelty_smooth_frames);

    let onset_peak_times = features::detect_peak_times(
        onset_env,
        sr,
        cfg.hop_length,
        cfg.onset_percentile,
        cfg.onset_min_spacing_s,
    );

    FeatureBundle {
        full_mfcc,
        full_timbre,
        full_chroma,
        beat_mfcc,
        beat_chroma,
        beat_novelty,
        section_novelty,
        onset_peak_times,
        novelty_norm,
        onset_norm,
        combined,
        timbre_hop,
    }
}

fn normalize_slice(values: &[f64]) -> Vec<f64> {
    let max = values.iter().cloned().fold(0.0, f64::max) + features::EPS;
    values.iter().map(|&v| v / max).collect()
}
