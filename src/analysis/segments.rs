//! Segment boundary detection and per-segment descriptors.
//!
//! Boundary seeds come from three curves (onset peaks, combined novelty
//! peaks, beat-level self-similarity novelty peaks) plus an optional
//! linear boundary model. Seeds are cleaned up (span, minimum duration,
//! target rate), snapped to bars then beats, and each surviving slice is
//! summarized with loudness, chroma, and timbre descriptors.

use ndarray::{Array2, Axis, s};

use super::FeatureBundle;
use super::artifact::Segment;
use super::features::{self, EPS};
use crate::config::{AnalysisConfig, TimbreMode};

/// Compute segment boundaries and descriptors.
pub fn compute_segments(
    cfg: &AnalysisConfig,
    y: &[f64],
    sr: u32,
    duration: f64,
    beat_times: &[f64],
    bar_starts: &[f64],
    bundle: &FeatureBundle,
) -> Vec<Segment> {
    let hop = cfg.hop_length;

    // Seed candidates: onset peaks, combined-novelty peaks, beat-novelty peaks
    let mut seeds: Vec<f64> = bundle.onset_peak_times.clone();
    seeds.extend(features::detect_peak_times(
        &bundle.combined,
        sr,
        hop,
        cfg.onset_percentile,
        cfg.onset_min_spacing_s,
    ));
    if !beat_times.is_empty() && !bundle.beat_novelty.is_empty() {
        let peaks = features::detect_peak_frames(
            &bundle.beat_novelty,
            cfg.segment_selfsim_percentile,
            cfg.segment_selfsim_min_spacing_beats,
        );
        seeds.extend(peaks.iter().filter_map(|&p| beat_times.get(p).copied()));
    }
    if let Some(score) = boundary_model_score(cfg, bundle, beat_times, sr, hop) {
        seeds.extend(features::detect_peak_times(
            &score,
            sr,
            hop,
            cfg.boundary_percentile,
            cfg.boundary_min_spacing_s,
        ));
    }

    let mut seg_times = features::boundary_times(&seeds, duration);
    seg_times = features::enforce_min_duration(&seg_times, cfg.segment_min_duration_s);
    seg_times = apply_target_rate(
        seg_times,
        duration,
        cfg.target_segment_rate,
        cfg.target_segment_rate_tolerance,
        cfg.segment_min_duration_s,
    );

    // Snap to musical structure, then clean up again
    if !bar_starts.is_empty() {
        seg_times =
            features::snap_times_to_peaks(&seg_times, bar_starts, cfg.segment_snap_bar_window_s);
    }
    if !beat_times.is_empty() {
        seg_times =
            features::snap_times_to_peaks(&seg_times, beat_times, cfg.segment_snap_beat_window_s);
    }
    seg_times = features::boundary_times(&seg_times, duration);
    seg_times = features::enforce_min_duration(&seg_times, cfg.segment_min_duration_s);
    seg_times = apply_target_rate(
        seg_times,
        duration,
        cfg.target_segment_rate,
        cfg.target_segment_rate_tolerance,
        cfg.segment_min_duration_s,
    );

    let confidences = features::sample_confidence(
        &seg_times[..seg_times.len().saturating_sub(1)],
        &bundle.combined,
        sr,
        hop,
    );

    let db = features::rms_db(y, cfg.frame_length, hop);
    let timbre = prepared_timbre(cfg, &bundle.full_timbre);

    let mut segments = Vec::with_capacity(seg_times.len().saturating_sub(1));
    for idx in 0..seg_times.len().saturating_sub(1) {
        let start = seg_times[idx];
        let end = seg_times[idx + 1];
        if end <= start {
            continue;
        }
        let confidence = confidences.get(idx).copied().unwrap_or(0.0).clamp(0.0, 1.0);
        segments.push(build_segment(
            cfg, sr, start, end, confidence, &db, bundle, &timbre,
        ));
    }
    segments
}

/// Linear boundary model over aligned frame features, when configured.
fn boundary_model_score(
    cfg: &AnalysisConfig,
    bundle: &FeatureBundle,
    beat_times: &[f64],
    sr: u32,
    hop: usize,
) -> Option<Vec<f64>> {
    let weights = cfg.boundary_model_weights.as_ref()?;
    let bias = cfg.boundary_model_bias?;
    if weights.len() != 3 {
        return None;
    }
    let len = bundle.onset_norm.len().min(bundle.novelty_norm.len());
    if len == 0 {
        return None;
    }

    // Beat energy: each beat interval holds the mean onset strength within it
    let mut beat_feat = vec![0.0; len];
    if beat_times.len() >= 2 {
        let mut frames: Vec<usize> = beat_times
            .iter()
            .map(|&t| features::time_to_frame(t, sr, hop).min(len.saturating_sub(1)))
            .collect();
        frames.dedup();
        for pair in frames.windows(2) {
            let (start, end) = (pair[0], pair[1]);
            if end <= start {
                continue;
            }
            let mean =
                bundle.onset_norm[start..end].iter().sum::<f64>() / (end - start) as f64;
            beat_feat[start..end].fill(mean);
        }
    }

    Some(
        (0..len)
            .map(|i| {
                weights[0] * bundle.onset_norm[i]
                    + weights[1] * bundle.novelty_norm[i]
                    + weights[2] * beat_feat[i]
                    + bias
            })
            .collect(),
    )
}

/// When the boundary count exceeds the target rate (with tolerance), raise
/// the minimum duration to `duration / target` and re-enforce.
pub fn apply_target_rate(
    times: Vec<f64>,
    duration: f64,
    rate: Option<f64>,
    tolerance: f64,
    min_base: f64,
) -> Vec<f64> {
    let Some(rate) = rate else {
        return times;
    };
    if duration <= 0.0 || rate <= 0.0 {
        return times;
    }
    let target = ((duration * rate).round() as usize).max(1);
    let current = times.len().saturating_sub(1).max(1);
    if current as f64 > target as f64 * (1.0 + tolerance) {
        let min_duration = (duration / target as f64).max(min_base);
        return features::enforce_min_duration(&times, min_duration);
    }
    times
}

/// Timbre matrix after the configured preprocessing (PCA projection or
/// per-coefficient standardization).
fn prepared_timbre(cfg: &AnalysisConfig, full_timbre: &Array2<f64>) -> Array2<f64> {
    match cfg.timbre_mode {
        TimbreMode::Pca => {
            if let (Some(components), Some(mean)) =
                (&cfg.timbre_pca_components, &cfg.timbre_pca_mean)
            {
                if full_timbre.nrows() == mean.len()
                    && components.iter().all(|row| row.len() == mean.len())
                {
                    let n_out = components.len();
                    let n_frames = full_timbre.ncols();
                    let mut projected = Array2::zeros((n_out, n_frames));
                    for frame in 0..n_frames {
                        for (out_row, component) in components.iter().enumerate() {
                            let mut sum = 0.0;
                            for (feat, &c) in component.iter().enumerate() {
                                sum += (full_timbre[[feat, frame]] - mean[feat]) * c;
                            }
                            projected[[out_row, frame]] = sum;
                        }
                    }
                    return projected;
                }
            }
            full_timbre.clone()
        }
        TimbreMode::Mfcc => {
            if !cfg.timbre_standardize || full_timbre.is_empty() {
                return full_timbre.clone();
            }
            let mut standardized = full_timbre.clone();
            for mut row in standardized.rows_mut() {
                let mean = row.mean().unwrap_or(0.0);
                let std = row.std(0.0) + EPS;
                row.mapv_inplace(|v| (v - mean) / std * cfg.timbre_scale);
            }
            standardized
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_segment(
    cfg: &AnalysisConfig,
    sr: u32,
    start: f64,
    end: f64,
    confidence: f64,
    db: &[f64],
    bundle: &FeatureBundle,
    timbre: &Array2<f64>,
) -> Segment {
    let hop = cfg.hop_length;
    let (start_frame, end_frame) = features::frame_slice(start, end, sr, hop);
    let db_end = end_frame.min(db.len());

    let (loudness_start, loudness_max, loudness_max_time, loudness_end) =
        if start_frame < db_end {
            let slice = &db[start_frame..db_end];
            let (max_idx, max_val) = slice
                .iter()
                .cloned()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .unwrap_or((0, -60.0));
            let max_time = (features::frames_to_time(start_frame + max_idx, sr, hop) - start)
                .clamp(0.0, end - start);
            (slice[0], max_val, max_time, slice[slice.len() - 1])
        } else {
            (-60.0, -60.0, 0.0, -60.0)
        };

    let chroma_end = end_frame.min(bundle.full_chroma.ncols());
    let chroma_mean: Vec<f64> = if start_frame < chroma_end {
        bundle
            .full_chroma
            .slice(s![.., start_frame..chroma_end])
            .mean_axis(Axis(1))
            .map(|m| m.to_vec())
            .unwrap_or_else(|| vec![0.0; 12])
    } else {
        vec![0.0; 12]
    };
    let pitches = features::normalize_max(&chroma_mean);

    let (t_start, t_end) = features::frame_slice(start, end, sr, bundle.timbre_hop);
    let t_end = t_end.min(timbre.ncols());
    let mut timbre_mean: Vec<f64> = if t_start < t_end {
        timbre
            .slice(s![.., t_start..t_end])
            .mean_axis(Axis(1))
            .map(|m| m.to_vec())
            .unwrap_or_else(|| vec![0.0; timbre.nrows()])
    } else {
        vec![0.0; timbre.nrows()]
    };

    if cfg.timbre_unit_norm {
        let norm: f64 = timbre_mean.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            timbre_mean.iter_mut().for_each(|v| *v /= norm);
        }
    }
    if let (Some(matrix), Some(bias)) =
        (&cfg.timbre_calibration_matrix, &cfg.timbre_calibration_bias)
    {
        if matrix.len() == timbre_mean.len()
            && bias.len() == timbre_mean.len()
            && matrix.iter().all(|row| row.len() == timbre_mean.len())
        {
            let n = timbre_mean.len();
            let mut out = vec![0.0; n];
            for (col, slot) in out.iter_mut().enumerate() {
                let mut sum = bias[col];
                for row in 0..n {
                    sum += timbre_mean[row] * matrix[row][col];
                }
                *slot = sum;
            }
            timbre_mean = out;
        }
    }

    Segment {
        start,
        duration: end - start,
        confidence,
        loudness_start,
        loudness_max,
        loudness_max_time,
        loudness_end,
        pitches,
        timbre: timbre_mean,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::build_feature_bundle;
    use crate::test_utils::two_tone;

    fn bundle_for(y: &[f64], cfg: &AnalysisConfig) -> (FeatureBundle, Vec<f64>) {
        let env = features::onset_envelope(y, cfg.frame_length, cfg.hop_length);
        let duration = y.len() as f64 / cfg.sample_rate as f64;
        let step = 0.5;
        let beats: Vec<f64> = (0..)
            .map(|i| i as f64 * step)
            .take_while(|t| *t < duration)
            .collect();
        let bundle = build_feature_bundle(cfg, y, cfg.sample_rate, &beats, &env);
        (bundle, beats)
    }

    #[test]
    fn segments_cover_the_track_densely() {
        let cfg = AnalysisConfig::default();
        let y = two_tone(220.0, 880.0, cfg.sample_rate, 4.0);
        let duration = y.len() as f64 / cfg.sample_rate as f64;
        let (bundle, beats) = bundle_for(&y, &cfg);
        let bars: Vec<f64> = beats.iter().step_by(4).copied().collect();

        let segments = compute_segments(&cfg, &y, cfg.sample_rate, duration, &beats, &bars, &bundle);
        assert!(!segments.is_empty());
        assert!((segments[0].start).abs() < 1e-9);
        for pair in segments.windows(2) {
            assert!(pair[0].start < pair[1].start);
            assert!((pair[0].start + pair[0].duration - pair[1].start).abs() < 1e-9);
        }
        for segment in &segments {
            assert!(segment.duration >= cfg.segment_min_duration_s - 1e-9);
            assert_eq!(segment.pitches.len(), 12);
            assert_eq!(segment.timbre.len(), cfg.mfcc_n_mfcc);
            assert!((0.0..=1.0).contains(&segment.confidence));
            let max = segment.pitches.iter().cloned().fold(0.0, f64::max);
            assert!(max == 0.0 || (max - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn loudness_descriptors_are_consistent() {
        let cfg = AnalysisConfig::default();
        let y = two_tone(220.0, 880.0, cfg.sample_rate, 4.0);
        let duration = y.len() as f64 / cfg.sample_rate as f64;
        let (bundle, beats) = bundle_for(&y, &cfg);

        let segments = compute_segments(&cfg, &y, cfg.sample_rate, duration, &beats, &[], &bundle);
        for segment in &segments {
            assert!(segment.loudness_max >= segment.loudness_start - 1e-9);
            assert!(segment.loudness_max <= 0.0 + 1e-9);
            assert!(segment.loudness_max_time >= 0.0);
            assert!(segment.loudness_max_time <= segment.duration + 1e-9);
        }
    }

    #[test]
    fn target_rate_thins_boundaries() {
        let times: Vec<f64> = (0..101).map(|i| i as f64 * 0.1).collect();
        // 100 segments over 10 s against a target of 1/s
        let thinned = apply_target_rate(times, 10.0, Some(1.0), 0.25, 0.1);
        assert!(thinned.len() - 1 <= 11);
    }

    #[test]
    fn target_rate_disabled_is_identity() {
        let times: Vec<f64> = vec![0.0, 0.5, 1.0];
        let out = apply_target_rate(times.clone(), 1.0, None, 0.25, 0.1);
        assert_eq!(out, times);
    }

    #[test]
    fn boundary_model_adds_candidates() {
        let mut cfg = AnalysisConfig::default();
        cfg.boundary_model_weights = Some(vec![1.0, 1.0, 0.5]);
        cfg.boundary_model_bias = Some(0.0);
        let y = two_tone(220.0, 880.0, cfg.sample_rate, 4.0);
        let (bundle, beats) = bundle_for(&y, &cfg);
        let score = boundary_model_score(&cfg, &bundle, &beats, cfg.sample_rate, cfg.hop_length);
        let score = score.expect("weights configured");
        assert_eq!(
            score.len(),
            bundle.onset_norm.len().min(bundle.novelty_norm.len())
        );
        assert!(score.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn unit_norm_timbre_has_unit_length() {
        let mut cfg = AnalysisConfig::default();
        cfg.timbre_unit_norm = true;
        let y = two_tone(220.0, 880.0, cfg.sample_rate, 4.0);
        let duration = y.len() as f64 / cfg.sample_rate as f64;
        let (bundle, beats) = bundle_for(&y, &cfg);
        let segments = compute_segments(&cfg, &y, cfg.sample_rate, duration, &beats, &[], &bundle);
        for segment in &segments {
            let norm: f64 = segment.timbre.iter().map(|v| v * v).sum::<f64>().sqrt();
            assert!(norm < 1.0 + 1e-9);
            assert!(norm == 0.0 || norm > 0.99);
        }
    }
}
