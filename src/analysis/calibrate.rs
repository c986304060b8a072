//! Segment calibration: remaps synthetic feature distributions toward a
//! reference distribution.
//!
//! Applied in a fixed order: pitch scale/bias, pitch affine matrix, bundle
//! pitch power/weights, bundle timbre/loudness/confidence maps, per-field
//! quantile maps, per-field scalar affines, then range clamps. Absent
//! tables are skipped; shapes were already validated at load time.

use crate::analysis::artifact::Segment;
use crate::analysis::features::interp;
use crate::config::{AnalysisConfig, Calibration};

/// Run the full calibration chain over freshly built segments.
pub fn calibrate_segments(
    segments: &mut [Segment],
    cfg: &AnalysisConfig,
    bundle: Option<&Calibration>,
) {
    if let (Some(scale), Some(bias)) = (&cfg.pitch_scale, &cfg.pitch_bias) {
        for segment in segments.iter_mut() {
            apply_pitch_scale_bias(&mut segment.pitches, scale, bias);
        }
    }
    if let (Some(matrix), Some(bias)) = (&cfg.pitch_calibration_matrix, &cfg.pitch_calibration_bias)
    {
        for segment in segments.iter_mut() {
            apply_pitch_matrix(&mut segment.pitches, matrix, bias);
        }
    }

    if let Some(bundle) = bundle {
        if let Some(pitch) = &bundle.pitch {
            for segment in segments.iter_mut() {
                let power = pitch.power.unwrap_or(1.0);
                for (idx, value) in segment.pitches.iter_mut().enumerate() {
                    let mut v = value.max(0.0).powf(power);
                    if let Some(weights) = &pitch.weights {
                        v *= weights[idx % weights.len()];
                    }
                    *value = v;
                }
                if pitch.normalize {
                    let total: f64 = segment.pitches.iter().sum();
                    if total > 0.0 {
                        segment.pitches.iter_mut().for_each(|v| *v /= total);
                    }
                }
                renormalize_max(&mut segment.pitches);
            }
        }
        if let Some(timbre) = &bundle.timbre {
            for segment in segments.iter_mut() {
                let n = segment.timbre.len().min(timbre.a.len());
                for idx in 0..n {
                    segment.timbre[idx] = segment.timbre[idx] * timbre.a[idx] + timbre.b[idx];
                }
            }
        }
        if let Some(loudness) = &bundle.loudness {
            for segment in segments.iter_mut() {
                if let Some(start) = &loudness.start {
                    segment.loudness_start = segment.loudness_start * start.a + start.b;
                }
                if let Some(max) = &loudness.max {
                    segment.loudness_max = segment.loudness_max * max.a + max.b;
                }
            }
        }
        if let Some(confidence) = &bundle.confidence {
            for segment in segments.iter_mut() {
                segment.confidence =
                    interp(segment.confidence, &confidence.source, &confidence.target);
            }
        }
    }

    if let Some(maps) = &cfg.segment_quantile_maps {
        for (field, map) in maps {
            for segment in segments.iter_mut() {
                if let Some(value) = field_mut(segment, field) {
                    *value = interp(*value, &map.src, &map.dst);
                }
            }
        }
    }
    if let (Some(scales), Some(biases)) = (&cfg.segment_scalar_scale, &cfg.segment_scalar_bias) {
        for (field, scale) in scales {
            let bias = biases.get(field).copied().unwrap_or(0.0);
            for segment in segments.iter_mut() {
                if let Some(value) = field_mut(segment, field) {
                    *value = *value * scale + bias;
                }
            }
        }
    }

    for segment in segments.iter_mut() {
        segment.confidence = segment.confidence.clamp(0.0, 1.0);
        segment.loudness_max_time = segment.loudness_max_time.clamp(0.0, segment.duration);
    }
}

/// Piecewise-linear offset of segment starts: `start' = start +
/// interp(start/duration, src, dst)`, clamped into the track.
pub fn apply_time_warp(segments: &mut [Segment], cfg: &AnalysisConfig, duration: f64) {
    let (Some(src), Some(dst)) = (&cfg.start_offset_map_src, &cfg.start_offset_map_dst) else {
        return;
    };
    if src.len() < 2 || src.len() != dst.len() || duration <= 0.0 {
        return;
    }
    for segment in segments.iter_mut() {
        let norm = (segment.start / duration).clamp(0.0, 1.0);
        let offset = interp(norm, src, dst);
        segment.start = (segment.start + offset).clamp(0.0, duration);
    }
}

/// Knit loudness across the list: each segment ends where the next starts;
/// the final segment closes on its own start value and runs out the track.
pub fn knit_segments(segments: &mut [Segment], duration: f64) {
    for idx in 0..segments.len().saturating_sub(1) {
        segments[idx].loudness_end = segments[idx + 1].loudness_start;
    }
    if let Some(last) = segments.last_mut() {
        last.loudness_end = last.loudness_start;
        last.duration = (duration - last.start).max(0.0);
    }
}

fn apply_pitch_scale_bias(pitches: &mut [f64], scale: &[f64], bias: &[f64]) {
    if pitches.len() != scale.len() || pitches.len() != bias.len() {
        return;
    }
    for (idx, value) in pitches.iter_mut().enumerate() {
        *value = (*value * scale[idx] + bias[idx]).clamp(0.0, 1.0);
    }
    renormalize_max(pitches);
}

fn apply_pitch_matrix(pitches: &mut Vec<f64>, matrix: &[Vec<f64>], bias: &[f64]) {
    if pitches.len() != matrix.len() || pitches.len() != bias.len() {
        return;
    }
    let n = pitches.len();
    let mut out = vec![0.0; n];
    for (col, slot) in out.iter_mut().enumerate() {
        let mut sum = bias[col];
        for row in 0..n {
            sum += pitches[row] * matrix[row][col];
        }
        *slot = sum.clamp(0.0, 1.0);
    }
    *pitches = out;
    renormalize_max(pitches);
}

/// Rescale so the maximum is exactly 1 (untouched when all-zero).
fn renormalize_max(values: &mut [f64]) {
    let max = values.iter().cloned().fold(0.0, f64::max);
    if max > 0.0 {
        values.iter_mut().for_each(|v| *v /= max);
    }
}

fn field_mut<'a>(segment: &'a mut Segment, field: &str) -> Option<&'a mut f64> {
    match field {
        "confidence" => Some(&mut segment.confidence),
        "loudness_start" => Some(&mut segment.loudness_start),
        "loudness_max" => Some(&mut segment.loudness_max),
        "loudness_max_time" => Some(&mut segment.loudness_max_time),
        "loudness_end" => Some(&mut segment.loudness_end),
        _ => None,
    }
}
