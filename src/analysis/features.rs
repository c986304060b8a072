//! Frame-level DSP primitives: RMS loudness, onset energy, STFT, mel /
//! MFCC, chroma, self-similarity, novelty, peak picking, and the
//! Krumhansl key/mode template match.
//!
//! Everything aggregates in f64; callers downcast only when storing into
//! the artifact. Frame-wise transforms fan out over rayon.

use std::sync::Arc;

use ndarray::{Array2, Axis, s};
use rayon::prelude::*;
use realfft::{RealFftPlanner, RealToComplex};

/// Guard against division by zero in normalizations.
pub const EPS: f64 = 1e-9;

const MIN_RMS: f64 = 1e-12;
const MIN_LOG_MEL: f64 = 1e-10;

// ---------------------------------------------------------------------------
// Framing and loudness
// ---------------------------------------------------------------------------

/// Number of analysis frames for a signal (after right-padding short input).
pub fn frame_count(len: usize, frame_length: usize, hop_length: usize) -> usize {
    let padded = len.max(frame_length);
    1 + (padded - frame_length) / hop_length
}

/// Frame-wise root-mean-square energy.
pub fn rms(y: &[f64], frame_length: usize, hop_length: usize) -> Vec<f64> {
    let n_frames = frame_count(y.len(), frame_length, hop_length);
    (0..n_frames)
        .map(|frame| {
            let start = frame * hop_length;
            let end = (start + frame_length).min(y.len());
            let mut sum_sq = 0.0;
            for &v in &y[start.min(y.len())..end] {
                sum_sq += v * v;
            }
            (sum_sq / frame_length as f64 + MIN_RMS).sqrt()
        })
        .collect()
}

/// Frame-wise loudness in dB, referenced to the loudest frame of the track.
pub fn rms_db(y: &[f64], frame_length: usize, hop_length: usize) -> Vec<f64> {
    let values = rms(y, frame_length, hop_length);
    let reference = values.iter().cloned().fold(MIN_RMS, f64::max);
    values
        .into_iter()
        .map(|v| 20.0 * (v.max(MIN_RMS) / reference).log10())
        .collect()
}

/// Onset strength: positive first difference of frame RMS.
pub fn onset_envelope(y: &[f64], frame_length: usize, hop_length: usize) -> Vec<f64> {
    let values = rms(y, frame_length, hop_length);
    let mut prev = 0.0;
    values
        .into_iter()
        .map(|v| {
            let diff = (v - prev).max(0.0);
            prev = v;
            diff
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Time / frame conversions
// ---------------------------------------------------------------------------

pub fn frames_to_time(frame: usize, sr: u32, hop_length: usize) -> f64 {
    frame as f64 * hop_length as f64 / sr as f64
}

pub fn time_to_frame(time: f64, sr: u32, hop_length: usize) -> usize {
    (time * sr as f64 / hop_length as f64).round().max(0.0) as usize
}

/// Frame span `[start, end)` covering a time interval, end-exclusive and
/// never empty.
pub fn frame_slice(start_s: f64, end_s: f64, sr: u32, hop_length: usize) -> (usize, usize) {
    let start = (start_s * sr as f64 / hop_length as f64).floor().max(0.0) as usize;
    let end = (end_s * sr as f64 / hop_length as f64).ceil() as usize;
    (start, end.max(start + 1))
}

// ---------------------------------------------------------------------------
// Statistics and peak picking
// ---------------------------------------------------------------------------

/// Linear-interpolated percentile (numpy semantics).
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let frac = rank - lower as f64;
    if lower + 1 < sorted.len() {
        sorted[lower] + frac * (sorted[lower + 1] - sorted[lower])
    } else {
        sorted[lower]
    }
}

/// Local maxima at or above `height`, thinned so surviving peaks are at
/// least `min_distance` apart (taller peaks win).
pub fn find_peaks(values: &[f64], height: f64, min_distance: usize) -> Vec<usize> {
    let mut candidates: Vec<usize> = (1..values.len().saturating_sub(1))
        .filter(|&i| values[i] > values[i - 1] && values[i] > values[i + 1] && values[i] >= height)
        .collect();
    if candidates.is_empty() {
        return candidates;
    }
    let min_distance = min_distance.max(1);
    candidates.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut kept: Vec<usize> = Vec::new();
    for idx in candidates {
        if kept
            .iter()
            .all(|&k| idx.abs_diff(k) >= min_distance)
        {
            kept.push(idx);
        }
    }
    kept.sort_unstable();
    kept
}

/// Peaks of a frame series above the given percentile, as frame indices.
pub fn detect_peak_frames(values: &[f64], pct: f64, min_distance: usize) -> Vec<usize> {
    if values.is_empty() {
        return Vec::new();
    }
    let threshold = percentile(values, pct);
    find_peaks(values, threshold, min_distance)
}

/// Peaks of a frame series above a percentile, converted to seconds.
pub fn detect_peak_times(
    values: &[f64],
    sr: u32,
    hop_length: usize,
    pct: f64,
    min_spacing_s: f64,
) -> Vec<f64> {
    let min_distance = ((min_spacing_s * sr as f64 / hop_length as f64) as usize).max(1);
    detect_peak_frames(values, pct, min_distance)
        .into_iter()
        .map(|frame| frames_to_time(frame, sr, hop_length))
        .collect()
}

/// Move each time to its nearest peak when one lies within `window_s`.
pub fn snap_times_to_peaks(times: &[f64], peak_times: &[f64], window_s: f64) -> Vec<f64> {
    if times.is_empty() || peak_times.is_empty() {
        return times.to_vec();
    }
    times
        .iter()
        .map(|&t| {
            let nearest = peak_times
                .iter()
                .cloned()
                .min_by(|a, b| {
                    (a - t)
                        .abs()
                        .partial_cmp(&(b - t).abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(t);
            if (nearest - t).abs() <= window_s {
                nearest
            } else {
                t
            }
        })
        .collect()
}

/// Drop boundaries closer than `min_duration` to their predecessor.
pub fn enforce_min_duration(times: &[f64], min_duration: f64) -> Vec<f64> {
    if times.len() < 2 {
        return times.to_vec();
    }
    let mut merged = vec![times[0]];
    for &t in &times[1..] {
        if t - merged.last().unwrap() >= min_duration {
            merged.push(t);
        }
    }
    merged
}

/// Sort, dedup (within epsilon) and clamp boundary times into
/// `[0, duration]`, always including both endpoints.
pub fn boundary_times(seeds: &[f64], duration: f64) -> Vec<f64> {
    let mut times: Vec<f64> = seeds
        .iter()
        .cloned()
        .filter(|&t| t >= 0.0 && t <= duration)
        .chain([0.0, duration])
        .collect();
    times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    times.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
    if times.len() < 2 {
        return vec![0.0, duration];
    }
    times
}

/// Sample a max-normalized envelope at the given times.
pub fn sample_confidence(times: &[f64], env: &[f64], sr: u32, hop_length: usize) -> Vec<f64> {
    if env.is_empty() {
        return vec![0.0; times.len()];
    }
    let max = env.iter().cloned().fold(0.0, f64::max) + EPS;
    times
        .iter()
        .map(|&t| {
            let frame = time_to_frame(t, sr, hop_length).min(env.len() - 1);
            env[frame] / max
        })
        .collect()
}

/// Piecewise-linear interpolation with clamped ends (numpy `interp`).
pub fn interp(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    debug_assert_eq!(xs.len(), ys.len());
    if xs.is_empty() {
        return x;
    }
    if x <= xs[0] {
        return ys[0];
    }
    if x >= xs[xs.len() - 1] {
        return ys[ys.len() - 1];
    }
    let idx = xs.partition_point(|&v| v <= x).min(xs.len() - 1);
    let (x0, x1) = (xs[idx - 1], xs[idx]);
    let (y0, y1) = (ys[idx - 1], ys[idx]);
    if (x1 - x0).abs() < f64::EPSILON {
        return y0;
    }
    y0 + (x - x0) / (x1 - x0) * (y1 - y0)
}

/// Box-filter smoothing with edge padding (`same` length output).
pub fn box_smooth(values: &[f64], width: usize) -> Vec<f64> {
    if values.is_empty() || width <= 1 {
        return values.to_vec();
    }
    let half = width / 2;
    (0..values.len())
        .map(|i| {
            let mut sum = 0.0;
            for k in 0..width {
                let idx = (i + k).saturating_sub(half).min(values.len() - 1);
                sum += values[idx];
            }
            sum / width as f64
        })
        .collect()
}

/// Scale a vector so its maximum is 1 (all zeros when non-positive).
pub fn normalize_max(vec: &[f64]) -> Vec<f64> {
    let max = vec.iter().cloned().fold(0.0, f64::max);
    if max <= 0.0 {
        return vec![0.0; vec.len()];
    }
    vec.iter().map(|&v| v / max).collect()
}

// ---------------------------------------------------------------------------
// Spectra
// ---------------------------------------------------------------------------

/// STFT magnitude: bin center frequencies plus a `bins x frames` matrix.
pub struct Stft {
    pub freqs: Vec<f64>,
    pub magnitude: Array2<f64>,
}

/// Hann-windowed STFT magnitude over right-padded frames.
pub fn stft_magnitude(y: &[f64], sr: u32, n_fft: usize, hop_length: usize) -> Stft {
    let n_bins = n_fft / 2 + 1;
    let n_frames = frame_count(y.len(), n_fft, hop_length);
    let freqs: Vec<f64> = (0..n_bins)
        .map(|i| i as f64 * sr as f64 / n_fft as f64)
        .collect();

    let mut planner = RealFftPlanner::<f64>::new();
    let fft: Arc<dyn RealToComplex<f64>> = planner.plan_fft_forward(n_fft);
    // Hann window for reduced spectral leakage
    let window: Vec<f64> = (0..n_fft)
        .map(|i| {
            let x = std::f64::consts::PI * 2.0 * i as f64 / (n_fft - 1) as f64;
            0.5 * (1.0 - x.cos())
        })
        .collect();

    let columns: Vec<Vec<f64>> = (0..n_frames)
        .into_par_iter()
        .map(|frame| {
            let start = frame * hop_length;
            let mut input = vec![0.0f64; n_fft];
            for (i, slot) in input.iter_mut().enumerate() {
                if let Some(&v) = y.get(start + i) {
                    *slot = v * window[i];
                }
            }
            let mut output = fft.make_output_vec();
            // Zero input is the only failure mode and we always match lengths
            let _ = fft.process(&mut input, &mut output);
            output.iter().map(|c| c.norm()).collect()
        })
        .collect();

    let mut magnitude = Array2::zeros((n_bins, n_frames));
    for (frame, column) in columns.iter().enumerate() {
        for (bin, &value) in column.iter().enumerate() {
            magnitude[[bin, frame]] = value;
        }
    }
    Stft { freqs, magnitude }
}

/// Triangular mel filter bank (`n_mels x (n_fft/2 + 1)`).
pub fn mel_filter_bank(sr: u32, n_fft: usize, n_mels: usize) -> Array2<f64> {
    fn hz_to_mel(freq: f64) -> f64 {
        2595.0 * (1.0 + freq / 700.0).log10()
    }
    fn mel_to_hz(mel: f64) -> f64 {
        700.0 * (10f64.powf(mel / 2595.0) - 1.0)
    }

    let n_bins = n_fft / 2 + 1;
    let mel_max = hz_to_mel(sr as f64 / 2.0);
    let bin_points: Vec<usize> = (0..n_mels + 2)
        .map(|i| {
            let mel = mel_max * i as f64 / (n_mels + 1) as f64;
            (((n_fft + 1) as f64 * mel_to_hz(mel) / sr as f64).floor() as usize).min(n_bins - 1)
        })
        .collect();

    let mut filters = Array2::zeros((n_mels, n_bins));
    for m in 0..n_mels {
        let (left, center, right) = (bin_points[m], bin_points[m + 1], bin_points[m + 2]);
        if right <= left {
            continue;
        }
        for bin in left..center {
            filters[[m, bin]] = (bin - left) as f64 / (center - left).max(1) as f64;
        }
        for bin in center..right {
            filters[[m, bin]] = (right - bin) as f64 / (right - center).max(1) as f64;
        }
    }
    filters
}

/// Log10 mel energies (`n_mels x frames`).
pub fn log_mel_frames(
    y: &[f64],
    sr: u32,
    hop_length: usize,
    frame_length: usize,
    n_mels: usize,
) -> Array2<f64> {
    let stft = stft_magnitude(y, sr, frame_length, hop_length);
    let power = stft.magnitude.mapv(|m| m * m);
    let filters = mel_filter_bank(sr, frame_length, n_mels);
    filters.dot(&power).mapv(|e| e.max(MIN_LOG_MEL).log10())
}

/// MFCCs via orthonormal DCT-II of the log-mel spectrum
/// (`n_mfcc x frames`). With `include_0th` the DC coefficient is kept,
/// otherwise coefficients 1..=n_mfcc are returned.
pub fn mfcc_frames(
    y: &[f64],
    sr: u32,
    hop_length: usize,
    frame_length: usize,
    n_mfcc: usize,
    n_mels: usize,
    include_0th: bool,
) -> Array2<f64> {
    let log_mel = log_mel_frames(y, sr, hop_length, frame_length, n_mels);
    let first = if include_0th { 0 } else { 1 };
    let dct = dct_matrix(n_mels, first, n_mfcc);
    dct.dot(&log_mel)
}

/// Rows `first..first + count` of the orthonormal DCT-II matrix of size N.
fn dct_matrix(n: usize, first: usize, count: usize) -> Array2<f64> {
    let mut matrix = Array2::zeros((count, n));
    for row in 0..count {
        let k = first + row;
        let scale = if k == 0 {
            (1.0 / n as f64).sqrt()
        } else {
            (2.0 / n as f64).sqrt()
        };
        for col in 0..n {
            matrix[[row, col]] =
                scale * (std::f64::consts::PI * (col as f64 + 0.5) * k as f64 / n as f64).cos();
        }
    }
    matrix
}

/// 12-bin pitch-class energy: STFT power summed into each bin's nearest
/// MIDI pitch class (`12 x frames`).
pub fn chroma_frames(y: &[f64], sr: u32, hop_length: usize, frame_length: usize) -> Array2<f64> {
    let stft = stft_magnitude(y, sr, frame_length, hop_length);
    let n_frames = stft.magnitude.ncols();
    let mut chroma = Array2::zeros((12, n_frames));
    for (bin, &freq) in stft.freqs.iter().enumerate() {
        if freq <= 0.0 {
            continue;
        }
        let midi = 69.0 + 12.0 * (freq / 440.0).log2();
        let pitch_class = (midi.round() as i64).rem_euclid(12) as usize;
        for frame in 0..n_frames {
            let m = stft.magnitude[[bin, frame]];
            chroma[[pitch_class, frame]] += m * m;
        }
    }
    chroma
}

/// CQT-like magnitude in dB: log-spaced sampling of the nearest STFT bins
/// (`n_bins x frames`), from C1 upward.
pub fn cqt_like(
    y: &[f64],
    sr: u32,
    hop_length: usize,
    frame_length: usize,
    bins_per_octave: usize,
    n_bins: usize,
) -> Array2<f64> {
    const FMIN: f64 = 32.703;
    let stft = stft_magnitude(y, sr, frame_length, hop_length);
    let n_frames = stft.magnitude.ncols();
    let mut out = Array2::zeros((n_bins, n_frames));
    for row in 0..n_bins {
        let target = (FMIN * 2f64.powf(row as f64 / bins_per_octave as f64))
            .clamp(stft.freqs[0], *stft.freqs.last().unwrap());
        let nearest = stft
            .freqs
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                (*a - target)
                    .abs()
                    .partial_cmp(&(*b - target).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0);
        for frame in 0..n_frames {
            out[[row, frame]] = 20.0 * stft.magnitude[[nearest, frame]].max(EPS).log10();
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Beat-synchronous aggregates and self-similarity
// ---------------------------------------------------------------------------

/// Column means between successive beat frames
/// (`rows x (beat_frames.len() - 1)`).
pub fn beat_sync_mean(feature: &Array2<f64>, beat_frames: &[usize]) -> Array2<f64> {
    let rows = feature.nrows();
    if feature.ncols() == 0 || beat_frames.len() < 2 {
        return Array2::zeros((rows, 0));
    }
    let mut clamped: Vec<usize> = beat_frames
        .iter()
        .map(|&f| f.min(feature.ncols() - 1))
        .collect();
    clamped.dedup();
    if clamped.len() < 2 {
        return Array2::zeros((rows, 0));
    }
    let mut synced = Array2::zeros((rows, clamped.len() - 1));
    for idx in 0..clamped.len() - 1 {
        let (start, end) = (clamped[idx], clamped[idx + 1]);
        if end <= start {
            continue;
        }
        let mean = feature.slice(s![.., start..end]).mean_axis(Axis(1)).unwrap();
        synced.column_mut(idx).assign(&mean);
    }
    synced
}

/// Pairwise cosine similarity of feature columns (`frames x frames`).
pub fn cosine_similarity_matrix(feature: &Array2<f64>) -> Array2<f64> {
    let n = feature.ncols();
    if n == 0 {
        return Array2::zeros((0, 0));
    }
    let mut normalized = feature.clone();
    for mut column in normalized.columns_mut() {
        let norm = column.dot(&column).sqrt() + EPS;
        column.mapv_inplace(|v| v / norm);
    }
    normalized.t().dot(&normalized)
}

/// Cosine similarity of two vectors.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    dot / (norm_a * norm_b + EPS)
}

/// Checkerboard-kernel novelty along the SSM diagonal, min-max normalized
/// to [0, 1].
pub fn novelty_from_ssm(ssm: &Array2<f64>, kernel_size: usize) -> Vec<f64> {
    let size = ssm.nrows();
    if size == 0 || kernel_size < 1 {
        return Vec::new();
    }
    let k = kernel_size.min(size / 2);
    if k < 1 {
        return vec![0.0; size];
    }
    let mut novelty = vec![0.0; size];
    for idx in k..size - k {
        let a = ssm.slice(s![idx - k..idx, idx - k..idx]).sum();
        let b = ssm.slice(s![idx - k..idx, idx..idx + k]).sum();
        let c = ssm.slice(s![idx..idx + k, idx - k..idx]).sum();
        let d = ssm.slice(s![idx..idx + k, idx..idx + k]).sum();
        novelty[idx] = a + d - b - c;
    }
    let min = novelty.iter().cloned().fold(f64::INFINITY, f64::min);
    let mut max = f64::NEG_INFINITY;
    for v in novelty.iter_mut() {
        *v -= min;
        max = max.max(*v);
    }
    let denom = max + EPS;
    for v in novelty.iter_mut() {
        *v /= denom;
    }
    novelty
}

// ---------------------------------------------------------------------------
// Key and mode
// ---------------------------------------------------------------------------

/// Key/mode estimate from a mean chroma vector.
#[derive(Debug, Clone, Copy)]
pub struct KeyMode {
    /// Pitch class 0..=11
    pub key: i64,
    pub key_confidence: f64,
    /// 1 = major, 0 = minor
    pub mode: i64,
    pub mode_confidence: f64,
}

/// Correlate chroma against the 24 rotated Krumhansl profiles.
pub fn key_mode_from_chroma(chroma: &[f64]) -> KeyMode {
    const MAJOR: [f64; 12] = [
        6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
    ];
    const MINOR: [f64; 12] = [
        6.33, 2.68, 3.52, 5.38, 2.6, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17,
    ];

    let total: f64 = chroma.iter().sum::<f64>() + EPS;
    let normalized: Vec<f64> = chroma.iter().map(|&v| v / total).collect();

    let score = |profile: &[f64; 12], shift: usize| -> f64 {
        let rolled: Vec<f64> = (0..12).map(|i| profile[(12 + i - shift) % 12]).collect();
        pearson(&normalized, &rolled)
    };

    let mut best_major = (0usize, f64::NEG_INFINITY);
    let mut best_minor = (0usize, f64::NEG_INFINITY);
    for shift in 0..12 {
        let major = score(&MAJOR, shift);
        if major > best_major.1 {
            best_major = (shift, major);
        }
        let minor = score(&MINOR, shift);
        if minor > best_minor.1 {
            best_minor = (shift, minor);
        }
    }

    if best_major.1 >= best_minor.1 {
        KeyMode {
            key: best_major.0 as i64,
            key_confidence: ((best_major.1 + 1.0) / 2.0).clamp(0.0, 1.0),
            mode: 1,
            mode_confidence: ((best_major.1 - best_minor.1 + 1.0) / 2.0).clamp(0.0, 1.0),
        }
    } else {
        KeyMode {
            key: best_minor.0 as i64,
            key_confidence: ((best_minor.1 + 1.0) / 2.0).clamp(0.0, 1.0),
            mode: 0,
            mode_confidence: ((best_minor.1 - best_major.1 + 1.0) / 2.0).clamp(0.0, 1.0),
        }
    }
}

/// Pearson correlation; 0 when either side is constant.
fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    let denom = (var_a * var_b).sqrt();
    if denom < EPS { 0.0 } else { cov / denom }
}
