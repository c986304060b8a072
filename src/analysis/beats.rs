//! Beat tracking.
//!
//! The default path derives a global tempo from the autocorrelation of the
//! onset envelope and lays a uniform beat grid; the caller then snaps grid
//! points to nearby onset peaks. The optional path consumes frame
//! activations from a pretrained downbeat model ([`DownbeatModel`]) and
//! decodes beats and downbeats with Viterbi over 3/4 and 4/4 bar-position
//! HMMs, keeping whichever meter scores higher.

use realfft::RealFftPlanner;

use super::features::{self, EPS};
use crate::error::Result;

/// Frame activation sequence produced by a downbeat model.
#[derive(Debug, Clone)]
pub struct Activations {
    /// Activation frames per second
    pub fps: f64,
    /// Beat salience per frame, in [0, 1]
    pub values: Vec<f64>,
}

/// A pretrained model that scores every activation frame for beat salience.
pub trait DownbeatModel: Send + Sync {
    fn activations(&self, y: &[f64], sr: u32) -> Result<Activations>;
}

/// Result of the default (autocorrelation) beat tracker.
#[derive(Debug, Clone)]
pub struct BeatGrid {
    /// Global tempo in BPM
    pub tempo: f64,
    /// Uniform grid of beat starts in seconds
    pub times: Vec<f64>,
}

/// Beats decoded from downbeat-model activations.
#[derive(Debug, Clone)]
pub struct TrackedBeats {
    pub times: Vec<f64>,
    /// 1-based position within the bar; 1 marks a downbeat
    pub beat_numbers: Vec<usize>,
    pub confidences: Vec<f64>,
    /// Beats per bar of the winning meter
    pub meter: usize,
}

/// Autocorrelation of a signal for lags `0..n`, via FFT.
pub fn autocorrelate(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let fft_len = (2 * n).next_power_of_two();
    let mut planner = RealFftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(fft_len);
    let ifft = planner.plan_fft_inverse(fft_len);

    let mut input = vec![0.0f64; fft_len];
    input[..n].copy_from_slice(values);
    let mut spectrum = fft.make_output_vec();
    let _ = fft.process(&mut input, &mut spectrum);
    for c in spectrum.iter_mut() {
        *c = rustfft::num_complex::Complex::new(c.norm_sqr(), 0.0);
    }
    let mut output = vec![0.0f64; fft_len];
    let _ = ifft.process(&mut spectrum, &mut output);
    let scale = 1.0 / fft_len as f64;
    output.truncate(n);
    output.iter_mut().for_each(|v| *v *= scale);
    output
}

/// Tempo from the onset envelope: argmax of the mean-removed
/// autocorrelation over the lag range spanned by the BPM bounds.
pub fn tempo_from_onset_env(
    env: &[f64],
    sr: u32,
    hop_length: usize,
    min_bpm: f64,
    max_bpm: f64,
) -> f64 {
    if env.len() < 2 {
        return 120.0;
    }
    let mean = env.iter().sum::<f64>() / env.len() as f64;
    let centered: Vec<f64> = env.iter().map(|&v| v - mean).collect();
    let autocorr = autocorrelate(&centered);

    let frames_per_second = sr as f64 / hop_length as f64;
    let min_lag = (frames_per_second * 60.0 / max_bpm) as usize;
    let max_lag = ((frames_per_second * 60.0 / min_bpm) as usize).min(autocorr.len());
    if max_lag <= min_lag {
        return 120.0;
    }
    let lag = (min_lag..max_lag)
        .max_by(|&a, &b| {
            autocorr[a]
                .partial_cmp(&autocorr[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(min_lag)
        .max(1);
    (60.0 * frames_per_second / lag as f64).clamp(min_bpm, max_bpm)
}

/// Default beat path: global tempo plus a uniform grid over the duration.
pub fn beat_grid(env: &[f64], sr: u32, hop_length: usize, duration: f64, min_bpm: f64, max_bpm: f64) -> BeatGrid {
    let tempo = tempo_from_onset_env(env, sr, hop_length, min_bpm, max_bpm);
    BeatGrid {
        tempo,
        times: uniform_grid(duration, tempo),
    }
}

/// Beat starts every `60/tempo` seconds across `[0, duration)`.
pub fn uniform_grid(duration: f64, tempo: f64) -> Vec<f64> {
    let step = 60.0 / tempo.max(EPS);
    let mut times = Vec::new();
    let mut t = 0.0;
    while t < duration.max(0.01) {
        times.push(t);
        t += step;
    }
    times
}

/// Decode beats/downbeats from model activations.
///
/// Runs Viterbi over a cyclic bar-position HMM once per candidate meter
/// (3/4 and 4/4) and keeps the higher-likelihood path. Beat instants are
/// refined by a parabolic fit around each activation peak; confidence is
/// the min-max normalized activation at the refined peak.
pub fn track_downbeats(
    activations: &Activations,
    min_bpm: f64,
    max_bpm: f64,
) -> Option<TrackedBeats> {
    let act = &activations.values;
    if act.len() < 4 {
        return None;
    }
    // Beat period in activation frames, from the activation autocorrelation
    let mean = act.iter().sum::<f64>() / act.len() as f64;
    let centered: Vec<f64> = act.iter().map(|&v| v - mean).collect();
    let autocorr = autocorrelate(&centered);
    let min_lag = ((activations.fps * 60.0 / max_bpm) as usize).max(2);
    let max_lag = ((activations.fps * 60.0 / min_bpm) as usize).min(autocorr.len());
    if max_lag <= min_lag {
        return None;
    }
    let period = (min_lag..max_lag)
        .max_by(|&a, &b| {
            autocorr[a]
                .partial_cmp(&autocorr[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(min_lag);

    let mut best: Option<(f64, Vec<usize>, usize)> = None;
    for meter in [3usize, 4usize] {
        if let Some((score, path)) = viterbi_bar_positions(act, period, meter) {
            if best.as_ref().is_none_or(|(b, _, _)| score > *b) {
                best = Some((score, path, meter));
            }
        }
    }
    let (_, path, meter) = best?;

    // Beat frames are entries into a beat-aligned state
    let mut frames = Vec::new();
    let mut numbers = Vec::new();
    let mut prev_state = usize::MAX;
    for (frame, &state) in path.iter().enumerate() {
        if state % period == 0 && state != prev_state {
            frames.push(frame);
            numbers.push(state / period + 1);
        }
        prev_state = state;
    }
    if frames.is_empty() {
        return None;
    }

    let (min_act, max_act) = act
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let spread = (max_act - min_act).max(EPS);

    let mut times = Vec::with_capacity(frames.len());
    let mut confidences = Vec::with_capacity(frames.len());
    for &frame in &frames {
        let (refined, peak) = refine_peak(act, frame);
        times.push(refined / activations.fps);
        confidences.push(((act[peak] - min_act) / spread).clamp(0.0, 1.0));
    }

    Some(TrackedBeats {
        times,
        beat_numbers: numbers,
        confidences,
        meter,
    })
}

/// Viterbi over a cyclic chain of `meter * period` bar positions.
///
/// Positions advance by one frame per step with small stay/skip
/// probabilities absorbing tempo drift. Beat-aligned positions emit the
/// activation, all others its complement; the downbeat position weights
/// the activation twice, so the meter whose downbeats land on accented
/// frames scores higher.
fn viterbi_bar_positions(act: &[f64], period: usize, meter: usize) -> Option<(f64, Vec<usize>)> {
    let n_states = meter * period;
    let n_frames = act.len();
    if n_states == 0 || n_frames == 0 {
        return None;
    }

    const P_ADVANCE: f64 = 0.9;
    const P_STAY: f64 = 0.05;
    const P_SKIP: f64 = 0.05;
    let log_advance = P_ADVANCE.ln();
    let log_stay = P_STAY.ln();
    let log_skip = P_SKIP.ln();

    let emit = |state: usize, frame: usize| -> f64 {
        let p = act[frame].clamp(1e-3, 1.0 - 1e-3);
        if state == 0 {
            2.0 * p.ln()
        } else if state % period == 0 {
            p.ln()
        } else {
            (1.0 - p).ln()
        }
    };

    let mut score: Vec<f64> = (0..n_states)
        .map(|s| -(n_states as f64).ln() + emit(s, 0))
        .collect();
    let mut backpointers: Vec<Vec<usize>> = Vec::with_capacity(n_frames);
    backpointers.push((0..n_states).collect());

    let mut next = vec![f64::NEG_INFINITY; n_states];
    for frame in 1..n_frames {
        let mut back = vec![0usize; n_states];
        for state in 0..n_states {
            // Predecessors: advance from state-1, stay, skip from state-2
            let from_advance = (state + n_states - 1) % n_states;
            let from_skip = (state + n_states - 2) % n_states;
            let candidates = [
                (from_advance, score[from_advance] + log_advance),
                (state, score[state] + log_stay),
                (from_skip, score[from_skip] + log_skip),
            ];
            let (arg, best) = candidates
                .iter()
                .cloned()
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .unwrap();
            next[state] = best + emit(state, frame);
            back[state] = arg;
        }
        std::mem::swap(&mut score, &mut next);
        backpointers.push(back);
    }

    let (mut state, best) = score
        .iter()
        .cloned()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;
    let mut path = vec![0usize; n_frames];
    for frame in (0..n_frames).rev() {
        path[frame] = state;
        state = backpointers[frame][state];
    }
    Some((best, path))
}

/// Parabolic refinement of a peak position around `frame`.
///
/// Returns the sub-frame position and the integer peak used for it.
fn refine_peak(values: &[f64], frame: usize) -> (f64, usize) {
    let count = values.len();
    if frame == 0 || frame + 1 >= count {
        return (frame as f64, frame);
    }
    // Re-center on the local maximum among immediate neighbors
    let peak = (frame - 1..=frame + 1)
        .max_by(|&a, &b| {
            values[a]
                .partial_cmp(&values[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(frame);
    if peak == 0 || peak + 1 >= count {
        return (peak as f64, peak);
    }
    let (y1, y2, y3) = (values[peak - 1], values[peak], values[peak + 1]);
    let denom = y1 - 2.0 * y2 + y3;
    if denom.abs() < 1e-12 {
        return (peak as f64, peak);
    }
    let delta = (0.5 * (y1 - y3) / denom).clamp(-0.5, 0.5);
    (peak as f64 + delta, peak)
}

/// Snap a beat grid to onset peaks and sample per-beat confidence.
pub fn snap_and_score(
    times: &[f64],
    onset_env: &[f64],
    sr: u32,
    hop_length: usize,
    onset_percentile: f64,
    onset_min_spacing_s: f64,
    snap_window_s: f64,
) -> (Vec<f64>, Vec<f64>) {
    let peaks = features::detect_peak_times(
        onset_env,
        sr,
        hop_length,
        onset_percentile,
        onset_min_spacing_s,
    );
    let snapped = features::snap_times_to_peaks(times, &peaks, snap_window_s);
    let confidences = features::sample_confidence(&snapped, onset_env, sr, hop_length);
    (snapped, confidences)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn click_track(period: usize, beats: usize, accent_every: usize) -> Vec<f64> {
        let mut act = vec![0.02; period * beats + 1];
        for beat in 0..beats {
            let frame = beat * period;
            act[frame] = if beat % accent_every == 0 { 0.95 } else { 0.8 };
        }
        act
    }

    #[test]
    fn autocorrelation_peaks_at_signal_period() {
        let mut signal = vec![0.0; 200];
        for i in (0..200).step_by(20) {
            signal[i] = 1.0;
        }
        let mean = signal.iter().sum::<f64>() / signal.len() as f64;
        let centered: Vec<f64> = signal.iter().map(|v| v - mean).collect();
        let ac = autocorrelate(&centered);
        let lag = (10..30)
            .max_by(|&a, &b| ac[a].partial_cmp(&ac[b]).unwrap())
            .unwrap();
        assert_eq!(lag, 20);
    }

    #[test]
    fn tempo_recovered_from_synthetic_onsets() {
        // 120 BPM at sr 22050 / hop 512 → beat every ~21.5 frames
        let frames_per_beat = 22050.0 / 512.0 * 0.5;
        let mut env = vec![0.0; 2000];
        let mut t = 0.0;
        while (t as usize) < env.len() {
            env[t as usize] = 1.0;
            t += frames_per_beat;
        }
        let tempo = tempo_from_onset_env(&env, 22050, 512, 60.0, 200.0);
        assert!((tempo - 120.0).abs() < 6.0, "tempo {tempo}");
    }

    #[test]
    fn uniform_grid_spans_duration() {
        let grid = uniform_grid(10.0, 120.0);
        assert_eq!(grid.len(), 20);
        assert!((grid[1] - 0.5).abs() < 1e-12);
        assert!(*grid.last().unwrap() < 10.0);
    }

    #[test]
    fn downbeat_tracker_prefers_four_four_accents() {
        let act = Activations {
            fps: 100.0,
            values: click_track(50, 32, 4),
        };
        let tracked = track_downbeats(&act, 60.0, 200.0).unwrap();
        assert_eq!(tracked.meter, 4);
        // Beat numbers cycle through the bar
        assert!(tracked.beat_numbers.iter().all(|&n| (1..=4).contains(&n)));
        assert!(tracked.beat_numbers.contains(&1));
        // Beats land near the impulse frames (0.5 s apart)
        for window in tracked.times.windows(2) {
            let gap = window[1] - window[0];
            assert!((gap - 0.5).abs() < 0.1, "gap {gap}");
        }
        assert!(tracked.confidences.iter().all(|&c| (0.0..=1.0).contains(&c)));
    }

    #[test]
    fn downbeat_tracker_prefers_three_four_accents() {
        let act = Activations {
            fps: 100.0,
            values: click_track(50, 30, 3),
        };
        let tracked = track_downbeats(&act, 60.0, 200.0).unwrap();
        assert_eq!(tracked.meter, 3);
    }

    #[test]
    fn downbeat_tracker_rejects_tiny_input() {
        let act = Activations {
            fps: 100.0,
            values: vec![0.5; 3],
        };
        assert!(track_downbeats(&act, 60.0, 200.0).is_none());
    }

    #[test]
    fn refine_peak_is_clamped_and_centered() {
        let values = [0.0, 1.0, 0.5, 0.0];
        let (refined, peak) = refine_peak(&values, 1);
        assert_eq!(peak, 1);
        assert!(refined >= 0.5 && refined <= 1.5);
        // Edges fall back to the integer frame
        assert_eq!(refine_peak(&values, 0).0, 0.0);
    }

    #[test]
    fn snap_and_score_moves_grid_onto_onsets() {
        // Envelope with clear peaks at frames 20 and 40
        let mut env = vec![0.0; 64];
        env[20] = 1.0;
        env[40] = 0.9;
        let frame_s = 512.0 / 22050.0;
        let grid = [20.5 * frame_s, 40.6 * frame_s];
        let (snapped, conf) = snap_and_score(&grid, &env, 22050, 512, 75.0, 0.05, 0.07);
        assert!((snapped[0] - 20.0 * frame_s).abs() < 1e-9);
        assert!((snapped[1] - 40.0 * frame_s).abs() < 1e-9);
        assert!(conf[0] > 0.99);
        assert!(conf[1] > 0.85);
    }
}
