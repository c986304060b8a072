//! The analysis artifact: typed events plus output hygiene.
//!
//! Events are stored in plain vectors per kind (sections, bars, beats,
//! tatums, segments); relationships are positional, never pointered. Lists
//! are dense: each event's duration chains to the next start, and the last
//! event closes out at the track duration.

use serde::{Deserialize, Serialize};

/// Values with magnitude below this round to exactly zero on output,
/// except inside `pitches`/`timbre` where small values carry signal.
const SMALL_VALUE: f64 = 1e-4;

/// Whole-track summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Track length in seconds
    pub duration: f64,
    /// Global tempo estimate in BPM
    pub tempo: f64,
    pub time_signature: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
}

/// A timed event shared by sections, bars, beats and tatums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub start: f64,
    pub duration: f64,
    pub confidence: f64,
}

/// A long musical phrase with tonal and tempo descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub start: f64,
    pub duration: f64,
    pub confidence: f64,
    /// Mean loudness over the section in dB (relative to track max RMS)
    pub loudness: f64,
    pub tempo: f64,
    pub tempo_confidence: f64,
    /// Pitch class 0..=11 (C..B)
    pub key: i64,
    pub key_confidence: f64,
    /// 1 = major, 0 = minor
    pub mode: i64,
    pub mode_confidence: f64,
    pub time_signature: i64,
    pub time_signature_confidence: f64,
}

/// A short timbral/harmonic event within a beat or two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub duration: f64,
    pub confidence: f64,
    pub loudness_start: f64,
    pub loudness_max: f64,
    /// Offset of the loudness peak from the segment start, seconds
    pub loudness_max_time: f64,
    pub loudness_end: f64,
    /// 12 pitch classes, max-normalized to [0, 1]
    pub pitches: Vec<f64>,
    pub timbre: Vec<f64>,
}

/// The complete artifact consumed by the jukebox player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub track: TrackInfo,
    pub sections: Vec<Section>,
    pub bars: Vec<Event>,
    pub beats: Vec<Event>,
    pub tatums: Vec<Event>,
    pub segments: Vec<Segment>,
}

/// Round to 5 decimal places. Applying twice is a no-op.
pub fn round5(value: f64) -> f64 {
    (value * 1e5).round() / 1e5
}

fn round5_zeroed(value: f64) -> f64 {
    let rounded = round5(value);
    if rounded.abs() < SMALL_VALUE { 0.0 } else { rounded }
}

impl Analysis {
    /// Apply output hygiene in place: round every float to 5 decimals and
    /// zero near-zero values outside `pitches`/`timbre`.
    pub fn round_for_output(&mut self) {
        self.track.duration = round5_zeroed(self.track.duration);
        self.track.tempo = round5_zeroed(self.track.tempo);

        for event in self
            .bars
            .iter_mut()
            .chain(self.beats.iter_mut())
            .chain(self.tatums.iter_mut())
        {
            event.start = round5_zeroed(event.start);
            event.duration = round5_zeroed(event.duration);
            event.confidence = round5_zeroed(event.confidence);
        }

        for section in &mut self.sections {
            section.start = round5_zeroed(section.start);
            section.duration = round5_zeroed(section.duration);
            section.confidence = round5_zeroed(section.confidence);
            section.loudness = round5_zeroed(section.loudness);
            section.tempo = round5_zeroed(section.tempo);
            section.tempo_confidence = round5_zeroed(section.tempo_confidence);
            section.key_confidence = round5_zeroed(section.key_confidence);
            section.mode_confidence = round5_zeroed(section.mode_confidence);
            section.time_signature_confidence = round5_zeroed(section.time_signature_confidence);
        }

        for segment in &mut self.segments {
            segment.start = round5_zeroed(segment.start);
            segment.duration = round5_zeroed(segment.duration);
            segment.confidence = round5_zeroed(segment.confidence);
            segment.loudness_start = round5_zeroed(segment.loudness_start);
            segment.loudness_max = round5_zeroed(segment.loudness_max);
            segment.loudness_max_time = round5_zeroed(segment.loudness_max_time);
            segment.loudness_end = round5_zeroed(segment.loudness_end);
            for value in segment.pitches.iter_mut().chain(segment.timbre.iter_mut()) {
                *value = round5(*value);
            }
        }
    }

    /// Fill in title/artist when the artifact has none (never the reverse).
    pub fn overlay_track_metadata(&mut self, title: Option<&str>, artist: Option<&str>) {
        if self.track.title.is_none() {
            if let Some(title) = title.filter(|t| !t.is_empty()) {
                self.track.title = Some(title.to_string());
            }
        }
        if self.track.artist.is_none() {
            if let Some(artist) = artist.filter(|a| !a.is_empty()) {
                self.track.artist = Some(artist.to_string());
            }
        }
    }

    /// Compact JSON encoding used for the on-disk artifact.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Build dense events from sorted start times.
///
/// Each event runs to the next start; the last runs to `duration`.
/// Degenerate (non-positive length) entries are dropped.
pub fn events_from_times(times: &[f64], confidences: &[f64], duration: f64) -> Vec<Event> {
    let mut events = Vec::with_capacity(times.len());
    for (idx, &start) in times.iter().enumerate() {
        let end = times.get(idx + 1).copied().unwrap_or(duration);
        if end <= start {
            continue;
        }
        events.push(Event {
            start,
            duration: end - start,
            confidence: confidences.get(idx).copied().unwrap_or(0.0),
        });
    }
    events
}

/// Stretch the final event so the list closes exactly at `duration`.
pub fn close_last_event(events: &mut [Event], duration: f64) {
    if let Some(last) = events.last_mut() {
        if last.start < 0.0 {
            last.start = 0.0;
        }
        last.duration = (duration - last.start).max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_analysis() -> Analysis {
        Analysis {
            track: TrackInfo {
                duration: 10.000004,
                tempo: 120.123456,
                time_signature: 4,
                title: None,
                artist: None,
            },
            sections: vec![],
            bars: vec![],
            beats: vec![Event {
                start: 0.0000312,
                duration: 0.5,
                confidence: 0.87654321,
            }],
            tatums: vec![],
            segments: vec![Segment {
                start: 0.0,
                duration: 0.5,
                confidence: 0.5,
                loudness_start: -30.000001,
                loudness_max: -0.00001,
                loudness_max_time: 0.25,
                loudness_end: -28.0,
                pitches: vec![0.00002, 1.0],
                timbre: vec![-0.00003, 4.2],
            }],
        }
    }

    #[test]
    fn rounding_zeroes_small_values_outside_vectors() {
        let mut analysis = sample_analysis();
        analysis.round_for_output();
        assert_eq!(analysis.beats[0].start, 0.0);
        assert_eq!(analysis.segments[0].loudness_max, 0.0);
        // pitches/timbre retain small values (rounded, not zeroed)
        assert_eq!(analysis.segments[0].pitches[0], 0.00002);
        assert_eq!(analysis.segments[0].timbre[0], -0.00003);
    }

    #[test]
    fn rounding_is_idempotent() {
        let mut once = sample_analysis();
        once.round_for_output();
        let mut twice = once.clone();
        twice.round_for_output();
        assert_eq!(once.to_json().unwrap(), twice.to_json().unwrap());
    }

    #[test]
    fn overlay_fills_only_missing_fields() {
        let mut analysis = sample_analysis();
        analysis.track.title = Some("From Tags".into());
        analysis.overlay_track_metadata(Some("From Job"), Some("Artist"));
        assert_eq!(analysis.track.title.as_deref(), Some("From Tags"));
        assert_eq!(analysis.track.artist.as_deref(), Some("Artist"));
    }

    #[test]
    fn serde_roundtrip_preserves_shape() {
        let mut analysis = sample_analysis();
        analysis.round_for_output();
        let json = analysis.to_json().unwrap();
        let parsed: Analysis = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.beats.len(), 1);
        assert_eq!(parsed.segments[0].pitches.len(), 2);
        // Absent title/artist stay out of the payload entirely
        assert!(!json.contains("\"title\""));
    }

    #[test]
    fn events_from_times_drops_degenerate_entries() {
        let events = events_from_times(&[0.0, 1.0, 1.0, 2.0], &[1.0, 1.0, 1.0, 1.0], 3.0);
        assert_eq!(events.len(), 3);
        assert!((events[0].duration - 1.0).abs() < 1e-12);
        assert!((events.last().unwrap().duration - 1.0).abs() < 1e-12);
    }

    #[test]
    fn close_last_event_reaches_duration() {
        let mut events = events_from_times(&[0.0, 1.0], &[1.0, 1.0], 2.0);
        events.last_mut().unwrap().duration = 0.25;
        close_last_event(&mut events, 2.0);
        let last = events.last().unwrap();
        assert!((last.start + last.duration - 2.0).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn round5_idempotent(value in -1e6f64..1e6f64) {
            let once = round5(value);
            prop_assert_eq!(once, round5(once));
        }

        #[test]
        fn events_are_ordered_and_nonnegative(
            mut starts in proptest::collection::vec(0.0f64..100.0, 1..20)
        ) {
            starts.sort_by(|a, b| a.partial_cmp(b).unwrap());
            starts.dedup();
            let confs = vec![1.0; starts.len()];
            let events = events_from_times(&starts, &confs, 101.0);
            for pair in events.windows(2) {
                prop_assert!(pair[0].start < pair[1].start);
                prop_assert!((pair[0].start + pair[0].duration - pair[1].start).abs() < 1e-9);
            }
            for event in &events {
                prop_assert!(event.duration >= 0.0);
            }
        }
    }
}
