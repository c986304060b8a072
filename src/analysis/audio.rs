//! Audio loading for the analysis pipeline.
//!
//! Decodes any supported container/codec with symphonia, downmixes to mono
//! by averaging channels, and resamples to the configured analysis rate
//! with rubato. Title/artist tags are read with lofty for the track object.
//!
//! Supported formats: MP3, FLAC, OGG Vorbis, WAV/PCM, AAC (in MP4), WebM.

use std::fs::File;
use std::path::Path;

use lofty::file::TaggedFileExt;
use lofty::probe::Probe;
use lofty::tag::Accessor;
use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{Error, Result};

/// Mono PCM at a known sample rate.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_s(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Title/artist read from embedded tags.
#[derive(Debug, Clone, Default)]
pub struct TrackTags {
    pub title: Option<String>,
    pub artist: Option<String>,
}

/// Decode a file to mono f32 PCM at `target_sr`.
pub fn load_mono(path: &Path, target_sr: u32) -> Result<DecodedAudio> {
    let file =
        File::open(path).map_err(|e| Error::decode(path, format!("open failed: {e}")))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension() {
        hint.with_extension(&ext.to_string_lossy());
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| Error::decode(path, e.to_string()))?;
    let mut reader = probed.format;

    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| Error::decode(path, "no audio track found"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let native_sr = codec_params
        .sample_rate
        .ok_or_else(|| Error::decode(path, "unknown sample rate"))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| Error::decode(path, e.to_string()))?;

    let mut mono: Vec<f32> = Vec::new();
    loop {
        let packet = match reader.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => return Err(Error::decode(path, e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            // Skip bad frames rather than failing the whole file
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(Error::decode(path, e.to_string())),
        };
        append_mono(&decoded, &mut mono);
    }

    if mono.is_empty() {
        return Err(Error::decode(path, "decoded no samples"));
    }

    let samples = if native_sr == target_sr {
        mono
    } else {
        resample(&mono, native_sr, target_sr)?
    };

    Ok(DecodedAudio {
        samples,
        sample_rate: target_sr,
    })
}

/// Average all channels of a decoded buffer into the mono accumulator.
fn append_mono(buffer: &AudioBufferRef, mono: &mut Vec<f32>) {
    macro_rules! mix {
        ($buf:expr, $convert:expr) => {{
            let planes = $buf.planes();
            let plane_slice = planes.planes();
            if plane_slice.is_empty() {
                return;
            }
            let channels = plane_slice.len() as f32;
            for frame in 0..$buf.frames() {
                let mut sum = 0.0f32;
                for plane in plane_slice {
                    sum += $convert(plane[frame]);
                }
                mono.push(sum / channels);
            }
        }};
    }

    match buffer {
        AudioBufferRef::F32(buf) => mix!(buf, |v: f32| v),
        AudioBufferRef::F64(buf) => mix!(buf, |v: f64| v as f32),
        AudioBufferRef::S16(buf) => mix!(buf, |v: i16| v as f32 / 32768.0),
        AudioBufferRef::S24(buf) => {
            mix!(buf, |v: symphonia::core::sample::i24| v.0 as f32 / 8388608.0)
        }
        AudioBufferRef::S32(buf) => mix!(buf, |v: i32| v as f32 / 2147483648.0),
        AudioBufferRef::U8(buf) => mix!(buf, |v: u8| (v as f32 - 128.0) / 128.0),
        _ => {}
    }
}

/// Resample mono audio between exact integer rates.
fn resample(input: &[f32], from_sr: u32, to_sr: u32) -> Result<Vec<f32>> {
    const CHUNK_SIZE: usize = 1024;

    let mut resampler =
        FftFixedIn::<f32>::new(from_sr as usize, to_sr as usize, CHUNK_SIZE, 2, 1)
            .map_err(|e| Error::analysis(format!("resampler init failed: {e}")))?;

    let expected = (input.len() as f64 * to_sr as f64 / from_sr as f64).round() as usize;
    let mut output: Vec<f32> = Vec::with_capacity(expected);
    let mut offset = 0;
    while offset < input.len() {
        let end = (offset + CHUNK_SIZE).min(input.len());
        let mut chunk = input[offset..end].to_vec();
        chunk.resize(CHUNK_SIZE, 0.0);
        let resampled = resampler
            .process(&[chunk], None)
            .map_err(|e| Error::analysis(format!("resampling failed: {e}")))?;
        if let Some(channel) = resampled.into_iter().next() {
            output.extend(channel);
        }
        offset = end;
    }
    // The final zero-padded chunk can overshoot; trim to the exact length
    output.truncate(expected);
    Ok(output)
}

/// Read title/artist tags, tolerating files without any metadata.
pub fn read_tags(path: &Path) -> TrackTags {
    let Ok(probe) = Probe::open(path) else {
        return TrackTags::default();
    };
    let Ok(tagged_file) = probe.read() else {
        return TrackTags::default();
    };
    let tag = tagged_file.primary_tag().or_else(|| tagged_file.first_tag());
    TrackTags {
        title: tag
            .and_then(|t| t.title().map(|s| s.to_string()))
            .filter(|s| !s.is_empty()),
        artist: tag
            .and_then(|t| t.artist().map(|s| s.to_string()))
            .filter(|s| !s.is_empty()),
    }
}
