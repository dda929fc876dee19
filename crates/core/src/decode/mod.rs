//! Decoder boundary: turns tone sources into seekable raw PCM streams.
//!
//! Every stream produced here is interleaved signed 16-bit little-endian
//! PCM at the sample rate and channel count of the output it is meant for.

mod resample;

use std::{
    fs::File,
    io::{self, Cursor, Read, Seek, SeekFrom},
    path::Path,
};

use serde::{Deserialize, Serialize};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::DecoderOptions,
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
};

use crate::{MetronomeError, Result};

const BYTES_PER_SAMPLE: u64 = 2;

/// Layout of a raw PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub fn frame_bytes(&self) -> u64 {
        u64::from(self.channels) * BYTES_PER_SAMPLE
    }

    pub fn bytes_per_second(&self) -> u64 {
        u64::from(self.sample_rate) * self.frame_bytes()
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
        }
    }
}

/// A decoded tone that can be read and repositioned.
pub trait DecodedStream: Read + Seek + Send {
    /// Total decoded length in bytes.
    fn total_len(&self) -> u64;

    fn format(&self) -> PcmFormat;
}

/// In-memory decoded PCM.
#[derive(Debug, Clone)]
pub struct PcmStream {
    format: PcmFormat,
    cursor: Cursor<Vec<u8>>,
}

impl PcmStream {
    /// Encodes interleaved floating point samples, clamping to `[-1, 1]`.
    pub fn from_samples(format: PcmFormat, samples: &[f32]) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE as usize);
        for sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        Self {
            format,
            cursor: Cursor::new(bytes),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        self.cursor.get_ref()
    }

    pub fn samples(&self) -> Vec<f32> {
        pcm_to_f32(self.bytes())
    }
}

impl Read for PcmStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for PcmStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl DecodedStream for PcmStream {
    fn total_len(&self) -> u64 {
        self.bytes().len() as u64
    }

    fn format(&self) -> PcmFormat {
        self.format
    }
}

/// Converts little-endian signed 16-bit PCM to floating point samples.
pub fn pcm_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE as usize)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / f32::from(i16::MAX))
        .collect()
}

/// Reads a whole stream from its start, leaving it rewound.
pub fn read_all(stream: &mut dyn DecodedStream) -> Result<Vec<f32>> {
    stream.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::with_capacity(usize::try_from(stream.total_len()).unwrap_or_default());
    stream.read_to_end(&mut bytes)?;
    stream.seek(SeekFrom::Start(0))?;
    Ok(pcm_to_f32(&bytes))
}

/// Decodes an audio file into PCM matching `target`.
pub fn decode_file(path: &Path, target: PcmFormat) -> Result<PcmStream> {
    tracing::info!(?path, "decoding tone");

    let file = File::open(path)
        .map_err(|err| MetronomeError::Decode(format!("{}: {err}", path.display())))?;

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let mut format = symphonia::default::get_probe()
        .format(
            &hint,
            MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions::default()),
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(decode_error)?
        .format;

    let track = format
        .default_track()
        .ok_or_else(|| MetronomeError::Decode("no playable track".into()))?;
    let track_id = track.id;
    let channels = track
        .codec_params
        .channels
        .map(|channels| channels.count())
        .ok_or_else(|| MetronomeError::Decode("unknown channel layout".into()))?;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| MetronomeError::Decode("unknown sample rate".into()))?;
    let delay = track.codec_params.delay.unwrap_or_default() as usize;
    let padding = track.codec_params.padding.unwrap_or_default() as usize;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(decode_error)?;

    let mut samples = Vec::new();
    let mut sample_buf = None;
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(err) => return Err(decode_error(err)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let audio_buf = match decoder.decode(&packet) {
            Ok(audio_buf) => audio_buf,
            Err(SymphoniaError::DecodeError(reason)) => {
                tracing::warn!(reason, "skipping corrupt packet");
                continue;
            }
            Err(err) => return Err(decode_error(err)),
        };

        let sample_buf = sample_buf.get_or_insert_with(|| {
            SampleBuffer::<f32>::new(audio_buf.capacity() as u64, *audio_buf.spec())
        });
        sample_buf.copy_interleaved_ref(audio_buf);
        samples.extend_from_slice(sample_buf.samples());
    }

    let skip = (delay * channels).min(samples.len());
    let keep = samples.len().saturating_sub(skip + padding * channels);
    let samples = &samples[skip..skip + keep];

    if samples.is_empty() {
        return Err(MetronomeError::Decode(format!(
            "{} contains no audio",
            path.display()
        )));
    }

    let remixed = remix(samples, channels, usize::from(target.channels));
    let resampled = resample::resample(
        &remixed,
        usize::from(target.channels),
        sample_rate,
        target.sample_rate,
    )?;

    tracing::info!(
        ?path,
        source_rate = sample_rate,
        source_channels = channels,
        frames = resampled.len() / usize::from(target.channels),
        "decoded tone"
    );

    Ok(PcmStream::from_samples(target, &resampled))
}

/// Maps interleaved frames from one channel count to another. Mono targets
/// average all channels; wider targets reuse the last source channel.
fn remix(samples: &[f32], from: usize, to: usize) -> Vec<f32> {
    if from == to || from == 0 || to == 0 {
        return samples.to_vec();
    }

    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        if to == 1 {
            out.push(frame.iter().sum::<f32>() / from as f32);
        } else {
            out.extend((0..to).map(|channel| frame[channel.min(from - 1)]));
        }
    }
    out
}

fn decode_error(err: impl std::fmt::Display) -> MetronomeError {
    MetronomeError::Decode(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_round_trips_within_quantisation() {
        let format = PcmFormat::default();
        let stream = PcmStream::from_samples(format, &[0.0, 0.5, -0.5, 1.0, -1.5]);

        assert_eq!(stream.total_len(), 10);
        let decoded = stream.samples();
        assert!((decoded[1] - 0.5).abs() < 1e-3);
        assert!((decoded[3] - 1.0).abs() < 1e-3);
        assert!((decoded[4] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn remix_duplicates_mono_and_averages_down() {
        assert_eq!(remix(&[0.25, 0.5], 1, 2), vec![0.25, 0.25, 0.5, 0.5]);
        let mono = remix(&[0.2, 0.4, 1.0, 0.0], 2, 1);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!((mono[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn read_all_rewinds_the_stream() {
        let mut stream = PcmStream::from_samples(PcmFormat::default(), &[0.5; 8]);
        stream.seek(SeekFrom::Start(6)).unwrap();

        let samples = read_all(&mut stream).unwrap();
        assert_eq!(samples.len(), 8);
        assert_eq!(stream.stream_position().unwrap(), 0);
    }

    #[test]
    fn missing_files_fail_to_decode() {
        let err = decode_file(Path::new("/definitely/not/here.mp3"), PcmFormat::default())
            .unwrap_err();
        assert!(matches!(err, MetronomeError::Decode(_)));
    }

    #[test]
    fn garbage_files_fail_to_decode() {
        let path = std::env::temp_dir().join(format!("metronome-garbage-{}.mp3", std::process::id()));
        std::fs::write(&path, b"this is not audio").unwrap();

        let err = decode_file(&path, PcmFormat::default()).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, MetronomeError::Decode(_)));
    }
}
