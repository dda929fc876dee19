use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{
    decode::{self, DecodedStream},
    MetronomeError, Result,
};

/// Level, relative to the peak, below which a tone counts as silent (-40 dB).
const SILENCE_RATIO: f32 = 0.01;
/// Longest stretch of audio fed to the FFT.
const MAX_FFT_FRAMES: usize = 1 << 16;

/// Summary of a decoded tone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToneAnalysis {
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_seconds: f32,
    pub peak: f32,
    pub rms: f32,
    /// Strongest frequency in the audible part of the tone.
    pub dominant_hz: Option<f32>,
    /// Length of the tone up to its last non-silent frame.
    pub active_seconds: f32,
    pub active_fraction: f32,
}

impl ToneAnalysis {
    /// Smallest whole percentage of the tone that keeps everything audible.
    pub fn suggested_trim_percent(&self) -> u8 {
        (self.active_fraction * 100.0).ceil().clamp(1.0, 100.0) as u8
    }
}

/// Measures decoded tones. Keeps its FFT plan between calls of the same size.
pub struct ToneAnalyser {
    planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl Default for ToneAnalyser {
    fn default() -> Self {
        Self::new()
    }
}

impl ToneAnalyser {
    pub fn new() -> Self {
        Self {
            planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    /// Reads the whole stream and measures it. The stream is left rewound.
    pub fn analyse(&mut self, stream: &mut dyn DecodedStream) -> Result<ToneAnalysis> {
        let format = stream.format();
        let channels = usize::from(format.channels.max(1));
        let samples = decode::read_all(stream)?;
        if samples.len() < channels {
            return Err(MetronomeError::Decode("tone contains no audio".into()));
        }

        let mono: Vec<f32> = samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();

        let rate = format.sample_rate.max(1) as f32;
        let peak = samples.iter().fold(0.0f32, |peak, sample| peak.max(sample.abs()));
        let active_frames = if peak > 0.0 {
            mono.iter()
                .rposition(|sample| sample.abs() >= peak * SILENCE_RATIO)
                .map_or(0, |last| last + 1)
        } else {
            0
        };

        let dominant_hz = if active_frames >= 2 {
            let window = &mono[..active_frames.min(MAX_FFT_FRAMES)];
            self.dominant_frequency(window, rate)?
        } else {
            None
        };

        let analysis = ToneAnalysis {
            sample_rate: format.sample_rate,
            channels: format.channels,
            duration_seconds: mono.len() as f32 / rate,
            peak,
            rms: compute_rms(&samples),
            dominant_hz,
            active_seconds: active_frames as f32 / rate,
            active_fraction: active_frames as f32 / mono.len() as f32,
        };
        tracing::debug!(?analysis, "analysed tone");
        Ok(analysis)
    }

    fn dominant_frequency(&mut self, samples: &[f32], sample_rate: f32) -> Result<Option<f32>> {
        let len = samples.len();
        let fft = self.prepare_fft(len);

        for (index, value) in samples.iter().enumerate() {
            fft.input[index] = *value * hann_value(index, len);
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
            .map_err(|err| MetronomeError::msg(format!("fft failed: {err}")))?;

        let bin_hz = sample_rate / len as f32;
        let strongest = fft
            .spectrum
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, bin)| (i, bin.norm()))
            .max_by(|a, b| a.1.total_cmp(&b.1));

        Ok(strongest
            .filter(|(_, magnitude)| *magnitude > f32::EPSILON)
            .map(|(i, _)| i as f32 * bin_hz))
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        let planner = &mut self.planner;
        let fft = self
            .fft
            .get_or_insert_with(|| FftResources::new(planner, size));
        if fft.size != size {
            *fft = FftResources::new(planner, size);
        }
        fft
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn new(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let plan = planner.plan_fft_forward(size);
        Self {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    }
}

impl fmt::Debug for ToneAnalyser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToneAnalyser")
            .field("fft_size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

fn compute_rms(samples: &[f32]) -> f32 {
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decode::{PcmFormat, PcmStream},
        sample::Pitch,
    };

    const FORMAT: PcmFormat = PcmFormat {
        sample_rate: 8_000,
        channels: 1,
    };

    #[test]
    fn finds_the_pitch_of_built_in_tones() {
        let mut analyser = ToneAnalyser::new();

        for pitch in Pitch::ALL {
            let mut stream = pitch.render(FORMAT);
            let analysis = analyser.analyse(&mut stream).unwrap();
            let dominant = analysis.dominant_hz.unwrap();
            assert!(
                (dominant - pitch.frequency()).abs() < 20.0,
                "{pitch:?}: {dominant} Hz"
            );
        }
    }

    #[test]
    fn built_in_tones_fit_the_default_window() {
        let mut stream = Pitch::High.render(FORMAT);
        let analysis = ToneAnalyser::new().analyse(&mut stream).unwrap();

        assert!((analysis.duration_seconds - 1.0).abs() < 1e-3);
        assert!(analysis.peak > 0.5 && analysis.peak <= 0.8);
        assert!(analysis.active_seconds <= 0.07, "{}", analysis.active_seconds);
        assert!(analysis.suggested_trim_percent() <= 10);
    }

    #[test]
    fn silence_has_no_pitch() {
        let mut stream = PcmStream::from_samples(FORMAT, &[0.0; 800]);
        let analysis = ToneAnalyser::new().analyse(&mut stream).unwrap();

        assert_eq!(analysis.peak, 0.0);
        assert_eq!(analysis.dominant_hz, None);
        assert_eq!(analysis.active_fraction, 0.0);
        assert_eq!(analysis.suggested_trim_percent(), 1);
    }

    #[test]
    fn empty_streams_are_rejected() {
        let mut stream = PcmStream::from_samples(FORMAT, &[]);
        assert!(matches!(
            ToneAnalyser::new().analyse(&mut stream),
            Err(MetronomeError::Decode(_))
        ));
    }
}
