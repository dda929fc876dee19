//! Tones played on each beat.

use std::{
    f32::consts::TAU,
    fmt,
    io::SeekFrom,
    path::{Path, PathBuf},
    str::FromStr,
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{
    decode::{self, DecodedStream, PcmFormat, PcmStream},
    output::{AudioOutputContext, PlaybackUnit},
    MetronomeError, Result,
};

const TONE_SECONDS: f32 = 1.0;
const CLICK_SECONDS: f32 = 0.06;
const CLICK_DECAY_SECONDS: f32 = 0.015;
const CLICK_AMPLITUDE: f32 = 0.8;
const PLAY_POLL: Duration = Duration::from_millis(1);

/// Built-in click pitches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pitch {
    Low,
    Mid,
    High,
}

impl Pitch {
    pub const ALL: [Pitch; 3] = [Self::Low, Self::Mid, Self::High];

    pub fn frequency(self) -> f32 {
        match self {
            Self::Low => 880.0,
            Self::Mid => 1_320.0,
            Self::High => 1_760.0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Mid => "mid",
            Self::High => "high",
        }
    }

    /// Synthesises the tone: a short decaying sine followed by silence, so
    /// only the leading part of the stream is worth playing.
    pub fn render(self, format: PcmFormat) -> PcmStream {
        let rate = format.sample_rate as f32;
        let frames = (rate * TONE_SECONDS).round() as usize;
        let click_frames = (rate * CLICK_SECONDS).round() as usize;
        let channels = usize::from(format.channels);
        let frequency = self.frequency();

        let mut samples = vec![0.0f32; frames * channels];
        for (index, frame) in samples
            .chunks_exact_mut(channels.max(1))
            .take(click_frames)
            .enumerate()
        {
            let t = index as f32 / rate;
            let value = (TAU * frequency * t).sin() * CLICK_AMPLITUDE * (-t / CLICK_DECAY_SECONDS).exp();
            frame.fill(value);
        }

        PcmStream::from_samples(format, &samples)
    }
}

/// Selects the audio a [`Sample`] plays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ToneSelector {
    Pitch(Pitch),
    File(PathBuf),
}

impl ToneSelector {
    /// Opens the tone as PCM in `format`.
    pub fn open(&self, format: PcmFormat) -> Result<Box<dyn DecodedStream>> {
        match self {
            Self::Pitch(pitch) => Ok(Box::new(pitch.render(format))),
            Self::File(path) => Ok(Box::new(decode::decode_file(path, format)?)),
        }
    }
}

impl FromStr for ToneSelector {
    type Err = MetronomeError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "low" | "1" => return Ok(Self::Pitch(Pitch::Low)),
            "mid" | "2" => return Ok(Self::Pitch(Pitch::Mid)),
            "high" | "3" => return Ok(Self::Pitch(Pitch::High)),
            _ => {}
        }

        if let Some(path) = trimmed.strip_prefix("file:") {
            if !path.is_empty() {
                return Ok(Self::File(PathBuf::from(path)));
            }
        } else if trimmed.contains(['/', '\\']) || Path::new(trimmed).extension().is_some() {
            return Ok(Self::File(PathBuf::from(trimmed)));
        }

        Err(MetronomeError::InvalidToneSelector(s.to_string()))
    }
}

impl TryFrom<String> for ToneSelector {
    type Error = MetronomeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ToneSelector> for String {
    fn from(value: ToneSelector) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ToneSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pitch(pitch) => f.write_str(pitch.name()),
            Self::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

/// Tones for the first beat of a bar and for every other beat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneSet {
    pub accent: ToneSelector,
    pub regular: ToneSelector,
}

impl Default for ToneSet {
    fn default() -> Self {
        Self {
            accent: ToneSelector::Pitch(Pitch::High),
            regular: ToneSelector::Pitch(Pitch::Low),
        }
    }
}

/// A decoded tone bound to its own playback unit.
pub struct Sample {
    selector: ToneSelector,
    hold: Duration,
    unit: Option<Box<dyn PlaybackUnit>>,
}

impl Sample {
    /// Decodes the tone and obtains a playback unit for it. Nothing is kept
    /// when either step fails.
    pub fn new(selector: &ToneSelector, ctx: &AudioOutputContext, hold: Duration) -> Result<Self> {
        let stream = selector.open(ctx.config().pcm_format())?;
        let unit = ctx.get_player(stream)?;

        tracing::debug!(tone = %selector, unit = unit.id(), ?hold, "sample ready");
        Ok(Self {
            selector: selector.clone(),
            hold,
            unit: Some(unit),
        })
    }

    pub fn selector(&self) -> &ToneSelector {
        &self.selector
    }

    pub fn hold(&self) -> Duration {
        self.hold
    }

    pub fn is_closed(&self) -> bool {
        self.unit.is_none()
    }

    /// Plays the tone and blocks until `hold` has passed or the unit runs
    /// out of audio, then rewinds to the start of the window. Fails with the
    /// unit's error when reading the tone broke off playback.
    pub fn play(&mut self) -> Result<()> {
        let unit = self.unit.as_mut().ok_or(MetronomeError::SampleClosed)?;

        let started = Instant::now();
        unit.play();
        while started.elapsed() < self.hold && unit.is_playing() {
            thread::sleep(PLAY_POLL);
        }
        unit.pause();
        if let Some(err) = unit.take_error() {
            return Err(err);
        }
        unit.seek(SeekFrom::Start(0))?;

        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(mut unit) = self.unit.take() {
            unit.pause();
            tracing::debug!(tone = %self.selector, unit = unit.id(), "sample closed");
        }
    }
}

impl Drop for Sample {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sample")
            .field("selector", &self.selector)
            .field("hold", &self.hold)
            .field("unit", &self.unit.as_ref().map(|unit| unit.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Arc};

    use super::*;
    use crate::{
        config::AudioConfig,
        output::{next_unit_id, OutputDevice, PcmSource},
    };

    /// Device whose units lose their source as soon as they start.
    struct UnpluggedDevice;

    struct UnpluggedUnit {
        id: u64,
        error: Option<io::Error>,
    }

    impl OutputDevice for UnpluggedDevice {
        fn new_player(&self, _: Box<dyn PcmSource>) -> Result<Box<dyn PlaybackUnit>> {
            Ok(Box::new(UnpluggedUnit {
                id: next_unit_id(),
                error: None,
            }))
        }
    }

    impl PlaybackUnit for UnpluggedUnit {
        fn id(&self) -> u64 {
            self.id
        }

        fn play(&mut self) {
            self.error = Some(io::Error::other("source went away"));
        }

        fn pause(&mut self) {}

        fn seek(&mut self, _: SeekFrom) -> Result<u64> {
            Ok(0)
        }

        fn is_playing(&self) -> bool {
            false
        }

        fn take_error(&mut self) -> Option<MetronomeError> {
            self.error.take().map(MetronomeError::from)
        }
    }

    fn silent() -> Arc<AudioOutputContext> {
        AudioOutputContext::silent(AudioConfig {
            sample_rate: 8_000,
            channels: 1,
            trim_percent: 10,
        })
    }

    #[test]
    fn parses_selectors() {
        assert_eq!("high".parse::<ToneSelector>().unwrap(), ToneSelector::Pitch(Pitch::High));
        assert_eq!(" Low ".parse::<ToneSelector>().unwrap(), ToneSelector::Pitch(Pitch::Low));
        assert_eq!("2".parse::<ToneSelector>().unwrap(), ToneSelector::Pitch(Pitch::Mid));
        assert_eq!(
            "file:click".parse::<ToneSelector>().unwrap(),
            ToneSelector::File(PathBuf::from("click"))
        );
        assert_eq!(
            "tones/wood.wav".parse::<ToneSelector>().unwrap(),
            ToneSelector::File(PathBuf::from("tones/wood.wav"))
        );

        for bad in ["", "loudest", "4", "file:"] {
            assert!(matches!(
                bad.parse::<ToneSelector>(),
                Err(MetronomeError::InvalidToneSelector(_))
            ));
        }
    }

    #[test]
    fn selectors_serialise_as_strings() {
        let tones = ToneSet::default();
        let json = serde_json::to_string(&tones).unwrap();
        assert_eq!(json, r#"{"accent":"high","regular":"low"}"#);

        let parsed: ToneSet = serde_json::from_str(r#"{"regular":"file:/tmp/tick.mp3"}"#).unwrap();
        assert_eq!(parsed.accent, ToneSelector::Pitch(Pitch::High));
        assert_eq!(parsed.regular, ToneSelector::File(PathBuf::from("/tmp/tick.mp3")));
    }

    #[test]
    fn rendered_pitches_are_loud_then_silent() {
        let format = PcmFormat {
            sample_rate: 8_000,
            channels: 2,
        };
        let stream = Pitch::Mid.render(format);
        let samples = stream.samples();

        assert_eq!(stream.total_len(), 8_000 * 2 * 2);
        assert!(samples[..960].iter().any(|s| s.abs() > 0.3));
        assert!(samples[960..].iter().all(|s| *s == 0.0));
        assert_eq!(samples[2], samples[3]);
    }

    #[test]
    fn play_blocks_for_the_trimmed_tone() {
        let ctx = silent();
        let mut sample = Sample::new(&ToneSelector::Pitch(Pitch::High), &ctx, Duration::from_secs(1)).unwrap();

        // The one second tone is trimmed to its first 100 ms.
        let started = Instant::now();
        sample.play().unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(90), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");

        // Rewound, so a second play lasts as long.
        let started = Instant::now();
        sample.play().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn play_stops_after_hold() {
        let ctx = silent();
        let mut sample = Sample::new(&ToneSelector::Pitch(Pitch::Low), &ctx, Duration::from_millis(20)).unwrap();

        let started = Instant::now();
        sample.play().unwrap();
        assert!(started.elapsed() < Duration::from_millis(90));
    }

    #[test]
    fn closed_samples_refuse_to_play() {
        let ctx = silent();
        let mut sample = Sample::new(&ToneSelector::Pitch(Pitch::Low), &ctx, Duration::from_millis(5)).unwrap();

        sample.close();
        sample.close();
        assert!(sample.is_closed());
        assert!(matches!(sample.play(), Err(MetronomeError::SampleClosed)));
    }

    #[test]
    fn undecodable_files_abort_construction() {
        let ctx = silent();
        let selector = ToneSelector::File(PathBuf::from("/no/such/tone.mp3"));

        let err = Sample::new(&selector, &ctx, Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, MetronomeError::Decode(_)));
    }

    #[test]
    fn read_failures_during_play_are_reported() {
        let config = AudioConfig {
            sample_rate: 8_000,
            channels: 1,
            trim_percent: 10,
        };
        let ctx = AudioOutputContext::new(
            config,
            Box::new(|_| Ok(Box::new(UnpluggedDevice) as Box<dyn OutputDevice>)),
        );
        let mut sample = Sample::new(&ToneSelector::Pitch(Pitch::Mid), &ctx, Duration::from_millis(50)).unwrap();

        let err = sample.play().unwrap_err();
        assert!(matches!(err, MetronomeError::Io(_)), "{err}");
        assert!(err.to_string().contains("source went away"));
    }
}
