use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    decode::PcmFormat, metronome::MetronomeSettings, sample::ToneSet, timeline::SpinStrategy,
    MetronomeError, Result, TimeSignature,
};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetronomeConfig {
    pub bpm: u32,
    pub time_signature: TimeSignature,
    /// Play tones on each beat; ticks keep running when disabled.
    pub sound: bool,
    /// Stop after this many full bars. Runs until stopped when unset.
    pub bars: Option<u32>,
    pub tones: ToneSet,
    pub audio: AudioConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for MetronomeConfig {
    fn default() -> Self {
        Self {
            bpm: 120,
            time_signature: TimeSignature::default(),
            sound: true,
            bars: None,
            tones: ToneSet::default(),
            audio: AudioConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl MetronomeConfig {
    /// Reads and validates a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        tracing::debug!(?path, "loaded configuration");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.bpm == 0 {
            return Err(MetronomeError::InvalidTempo(0));
        }
        self.time_signature.validate()?;
        self.audio.validate()
    }

    pub fn settings(&self) -> MetronomeSettings {
        MetronomeSettings {
            sound: self.sound,
            bars: self.bars,
        }
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Leading share of each decoded tone that is played, in percent.
    pub trim_percent: u8,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            trim_percent: 10,
        }
    }
}

impl AudioConfig {
    pub fn pcm_format(&self) -> PcmFormat {
        PcmFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(MetronomeError::msg(format!(
                "audio output needs a sample rate and at least one channel, got {} Hz / {} ch",
                self.sample_rate, self.channels
            )));
        }
        if !(1..=100).contains(&self.trim_percent) {
            return Err(MetronomeError::msg(format!(
                "trim percentage must be within 1..=100, got {}",
                self.trim_percent
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub spin: SpinStrategy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sample::Pitch, NoteValue, ToneSelector};

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let config: MetronomeConfig = serde_json::from_str(r#"{ "bpm": 90 }"#).unwrap();

        assert_eq!(config.bpm, 90);
        assert_eq!(config.time_signature, TimeSignature::COMMON);
        assert_eq!(config.audio.trim_percent, 10);
        assert_eq!(config.tones.accent, ToneSelector::Pitch(Pitch::High));
        assert!(config.sound);
    }

    #[test]
    fn saves_and_loads_from_disk() {
        let path = std::env::temp_dir().join(format!("metronome-config-{}.json", std::process::id()));
        let mut config = MetronomeConfig::default();
        config.bpm = 72;
        config.bars = Some(8);
        config.time_signature = TimeSignature::new(3, NoteValue::Quarter).unwrap();

        config.save(&path).unwrap();
        let loaded = MetronomeConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, config);
    }

    #[test]
    fn rejects_invalid_values() {
        let zero_tempo: MetronomeConfig = serde_json::from_str(r#"{ "bpm": 0 }"#).unwrap();
        assert!(matches!(
            zero_tempo.validate(),
            Err(MetronomeError::InvalidTempo(0))
        ));

        let empty_bar: MetronomeConfig = serde_json::from_str(
            r#"{ "time_signature": { "beats_per_bar": 0, "note_value": 4 } }"#,
        )
        .unwrap();
        assert!(matches!(
            empty_bar.validate(),
            Err(MetronomeError::InvalidBeatsPerBar(0))
        ));

        let mut config = MetronomeConfig::default();
        config.audio.trim_percent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = serde_json::from_str::<MetronomeConfig>("{ bpm: ").unwrap_err();
        assert!(matches!(MetronomeError::from(err), MetronomeError::Config(_)));
    }
}
