use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{MetronomeError, Result};

/// Note value that receives one beat (the lower number of a time signature).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum NoteValue {
    Whole,
    Half,
    Quarter,
    Eighth,
    Sixteenth,
    ThirtySecond,
}

impl NoteValue {
    pub const ALL: [NoteValue; 6] = [
        Self::Whole,
        Self::Half,
        Self::Quarter,
        Self::Eighth,
        Self::Sixteenth,
        Self::ThirtySecond,
    ];

    pub fn as_int(self) -> u32 {
        match self {
            Self::Whole => 1,
            Self::Half => 2,
            Self::Quarter => 4,
            Self::Eighth => 8,
            Self::Sixteenth => 16,
            Self::ThirtySecond => 32,
        }
    }

    pub fn from_int(value: i64) -> Result<Self> {
        match value {
            1 => Ok(Self::Whole),
            2 => Ok(Self::Half),
            4 => Ok(Self::Quarter),
            8 => Ok(Self::Eighth),
            16 => Ok(Self::Sixteenth),
            32 => Ok(Self::ThirtySecond),
            other => Err(MetronomeError::InvalidNoteValue(other)),
        }
    }
}

impl TryFrom<i64> for NoteValue {
    type Error = MetronomeError;

    fn try_from(value: i64) -> Result<Self> {
        Self::from_int(value)
    }
}

impl From<NoteValue> for i64 {
    fn from(value: NoteValue) -> Self {
        i64::from(value.as_int())
    }
}

impl fmt::Display for NoteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_int())
    }
}

/// Number of beats in a bar and the note value counted as one beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    beats_per_bar: u32,
    note_value: NoteValue,
}

impl TimeSignature {
    pub const COMMON: TimeSignature = TimeSignature {
        beats_per_bar: 4,
        note_value: NoteValue::Quarter,
    };

    pub fn new(beats_per_bar: u32, note_value: NoteValue) -> Result<Self> {
        if beats_per_bar == 0 {
            return Err(MetronomeError::InvalidBeatsPerBar(0));
        }

        Ok(Self {
            beats_per_bar,
            note_value,
        })
    }

    pub fn beats_per_bar(&self) -> u32 {
        self.beats_per_bar
    }

    pub fn note_value(&self) -> NoteValue {
        self.note_value
    }

    /// Re-checks the invariants; deserialised values bypass [`TimeSignature::new`].
    pub fn validate(&self) -> Result<()> {
        Self::new(self.beats_per_bar, self.note_value).map(|_| ())
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::COMMON
    }
}

impl fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.beats_per_bar, self.note_value)
    }
}

impl FromStr for TimeSignature {
    type Err = MetronomeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || MetronomeError::InvalidTimeSignature(s.to_string());
        let (beats, note) = s.trim().split_once('/').ok_or_else(invalid)?;
        let beats: i64 = beats.trim().parse().map_err(|_| invalid())?;
        let note: i64 = note.trim().parse().map_err(|_| invalid())?;

        let beats_per_bar = u32::try_from(beats)
            .ok()
            .filter(|beats| *beats > 0)
            .ok_or(MetronomeError::InvalidBeatsPerBar(beats))?;

        Self::new(beats_per_bar, NoteValue::from_int(note)?)
    }
}
