//! Core library for the metronome.
//!
//! The crate is split by subsystem: a drift-compensating tick scheduler, the
//! tones played on each beat, the bounded stream window that trims those
//! tones, and the single audio output every tone is played through.

pub mod analysis;
pub mod config;
pub mod decode;
pub mod error;
pub mod metronome;
pub mod note;
pub mod output;
pub mod sample;
pub mod timeline;
pub mod window;

pub use analysis::{ToneAnalyser, ToneAnalysis};
pub use config::{AudioConfig, MetronomeConfig, SchedulerConfig};
pub use decode::{DecodedStream, PcmFormat, PcmStream};
pub use error::{MetronomeError, Result};
pub use metronome::{Beat, BeatEvent, Metronome, MetronomeSettings};
pub use note::{NoteValue, TimeSignature};
pub use output::{AudioOutputContext, CpalDevice, NullDevice, OutputDevice, PlaybackUnit};
pub use sample::{Pitch, Sample, ToneSelector, ToneSet};
pub use timeline::{DriftCompensator, Scheduler, SchedulerState, SpinStrategy, StopHandle, Tick};
pub use window::{BoundedSeeker, Chunk, TailCount, Whence};
