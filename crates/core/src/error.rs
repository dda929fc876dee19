use std::io;

/// Result alias that carries the custom [`MetronomeError`] type.
pub type Result<T> = std::result::Result<T, MetronomeError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum MetronomeError {
    /// The tone selector does not name a built-in pitch or a tone file.
    #[error("invalid tone selector `{0}`")]
    InvalidToneSelector(String),
    /// The audio source could not be opened or decoded.
    #[error("failed to decode tone: {0}")]
    Decode(String),
    /// The hardware output context could not be created. Not retried.
    #[error("audio output unavailable: {0}")]
    HardwareContext(String),
    #[error("invalid seek whence value {0}")]
    InvalidSeekWhence(i32),
    #[error("seek to {target} lands before window start {start}")]
    SeekBeforeStart { target: i64, start: u64 },
    /// Normal exhaustion of a bounded stream rather than a failure.
    #[error("end of stream")]
    EndOfStream,
    #[error("invalid note value {0}")]
    InvalidNoteValue(i64),
    #[error("invalid beats per bar {0}")]
    InvalidBeatsPerBar(i64),
    #[error("invalid tempo {0} bpm")]
    InvalidTempo(i64),
    #[error("invalid time signature `{0}`")]
    InvalidTimeSignature(String),
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },
    #[error("sample has been closed")]
    SampleClosed,
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Message(String),
}

impl MetronomeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Converts the error for use behind the `std::io` traits, keeping
    /// wrapped IO errors intact.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Self::Io(err) => err,
            Self::SeekBeforeStart { .. } | Self::InvalidSeekWhence(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, self)
            }
            Self::EndOfStream => io::Error::new(io::ErrorKind::UnexpectedEof, self),
            other => io::Error::other(other),
        }
    }
}

impl From<&str> for MetronomeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for MetronomeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
