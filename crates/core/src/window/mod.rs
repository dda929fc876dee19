//! Byte window over a seekable stream.
//!
//! Decoded tones carry trailing silence. [`BoundedSeeker`] exposes only a
//! leading `[start, start + limit)` slice of a stream so playback stops once
//! the audible part has been consumed.

use std::io::{self, Read, Seek, SeekFrom};

use crate::{MetronomeError, Result};

/// Reference point for [`BoundedSeeker::seek_whence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// Offset from the window start.
    Start,
    /// Offset from the current window position.
    Current,
    /// Offset from the window end (`start + limit`).
    End,
}

impl Whence {
    /// Maps the conventional `0 | 1 | 2` whence codes.
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Start),
            1 => Ok(Self::Current),
            2 => Ok(Self::End),
            other => Err(MetronomeError::InvalidSeekWhence(other)),
        }
    }
}

/// Count reported by the read that reaches the end of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TailCount {
    /// The number of bytes actually read.
    #[default]
    Actual,
    /// A percentage of the requested buffer length. Downstream consumers that
    /// rely on exact counts at end of stream must not use this.
    PercentOfRequest(u8),
}

/// Outcome of a successful [`BoundedSeeker::read_bounded`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    /// Bytes were read and the window has more to give.
    More(usize),
    /// This read reached the end of the window.
    Last(usize),
}

impl Chunk {
    pub fn count(self) -> usize {
        match self {
            Self::More(n) | Self::Last(n) => n,
        }
    }

    pub fn is_last(self) -> bool {
        matches!(self, Self::Last(_))
    }
}

#[derive(Debug)]
pub struct BoundedSeeker<R> {
    inner: R,
    start: u64,
    limit: u64,
    pos: u64,
    tail: TailCount,
}

impl<R: Read + Seek> BoundedSeeker<R> {
    /// Wraps `inner`, positioning it at `start`.
    pub fn new(mut inner: R, start: u64, limit: u64) -> Result<Self> {
        inner.seek(SeekFrom::Start(start))?;

        Ok(Self {
            inner,
            start,
            limit,
            pos: 0,
            tail: TailCount::Actual,
        })
    }

    pub fn with_tail_count(mut self, tail: TailCount) -> Self {
        self.tail = tail;
        self
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Current position relative to the window start.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.pos)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads at most the bytes left in the window.
    ///
    /// Fails with [`MetronomeError::EndOfStream`] once the window is
    /// exhausted or the wrapped stream runs out before the window end. The read that reaches the boundary returns [`Chunk::Last`],
    /// carrying a count chosen by the configured [`TailCount`].
    pub fn read_bounded(&mut self, buf: &mut [u8]) -> Result<Chunk> {
        if self.pos >= self.limit {
            return Err(MetronomeError::EndOfStream);
        }

        let remaining = self.limit - self.pos;
        let to_read = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));

        let n = self.inner.read(&mut buf[..to_read])?;
        if n == 0 && to_read > 0 {
            // The wrapped stream ended inside the window.
            return Err(MetronomeError::EndOfStream);
        }
        self.pos += n as u64;

        if self.pos < self.limit {
            return Ok(Chunk::More(n));
        }

        let count = match self.tail {
            TailCount::Actual => n,
            TailCount::PercentOfRequest(percent) => buf.len() * usize::from(percent) / 100,
        };
        Ok(Chunk::Last(count))
    }

    /// Moves within the window and returns the new window position.
    pub fn seek_whence(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let base = match whence {
            Whence::Start => self.start,
            Whence::Current => self.start + self.pos,
            Whence::End => self.start + self.limit,
        };
        let target = i128::from(base) + i128::from(offset);

        if target < i128::from(self.start) {
            return Err(MetronomeError::SeekBeforeStart {
                target: i64::try_from(target).unwrap_or(i64::MIN),
                start: self.start,
            });
        }

        // Targets past the end clamp to it so `pos` stays within the window.
        let end = i128::from(self.start + self.limit);
        let absolute = u64::try_from(target.min(end))
            .map_err(|_| MetronomeError::msg(format!("seek target {target} overflows")))?;
        self.inner.seek(SeekFrom::Start(absolute))?;

        self.pos = absolute - self.start;
        Ok(self.pos)
    }

    /// Same as [`BoundedSeeker::seek_whence`] with a raw whence code.
    pub fn seek_raw(&mut self, offset: i64, whence: i32) -> Result<u64> {
        self.seek_whence(offset, Whence::from_raw(whence)?)
    }
}

impl<R: Read + Seek> Read for BoundedSeeker<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let tail = std::mem::take(&mut self.tail);
        let result = self.read_bounded(buf);
        self.tail = tail;

        match result {
            Ok(chunk) => Ok(chunk.count()),
            Err(MetronomeError::EndOfStream) => Ok(0),
            Err(err) => Err(err.into_io()),
        }
    }
}

impl<R: Read + Seek> Seek for BoundedSeeker<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (offset, whence) = match pos {
            SeekFrom::Start(offset) => (
                i64::try_from(offset)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "seek offset"))?,
                Whence::Start,
            ),
            SeekFrom::Current(offset) => (offset, Whence::Current),
            SeekFrom::End(offset) => (offset, Whence::End),
        };

        self.seek_whence(offset, whence).map_err(MetronomeError::into_io)
    }
}
