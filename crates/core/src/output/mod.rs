//! Hardware output boundary and the shared output context.
//!
//! One [`AudioOutputContext`] owns the single output device of a session.
//! It is built explicitly and handed to every [`crate::Sample`]; the device
//! itself is created lazily on first use.

mod hardware;

use std::{
    fmt,
    io::{Read, Seek, SeekFrom},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    config::AudioConfig,
    decode::{DecodedStream, PcmFormat},
    window::BoundedSeeker,
    MetronomeError, Result,
};

pub use self::hardware::CpalDevice;

/// Byte source a playback unit pulls PCM from.
pub trait PcmSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> PcmSource for T {}

/// A hardware output capable of creating playback units.
pub trait OutputDevice: Send {
    fn new_player(&self, source: Box<dyn PcmSource>) -> Result<Box<dyn PlaybackUnit>>;
}

/// A hardware-bound handle starting and stopping one bounded stream.
pub trait PlaybackUnit: Send {
    /// Identifier unique within the process.
    fn id(&self) -> u64;

    fn play(&mut self);

    fn pause(&mut self);

    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    fn is_playing(&self) -> bool;

    /// Takes the error that ended playback, if reading the source failed.
    fn take_error(&mut self) -> Option<MetronomeError>;
}

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Hands out process-unique playback unit identifiers.
pub fn next_unit_id() -> u64 {
    NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Builds the output device for a context.
pub type DeviceFactory = Box<dyn Fn(&AudioConfig) -> Result<Box<dyn OutputDevice>> + Send + Sync>;

/// Length of the playable window: `percent` of `total`, rounded down to a
/// whole frame.
pub fn window_len(total: u64, percent: u8, frame_bytes: u64) -> u64 {
    let raw = total * u64::from(percent.min(100)) / 100;
    if frame_bytes == 0 {
        return raw;
    }
    raw - raw % frame_bytes
}

/// Owner of the session's single output device.
pub struct AudioOutputContext {
    config: AudioConfig,
    factory: DeviceFactory,
    device: Mutex<Option<Box<dyn OutputDevice>>>,
    created: AtomicUsize,
}

impl AudioOutputContext {
    pub fn new(config: AudioConfig, factory: DeviceFactory) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            device: Mutex::new(None),
            created: AtomicUsize::new(0),
        })
    }

    /// Context backed by the default cpal output device.
    pub fn cpal(config: AudioConfig) -> Arc<Self> {
        Self::new(
            config,
            Box::new(|config| Ok(Box::new(CpalDevice::open(config)?) as Box<dyn OutputDevice>)),
        )
    }

    /// Context whose units make no sound but take as long as the real thing.
    pub fn silent(config: AudioConfig) -> Arc<Self> {
        Self::new(
            config,
            Box::new(|config| Ok(Box::new(NullDevice::new(config.pcm_format())) as Box<dyn OutputDevice>)),
        )
    }

    /// Process-wide cpal context. The configuration of the first caller wins.
    pub fn shared(config: AudioConfig) -> Arc<Self> {
        static SHARED: OnceLock<Arc<AudioOutputContext>> = OnceLock::new();
        SHARED.get_or_init(|| Self::cpal(config)).clone()
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Number of devices this context has created; never more than one.
    pub fn devices_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Creates the output device if it does not exist yet. The first caller
    /// blocks until the device is ready.
    pub fn ensure_ready(&self) -> Result<()> {
        let mut slot = self.device.lock();
        self.ready_device(&mut slot).map(|_| ())
    }

    /// Trims `stream` to its playable window and binds it to a new unit.
    pub fn get_player(&self, mut stream: Box<dyn DecodedStream>) -> Result<Box<dyn PlaybackUnit>> {
        let mut slot = self.device.lock();
        let device = self.ready_device(&mut slot)?;

        let format = stream.format();
        let expected = self.config.pcm_format();
        if format != expected {
            return Err(MetronomeError::Decode(format!(
                "tone is {} Hz / {} ch but output expects {} Hz / {} ch",
                format.sample_rate, format.channels, expected.sample_rate, expected.channels
            )));
        }

        stream.seek(SeekFrom::Start(0))?;
        let total = stream.total_len();
        let limit = window_len(total, self.config.trim_percent, format.frame_bytes());
        let window = BoundedSeeker::new(stream, 0, limit)?;

        let unit = device.new_player(Box::new(window))?;
        tracing::debug!(unit = unit.id(), total, limit, "created playback unit");
        Ok(unit)
    }

    fn ready_device<'a>(
        &self,
        slot: &'a mut Option<Box<dyn OutputDevice>>,
    ) -> Result<&'a dyn OutputDevice> {
        let device = match slot.take() {
            Some(device) => device,
            None => {
                tracing::info!(
                    sample_rate = self.config.sample_rate,
                    channels = self.config.channels,
                    "creating audio output device"
                );
                let device = (self.factory)(&self.config).map_err(|err| match err {
                    MetronomeError::HardwareContext(_) => err,
                    other => MetronomeError::HardwareContext(other.to_string()),
                })?;
                self.created.fetch_add(1, Ordering::SeqCst);
                device
            }
        };

        Ok(&**slot.insert(device))
    }
}

impl fmt::Debug for AudioOutputContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioOutputContext")
            .field("config", &self.config)
            .field("ready", &self.device.lock().is_some())
            .finish()
    }
}

/// Silent output device.
#[derive(Debug, Clone, Copy)]
pub struct NullDevice {
    format: PcmFormat,
}

impl NullDevice {
    pub fn new(format: PcmFormat) -> Self {
        Self { format }
    }
}

impl OutputDevice for NullDevice {
    fn new_player(&self, mut source: Box<dyn PcmSource>) -> Result<Box<dyn PlaybackUnit>> {
        let len = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(0))?;

        Ok(Box::new(NullUnit {
            id: next_unit_id(),
            source,
            bytes_per_second: self.format.bytes_per_second().max(1),
            length: bytes_to_duration(len, self.format.bytes_per_second().max(1)),
            played: Duration::ZERO,
            started: None,
        }))
    }
}

/// Tracks playback progress against the wall clock instead of a device.
struct NullUnit {
    id: u64,
    source: Box<dyn PcmSource>,
    bytes_per_second: u64,
    length: Duration,
    played: Duration,
    started: Option<Instant>,
}

impl NullUnit {
    fn position(&self) -> Duration {
        self.played + self.started.map_or(Duration::ZERO, |started| started.elapsed())
    }
}

impl PlaybackUnit for NullUnit {
    fn id(&self) -> u64 {
        self.id
    }

    fn play(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn pause(&mut self) {
        self.played = self.position().min(self.length);
        self.started = None;
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let offset = self.source.seek(pos)?;
        self.played = bytes_to_duration(offset, self.bytes_per_second);
        if self.started.is_some() {
            self.started = Some(Instant::now());
        }
        Ok(offset)
    }

    fn is_playing(&self) -> bool {
        self.started.is_some() && self.position() < self.length
    }

    fn take_error(&mut self) -> Option<MetronomeError> {
        None
    }
}

fn bytes_to_duration(bytes: u64, bytes_per_second: u64) -> Duration {
    Duration::from_micros(bytes.saturating_mul(1_000_000) / bytes_per_second)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, thread};

    use super::*;
    use crate::decode::PcmStream;

    fn config() -> AudioConfig {
        AudioConfig {
            sample_rate: 1_000,
            channels: 1,
            trim_percent: 10,
        }
    }

    fn tone(frames: usize) -> Box<dyn DecodedStream> {
        Box::new(PcmStream::from_samples(config().pcm_format(), &vec![0.5; frames]))
    }

    fn counting_context() -> (Arc<AudioOutputContext>, Arc<AtomicUsize>) {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = opened.clone();
        let ctx = AudioOutputContext::new(
            config(),
            Box::new(move |config| {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                Ok(Box::new(NullDevice::new(config.pcm_format())) as Box<dyn OutputDevice>)
            }),
        );
        (ctx, opened)
    }

    #[test]
    fn window_is_trimmed_to_whole_frames() {
        assert_eq!(window_len(1_000, 10, 4), 100);
        assert_eq!(window_len(1_010, 10, 4), 100);
        assert_eq!(window_len(1_000, 100, 4), 1_000);
        assert_eq!(window_len(1_000, 150, 1), 1_000);
    }

    #[test]
    fn concurrent_players_share_one_device() {
        let (ctx, opened) = counting_context();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                thread::spawn(move || ctx.get_player(tone(100)).map(|unit| unit.id()))
            })
            .collect();

        let ids: HashSet<u64> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect();

        assert_eq!(ids.len(), 8);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.devices_created(), 1);
    }

    #[test]
    fn ensure_ready_is_idempotent() {
        let (ctx, opened) = counting_context();
        ctx.ensure_ready().unwrap();
        ctx.ensure_ready().unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn device_failures_surface_as_hardware_errors() {
        let ctx = AudioOutputContext::new(config(), Box::new(|_| Err("no sound card".into())));

        let err = ctx.get_player(tone(10)).err().expect("device creation must fail");
        assert!(matches!(err, MetronomeError::HardwareContext(msg) if msg.contains("no sound card")));
        assert_eq!(ctx.devices_created(), 0);
    }

    #[test]
    fn rejects_tones_in_another_format() {
        let ctx = AudioOutputContext::silent(config());
        let stereo = PcmFormat {
            sample_rate: 1_000,
            channels: 2,
        };
        let stream = Box::new(PcmStream::from_samples(stereo, &[0.0; 20]));

        assert!(matches!(
            ctx.get_player(stream),
            Err(MetronomeError::Decode(_))
        ));
    }

    #[test]
    fn null_units_play_for_the_trimmed_window() {
        let ctx = AudioOutputContext::silent(config());
        // 1000 frames at 1 kHz mono is one second; the window keeps 100 ms.
        let mut unit = ctx.get_player(tone(1_000)).unwrap();

        assert!(!unit.is_playing());
        unit.play();
        assert!(unit.is_playing());
        thread::sleep(Duration::from_millis(150));
        assert!(!unit.is_playing());

        unit.pause();
        assert_eq!(unit.seek(SeekFrom::Start(0)).unwrap(), 0);
        unit.play();
        assert!(unit.is_playing());
    }
}
