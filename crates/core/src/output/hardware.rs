use std::{
    io::{Read, Seek, SeekFrom},
    sync::Arc,
    thread::{self, JoinHandle},
};

use cpal::{
    traits::{DeviceTrait as _, HostTrait as _, StreamTrait as _},
    BufferSize, OutputCallbackInfo, SampleRate, StreamConfig,
};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;

use super::{next_unit_id, OutputDevice, PcmSource, PlaybackUnit};
use crate::{config::AudioConfig, MetronomeError, Result};

/// Output device backed by the host's default cpal output.
///
/// cpal streams cannot move between threads, so the stream lives on its own
/// thread for as long as the device exists. Playback units are mixed into the
/// stream's callback.
pub struct CpalDevice {
    mixer: Arc<Mixer>,
    shutdown: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CpalDevice {
    /// Opens the default output device and blocks until its stream is running.
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let mixer = Arc::new(Mixer::default());
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: SampleRate(config.sample_rate),
            buffer_size: BufferSize::Default,
        };
        let stream_mixer = mixer.clone();

        let worker = thread::Builder::new()
            .name("metronome-audio".into())
            .spawn(move || {
                let stream = match build_stream(&stream_config, stream_mixer) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Disconnects when the device is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::info!("output stream closed");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                mixer,
                shutdown: Some(shutdown_tx),
                worker: Some(worker),
            }),
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(err)
            }
            Err(_) => Err(MetronomeError::HardwareContext(
                "audio thread exited before the stream was ready".into(),
            )),
        }
    }
}

impl OutputDevice for CpalDevice {
    fn new_player(&self, source: Box<dyn PcmSource>) -> Result<Box<dyn PlaybackUnit>> {
        let voice = Arc::new(Voice {
            id: next_unit_id(),
            state: Mutex::new(VoiceState {
                source,
                playing: false,
                error: None,
            }),
        });
        self.mixer.voices.lock().push(voice.clone());

        Ok(Box::new(CpalUnit {
            voice,
            mixer: self.mixer.clone(),
        }))
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for CpalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalDevice")
            .field("voices", &self.mixer.voices.lock().len())
            .finish()
    }
}

fn build_stream(config: &StreamConfig, mixer: Arc<Mixer>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| MetronomeError::HardwareContext("no default output device".into()))?;

    tracing::info!(
        device = %device.name().unwrap_or_default(),
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        "starting output stream"
    );

    let mut scratch = Vec::new();
    let stream = device
        .build_output_stream(
            config,
            move |buf: &mut [f32], _: &OutputCallbackInfo| mixer.render(buf, &mut scratch),
            |err| tracing::error!(%err, "output stream error"),
            None,
        )
        .map_err(hardware_error)?;
    stream.play().map_err(hardware_error)?;

    Ok(stream)
}

fn hardware_error(err: impl std::fmt::Display) -> MetronomeError {
    MetronomeError::HardwareContext(err.to_string())
}

#[derive(Default)]
struct Mixer {
    voices: Mutex<Vec<Arc<Voice>>>,
}

impl Mixer {
    /// Sums every playing voice into `out`. A voice stops once its source
    /// runs dry.
    fn render(&self, out: &mut [f32], scratch: &mut Vec<u8>) {
        out.fill(0.0);
        scratch.resize(out.len() * 2, 0);

        for voice in self.voices.lock().iter() {
            let mut state = voice.state.lock();
            if !state.playing {
                continue;
            }

            let filled = match fill(state.source.as_mut(), scratch) {
                Ok(filled) => filled,
                Err(err) => {
                    tracing::error!(unit = voice.id, %err, "playback read failed");
                    state.playing = false;
                    state.error = Some(err);
                    continue;
                }
            };

            for (sample, pair) in out.iter_mut().zip(scratch[..filled].chunks_exact(2)) {
                *sample += f32::from(i16::from_le_bytes([pair[0], pair[1]])) / f32::from(i16::MAX);
            }

            if filled < scratch.len() {
                state.playing = false;
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }
}

/// Reads until `buf` is full or the source is exhausted.
fn fill(source: &mut dyn PcmSource, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

struct Voice {
    id: u64,
    state: Mutex<VoiceState>,
}

struct VoiceState {
    source: Box<dyn PcmSource>,
    playing: bool,
    error: Option<std::io::Error>,
}

struct CpalUnit {
    voice: Arc<Voice>,
    mixer: Arc<Mixer>,
}

impl PlaybackUnit for CpalUnit {
    fn id(&self) -> u64 {
        self.voice.id
    }

    fn play(&mut self) {
        self.voice.state.lock().playing = true;
    }

    fn pause(&mut self) {
        self.voice.state.lock().playing = false;
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.voice.state.lock().source.seek(pos)?)
    }

    fn is_playing(&self) -> bool {
        self.voice.state.lock().playing
    }

    fn take_error(&mut self) -> Option<MetronomeError> {
        self.voice.state.lock().error.take().map(MetronomeError::from)
    }
}

impl Drop for CpalUnit {
    fn drop(&mut self) {
        let id = self.voice.id;
        self.mixer.voices.lock().retain(|voice| voice.id != id);
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor};

    use super::*;

    struct BrokenSource;

    impl Read for BrokenSource {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("device unplugged"))
        }
    }

    impl Seek for BrokenSource {
        fn seek(&mut self, _: SeekFrom) -> io::Result<u64> {
            Ok(0)
        }
    }

    fn pcm(samples: &[i16]) -> Box<dyn PcmSource> {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Box::new(Cursor::new(bytes))
    }

    fn voice(id: u64, source: Box<dyn PcmSource>, playing: bool) -> Arc<Voice> {
        Arc::new(Voice {
            id,
            state: Mutex::new(VoiceState {
                source,
                playing,
                error: None,
            }),
        })
    }

    #[test]
    fn mixes_playing_voices_and_stops_exhausted_ones() {
        let mixer = Mixer::default();
        let loud = voice(1, pcm(&[i16::MAX / 2; 2]), true);
        let idle = voice(2, pcm(&[i16::MAX; 4]), false);
        mixer.voices.lock().extend([loud.clone(), idle.clone()]);

        let mut out = [0.0f32; 4];
        let mut scratch = Vec::new();
        mixer.render(&mut out, &mut scratch);

        assert!((out[0] - 0.5).abs() < 1e-3);
        assert!((out[1] - 0.5).abs() < 1e-3);
        assert_eq!(out[2], 0.0);
        assert!(!loud.state.lock().playing);
        assert!(!idle.state.lock().playing);
    }

    #[test]
    fn dropping_a_unit_detaches_its_voice() {
        let mixer = Arc::new(Mixer::default());
        let shared = voice(7, pcm(&[0; 8]), false);
        mixer.voices.lock().push(shared.clone());

        let mut unit = CpalUnit {
            voice: shared,
            mixer: mixer.clone(),
        };
        unit.play();
        assert!(unit.is_playing());
        assert_eq!(unit.seek(SeekFrom::Start(4)).unwrap(), 4);

        drop(unit);
        assert!(mixer.voices.lock().is_empty());
    }
    #[test]
    fn read_failures_are_kept_for_the_unit() {
        let mixer = Arc::new(Mixer::default());
        let broken = voice(3, Box::new(BrokenSource), true);
        mixer.voices.lock().push(broken.clone());

        let mut out = [0.5f32; 4];
        mixer.render(&mut out, &mut Vec::new());
        assert_eq!(out, [0.0; 4]);

        let mut unit = CpalUnit {
            voice: broken,
            mixer,
        };
        assert!(!unit.is_playing());
        let err = unit.take_error().expect("read error must be kept");
        assert!(err.to_string().contains("device unplugged"));
        assert!(unit.take_error().is_none());
    }
}
