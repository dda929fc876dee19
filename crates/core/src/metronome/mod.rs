//! Beats, bars and the metronome that plays them.

use std::{
    fmt,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::{
    config::MetronomeConfig,
    output::AudioOutputContext,
    sample::{Sample, ToneSelector, ToneSet},
    timeline::{self, Scheduler, SchedulerState, SpinStrategy, StopHandle, Tick},
    MetronomeError, Result, TimeSignature,
};

/// Beat events kept for listeners that fall behind. Newer events are dropped
/// once this many are waiting.
pub const EVENT_BACKLOG: usize = 64;

/// One position within a bar and the tone played on it.
#[derive(Debug)]
pub struct Beat {
    ordinal: u32,
    accent: bool,
    sample: Sample,
}

impl Beat {
    pub fn new(ordinal: u32, sample: Sample) -> Self {
        Self {
            ordinal,
            accent: ordinal == 1,
            sample,
        }
    }

    /// 1-based position in the bar.
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn is_accent(&self) -> bool {
        self.accent
    }

    pub fn tone(&self) -> &ToneSelector {
        self.sample.selector()
    }

    /// Plays the beat's tone, blocking until it is done.
    pub fn play(&mut self) -> Result<()> {
        self.sample.play()
    }
}

impl TimeSignature {
    /// Builds one beat per position in the bar: the accent tone on the first,
    /// the regular tone on the rest.
    pub fn build_beats(&self, ctx: &AudioOutputContext, tones: &ToneSet, hold: Duration) -> Result<Vec<Beat>> {
        (1..=self.beats_per_bar())
            .map(|ordinal| {
                let tone = if ordinal == 1 { &tones.accent } else { &tones.regular };
                Ok(Beat::new(ordinal, Sample::new(tone, ctx, hold)?))
            })
            .collect()
    }
}

/// Playback options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetronomeSettings {
    /// Play each beat's tone. Ticks and events continue when off.
    pub sound: bool,
    /// Stop on its own after this many full bars.
    pub bars: Option<u32>,
}

impl Default for MetronomeSettings {
    fn default() -> Self {
        Self {
            sound: true,
            bars: None,
        }
    }
}

/// Published for every beat the metronome reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeatEvent {
    /// 1-based bar number.
    pub bar: u64,
    pub ordinal: u32,
    pub accent: bool,
    pub tick: Tick,
}

type Consumer = JoinHandle<(Vec<Beat>, Result<()>)>;

pub struct Metronome {
    time_signature: TimeSignature,
    settings: MetronomeSettings,
    scheduler: Scheduler,
    beats: Vec<Beat>,
    events_tx: Option<Sender<BeatEvent>>,
    events_rx: Receiver<BeatEvent>,
    consumer: Option<Consumer>,
}

impl Metronome {
    pub fn new(
        bpm: u32,
        time_signature: TimeSignature,
        settings: MetronomeSettings,
        beats: Vec<Beat>,
        spin: SpinStrategy,
    ) -> Result<Self> {
        time_signature.validate()?;
        if beats.len() != time_signature.beats_per_bar() as usize {
            return Err(MetronomeError::InvalidBeatsPerBar(beats.len() as i64));
        }

        let scheduler = Scheduler::new(bpm, spin)?;
        let (events_tx, events_rx) = bounded(EVENT_BACKLOG);

        Ok(Self {
            time_signature,
            settings,
            scheduler,
            beats,
            events_tx: Some(events_tx),
            events_rx,
            consumer: None,
        })
    }

    /// Builds the beats through `ctx`. Each tone is held for at most half a
    /// beat.
    pub fn with_context(
        bpm: u32,
        time_signature: TimeSignature,
        settings: MetronomeSettings,
        ctx: &AudioOutputContext,
        tones: &ToneSet,
        spin: SpinStrategy,
    ) -> Result<Self> {
        let hold = Duration::from_micros(timeline::micros_per_beat(bpm)? / 2);
        let beats = time_signature.build_beats(ctx, tones, hold)?;
        Self::new(bpm, time_signature, settings, beats, spin)
    }

    pub fn from_config(config: &MetronomeConfig, ctx: &AudioOutputContext) -> Result<Self> {
        config.validate()?;
        Self::with_context(
            config.bpm,
            config.time_signature,
            config.settings(),
            ctx,
            &config.tones,
            config.scheduler.spin,
        )
    }

    pub fn bpm(&self) -> u32 {
        self.scheduler.bpm()
    }

    pub fn micros_per_beat(&self) -> u64 {
        self.scheduler.micros_per_beat()
    }

    pub fn time_signature(&self) -> TimeSignature {
        self.time_signature
    }

    pub fn settings(&self) -> MetronomeSettings {
        self.settings
    }

    /// The beats of one bar. Empty while the metronome is running.
    pub fn beats(&self) -> &[Beat] {
        &self.beats
    }

    /// Receiver for beat events. At most [`EVENT_BACKLOG`] undelivered events
    /// are kept; the beat keeps going whether or not anyone listens.
    pub fn events(&self) -> Receiver<BeatEvent> {
        self.events_rx.clone()
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.scheduler.stop_handle()
    }

    pub fn start(&mut self) -> Result<()> {
        let state = self.scheduler.state();
        let events = self
            .events_tx
            .take()
            .ok_or(MetronomeError::InvalidState {
                action: "start",
                state: state.as_str(),
            })?;

        let ticks = self.scheduler.ticks();
        self.scheduler.start()?;

        let beats = std::mem::take(&mut self.beats);
        let settings = self.settings;
        let stop = self.scheduler.stop_handle();
        let consumer = thread::Builder::new()
            .name("metronome-beats".into())
            .spawn(move || consume(ticks, beats, settings, events, stop));

        match consumer {
            Ok(consumer) => {
                self.consumer = Some(consumer);
                tracing::info!(
                    bpm = self.bpm(),
                    time_signature = %self.time_signature,
                    sound = settings.sound,
                    bars = ?settings.bars,
                    "metronome started"
                );
                Ok(())
            }
            Err(err) => {
                self.scheduler.stop()?;
                Err(err.into())
            }
        }
    }

    pub fn pause(&self) -> Result<()> {
        self.scheduler.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.scheduler.resume()
    }

    /// Stops ticking and waits for the beat being played to finish.
    pub fn stop(&mut self) -> Result<()> {
        self.scheduler.stop()?;
        self.join_consumer()
    }

    /// Blocks until the metronome stops on its own, after its bar count is
    /// reached or a beat fails to play.
    pub fn wait(&mut self) -> Result<()> {
        let outcome = self.join_consumer();
        self.scheduler.stop()?;
        outcome
    }

    fn join_consumer(&mut self) -> Result<()> {
        let Some(consumer) = self.consumer.take() else {
            return Ok(());
        };
        let (beats, outcome) = consumer
            .join()
            .map_err(|_| MetronomeError::msg("beat consumer thread panicked"))?;
        self.beats = beats;
        outcome
    }
}

impl Drop for Metronome {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::error!(%err, "metronome did not stop cleanly");
        }
    }
}

impl fmt::Debug for Metronome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metronome")
            .field("time_signature", &self.time_signature)
            .field("settings", &self.settings)
            .field("scheduler", &self.scheduler)
            .field("beats", &self.beats)
            .finish()
    }
}

fn consume(
    ticks: Receiver<Tick>,
    mut beats: Vec<Beat>,
    settings: MetronomeSettings,
    events: Sender<BeatEvent>,
    stop: StopHandle,
) -> (Vec<Beat>, Result<()>) {
    let per_bar = beats.len() as u64;
    if per_bar == 0 {
        stop.request_stop();
        return (beats, Err(MetronomeError::InvalidBeatsPerBar(0)));
    }

    for tick in ticks.iter() {
        let position = (tick.sequence - 1) % per_bar;
        let bar = (tick.sequence - 1) / per_bar + 1;
        let beat = &mut beats[position as usize];

        let event = BeatEvent {
            bar,
            ordinal: beat.ordinal(),
            accent: beat.is_accent(),
            tick,
        };
        tracing::debug!(bar, beat = event.ordinal, accent = event.accent, "beat");
        match events.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!(bar, beat = event.ordinal, "event backlog full, dropping event");
            }
        }

        if settings.sound {
            if let Err(err) = beat.play() {
                tracing::error!(%err, bar, beat = event.ordinal, "beat failed to play");
                stop.request_stop();
                return (beats, Err(err));
            }
        }

        let bar_done = position + 1 == per_bar;
        if bar_done && settings.bars.is_some_and(|bars| bar >= u64::from(bars)) {
            tracing::info!(bars = bar, "bar count reached");
            stop.request_stop();
            break;
        }
    }

    (beats, Ok(()))
}
