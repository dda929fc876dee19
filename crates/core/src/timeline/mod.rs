//! Drift-compensated beat scheduling.

use std::{
    fmt,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{MetronomeError, Result};

pub const MICROS_PER_MINUTE: u64 = 60_000_000;

/// Target beat interval in microseconds for `bpm`.
pub fn micros_per_beat(bpm: u32) -> Result<u64> {
    if bpm == 0 {
        return Err(MetronomeError::InvalidTempo(0));
    }
    match MICROS_PER_MINUTE / u64::from(bpm) {
        0 => Err(MetronomeError::InvalidTempo(i64::from(bpm))),
        interval => Ok(interval),
    }
}

/// One elapsed beat interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// 1-based tick count since start.
    pub sequence: u64,
    /// Time budget until the next tick after compensating for this one's lateness.
    pub budget_micros: u64,
    /// How far past its deadline this tick fired.
    pub lateness_micros: u64,
    pub at: Instant,
}

/// Integral drift correction over a fixed interval. The clock is supplied by
/// the caller.
///
/// A tick that fires `d` late shortens the following budget to
/// `interval - d`, so tick times stay on the ideal grid. The budget never
/// goes below zero: a tick more than a whole interval late yields one
/// immediate catch-up tick instead of a burst.
#[derive(Debug, Clone)]
pub struct DriftCompensator {
    interval: u64,
    budget: u64,
    last: Instant,
    sequence: u64,
}

impl DriftCompensator {
    pub fn new(interval_micros: u64, origin: Instant) -> Self {
        Self {
            interval: interval_micros,
            budget: interval_micros,
            last: origin,
            sequence: 0,
        }
    }

    pub fn interval_micros(&self) -> u64 {
        self.interval
    }

    pub fn budget_micros(&self) -> u64 {
        self.budget
    }

    pub fn deadline(&self) -> Instant {
        self.last + Duration::from_micros(self.budget)
    }

    /// Emits a tick when `now` has reached the deadline.
    pub fn poll(&mut self, now: Instant) -> Option<Tick> {
        let elapsed = u64::try_from(now.saturating_duration_since(self.last).as_micros())
            .unwrap_or(u64::MAX);
        if elapsed < self.budget {
            return None;
        }

        let lateness = elapsed - self.budget;
        self.budget = (self.budget + self.interval).saturating_sub(elapsed);
        self.last = now;
        self.sequence += 1;

        Some(Tick {
            sequence: self.sequence,
            budget_micros: self.budget,
            lateness_micros: lateness,
            at: now,
        })
    }

    /// Moves the anchor forward, e.g. by the time spent paused.
    pub fn shift(&mut self, by: Duration) {
        self.last += by;
    }
}

/// How the scheduler waits between deadline checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpinStrategy {
    /// Pure busy poll.
    Busy,
    /// Busy poll that yields the thread between checks.
    #[default]
    Yield,
}

impl SpinStrategy {
    fn relax(self) {
        match self {
            Self::Busy => std::hint::spin_loop(),
            Self::Yield => thread::yield_now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl SchedulerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Pause,
    Resume,
    Stop,
}

/// Runs a [`DriftCompensator`] on its own thread and hands ticks to a single
/// consumer over a rendezvous channel.
///
/// A consumer slower than the interval paces the ticks. Once stopped the
/// scheduler cannot be restarted.
pub struct Scheduler {
    bpm: u32,
    interval: u64,
    spin: SpinStrategy,
    state: Arc<Mutex<SchedulerState>>,
    ticks_tx: Option<Sender<Tick>>,
    ticks_rx: Receiver<Tick>,
    control_tx: Sender<Control>,
    control_rx: Option<Receiver<Control>>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(bpm: u32, spin: SpinStrategy) -> Result<Self> {
        let interval = micros_per_beat(bpm)?;
        let (ticks_tx, ticks_rx) = bounded(0);
        let (control_tx, control_rx) = unbounded();

        Ok(Self {
            bpm,
            interval,
            spin,
            state: Arc::new(Mutex::new(SchedulerState::Idle)),
            ticks_tx: Some(ticks_tx),
            ticks_rx,
            control_tx,
            control_rx: Some(control_rx),
            worker: None,
        })
    }

    pub fn bpm(&self) -> u32 {
        self.bpm
    }

    pub fn micros_per_beat(&self) -> u64 {
        self.interval
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    /// Receiving end of the tick channel. Disconnects once the scheduler stops.
    pub fn ticks(&self) -> Receiver<Tick> {
        self.ticks_rx.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            control: self.control_tx.clone(),
            state: self.state.clone(),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        let (Some(ticks), Some(control)) = (self.ticks_tx.take(), self.control_rx.take()) else {
            return Err(invalid("start", *state));
        };
        if *state != SchedulerState::Idle {
            return Err(invalid("start", *state));
        }

        let interval = self.interval;
        let spin = self.spin;
        let worker = thread::Builder::new()
            .name("metronome-scheduler".into())
            .spawn(move || run(interval, spin, ticks, control))?;

        self.worker = Some(worker);
        *state = SchedulerState::Running;
        tracing::info!(bpm = self.bpm, interval_micros = interval, ?spin, "scheduler started");
        Ok(())
    }

    /// Halts tick emission, keeping the remaining part of the current interval.
    ///
    /// A tick already waiting for the consumer is handed over right after
    /// [`Scheduler::resume`], with `at` moved forward by the paused time.
    pub fn pause(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != SchedulerState::Running {
            return Err(invalid("pause", *state));
        }
        self.send(Control::Pause)?;
        *state = SchedulerState::Paused;
        tracing::debug!("scheduler paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != SchedulerState::Paused {
            return Err(invalid("resume", *state));
        }
        self.send(Control::Resume)?;
        *state = SchedulerState::Running;
        tracing::debug!("scheduler resumed");
        Ok(())
    }

    /// Stops the loop and waits for its thread to exit. Calling it again is a
    /// no-op.
    pub fn stop(&mut self) -> Result<()> {
        let _ = self.control_tx.send(Control::Stop);
        self.ticks_tx.take();
        *self.state.lock() = SchedulerState::Stopped;

        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| MetronomeError::msg("scheduler thread panicked"))?;
            tracing::info!(bpm = self.bpm, "scheduler stopped");
        }
        Ok(())
    }

    fn send(&self, control: Control) -> Result<()> {
        self.control_tx
            .send(control)
            .map_err(|_| MetronomeError::msg("scheduler thread has exited"))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::error!(%err, "failed to stop scheduler");
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("bpm", &self.bpm)
            .field("interval_micros", &self.interval)
            .field("spin", &self.spin)
            .field("state", &self.state())
            .finish()
    }
}

/// Requests a stop without waiting for the scheduler thread.
#[derive(Clone)]
pub struct StopHandle {
    control: Sender<Control>,
    state: Arc<Mutex<SchedulerState>>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        let _ = self.control.send(Control::Stop);
        *self.state.lock() = SchedulerState::Stopped;
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle").finish_non_exhaustive()
    }
}

fn invalid(action: &'static str, state: SchedulerState) -> MetronomeError {
    MetronomeError::InvalidState {
        action,
        state: state.as_str(),
    }
}

fn run(interval: u64, spin: SpinStrategy, ticks: Sender<Tick>, control: Receiver<Control>) {
    let mut drift = DriftCompensator::new(interval, Instant::now());

    loop {
        match control.try_recv() {
            Ok(Control::Stop) | Err(TryRecvError::Disconnected) => break,
            Ok(Control::Pause) => {
                if hold_paused(&control, &mut drift).is_none() {
                    break;
                }
                continue;
            }
            Ok(Control::Resume) | Err(TryRecvError::Empty) => {}
        }

        let Some(tick) = drift.poll(Instant::now()) else {
            spin.relax();
            continue;
        };

        if tick.lateness_micros > interval / 10 {
            tracing::warn!(
                sequence = tick.sequence,
                lateness_micros = tick.lateness_micros,
                "tick fired late"
            );
        } else {
            tracing::trace!(
                sequence = tick.sequence,
                budget_micros = tick.budget_micros,
                lateness_micros = tick.lateness_micros,
                "tick"
            );
        }

        if !deliver(&ticks, &control, tick, &mut drift) {
            break;
        }
    }

    tracing::debug!(ticks = drift.sequence, "scheduler loop exited");
}

/// Blocks until the tick is taken, watching for control messages meanwhile.
/// A tick held across a pause is moved forward by the paused time, matching
/// the shifted anchor. Returns false when the loop should exit.
fn deliver(
    ticks: &Sender<Tick>,
    control: &Receiver<Control>,
    mut tick: Tick,
    drift: &mut DriftCompensator,
) -> bool {
    loop {
        select! {
            send(ticks, tick) -> sent => return sent.is_ok(),
            recv(control) -> message => match message {
                Ok(Control::Pause) => match hold_paused(control, drift) {
                    Some(paused) => tick.at += paused,
                    None => return false,
                },
                Ok(Control::Resume) => {}
                Ok(Control::Stop) | Err(_) => return false,
            },
        }
    }
}

/// Waits for a resume and returns how long the loop was paused, or `None`
/// when it should exit instead.
fn hold_paused(control: &Receiver<Control>, drift: &mut DriftCompensator) -> Option<Duration> {
    let paused_at = Instant::now();
    loop {
        match control.recv() {
            Ok(Control::Resume) => {
                let paused = paused_at.elapsed();
                drift.shift(paused);
                return Some(paused);
            }
            Ok(Control::Pause) => {}
            Ok(Control::Stop) | Err(_) => return None,
        }
    }
}
