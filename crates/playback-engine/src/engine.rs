//! Playback engine: one decoder, one time-stretcher, one output sink, and a
//! single worker thread that pulls, stretches, and writes.
//!
//! Control methods are called from arbitrary threads and communicate with
//! the worker purely through small atomic cells (a playing flag, a stop
//! flag, an optional pending seek). The worker reacts at loop-iteration
//! boundaries; nothing is preempted mid-operation. `position()` is lock-free
//! and callable concurrently with the worker.

use std::path::Path;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::config::EngineConfig;
use crate::decode::{DecoderRegistry, MediaDecoder, ReadOutcome};
use crate::error::EngineError;
use crate::sink::{CpalSinkFactory, OutputSink, PeriodCallback, SinkCells, SinkFactory};
use crate::stretch::{SoundTouchStretcher, TimeStretcher};

/// Sentinel for "no pending seek" in the shared cell.
const NO_SEEK: u64 = u64::MAX;

/// Engine lifecycle state, owned by the worker thread and published for
/// observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    /// Initial and terminal state.
    Stopped = 0,
    /// Worker is polling for a usable output device/format.
    WaitingForDevice = 1,
    Playing = 2,
    Paused = 3,
    /// Worker is tearing down decoder, stretcher, and sink.
    Draining = 4,
}

impl PlaybackState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::WaitingForDevice,
            2 => Self::Playing,
            3 => Self::Paused,
            4 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Why the worker exited its loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// Natural end of stream. The only reason that fires completion.
    Eof,
    /// Caller requested stop.
    Stopped,
    /// Decoder or device failure; playback shut down gracefully.
    Error,
}

/// Event hooks for one playback.
///
/// `on_pulse` fires roughly once per second of played audio with the current
/// position, on a non-worker thread, and is suppressed while paused.
/// `on_completion` fires exactly once, only when the media is exhausted (not
/// on `stop()` or error).
#[derive(Default)]
pub struct EngineCallbacks {
    pub on_pulse: Option<Arc<dyn Fn(f64) + Send + Sync>>,
    pub on_completion: Option<Box<dyn FnOnce() + Send>>,
}

/// Builds the time-stretcher once the source rate and channel count are
/// settled.
pub type StretcherFactory = Box<dyn FnOnce(u32, usize) -> Box<dyn TimeStretcher> + Send>;

struct Shared {
    cells: SinkCells,
    /// Pending seek target in ms; `NO_SEEK` when empty. Written by any
    /// caller thread, consumed (swapped out) by the worker once per loop
    /// iteration. A newer write overwrites an unconsumed older one;
    /// last-write-wins is intentional.
    pending_seek_ms: AtomicU64,
    /// Position offset recorded at each (re)start point of the sink.
    seekbase_ms: AtomicU64,
    state: AtomicU8,
    end_reason: AtomicU8,
}

impl Shared {
    fn new() -> Self {
        Self {
            cells: SinkCells::new(),
            pending_seek_ms: AtomicU64::new(NO_SEEK),
            seekbase_ms: AtomicU64::new(0),
            state: AtomicU8::new(PlaybackState::Stopped as u8),
            end_reason: AtomicU8::new(0),
        }
    }

    fn set_state(&self, state: PlaybackState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_end_reason(&self, reason: EndReason) {
        let v = match reason {
            EndReason::Eof => 1,
            EndReason::Stopped => 2,
            EndReason::Error => 3,
        };
        self.end_reason.store(v, Ordering::Relaxed);
    }

    fn end_reason(&self) -> Option<EndReason> {
        match self.end_reason.load(Ordering::Relaxed) {
            1 => Some(EndReason::Eof),
            2 => Some(EndReason::Stopped),
            3 => Some(EndReason::Error),
            _ => None,
        }
    }
}

/// `seekbase + rate * head / sink_rate`, falling back to the seekbase when
/// no sink exists. The head comes from the device's own played-frame
/// counter and is never double-counted here.
fn position_secs(shared: &Shared, rate: f64) -> f64 {
    let base = shared.seekbase_ms.load(Ordering::Relaxed) as f64 / 1000.0;
    let sink_rate = shared.cells.sink_rate.load(Ordering::Relaxed);
    if sink_rate == 0 {
        return base;
    }
    let head = shared.cells.played_frames.load(Ordering::Relaxed) as f64;
    base + rate * head / sink_rate as f64
}

/// One active playback of one file at one fixed rate.
///
/// Construction opens the decoder (failing fast on an unrecognized format)
/// and spawns the worker. Changing the file or the rate means constructing a
/// new engine; none of the owned resources are shared across instances.
pub struct PlaybackEngine {
    shared: Arc<Shared>,
    rate: f64,
    duration_ms: Option<u64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackEngine {
    /// Open `path` with the default decoder registry and start playback at
    /// `rate` through the default CPAL sink.
    pub fn start(
        path: impl AsRef<Path>,
        rate: f64,
        callbacks: EngineCallbacks,
    ) -> Result<Self, EngineError> {
        Self::start_with_config(path, rate, EngineConfig::default(), callbacks)
    }

    pub fn start_with_config(
        path: impl AsRef<Path>,
        rate: f64,
        config: EngineConfig,
        callbacks: EngineCallbacks,
    ) -> Result<Self, EngineError> {
        let decoder = DecoderRegistry::with_defaults().open(path.as_ref())?;
        let sink_factory = CpalSinkFactory::new(config.clone());
        let stretcher: StretcherFactory = Box::new(move |sample_rate, channels| {
            Box::new(SoundTouchStretcher::new(sample_rate, channels, rate)) as Box<dyn TimeStretcher>
        });
        Ok(Self::start_with_parts(
            decoder,
            sink_factory,
            stretcher,
            rate,
            config,
            callbacks,
        ))
    }

    /// Start playback from injected parts. This is the seam used by tests
    /// and by embedders with custom decoders or sinks.
    pub fn start_with_parts(
        decoder: Box<dyn MediaDecoder>,
        sink_factory: impl SinkFactory + 'static,
        stretcher_factory: StretcherFactory,
        rate: f64,
        config: EngineConfig,
        callbacks: EngineCallbacks,
    ) -> Self {
        assert!(rate.is_finite() && rate > 0.0, "playback rate must be positive");

        let shared = Arc::new(Shared::new());
        let duration_ms = decoder.duration_ms();

        let worker_shared = shared.clone();
        let handle = thread::spawn(move || {
            run_worker(
                decoder,
                Box::new(sink_factory),
                stretcher_factory,
                worker_shared,
                rate,
                config,
                callbacks,
            );
        });

        Self {
            shared,
            rate,
            duration_ms,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Pause output. Idempotent; a no-op until a sink exists.
    pub fn pause(&self) {
        self.shared.cells.playing.store(false, Ordering::Relaxed);
    }

    /// Resume output. Idempotent.
    pub fn resume(&self) {
        self.shared.cells.playing.store(true, Ordering::Relaxed);
    }

    pub fn is_playing(&self) -> bool {
        self.shared.cells.playing.load(Ordering::Relaxed)
    }

    /// Record a pending seek, consumed by the worker on its next loop
    /// iteration. A newer call overwrites an unconsumed older target.
    /// Seeking never changes the playback rate.
    pub fn seek_to(&self, seconds: f64) {
        let ms = ((seconds.max(0.0) * 1000.0) as u64).min(NO_SEEK - 1);
        self.shared.pending_seek_ms.store(ms, Ordering::Relaxed);
    }

    /// Request worker exit. Advisory: observed at the next iteration
    /// boundary and before any blocking write, so exit latency is bounded
    /// by the poll interval plus one device buffer.
    pub fn stop(&self) {
        self.shared.cells.stop.store(true, Ordering::Relaxed);
    }

    /// Current position in seconds. Lock-free, callable from any thread.
    pub fn position(&self) -> f64 {
        position_secs(&self.shared, self.rate)
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    /// Why playback ended; `None` while the worker is alive.
    pub fn end_reason(&self) -> Option<EndReason> {
        self.shared.end_reason()
    }

    /// Duration reported by the decoder at open time, in milliseconds.
    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Wait for the worker to finish. Returns immediately if already joined.
    pub fn join(&self) {
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn run_worker(
    decoder: Box<dyn MediaDecoder>,
    sink_factory: Box<dyn SinkFactory>,
    stretcher_factory: StretcherFactory,
    shared: Arc<Shared>,
    rate: f64,
    config: EngineConfig,
    callbacks: EngineCallbacks,
) {
    shared.set_state(PlaybackState::WaitingForDevice);
    let on_period = make_period_callback(shared.clone(), rate, callbacks.on_pulse);

    let (reason, sink) = drive(
        decoder,
        sink_factory,
        stretcher_factory,
        &shared,
        rate,
        &config,
        on_period,
    );

    // Unconditional cleanup: every exit route funnels through here.
    shared.set_state(PlaybackState::Draining);
    if let Some(mut sink) = sink {
        if reason == EndReason::Eof {
            sink.drain();
        }
        // Fold the head into the seekbase so position queries after
        // teardown return the stop point.
        let head = sink.head_frame_position();
        let sink_rate = sink.sample_rate();
        if sink_rate > 0 {
            let advance_ms = (rate * head as f64 * 1000.0 / sink_rate as f64) as u64;
            shared.seekbase_ms.fetch_add(advance_ms, Ordering::Relaxed);
        }
        sink.release();
    }
    shared.cells.playing.store(false, Ordering::Relaxed);
    shared.set_end_reason(reason);

    if reason == EndReason::Eof {
        if let Some(done) = callbacks.on_completion {
            done();
        }
    }

    shared.set_state(PlaybackState::Stopped);
    tracing::info!(?reason, "playback finished");
}

/// Run the pipeline to its end reason. Decoder and stretcher are owned here
/// and dropped on return, whatever the exit path; the sink is handed back
/// for the final drain/release.
fn drive(
    decoder: Box<dyn MediaDecoder>,
    mut sink_factory: Box<dyn SinkFactory>,
    stretcher_factory: StretcherFactory,
    shared: &Arc<Shared>,
    rate: f64,
    config: &EngineConfig,
    on_period: PeriodCallback,
) -> (EndReason, Option<Box<dyn OutputSink>>) {
    let sink = match wait_for_sink(&mut *sink_factory, &*decoder, shared, config, &on_period) {
        SinkWait::Ready(sink) => sink,
        SinkWait::Cancelled => return (EndReason::Stopped, None),
        SinkWait::Failed => return (EndReason::Error, None),
    };

    let stretcher = stretcher_factory(decoder.sample_rate(), decoder.channel_count());
    let duration_ms = decoder.duration_ms();

    let mut worker = Worker {
        decoder,
        stretcher,
        sink: Some(sink),
        sink_factory,
        on_period,
        shared: shared.clone(),
        config: config.clone(),
        duration_ms,
        pcm: Vec::new(),
        stretched: vec![0.0f32; config.chunk_frames.max(1) * 8],
    };

    let reason = worker.run();
    (reason, worker.sink.take())
}

enum SinkWait {
    Ready(Box<dyn OutputSink>),
    Cancelled,
    Failed,
}

/// Poll the factory until a sink exists, stop is requested, or the device
/// fails hard. A streaming decoder may not know its true rate yet, in which
/// case the factory yields `None` and we retry on the poll interval.
fn wait_for_sink(
    factory: &mut dyn SinkFactory,
    decoder: &dyn MediaDecoder,
    shared: &Shared,
    config: &EngineConfig,
    on_period: &PeriodCallback,
) -> SinkWait {
    loop {
        if shared.cells.stop.load(Ordering::Relaxed) {
            return SinkWait::Cancelled;
        }
        match factory.create(
            decoder.sample_rate(),
            decoder.channel_count(),
            &shared.cells,
            on_period.clone(),
        ) {
            Ok(Some(sink)) => return SinkWait::Ready(sink),
            Ok(None) => thread::sleep(config.poll_interval),
            Err(e) => {
                tracing::warn!("output sink creation failed: {e}");
                return SinkWait::Failed;
            }
        }
    }
}

fn make_period_callback(
    shared: Arc<Shared>,
    rate: f64,
    on_pulse: Option<Arc<dyn Fn(f64) + Send + Sync>>,
) -> PeriodCallback {
    Arc::new(move || {
        if !shared.cells.playing.load(Ordering::Relaxed) {
            return;
        }
        if let Some(pulse) = &on_pulse {
            pulse(position_secs(&shared, rate));
        }
    })
}

enum SeekAbort {
    Cancelled,
    Failed,
}

struct Worker {
    decoder: Box<dyn MediaDecoder>,
    stretcher: Box<dyn TimeStretcher>,
    sink: Option<Box<dyn OutputSink>>,
    sink_factory: Box<dyn SinkFactory>,
    on_period: PeriodCallback,
    shared: Arc<Shared>,
    config: EngineConfig,
    duration_ms: Option<u64>,
    pcm: Vec<f32>,
    stretched: Vec<f32>,
}

impl Worker {
    fn run(&mut self) -> EndReason {
        loop {
            // (1) Consume a pending seek, if any (last write wins).
            let pending = self.shared.pending_seek_ms.swap(NO_SEEK, Ordering::Relaxed);
            if pending != NO_SEEK {
                match self.apply_seek(pending) {
                    Ok(()) => {}
                    Err(SeekAbort::Cancelled) => return EndReason::Stopped,
                    Err(SeekAbort::Failed) => return EndReason::Error,
                }
            }

            // (2) Stop request.
            if self.stop_requested() {
                return EndReason::Stopped;
            }

            // (3) Paused: idle briefly, stay responsive.
            if !self.shared.cells.playing.load(Ordering::Relaxed) {
                self.shared.set_state(PlaybackState::Paused);
                thread::sleep(self.config.poll_interval);
                continue;
            }
            self.shared.set_state(PlaybackState::Playing);

            // (4) Read one batch. Underrun and end-of-stream are distinct:
            // the former is retried, the latter ends playback.
            match self.decoder.read_frames(&mut self.pcm) {
                Ok(ReadOutcome::Frames(_)) => {
                    if !self.stretch_and_write(false) {
                        return EndReason::Stopped;
                    }
                }
                Ok(ReadOutcome::NeedMoreData) => thread::sleep(self.config.poll_interval),
                Ok(ReadOutcome::EndOfStream) => {
                    self.stretcher.finish();
                    if !self.stretch_and_write(true) {
                        return EndReason::Stopped;
                    }
                    return EndReason::Eof;
                }
                Err(e) => {
                    tracing::warn!("decoder error during playback: {e}");
                    return EndReason::Error;
                }
            }
        }
    }

    fn stop_requested(&self) -> bool {
        self.shared.cells.stop.load(Ordering::Relaxed)
    }

    /// Run the current batch (or, when flushing, nothing) through the
    /// stretcher and write everything it produces. Stop is observed before
    /// every blocking write. Returns `false` when a write was abandoned.
    fn stretch_and_write(&mut self, flush_only: bool) -> bool {
        let mut feed = !flush_only;
        loop {
            if self.stop_requested() {
                return false;
            }
            let n = if feed {
                feed = false;
                self.stretcher.process(&self.pcm, &mut self.stretched)
            } else {
                self.stretcher.process(&[], &mut self.stretched)
            };
            if n == 0 {
                return true;
            }
            if let Some(sink) = self.sink.as_mut() {
                if !sink.write(&self.stretched[..n]) {
                    return false;
                }
            }
        }
    }

    /// Seek: release the sink, reposition the decoder, reset the position
    /// base and the stretcher, recreate the sink. The playing flag is left
    /// untouched, so playback resumes only if it was playing before.
    fn apply_seek(&mut self, target_ms: u64) -> Result<(), SeekAbort> {
        let target_ms = match self.duration_ms {
            Some(total) => target_ms.min(total),
            None => target_ms,
        };
        tracing::debug!(target_ms, "seeking");

        if let Some(sink) = self.sink.take() {
            sink.release();
        }

        self.shared.seekbase_ms.store(target_ms, Ordering::Relaxed);
        self.stretcher.reset();
        if let Err(e) = self.decoder.seek(target_ms as f64 / 1000.0) {
            tracing::warn!("seek failed: {e}");
            return Err(SeekAbort::Failed);
        }

        self.shared.set_state(PlaybackState::WaitingForDevice);
        match wait_for_sink(
            &mut *self.sink_factory,
            &*self.decoder,
            &self.shared,
            &self.config,
            &self.on_period,
        ) {
            SinkWait::Ready(sink) => {
                self.sink = Some(sink);
                Ok(())
            }
            SinkWait::Cancelled => Err(SeekAbort::Cancelled),
            SinkWait::Failed => Err(SeekAbort::Failed),
        }
    }
}
