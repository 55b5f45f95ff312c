//! Output sink abstraction over the platform audio device.
//!
//! The engine worker owns one [`OutputSink`] at a time and talks to it with
//! blocking writes (the loop's backpressure point). Cross-thread transport
//! state lives in [`SinkCells`], so pause/stop/position work from any thread
//! without touching the worker-owned sink object.
//!
//! The CPAL implementation feeds a bounded queue that the device callback
//! drains without blocking. When the negotiated device rate differs from the
//! source rate, a resampler stage is spliced in between.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};

use crate::config::EngineConfig;
use crate::device;
use crate::error::EngineError;
use crate::queue::{SharedPcm, capacity_samples};
use crate::resample::start_resampler;

/// Shared transport cells. Each cell has one writer class: callers flip
/// `playing` and `stop`; the sink side owns `played_frames` and `sink_rate`.
#[derive(Clone, Debug)]
pub struct SinkCells {
    /// True while transport is playing. The device callback outputs silence
    /// and does not drain the queue when false, so pausing freezes the head.
    pub playing: Arc<AtomicBool>,
    /// Stop request. Also cancels blocking writes and drain waits.
    pub stop: Arc<AtomicBool>,
    /// Device frames played since the sink was (re)created.
    pub played_frames: Arc<AtomicU64>,
    /// Device stream rate in Hz; `0` while no sink exists.
    pub sink_rate: Arc<AtomicU32>,
}

impl SinkCells {
    pub fn new() -> Self {
        Self {
            playing: Arc::new(AtomicBool::new(true)),
            stop: Arc::new(AtomicBool::new(false)),
            played_frames: Arc::new(AtomicU64::new(0)),
            sink_rate: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl Default for SinkCells {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback invoked by the sink roughly once per notification period of
/// played audio, on a thread that is not the engine worker.
pub type PeriodCallback = Arc<dyn Fn() + Send + Sync>;

/// One live output device session, owned by the engine worker thread.
///
/// Not `Send`: `cpal::Stream` must stay on the thread that built it.
pub trait OutputSink {
    /// Queue interleaved samples for playback, blocking while the device
    /// absorbs earlier data. Returns `false` when the write was abandoned
    /// because stop was requested.
    fn write(&mut self, samples: &[f32]) -> bool;

    /// Device frames played since creation. Monotone while playing.
    fn head_frame_position(&self) -> u64;

    /// Actual device stream rate the head counter runs at.
    fn sample_rate(&self) -> u32;

    /// Stop intake and wait (bounded) for the head position to settle.
    fn drain(&mut self);

    /// Tear the sink down and zero its cells.
    fn release(self: Box<Self>);
}

/// Creates sinks for the engine worker.
///
/// `Ok(None)` means the requested rate is not determinable yet (for example
/// a streaming decoder that has not revealed its rate); the worker retries
/// on a bounded poll instead of failing.
pub trait SinkFactory: Send {
    fn create(
        &mut self,
        sample_rate: u32,
        channels: usize,
        cells: &SinkCells,
        on_period: PeriodCallback,
    ) -> Result<Option<Box<dyn OutputSink>>, EngineError>;
}

/// CPAL-backed sink factory using the engine's tuning config.
pub struct CpalSinkFactory {
    config: EngineConfig,
}

impl CpalSinkFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl SinkFactory for CpalSinkFactory {
    fn create(
        &mut self,
        sample_rate: u32,
        channels: usize,
        cells: &SinkCells,
        on_period: PeriodCallback,
    ) -> Result<Option<Box<dyn OutputSink>>, EngineError> {
        if sample_rate == 0 {
            return Ok(None);
        }

        let host = cpal::default_host();
        let device = device::select_device(&host, self.config.device_name.as_deref())?;
        let supported = device::select_output_config(&device, sample_rate)?;
        let mut stream_config: cpal::StreamConfig = supported.clone().into();
        if let Some(buf) = device::select_buffer_size(&supported) {
            stream_config.buffer_size = buf;
        }
        let stream_rate = stream_config.sample_rate;

        let srcq = Arc::new(SharedPcm::new(
            channels,
            capacity_samples(sample_rate, channels, self.config.buffer_seconds),
        ));
        let dstq = if stream_rate == sample_rate {
            srcq.clone()
        } else {
            tracing::info!(from_hz = sample_rate, to_hz = stream_rate, "resampling");
            start_resampler(
                srcq.clone(),
                sample_rate,
                stream_rate,
                self.config.chunk_frames,
                self.config.buffer_seconds,
                cells.stop.clone(),
            )
        };

        let stream = build_output_stream(
            &device,
            &stream_config,
            supported.sample_format(),
            &dstq,
            cells,
            self.config.refill_max_frames,
        )?;
        stream.play().map_err(EngineError::device)?;

        cells.played_frames.store(0, Ordering::Relaxed);
        cells.sink_rate.store(stream_rate, Ordering::Relaxed);

        let notifier_alive = spawn_notifier(
            cells.clone(),
            on_period,
            period_frames(stream_rate, self.config.notify_seconds),
            self.config.poll_interval,
        );

        tracing::debug!(
            device = %device.description().map(|d| d.to_string()).unwrap_or_default(),
            rate_hz = stream_rate,
            "output sink created"
        );

        Ok(Some(Box::new(CpalSink {
            _stream: stream,
            srcq,
            dstq,
            cells: cells.clone(),
            notifier_alive,
            stream_rate,
            poll_interval: self.config.poll_interval,
        })))
    }
}

struct CpalSink {
    _stream: cpal::Stream,
    srcq: Arc<SharedPcm>,
    dstq: Arc<SharedPcm>,
    cells: SinkCells,
    notifier_alive: Arc<AtomicBool>,
    stream_rate: u32,
    poll_interval: Duration,
}

impl OutputSink for CpalSink {
    fn write(&mut self, samples: &[f32]) -> bool {
        self.srcq.push_blocking(samples, &self.cells.stop)
    }

    fn head_frame_position(&self) -> u64 {
        self.cells.played_frames.load(Ordering::Relaxed)
    }

    fn sample_rate(&self) -> u32 {
        self.stream_rate
    }

    fn drain(&mut self) {
        self.srcq.close();
        self.dstq.wait_drained(&self.cells.stop);

        // The device still holds up to one hardware buffer; wait until the
        // head stops advancing, bounded by a handful of poll intervals.
        let mut prev = self.head_frame_position();
        for _ in 0..20 {
            if self.cells.stop.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(self.poll_interval);
            let cur = self.head_frame_position();
            if cur == prev {
                break;
            }
            prev = cur;
        }
    }

    fn release(self: Box<Self>) {
        // Drop handles the rest; cells are zeroed so position falls back to
        // the recorded seekbase.
        self.cells.sink_rate.store(0, Ordering::Relaxed);
        self.cells.played_frames.store(0, Ordering::Relaxed);
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.notifier_alive.store(false, Ordering::Relaxed);
        self.srcq.close();
        self.dstq.close();
    }
}

/// Frames per notification period, at least one.
fn period_frames(stream_rate: u32, notify_seconds: f32) -> u64 {
    let frames = (stream_rate as f64 * notify_seconds.max(0.0) as f64) as u64;
    frames.max(1)
}

/// Watch the played-frame counter and fire `on_period` each time it crosses
/// a period boundary. Runs until the sink is dropped or stop is raised.
fn spawn_notifier(
    cells: SinkCells,
    on_period: PeriodCallback,
    period_frames: u64,
    poll_interval: Duration,
) -> Arc<AtomicBool> {
    let alive = Arc::new(AtomicBool::new(true));
    let alive_thread = alive.clone();
    thread::spawn(move || {
        let mut last_mark = 0u64;
        while alive_thread.load(Ordering::Relaxed) && !cells.stop.load(Ordering::Relaxed) {
            let mark = cells.played_frames.load(Ordering::Relaxed) / period_frames;
            if mark > last_mark {
                last_mark = mark;
                on_period();
            }
            thread::sleep(poll_interval);
        }
    });
    alive
}

/// Build the CPAL output stream for the negotiated sample format.
fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    dstq: &Arc<SharedPcm>,
    cells: &SinkCells,
    refill_max_frames: usize,
) -> Result<cpal::Stream, EngineError> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, dstq, cells, refill_max_frames),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, dstq, cells, refill_max_frames),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, dstq, cells, refill_max_frames),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, dstq, cells, refill_max_frames),
        other => Err(EngineError::Device(format!(
            "unsupported sample format: {other:?}"
        ))),
    }
}

/// Local refill buffer for the device callback, so the callback drains the
/// queue in bursts instead of locking it per sample.
struct CallbackBuf {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    dstq: &Arc<SharedPcm>,
    cells: &SinkCells,
    refill_max_frames: usize,
) -> Result<cpal::Stream, EngineError>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let refill_max_frames = refill_max_frames.max(1);

    let state = Arc::new(Mutex::new(CallbackBuf {
        pos: 0,
        src_channels: dstq.channels(),
        src: Vec::new(),
    }));

    let dstq_cb = dstq.clone();
    let playing = cells.playing.clone();
    let played_frames = cells.played_frames.clone();
    let err_fn = |err| tracing::warn!("output stream error: {err}");

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                if !playing.load(Ordering::Relaxed) {
                    // Pause means pause: silence without draining the queue.
                    data.fill(<T as cpal::Sample>::from_sample::<f32>(0.0));
                    return;
                }

                let mut st = state.lock().unwrap();
                let frames = data.len() / channels_out;
                let mut filled = 0usize;

                for frame in 0..frames {
                    if st.pos >= st.src.len() {
                        st.pos = 0;
                        st.src.clear();
                        match dstq_cb.pop_now(refill_max_frames) {
                            Some(v) => st.src = v,
                            None => {
                                // Underrun; fill the rest with silence.
                                for idx in (frame * channels_out)..data.len() {
                                    data[idx] = <T as cpal::Sample>::from_sample::<f32>(0.0);
                                }
                                break;
                            }
                        }
                    }
                    for ch in 0..channels_out {
                        let sample = next_sample_mapped(&mut st, channels_out, ch);
                        data[frame * channels_out + ch] =
                            <T as cpal::Sample>::from_sample::<f32>(sample);
                    }
                    filled += 1;
                }

                if filled > 0 {
                    played_frames.fetch_add(filled as u64, Ordering::Relaxed);
                }
            },
            err_fn,
            None,
        )
        .map_err(EngineError::device)?;

    Ok(stream)
}

/// Read one output sample for `dst_ch`, applying basic channel mapping
/// (mono↔stereo, clamp otherwise). `st.pos` advances once per destination
/// frame, after the last channel.
fn next_sample_mapped(st: &mut CallbackBuf, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let get_src = |ch: usize, st: &CallbackBuf| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (st.src_channels, dst_channels) {
        (1, 1) => get_src(0, st),
        (2, 2) => get_src(dst_ch.min(1), st),
        (2, 1) => 0.5 * (get_src(0, st) + get_src(1, st)),
        (1, 2) => get_src(0, st),
        _ => get_src(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn period_frames_is_at_least_one() {
        assert_eq!(period_frames(48_000, 1.0), 48_000);
        assert_eq!(period_frames(48_000, 0.5), 24_000);
        assert_eq!(period_frames(0, 1.0), 1);
        assert_eq!(period_frames(48_000, 0.0), 1);
    }

    #[test]
    fn next_sample_mapped_duplicates_mono_to_stereo() {
        let mut st = CallbackBuf {
            pos: 0,
            src_channels: 1,
            src: vec![0.5, 0.7],
        };
        assert_eq!(next_sample_mapped(&mut st, 2, 0), 0.5);
        assert_eq!(next_sample_mapped(&mut st, 2, 1), 0.5);
        assert_eq!(next_sample_mapped(&mut st, 2, 0), 0.7);
    }

    #[test]
    fn next_sample_mapped_averages_stereo_to_mono() {
        let mut st = CallbackBuf {
            pos: 0,
            src_channels: 2,
            src: vec![0.2, 0.4],
        };
        let v = next_sample_mapped(&mut st, 1, 0);
        assert!((v - 0.3).abs() < 1e-6);
    }

    #[test]
    fn next_sample_mapped_is_silent_past_the_end() {
        let mut st = CallbackBuf {
            pos: 2,
            src_channels: 1,
            src: vec![0.5, 0.7],
        };
        assert_eq!(next_sample_mapped(&mut st, 1, 0), 0.0);
    }

    #[test]
    fn notifier_fires_on_period_crossings_and_stops() {
        let cells = SinkCells::new();
        let fired = Arc::new(AtomicU64::new(0));
        let fired_cb = fired.clone();
        let alive = spawn_notifier(
            cells.clone(),
            Arc::new(move || {
                fired_cb.fetch_add(1, Ordering::Relaxed);
            }),
            100,
            Duration::from_millis(1),
        );

        cells.played_frames.store(250, Ordering::Relaxed);
        let deadline = Instant::now() + Duration::from_secs(1);
        while fired.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(fired.load(Ordering::Relaxed) >= 1);

        alive.store(false, Ordering::Relaxed);
    }
}
