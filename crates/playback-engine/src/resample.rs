//! Streaming sample-rate conversion stage.
//!
//! When the output device cannot run at the decoder's native rate, the sink
//! splices this Rubato-based stage between its intake queue and the queue the
//! device callback drains. Runs in a background thread; closing the source
//! queue drains the tail and closes the output queue.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::queue::{SharedPcm, capacity_samples};

/// Start the resampler thread converting `srcq` (at `src_rate`) into a new
/// queue at `dst_rate`.
///
/// `cancel` bounds how long the stage blocks on a full output queue after a
/// stop request.
pub fn start_resampler(
    srcq: Arc<SharedPcm>,
    src_rate: u32,
    dst_rate: u32,
    chunk_frames: usize,
    buffer_seconds: f32,
    cancel: Arc<AtomicBool>,
) -> Arc<SharedPcm> {
    let channels = srcq.channels();
    let dstq = Arc::new(SharedPcm::new(
        channels,
        capacity_samples(dst_rate, channels, buffer_seconds),
    ));

    let f_ratio = dst_rate as f64 / src_rate as f64;
    let chunk_frames = chunk_frames.max(1);

    let sinc_len = 128;
    let window = WindowFunction::BlackmanHarris2;
    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff: calculate_cutoff(sinc_len, window),
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window,
    };

    let dstq_thread = dstq.clone();
    thread::spawn(move || {
        let mut resampler = match Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        ) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("resampler init error: {e:#}");
                dstq_thread.close();
                return;
            }
        };

        let out_headroom = (f_ratio.ceil() as usize).saturating_add(2).max(3);
        let mut out = vec![0.0f32; channels * chunk_frames * out_headroom];

        // Steady state: full chunks. Once the source closes, flush whatever
        // partial tail remains.
        while let Some(input) = srcq.pop_exact(chunk_frames) {
            if !resample_chunk(
                &mut resampler,
                &input,
                chunk_frames,
                None,
                channels,
                &mut out,
                &dstq_thread,
                &cancel,
            ) {
                dstq_thread.close();
                return;
            }
        }

        while let Some(tail) = srcq.pop_up_to(chunk_frames) {
            let tail_frames = tail.len() / channels;
            if tail_frames == 0 {
                continue;
            }
            if !resample_chunk(
                &mut resampler,
                &tail,
                chunk_frames,
                Some(tail_frames),
                channels,
                &mut out,
                &dstq_thread,
                &cancel,
            ) {
                break;
            }
        }

        dstq_thread.close();
    });

    dstq
}

/// Run one chunk through the resampler and push the produced samples.
///
/// Returns `false` when the stage should shut down (processing error or a
/// cancelled/closed output queue).
#[allow(clippy::too_many_arguments)]
fn resample_chunk(
    resampler: &mut Async<f32>,
    input: &[f32],
    chunk_frames: usize,
    partial_len: Option<usize>,
    channels: usize,
    out: &mut [f32],
    dstq: &Arc<SharedPcm>,
    cancel: &AtomicBool,
) -> bool {
    let input_frames = partial_len.unwrap_or(chunk_frames);
    let input_adapter = match InterleavedSlice::new(input, channels, input_frames) {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("interleaved input adapter error: {e:#}");
            return false;
        }
    };

    let out_capacity_frames = out.len() / channels;
    let mut output_adapter = match InterleavedSlice::new_mut(out, channels, out_capacity_frames) {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("interleaved output adapter error: {e:#}");
            return false;
        }
    };

    let indexing = Indexing {
        input_offset: 0,
        output_offset: 0,
        active_channels_mask: None,
        partial_len,
    };

    let (_consumed, produced_frames) =
        match resampler.process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing)) {
            Ok(x) => x,
            Err(e) => {
                tracing::error!("resampler process error: {e:#}");
                return false;
            }
        };

    let produced_samples = produced_frames * channels;
    if produced_samples == 0 {
        return true;
    }
    dstq.push_blocking(&out[..produced_samples], cancel)
}
