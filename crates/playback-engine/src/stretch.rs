//! Time-stretch contract and the SoundTouch-backed implementation.
//!
//! The stretcher changes playback tempo by a fixed factor while preserving
//! perceived pitch: feeding it `d` seconds of audio yields roughly `d / rate`
//! seconds of output at the same sample rate.

use soundtouch::SoundTouch;

/// Tempo-changing processor over interleaved `f32` samples.
///
/// Implementations may buffer internally. A call with an empty `input`
/// drains pending output without feeding new data; callers loop on that
/// until `0` is returned.
pub trait TimeStretcher: Send {
    /// Feed `input` (interleaved, whole frames) and write processed samples
    /// into `output`. Returns the number of interleaved samples written,
    /// never more than `output.len()`.
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> usize;

    /// Drop any buffered audio. Used when the read cursor jumps (seek).
    fn reset(&mut self);

    /// Signal end of input so the buffered tail can be drained with
    /// subsequent empty-input `process` calls.
    fn finish(&mut self);
}

/// SoundTouch processor with a fixed tempo factor.
pub struct SoundTouchStretcher {
    st: SoundTouch,
    channels: usize,
}

impl SoundTouchStretcher {
    /// `rate` is the playback-rate factor (tempo); must be positive.
    pub fn new(sample_rate: u32, channels: usize, rate: f64) -> Self {
        let mut st = SoundTouch::new();
        st.set_sample_rate(sample_rate);
        st.set_channels(channels as u32);
        st.set_tempo(rate);
        Self { st, channels }
    }
}

impl TimeStretcher for SoundTouchStretcher {
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> usize {
        if !input.is_empty() {
            self.st.put_samples(input, input.len() / self.channels);
        }
        let max_frames = output.len() / self.channels;
        let received = self.st.receive_samples(output, max_frames);
        received * self.channels
    }

    fn reset(&mut self) {
        self.st.clear();
    }

    fn finish(&mut self) {
        self.st.flush();
    }
}
