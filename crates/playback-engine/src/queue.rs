//! Bounded thread-safe queue for interleaved PCM samples.
//!
//! [`SharedPcm`] is the hand-off between the engine worker, the optional
//! resampler stage, and the output callback:
//! - worker → queue (blocking push, backpressure paces the loop)
//! - resampler thread → queue
//! - device callback drains the queue (non-blocking)
//!
//! A single condvar signals all state changes; the `done` flag lives under
//! the same mutex as the buffer so close/drain cannot race.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Wait quantum for blocking operations that also watch a cancel flag.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Bounded queue of interleaved `f32` samples with a fixed channel count.
///
/// Samples are stored interleaved:
/// `frame0[ch0], frame0[ch1], ..., frame1[ch0], ...`
pub struct SharedPcm {
    channels: usize,
    max_samples: usize,
    inner: Mutex<Inner>,
    cv: Condvar,
}

struct Inner {
    buf: VecDeque<f32>,
    done: bool,
}

/// Queue capacity in samples for `seconds` of audio at `rate_hz`.
///
/// Non-finite or non-positive durations fall back to two seconds.
pub fn capacity_samples(rate_hz: u32, channels: usize, seconds: f32) -> usize {
    let secs = if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        2.0
    };
    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl SharedPcm {
    pub fn new(channels: usize, max_samples: usize) -> Self {
        Self {
            channels: channels.max(1),
            max_samples: max_samples.max(channels.max(1)),
            inner: Mutex::new(Inner {
                buf: VecDeque::new(),
                done: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Best-effort snapshot of buffered frames.
    pub fn len_frames(&self) -> usize {
        let g = self.inner.lock().unwrap();
        g.buf.len() / self.channels
    }

    /// Whether the producer has closed the queue. Buffered samples remain
    /// poppable after close.
    pub fn is_done(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    /// Mark the queue finished and wake all waiters. Idempotent.
    pub fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.done = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Push interleaved samples, blocking while the queue is full.
    ///
    /// Returns `false` when the push was abandoned because the queue was
    /// closed or `cancel` was raised; remaining samples are dropped. The
    /// cancel flag is re-checked on a bounded wait quantum so a raised flag
    /// unblocks the caller within tens of milliseconds.
    pub fn push_blocking(&self, samples: &[f32], cancel: &AtomicBool) -> bool {
        let mut offset = 0;

        while offset < samples.len() {
            let mut g = self.inner.lock().unwrap();

            while g.buf.len() >= self.max_samples && !g.done {
                if cancel.load(Ordering::Relaxed) {
                    return false;
                }
                let (ng, _) = self.cv.wait_timeout(g, CANCEL_POLL).unwrap();
                g = ng;
            }
            if g.done || cancel.load(Ordering::Relaxed) {
                return false;
            }

            while offset < samples.len() && g.buf.len() < self.max_samples {
                g.buf.push_back(samples[offset]);
                offset += 1;
            }

            drop(g);
            self.cv.notify_all();
        }

        true
    }

    /// Pop up to `max_frames` whole frames without blocking.
    ///
    /// Returns `None` when no complete frame is buffered.
    pub fn pop_now(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.inner.lock().unwrap();
        let take = (g.buf.len() / self.channels).min(max_frames) * self.channels;
        if take == 0 {
            return None;
        }
        let out = drain_samples(&mut g, take);
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Block until exactly `frames` frames are available and pop them.
    ///
    /// Returns `None` if the queue closes before enough data arrives.
    pub fn pop_exact(&self, frames: usize) -> Option<Vec<f32>> {
        let want = frames * self.channels;
        let mut g = self.inner.lock().unwrap();
        while g.buf.len() < want && !g.done {
            g = self.cv.wait(g).unwrap();
        }
        if g.buf.len() < want {
            return None;
        }
        let out = drain_samples(&mut g, want);
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Block until at least one frame is available, then pop up to
    /// `max_frames`. Returns `None` once the queue is closed and empty.
    pub fn pop_up_to(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.inner.lock().unwrap();
        while g.buf.is_empty() && !g.done {
            g = self.cv.wait(g).unwrap();
        }
        if g.buf.is_empty() {
            return None;
        }
        let take = (g.buf.len() / self.channels).min(max_frames) * self.channels;
        if take == 0 {
            // Closed with a partial trailing frame; drop it.
            g.buf.clear();
            return None;
        }
        let out = drain_samples(&mut g, take);
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Block until the queue is closed and fully drained, or `cancel` is
    /// raised. Returns `true` on a normal drain.
    pub fn wait_drained(&self, cancel: &AtomicBool) -> bool {
        let mut g = self.inner.lock().unwrap();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return false;
            }
            if g.done && g.buf.is_empty() {
                return true;
            }
            let (ng, _) = self.cv.wait_timeout(g, CANCEL_POLL).unwrap();
            g = ng;
        }
    }
}

fn drain_samples(g: &mut Inner, count: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(g.buf.pop_front().unwrap_or(0.0));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn capacity_samples_falls_back_for_bad_durations() {
        assert_eq!(capacity_samples(48_000, 2, 2.0), 192_000);
        assert_eq!(capacity_samples(48_000, 2, -1.0), 192_000);
        assert_eq!(capacity_samples(48_000, 2, f32::NAN), 192_000);
    }

    #[test]
    fn pop_now_empty_returns_none() {
        let q = SharedPcm::new(2, 16);
        assert!(q.pop_now(4).is_none());
    }

    #[test]
    fn pop_now_returns_whole_frames_only() {
        let q = SharedPcm::new(2, 64);
        let cancel = AtomicBool::new(false);
        assert!(q.push_blocking(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &cancel));

        let out = q.pop_now(2).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(q.len_frames(), 1);
    }

    #[test]
    fn pop_exact_waits_for_enough_data() {
        let q = Arc::new(SharedPcm::new(2, 64));
        let q_pop = q.clone();

        let handle = thread::spawn(move || {
            let out = q_pop.pop_exact(3).unwrap();
            assert_eq!(out.len(), 6);
        });

        let cancel = AtomicBool::new(false);
        q.push_blocking(&[0.1, 0.2, 0.3, 0.4], &cancel);
        q.push_blocking(&[0.5, 0.6], &cancel);
        handle.join().unwrap();
    }

    #[test]
    fn pop_exact_returns_none_when_closed_short() {
        let q = SharedPcm::new(2, 64);
        q.close();
        assert!(q.pop_exact(1).is_none());
    }

    #[test]
    fn pop_up_to_drains_tail_then_none_after_close() {
        let q = Arc::new(SharedPcm::new(2, 64));
        let q_pop = q.clone();

        let handle = thread::spawn(move || {
            let out = q_pop.pop_up_to(8).unwrap();
            assert_eq!(out.len(), 4);
            assert!(q_pop.pop_up_to(8).is_none());
        });

        let cancel = AtomicBool::new(false);
        q.push_blocking(&[1.0, 2.0, 3.0, 4.0], &cancel);
        q.close();
        handle.join().unwrap();
    }

    #[test]
    fn push_blocking_returns_false_on_cancel() {
        let q = SharedPcm::new(1, 4);
        let cancel = AtomicBool::new(false);
        assert!(q.push_blocking(&[1.0, 2.0, 3.0, 4.0], &cancel));

        // Queue is full; a raised cancel flag must unblock the push.
        cancel.store(true, Ordering::Relaxed);
        assert!(!q.push_blocking(&[5.0], &cancel));
    }

    #[test]
    fn push_blocking_returns_false_after_close() {
        let q = SharedPcm::new(1, 4);
        q.close();
        let cancel = AtomicBool::new(false);
        assert!(!q.push_blocking(&[1.0], &cancel));
    }

    #[test]
    fn wait_drained_returns_true_when_closed_and_empty() {
        let q = SharedPcm::new(2, 64);
        q.close();
        let cancel = AtomicBool::new(false);
        assert!(q.wait_drained(&cancel));
    }

    #[test]
    fn wait_drained_respects_cancel() {
        let q = SharedPcm::new(2, 64);
        let cancel = AtomicBool::new(true);
        assert!(!q.wait_drained(&cancel));
    }
}
