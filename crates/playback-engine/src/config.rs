use std::time::Duration;

/// Tuning parameters shared by the decode/stretch/output stages.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Decoder batch size in frames per loop iteration.
    pub chunk_frames: usize,
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
    /// Target buffer duration for sink queue sizing.
    pub buffer_seconds: f32,
    /// Bounded sleep used while waiting for the device, a paused state,
    /// or a decoder underrun. Also the wait quantum for cancellable writes.
    pub poll_interval: Duration,
    /// Periodic position pulse interval, in seconds of played audio.
    pub notify_seconds: f32,
    /// Output device selector (case-insensitive substring). `None` picks
    /// the host default.
    pub device_name: Option<String>,
}

impl Default for EngineConfig {
    /// Defaults tuned for low-risk playback across common devices.
    fn default() -> Self {
        Self {
            chunk_frames: 1024,
            refill_max_frames: 4096,
            buffer_seconds: 2.0,
            poll_interval: Duration::from_millis(50),
            notify_seconds: 1.0,
            device_name: None,
        }
    }
}
