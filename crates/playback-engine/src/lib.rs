//! Audio playback engine for locally stored, compressed media.
//!
//! ## Pipeline
//! 1. **Decode**: Symphonia turns the file into interleaved `f32` batches.
//! 2. **Stretch**: SoundTouch applies the fixed playback-rate factor while
//!    preserving pitch.
//! 3. **Output**: a CPAL stream drains a bounded queue, with a Rubato
//!    resampler spliced in when the device cannot run at the source rate.
//!
//! One worker thread per [`PlaybackEngine`] drives all three stages; pause,
//! seek, stop, and position queries come from any thread through atomic
//! cells and take effect at loop-iteration boundaries.

pub mod config;
pub mod decode;
pub mod device;
pub mod engine;
pub mod error;
pub mod queue;
pub mod resample;
pub mod sink;
pub mod stretch;

pub use config::EngineConfig;
pub use decode::{DecoderRegistry, ReadOutcome, probe_duration};
pub use engine::{EngineCallbacks, EndReason, PlaybackEngine, PlaybackState};
pub use error::EngineError;
