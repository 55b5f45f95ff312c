//! Decoder contract and the Symphonia-backed implementation.
//!
//! The engine pulls interleaved `f32` batches from a [`MediaDecoder`]. The
//! two "no data" conditions are distinct outcomes: a transient underrun
//! ([`ReadOutcome::NeedMoreData`], retry after a short delay) is never the
//! same thing as exhaustion ([`ReadOutcome::EndOfStream`], stop).
//!
//! Concrete decoders are chosen through a [`DecoderRegistry`] of providers,
//! so new formats register without touching the engine.

use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::error::EngineError;

/// Result of one read from a decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` frames were decoded into the caller's buffer.
    Frames(usize),
    /// Not enough source data is buffered yet; retry after a short delay.
    NeedMoreData,
    /// No further frames will ever be available.
    EndOfStream,
}

/// One open compressed-audio session, owned by a single engine.
pub trait MediaDecoder: Send {
    /// Native sample rate in Hz. `0` while a streaming source has not yet
    /// revealed its true rate.
    fn sample_rate(&self) -> u32;

    fn channel_count(&self) -> usize;

    /// Total duration in milliseconds, when the container reports one.
    fn duration_ms(&self) -> Option<u64>;

    /// Reposition the read cursor to (or nearest to) `seconds`.
    fn seek(&mut self, seconds: f64) -> Result<(), EngineError>;

    /// Decode the next batch of interleaved `f32` frames into `out`.
    ///
    /// `out` is cleared and refilled; its length after a `Frames(n)` return
    /// is `n * channel_count()`.
    fn read_frames(&mut self, out: &mut Vec<f32>) -> Result<ReadOutcome, EngineError>;
}

/// A decoder capability that can claim and open media paths.
pub trait DecoderProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_decode(&self, path: &Path) -> bool;
    fn open(&self, path: &Path) -> Result<Box<dyn MediaDecoder>, EngineError>;
}

/// Ordered set of decoder providers. The first provider claiming a path
/// opens it; an unclaimed path is an [`EngineError::UnsupportedFormat`].
pub struct DecoderRegistry {
    providers: Vec<Box<dyn DecoderProvider>>,
}

impl DecoderRegistry {
    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Registry with the built-in Symphonia provider.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(SymphoniaProvider::default()));
        registry
    }

    pub fn register(&mut self, provider: Box<dyn DecoderProvider>) {
        self.providers.push(provider);
    }

    pub fn open(&self, path: &Path) -> Result<Box<dyn MediaDecoder>, EngineError> {
        for provider in &self.providers {
            if provider.can_decode(path) {
                tracing::debug!(provider = provider.name(), path = ?path, "decoder selected");
                return provider.open(path);
            }
        }
        Err(EngineError::UnsupportedFormat {
            path: path.to_path_buf(),
        })
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// One-shot duration probe: opens a transient decoder session solely to read
/// its reported duration, then closes it. Unrelated to any active playback.
pub fn probe_duration(path: impl AsRef<Path>) -> Result<Option<u64>, EngineError> {
    let decoder = DecoderRegistry::with_defaults().open(path.as_ref())?;
    Ok(decoder.duration_ms())
}

/// Symphonia-backed provider claiming paths by extension.
pub struct SymphoniaProvider {
    extensions: &'static [&'static str],
}

impl Default for SymphoniaProvider {
    fn default() -> Self {
        Self {
            extensions: &["mp3", "ogg", "oga", "flac", "wav", "aiff", "aif", "aac"],
        }
    }
}

impl DecoderProvider for SymphoniaProvider {
    fn name(&self) -> &'static str {
        "symphonia"
    }

    fn can_decode(&self, path: &Path) -> bool {
        extension_of(path)
            .map(|ext| self.extensions.contains(&ext.as_str()))
            .unwrap_or(false)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn MediaDecoder>, EngineError> {
        Ok(Box::new(SymphoniaDecoder::open(path)?))
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Pull-based Symphonia decode session over one local file.
pub struct SymphoniaDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
    duration_ms: Option<u64>,
}

impl SymphoniaDecoder {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let file = File::open(path)?;

        let mut hint = Hint::new();
        if let Some(ext) = extension_of(path) {
            hint.with_extension(&ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;

        let format = probed.format;
        let track = format
            .default_track()
            .ok_or(SymphoniaError::Unsupported("no default audio track"))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let sample_rate = codec_params.sample_rate.unwrap_or(0);
        let channels = codec_params
            .channels
            .map(|c| c.count())
            .ok_or(SymphoniaError::Unsupported("unknown channel layout"))?;
        let duration_ms = duration_ms_from_codec_params(&codec_params);

        let decoder =
            symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            duration_ms,
        })
    }
}

impl MediaDecoder for SymphoniaDecoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channel_count(&self) -> usize {
        self.channels
    }

    fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    fn seek(&mut self, seconds: f64) -> Result<(), EngineError> {
        let seconds = seconds.max(0.0);
        let time = Time::new(seconds as u64, seconds.fract());
        self.format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(self.track_id),
            },
        )?;
        self.decoder.reset();
        Ok(())
    }

    fn read_frames(&mut self, out: &mut Vec<f32>) -> Result<ReadOutcome, EngineError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(ReadOutcome::EndOfStream);
                }
                Err(SymphoniaError::IoError(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) =>
                {
                    return Ok(ReadOutcome::NeedMoreData);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(ReadOutcome::EndOfStream),
                Err(e) => return Err(e.into()),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    if decoded.frames() == 0 {
                        continue;
                    }
                    let mut sample_buf =
                        SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
                    sample_buf.copy_interleaved_ref(decoded);
                    out.clear();
                    out.extend_from_slice(sample_buf.samples());
                    return Ok(ReadOutcome::Frames(out.len() / self.channels));
                }
                // Malformed packet; skip it and keep decoding.
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!("skipping undecodable packet: {e}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Best-effort duration in milliseconds from codec metadata.
fn duration_ms_from_codec_params(params: &CodecParameters) -> Option<u64> {
    let frames = params.n_frames?;
    let rate = params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn duration_ms_computes_from_frames_and_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(48_000);
        params.n_frames = Some(96_000);
        assert_eq!(duration_ms_from_codec_params(&params), Some(2000));
    }

    #[test]
    fn duration_ms_handles_missing_and_zero_rate() {
        let mut params = CodecParameters::new();
        params.n_frames = Some(100);
        assert!(duration_ms_from_codec_params(&params).is_none());
        params.sample_rate = Some(0);
        assert!(duration_ms_from_codec_params(&params).is_none());
    }

    #[test]
    fn provider_claims_known_extensions_case_insensitively() {
        let provider = SymphoniaProvider::default();
        assert!(provider.can_decode(Path::new("episode.mp3")));
        assert!(provider.can_decode(Path::new("episode.OGG")));
        assert!(provider.can_decode(Path::new("episode.oga")));
        assert!(!provider.can_decode(Path::new("episode.xyz")));
        assert!(!provider.can_decode(Path::new("no_extension")));
    }

    #[test]
    fn registry_rejects_unclaimed_paths_with_unsupported_format() {
        let registry = DecoderRegistry::with_defaults();
        let err = registry.open(Path::new("episode.xyz")).err().unwrap();
        assert!(err.is_unsupported_format());
    }

    #[test]
    fn empty_registry_claims_nothing() {
        let registry = DecoderRegistry::empty();
        let err = registry.open(Path::new("episode.mp3")).err().unwrap();
        assert!(err.is_unsupported_format());
    }

    #[test]
    fn probe_duration_propagates_unsupported_format() {
        let err = probe_duration(PathBuf::from("episode.xyz")).unwrap_err();
        assert!(err.is_unsupported_format());
    }

    #[test]
    fn read_outcomes_are_distinct() {
        assert_ne!(ReadOutcome::NeedMoreData, ReadOutcome::EndOfStream);
        assert_ne!(ReadOutcome::Frames(0), ReadOutcome::NeedMoreData);
    }
}
