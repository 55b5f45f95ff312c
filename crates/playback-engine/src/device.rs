//! Output device and stream-config selection.
//!
//! Thin wrappers around CPAL: pick a device by optional substring, choose a
//! supported config close to the source rate, and prefer a fixed buffer size
//! when the device advertises one.

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::EngineError;

/// Pick an output device by case-insensitive substring, or the host default.
pub fn select_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device, EngineError> {
    let mut devices: Vec<cpal::Device> = host
        .output_devices()
        .map_err(EngineError::device)?
        .collect();

    if let Some(needle) = needle {
        if let Some(d) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| name_matches(&n.name(), needle))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(EngineError::Device(format!(
            "no output device matched: {needle}"
        )));
    }

    host.default_output_device()
        .ok_or_else(|| EngineError::Device("no default output device".into()))
}

/// Choose the best supported output config for a target sample rate.
///
/// Prefers rates at or below the target (highest first), then sample format
/// quality; falls back to the lowest rate above the target.
pub fn select_output_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig, EngineError> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .map_err(EngineError::device)?
        .collect();
    if ranges.is_empty() {
        return Err(EngineError::Device("no supported output configs".into()));
    }

    let mut best: Option<(bool, u32, u8, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = clamp_rate(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let below = rate <= target_rate;
        let rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_below, b_rate, b_rank, _)) => {
                candidate_beats(below, rate, rank, *b_below, *b_rate, *b_rank)
            }
        };
        if replace {
            best = Some((below, rate, rank, range.with_sample_rate(rate)));
        }
    }

    Ok(best.expect("ranges checked non-empty").3)
}

/// Prefer a fixed stream buffer size when the device reports a range.
///
/// Returns `None` when only the default buffer size is supported.
pub fn select_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    const MAX_FRAMES: u32 = 16_384;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            let chosen = if *max > MAX_FRAMES {
                if *min > MAX_FRAMES { *min } else { MAX_FRAMES }
            } else {
                *max
            };
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Log the host's output devices (CLI `--list-devices`).
pub fn list_devices(host: &cpal::Host) -> Result<(), EngineError> {
    let devices = host.output_devices().map_err(EngineError::device)?;
    for (i, d) in devices.enumerate() {
        println!("#{i}: {}", d.description().map_err(EngineError::device)?);
    }
    Ok(())
}

fn clamp_rate(min: u32, max: u32, target: u32) -> u32 {
    if target >= min && target <= max {
        target
    } else if target < min {
        min
    } else {
        max
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn candidate_beats(
    below: bool,
    rate: u32,
    rank: u8,
    best_below: bool,
    best_rate: u32,
    best_rank: u8,
) -> bool {
    if below != best_below {
        below && !best_below
    } else if rate != best_rate {
        if below { rate > best_rate } else { rate < best_rate }
    } else {
        rank < best_rank
    }
}

fn name_matches(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_rate_prefers_target_when_in_range() {
        assert_eq!(clamp_rate(44_100, 96_000, 48_000), 48_000);
    }

    #[test]
    fn clamp_rate_clamps_outside_the_range() {
        assert_eq!(clamp_rate(44_100, 96_000, 22_050), 44_100);
        assert_eq!(clamp_rate(44_100, 96_000, 192_000), 96_000);
    }

    #[test]
    fn candidate_beats_prefers_at_or_below_target() {
        assert!(candidate_beats(true, 44_100, 1, false, 48_000, 1));
        assert!(!candidate_beats(false, 96_000, 0, true, 44_100, 2));
    }

    #[test]
    fn candidate_beats_prefers_higher_rate_below_target() {
        assert!(candidate_beats(true, 48_000, 2, true, 44_100, 2));
    }

    #[test]
    fn candidate_beats_prefers_lower_rate_above_target() {
        assert!(candidate_beats(false, 48_000, 2, false, 96_000, 2));
    }

    #[test]
    fn candidate_beats_breaks_ties_on_sample_format() {
        assert!(candidate_beats(true, 48_000, 0, true, 48_000, 2));
    }

    #[test]
    fn name_matches_is_case_insensitive_and_rejects_empty() {
        assert!(name_matches("USB DAC", "dac"));
        assert!(name_matches("usb dac", "USB"));
        assert!(!name_matches("USB DAC", "speaker"));
        assert!(!name_matches("USB DAC", ""));
    }
}
