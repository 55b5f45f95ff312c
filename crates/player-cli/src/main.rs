//! Player CLI — plays a local audio file through the playback engine with a
//! pitch-preserving rate control.
//!
//! Transport is driven from the terminal's signal handler (Ctrl-C stops
//! playback gracefully); position pulses are logged about once per second of
//! played audio.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use playback_engine::{EndReason, EngineCallbacks, EngineConfig, PlaybackEngine, probe_duration};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Play a local audio file at an adjustable speed without pitch shift")]
struct Args {
    /// Path to the audio file
    path: Option<PathBuf>,

    /// Playback rate factor (1.0 = normal speed; pitch is preserved)
    #[arg(long, default_value_t = 1.0)]
    rate: f64,

    /// Start position in seconds
    #[arg(long, default_value_t = 0.0)]
    start_at: f64,

    /// Use a specific output device by substring match
    #[arg(long)]
    device: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the file duration and exit without playing
    #[arg(long)]
    probe: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.list_devices {
        let host = cpal::default_host();
        playback_engine::device::list_devices(&host)?;
        return Ok(());
    }

    let path = args.path.context("missing audio file path")?;

    if args.probe {
        match probe_duration(&path)? {
            Some(ms) => println!("{:.1}", ms as f64 / 1000.0),
            None => println!("unknown"),
        }
        return Ok(());
    }

    if !(args.rate.is_finite() && args.rate > 0.0) {
        bail!("--rate must be a positive number");
    }

    let config = EngineConfig {
        device_name: args.device.clone(),
        ..EngineConfig::default()
    };

    let duration_hint = probe_duration(&path).ok().flatten();
    let callbacks = EngineCallbacks {
        on_pulse: Some(Arc::new(move |pos: f64| match duration_hint {
            Some(ms) => tracing::info!("position {pos:.1}s / {:.1}s", ms as f64 / 1000.0),
            None => tracing::info!("position {pos:.1}s"),
        })),
        on_completion: Some(Box::new(|| tracing::info!("playback complete"))),
    };

    let engine = Arc::new(
        PlaybackEngine::start_with_config(&path, args.rate, config, callbacks)
            .with_context(|| format!("open {}", path.display()))?,
    );
    tracing::info!(path = %path.display(), rate = args.rate, "playing");

    if args.start_at > 0.0 {
        engine.seek_to(args.start_at);
    }

    let engine_for_signal = engine.clone();
    let _ = ctrlc::set_handler(move || {
        tracing::info!("stop requested");
        engine_for_signal.stop();
    });

    engine.join();

    match engine.end_reason() {
        Some(EndReason::Error) => bail!("playback ended with an error"),
        _ => Ok(())
    }
}
