//! # aviplay
//!
//! Plays one AVI file in a window (or headless) and exits.

mod headless;
mod surface;
mod window;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing_subscriber::EnvFilter;

use aviplay_core::{play_file, AudioOutput, PlaybackConfig, PlaybackExit, SetupError, SyncStats};

use headless::{DumpSettings, HeadlessDisplay};

pub type SessionOutcome = Result<(PlaybackExit, Option<SyncStats>), SetupError>;

/// Builds the output device on the thread that will own it
pub type AudioFactory = fn() -> Option<Box<dyn AudioOutput>>;

// ============================================================================
// Arguments
// ============================================================================

#[derive(Debug, Default, PartialEq)]
struct Options {
    input: Option<PathBuf>,
    config: Option<PathBuf>,
    no_audio: bool,
    no_skip: bool,
    headless: bool,
    probe: bool,
    dump: Option<PathBuf>,
    dump_every: u64,
    debug: bool,
    help: bool,
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut options = Options {
        dump_every: 1,
        ..Default::default()
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                let value = args.get(i + 1).context("Missing value for --config")?;
                options.config = Some(PathBuf::from(value));
                i += 1;
            }
            "--dump" => {
                let value = args.get(i + 1).context("Missing value for --dump")?;
                options.dump = Some(PathBuf::from(value));
                i += 1;
            }
            "--dump-every" => {
                let value = args.get(i + 1).context("Missing value for --dump-every")?;
                options.dump_every = value
                    .parse::<u64>()
                    .ok()
                    .filter(|n| *n > 0)
                    .with_context(|| format!("Invalid frame interval {}", value))?;
                i += 1;
            }
            "--no-audio" => options.no_audio = true,
            "--no-skip" => options.no_skip = true,
            "--headless" => options.headless = true,
            "--probe" => options.probe = true,
            "--debug" => options.debug = true,
            "--help" | "-h" => options.help = true,
            other if other.starts_with('-') => anyhow::bail!("Unknown option {}", other),
            other => {
                if options.input.is_some() {
                    anyhow::bail!("Only one input file is supported (got {})", other);
                }
                options.input = Some(PathBuf::from(other));
            }
        }
        i += 1;
    }

    // Dumping only makes sense without a window
    if options.dump.is_some() {
        options.headless = true;
    }
    Ok(options)
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  aviplay [options] <file.avi>\n\n\
         Options:\n  \
         --config <path>    JSON playback settings\n  \
         --no-audio         Play video only\n  \
         --no-skip          Ignore confirm keys and mouse clicks\n  \
         --headless         No window; Enter skips, Ctrl-C quits\n  \
         --dump <dir>       Write frames as PNG (implies --headless)\n  \
         --dump-every <n>   Only every n-th frame (default 1)\n  \
         --probe            Print stream info as JSON and exit\n  \
         --debug            Verbose logging\n"
    );
}

fn playback_config(options: &Options) -> Result<PlaybackConfig> {
    let mut config = match &options.config {
        Some(path) => PlaybackConfig::load(path).with_context(|| format!("Loading {}", path.display()))?,
        None => PlaybackConfig::default(),
    };
    if options.no_audio {
        config.audio = false;
    }
    if options.no_skip {
        config.skippable = false;
    }
    Ok(config)
}

// ============================================================================
// Audio Device
// ============================================================================

#[cfg(feature = "audio")]
fn default_audio() -> Option<Box<dyn AudioOutput>> {
    Some(Box::new(aviplay_core::CpalOutput::new()))
}

#[cfg(not(feature = "audio"))]
fn default_audio() -> Option<Box<dyn AudioOutput>> {
    tracing::info!("Built without the audio feature; playing video only");
    None
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args).inspect_err(|_| print_usage())?;
    if options.help {
        print_usage();
        return Ok(());
    }

    let default_filter = if options.debug { "aviplay=debug,aviplay_core=debug" } else { "aviplay=info,aviplay_core=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let input = options.input.clone().context("No input file given")?;

    if options.probe {
        let info = aviplay_core::probe(&input).with_context(|| format!("Probing {}", input.display()))?;
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let config = playback_config(&options)?;
    tracing::info!("aviplay v{}: {}", env!("CARGO_PKG_VERSION"), input.display());

    let outcome = if options.headless {
        run_headless(input.clone(), config, &options)?
    } else {
        window::run_window(input.clone(), config, default_audio)?
    };

    let (exit, stats) = outcome.with_context(|| format!("Playing {}", input.display()))?;
    match stats {
        Some(stats) => tracing::info!(
            "Playback {:?}: {} frames decoded, {} shown, {} discarded, {} stalls",
            exit,
            stats.pulled,
            stats.displayed_fresh + stats.displayed_cached,
            stats.discarded,
            stats.stalls
        ),
        None => tracing::info!("Playback {:?}", exit),
    }
    Ok(())
}

fn run_headless(input: PathBuf, config: PlaybackConfig, options: &Options) -> Result<SessionOutcome> {
    let dump = options.dump.clone().map(|dir| DumpSettings {
        dir,
        every: options.dump_every,
    });
    let display = HeadlessDisplay::new(dump);
    let blits = display.counter();
    let mut events = headless::terminal_events()?;

    let audio = if config.audio { default_audio() } else { None };
    let outcome = play_file(&input, config, Box::new(display), audio, &mut events);

    tracing::debug!("Headless surface received {} blits", blits.load(Ordering::Relaxed));
    Ok(outcome)
}
