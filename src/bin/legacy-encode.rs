use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{ArgAction, Parser, ValueEnum};
use hw_jpeg::BackendKind;
use hw_jpeg::driver::{self, EncodeOptions, ResolutionChange, SyncPolicy};
use tracing_subscriber::EnvFilter;

const EXIT_USAGE: u8 = 1;
const EXIT_FAILURE: u8 = 255;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Auto,
    Sw,
    Hw,
}

impl From<BackendArg> for BackendKind {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Auto => BackendKind::Auto,
            BackendArg::Sw => BackendKind::Software,
            BackendArg::Hw => BackendKind::Hardware,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    about = "Encode raw NV12 frames into numbered JPEG files",
    disable_help_flag = true
)]
struct Args {
    /// Raw NV12 input file.
    #[arg(short = 'i')]
    input: PathBuf,
    #[arg(short = 'w', value_parser = clap::value_parser!(u16).range(1..))]
    width: u16,
    #[arg(short = 'h', value_parser = clap::value_parser!(u16).range(1..))]
    height: u16,
    #[arg(short = 'f', default_value_t = driver::DEFAULT_FRAME_RATE, value_parser = clap::value_parser!(u32).range(1..))]
    fps: u32,
    #[arg(short = 'q', default_value_t = driver::DEFAULT_QUALITY)]
    quality: u16,
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = BackendArg::Auto)]
    backend: BackendArg,
    /// Stop after this many written frames (0 = until the input ends).
    #[arg(long, default_value_t = driver::DEFAULT_MAX_FRAMES)]
    max_frames: u32,
    /// Reset to `--reset-size` after this many written frames.
    #[arg(long, requires = "reset_size", value_parser = clap::value_parser!(u32).range(1..))]
    reset_after: Option<u32>,
    #[arg(long, value_parser = parse_size, requires = "reset_after")]
    reset_size: Option<(u16, u16)>,
    /// Continue reading from this file after the reset.
    #[arg(long, requires = "reset_after")]
    reset_input: Option<PathBuf>,
    #[arg(long, default_value_t = hw_jpeg::DEFAULT_BITSTREAM_CAPACITY)]
    bitstream_size: usize,
    #[arg(long, default_value_t = 100)]
    sync_wait_ms: u64,
    #[arg(long, default_value_t = 50)]
    sync_max_attempts: u32,
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

fn parse_size(value: &str) -> Result<(u16, u16), String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {value}"))?;
    let parse = |part: &str| match part.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid dimension {part:?} in {value}")),
        Ok(dim) => Ok(dim),
    };
    Ok((parse(width)?, parse(height)?))
}

impl Args {
    fn into_options(self) -> EncodeOptions {
        let mut options = EncodeOptions::new(self.input, self.width, self.height);
        options.frame_rate = self.fps;
        options.quality = self.quality;
        options.output_dir = self.output_dir;
        options.backend = self.backend.into();
        options.bitstream_capacity = self.bitstream_size;
        options.max_frames = (self.max_frames != 0).then_some(self.max_frames);
        options.resolution_change = self
            .reset_after
            .zip(self.reset_size)
            .map(|(after_frames, (width, height))| ResolutionChange {
                after_frames,
                width,
                height,
                input: self.reset_input,
            });
        options.sync = SyncPolicy {
            wait: Duration::from_millis(self.sync_wait_ms),
            max_attempts: self.sync_max_attempts,
        };
        options
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hw_jpeg={level},legacy_encode={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(options: &EncodeOptions) -> Result<u32> {
    tracing::info!(%options, "starting encode");
    let summary = driver::run(options)
        .with_context(|| format!("encoding {} failed", options.input.display()))?;
    Ok(summary.frames_written)
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(EXIT_USAGE),
            };
        }
    };
    init_tracing(args.verbose);

    match run(&args.into_options()) {
        Ok(frames) => {
            println!("Encoded {frames} frames");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
