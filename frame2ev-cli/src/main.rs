//! Event camera simulator CLI.
//!
//! Converts decoded videos (directories of frame images) into event streams,
//! replays them as a live capture, and converts between export formats.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use frame2ev_core::batch::{BatchOptions, BatchProcessor, DEFAULT_PROGRESS_INTERVAL};
use frame2ev_core::output;
use frame2ev_core::pipeline::{
    AcquisitionPipeline, DisplayUpdate, PipelineOptions, SharedConfig, DEFAULT_RESERVOIR_CAPACITY,
};
use frame2ev_core::sink::ImageSequenceSink;
use frame2ev_core::source::{FrameSource, ImageSequenceSource, SyntheticSource, DEFAULT_FRAME_RATE};
use frame2ev_core::{Background, Event, EventConfig, EventGenerator, Resolution};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Event camera simulator.
///
/// Turns ordinary video frames into the (x, y, timestamp, polarity) events a
/// dynamic vision sensor would report.
#[derive(Parser, Debug)]
#[command(name = "frame2ev")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Suppress progress output (logs default to warnings only)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a stored video into events and a rendered event video
    Batch(BatchArgs),
    /// Replay a video (or a synthetic scene) as a live camera
    Live(LiveArgs),
    /// Convert an event file between .csv and .npz
    Convert(ConvertArgs),
}

/// Engine parameters shared by the batch and live commands.
#[derive(Args, Debug)]
struct EngineArgs {
    /// Minimum absolute intensity change (exclusive) that produces an event
    #[arg(
        short,
        long,
        default_value_t = 15,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    threshold: u32,

    /// Decay parameter (currently has no effect on generation)
    #[arg(short, long, default_value_t = 10, allow_negative_numbers = true)]
    decay: i32,

    /// Event image background: white, black, gray, or "r,g,b"
    #[arg(short, long, default_value = "white")]
    background: Background,

    /// Do not emit positive (brightening) events
    #[arg(long)]
    no_positive: bool,

    /// Do not emit negative (darkening) events
    #[arg(long)]
    no_negative: bool,

    /// Resolution the engine operates at
    #[arg(long, value_name = "WxH", default_value = "1280x720")]
    processing: Resolution,
}

impl EngineArgs {
    fn config(&self) -> EventConfig {
        EventConfig {
            threshold: self.threshold,
            decay: self.decay,
            polarity_pos: !self.no_positive,
            polarity_neg: !self.no_negative,
            background: self.background,
        }
    }
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// Input directory of frame images (png, bmp, jpg)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output directory for the rendered event frames
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    #[command(flatten)]
    engine: EngineArgs,

    /// Export all events as CSV
    #[arg(long)]
    save_csv: bool,

    /// CSV export path (implies --save-csv)
    #[arg(long, value_name = "PATH")]
    csv: Option<PathBuf>,

    /// Export all events as NPZ
    #[arg(long)]
    save_npz: bool,

    /// NPZ export path (implies --save-npz)
    #[arg(long, value_name = "PATH")]
    npz: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct LiveArgs {
    /// Directory of frame images replayed as a looping capture device
    #[arg(short, long, value_name = "DIR", conflicts_with = "synthetic")]
    input: Option<PathBuf>,

    /// Use a synthetic moving-square scene instead of recorded frames
    #[arg(long)]
    synthetic: bool,

    /// Capture frame rate
    #[arg(long, default_value_t = DEFAULT_FRAME_RATE)]
    fps: f64,

    /// Session length in seconds
    #[arg(long, default_value_t = 10.0)]
    seconds: f64,

    #[command(flatten)]
    engine: EngineArgs,

    /// Number of frames buffered between capture and processing
    #[arg(long, default_value_t = DEFAULT_RESERVOIR_CAPACITY)]
    reservoir: usize,

    /// Directory for the timestamped CSV and NPZ exports
    #[arg(long, value_name = "DIR", default_value = ".")]
    export_dir: PathBuf,

    /// Skip exporting the session log
    #[arg(long)]
    no_export: bool,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Input event file (.csv or .npz)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output event file (.csv or .npz)
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventFormat {
    Csv,
    Npz,
}

impl EventFormat {
    fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        match ext.as_str() {
            "csv" => Ok(Self::Csv),
            "npz" => Ok(Self::Npz),
            _ => bail!("Unsupported event format: {:?}. Use .csv or .npz", path),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet);

    match cli.command {
        Command::Batch(args) => run_batch(args, cli.quiet),
        Command::Live(args) => run_live(args, cli.quiet),
        Command::Convert(args) => run_convert(args),
    }
}

fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn spinner(quiet: bool, message: &str) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn progress_bar(quiet: bool, len: u64) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} frames {msg}")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn write_events(path: &Path, events: &[Event]) -> Result<()> {
    match EventFormat::from_path(path)? {
        EventFormat::Csv => output::write_csv(path, events)
            .with_context(|| format!("Failed to write CSV output {:?}", path)),
        EventFormat::Npz => output::write_npz(path, events)
            .with_context(|| format!("Failed to write NPZ output {:?}", path)),
    }
}

fn read_events(path: &Path) -> Result<Vec<Event>> {
    match EventFormat::from_path(path)? {
        EventFormat::Csv => {
            output::read_csv(path).with_context(|| format!("Failed to read CSV input {:?}", path))
        }
        EventFormat::Npz => {
            output::read_npz(path).with_context(|| format!("Failed to read NPZ input {:?}", path))
        }
    }
}

/// Resolves an export path: explicit path, timestamped name, or none.
fn export_path(explicit: Option<PathBuf>, enabled: bool, dir: &Path, ext: &str) -> Option<PathBuf> {
    explicit.or_else(|| enabled.then(|| dir.join(output::timestamped_filename("events", ext))))
}

fn run_batch(args: BatchArgs, quiet: bool) -> Result<()> {
    let start_time = Instant::now();

    // Open the input before creating anything on disk
    let mut source = ImageSequenceSource::open(&args.input)
        .with_context(|| format!("Failed to open input video {:?}", args.input))?;
    let input_frames = source.len() as u64;
    let input_resolution = source.resolution();

    let options = BatchOptions {
        config: args.engine.config(),
        processing: args.engine.processing,
        progress_interval: DEFAULT_PROGRESS_INTERVAL,
    };

    let mut sink = ImageSequenceSink::create(&args.output)
        .with_context(|| format!("Failed to create output directory {:?}", args.output))?;

    let progress = progress_bar(quiet, input_frames)?;
    progress.set_message(format!("{:?}", args.input.file_name().unwrap_or_default()));

    let report = BatchProcessor::new(options)
        .run_with_progress(&mut source, &mut sink, |p| {
            progress.set_position(p.frames);
            progress.set_message(format!("{:.1} fps, {} events", p.average_fps(), p.events));
        })
        .context("Batch processing failed")?;

    progress.finish_with_message(format!("{} events", report.events.len()));

    let export_dir = Path::new(".");
    let csv_path = export_path(args.csv, args.save_csv, export_dir, "csv");
    let npz_path = export_path(args.npz, args.save_npz, export_dir, "npz");
    for path in csv_path.iter().chain(npz_path.iter()) {
        write_events(path, &report.events)?;
        info!(path = ?path, events = report.events.len(), "events exported");
    }

    if !quiet {
        let total = start_time.elapsed();
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Input:        {:?}", args.input);
        eprintln!("  Output:       {:?}", args.output);
        eprintln!("  Frames:       {} read, {} written", report.frames_read, report.frames_written);
        eprintln!("  Resolution:   {} (processed at {})", input_resolution, report.processing);
        eprintln!("  Events:       {}", report.events.len());
        eprintln!("  Duration:     {:.3}s", total.as_secs_f64());
        if let Some(path) = &csv_path {
            eprintln!("  CSV:          {:?}", path);
        }
        if let Some(path) = &npz_path {
            eprintln!("  NPZ:          {:?}", path);
        }
    }

    Ok(())
}

fn run_live(args: LiveArgs, quiet: bool) -> Result<()> {
    if !(args.seconds.is_finite() && args.seconds >= 0.0) {
        bail!("Session length must be a non-negative number of seconds");
    }
    let processing = args.engine.processing;

    let source: Box<dyn FrameSource> = match (&args.input, args.synthetic) {
        (Some(dir), _) => Box::new(
            ImageSequenceSource::open(dir)
                .with_context(|| format!("Failed to open capture device {:?}", dir))?
                .with_frame_rate(args.fps)
                .paced(true)
                .looping(true),
        ),
        (None, true) => Box::new(SyntheticSource::new(processing).paced(args.fps)),
        (None, false) => bail!("No frame source: pass --input DIR or --synthetic"),
    };

    let (tx, rx) = crossbeam_channel::bounded::<DisplayUpdate>(2);
    let config = SharedConfig::new(args.engine.config());
    let options = PipelineOptions {
        reservoir_capacity: args.reservoir.max(1),
        ..PipelineOptions::default()
    };
    let mut pipeline = AcquisitionPipeline::new(
        source,
        EventGenerator::new(processing),
        config,
        Arc::new(tx),
        options,
    );
    let log = pipeline.log().clone();

    let progress = spinner(quiet, "Capturing...")?;
    pipeline.start().context("Failed to start acquisition")?;

    let deadline = Instant::now() + Duration::from_secs_f64(args.seconds);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(remaining.min(Duration::from_millis(200))) {
            Ok(update) => {
                let stats = pipeline.stats();
                progress.set_message(format!(
                    "{:.1} fps, {:.0} events/s, {} events, {} dropped",
                    stats.capture_rate,
                    update.event_rate,
                    log.len(),
                    stats.dropped
                ));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let stats = pipeline.stats();
    pipeline.close().context("Failed to stop acquisition")?;
    progress.finish_with_message(format!(
        "{} frames processed, {} dropped, {} events",
        stats.processed,
        stats.dropped,
        log.len()
    ));

    if args.no_export {
        return Ok(());
    }

    let events = log.snapshot();
    fs::create_dir_all(&args.export_dir)
        .with_context(|| format!("Failed to create export directory {:?}", args.export_dir))?;
    for ext in ["csv", "npz"] {
        let path = args
            .export_dir
            .join(output::timestamped_filename("events", ext));
        write_events(&path, &events)?;
        if !quiet {
            eprintln!("Saved {} events to {:?}", events.len(), path);
        }
    }

    Ok(())
}

fn run_convert(args: ConvertArgs) -> Result<()> {
    // Validate both extensions before touching the filesystem
    EventFormat::from_path(&args.output)?;
    let events = read_events(&args.input)?;
    write_events(&args.output, &events)?;
    info!(
        input = ?args.input,
        output = ?args.output,
        events = events.len(),
        "events converted"
    );
    Ok(())
}
