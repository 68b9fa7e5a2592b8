//! CLI entry point for the video rotator
//!
//! Parses command line arguments, layers them over the configuration file,
//! runs one batch and renders its progress on the terminal.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use video_rotator::config::LoggingConfig;
use video_rotator::{
    gather_inputs, Acceleration, BatchParams, BatchReport, BatchScheduler, ChannelReporter,
    Config, ExistingOutput, LogFormat, OutputPolicy, ProgressEvent, Rotation, SchedulerError,
    TimeRemaining,
};

/// Video Rotator - rotate batches of videos with ffmpeg
#[derive(Parser, Debug)]
#[command(name = "video-rotator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Video files or directories to process
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Path to the configuration file
    #[arg(short, long, default_value = "video-rotator.toml")]
    config: PathBuf,

    /// Rotation: cw, ccw or 180
    #[arg(short, long)]
    rotation: Option<Rotation>,

    /// Text appended to each output file name
    #[arg(short, long)]
    suffix: Option<String>,

    /// Where outputs go: same_as_source, fixed_location or custom
    #[arg(long)]
    output_policy: Option<OutputPolicy>,

    /// Output directory (implies the custom policy)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Put outputs into a rotated_videos_YYYYMMDD subdirectory
    #[arg(long)]
    dated_subdir: bool,

    /// Hardware acceleration: none, nvenc, qsv or amf
    #[arg(short, long)]
    acceleration: Option<Acceleration>,

    /// Number of videos encoded at once (0 = derive from CPU count)
    #[arg(short = 'j', long)]
    concurrency: Option<u32>,

    /// What to do when an output file exists: overwrite or fail
    #[arg(long)]
    existing_output: Option<ExistingOutput>,

    /// Write the final report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Skip the encoder probe at startup
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Log filter when RUST_LOG is unset (e.g. debug, video_rotator=trace)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Layer command line flags over the loaded configuration.
    fn apply_to(&self, config: &mut Config) {
        let p = &mut config.processing;
        if let Some(rotation) = self.rotation {
            p.rotation = rotation;
        }
        if let Some(suffix) = &self.suffix {
            p.suffix = suffix.clone();
        }
        if let Some(dir) = &self.output_dir {
            p.output_dir = Some(dir.clone());
            p.output_policy = OutputPolicy::Custom;
        }
        if let Some(policy) = self.output_policy {
            p.output_policy = policy;
        }
        if self.dated_subdir {
            p.create_dated_subdir = true;
        }
        if let Some(acceleration) = self.acceleration {
            p.acceleration = acceleration;
        }
        if let Some(concurrency) = self.concurrency {
            p.concurrency = concurrency;
        }
        if let Some(existing) = self.existing_output {
            p.existing_output = existing;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Prints reporter events on stdout.
#[derive(Default)]
struct Console {
    remaining: Option<TimeRemaining>,
    last_overall: f32,
}

impl Console {
    fn render(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::Log { message } => println!("{}", message),
            ProgressEvent::Status { message } => println!("== {}", message),
            ProgressEvent::TimeRemaining { remaining } => self.remaining = Some(remaining),
            ProgressEvent::Progress { overall, .. } => {
                // Per-file progress arrives many times a second; only batch steps are printed
                if overall > self.last_overall {
                    self.last_overall = overall;
                    match self.remaining {
                        Some(remaining) if overall < 100.0 => {
                            println!("[{:5.1}%] remaining {}", overall, remaining)
                        }
                        _ => println!("[{:5.1}%]", overall),
                    }
                }
            }
        }
    }
}

fn write_report(path: &Path, report: &BatchReport) {
    match report.to_json() {
        Ok(json) => match std::fs::write(path, json) {
            Ok(()) => info!(path = %path.display(), "report written"),
            Err(e) => error!(path = %path.display(), error = %e, "failed to write report"),
        },
        Err(e) => error!(error = %e, "failed to serialize report"),
    }
}

async fn run(args: Args, config: Config) -> Result<BatchReport, SchedulerError> {
    let inputs = gather_inputs(&args.paths)?;
    let params = BatchParams::from_config(&config);

    let (reporter, mut rx) = ChannelReporter::channel();
    let scheduler = BatchScheduler::from_config(&config, Arc::new(reporter))?;

    if args.skip_checks || !config.encoder.check_on_startup {
        warn!("Skipping encoder startup checks");
    } else {
        let version = scheduler.preflight(&params).await?;
        info!(version = %version, "using {}", scheduler.program().display());
    }

    let printer = tokio::spawn(async move {
        let mut console = Console::default();
        while let Some(event) = rx.recv().await {
            console.render(event);
        }
    });

    let stopper = scheduler.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping...");
            stopper.request_stop();
        }
    });

    let result = scheduler.process_batch(inputs, &params).await;

    // Release every reporter handle so the printer sees the channel close
    ctrl_c.abort();
    let _ = ctrl_c.await;
    drop(scheduler);
    let _ = printer.await;

    let report = result?;
    if let Some(path) = &args.report {
        write_report(path, &report);
    }
    Ok(report)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    args.apply_to(&mut config);
    init_tracing(&config.logging);

    match run(args, config).await {
        Ok(report) if report.all_succeeded() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
