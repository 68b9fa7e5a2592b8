//! Batch scheduler
//!
//! Fans a file list out into one task per job, bounded by a semaphore sized to
//! the batch concurrency. Each task waits for a slot, checks the stop flag,
//! resolves the output, runs the encoder and folds its outcome into the
//! shared [`BatchRun`]. The slot is held until the outcome has been reported,
//! so a stop issued from a progress callback is seen by the next job.

use crate::batch::{BatchReport, BatchRun, Completion};
use crate::config::{Config, ConfigError, ExistingOutput};
use crate::encode::{EncodeObserver, EncodeRequest, EncodeSummary, Encoder};
use crate::job::{Job, JobError, JobState};
use crate::params::BatchParams;
use crate::registry::ProcessRegistry;
use crate::report::{ProgressEvent, ProgressReporter, TimeRemaining};
use crate::resolve::OutputLayout;
use crate::scan::collect_inputs;
use crate::startup::{
    check_encoder_available, locate_encoder, warn_if_codec_missing, StartupError,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Default wait between the graceful signal and the force-kill on stop.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Error type for scheduler operations
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("No video files found in the given paths")]
    NoInputs,

    #[error("A batch is already running")]
    AlreadyRunning,
}

/// Expand the given paths into batch inputs, failing when none are videos.
pub fn gather_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>, SchedulerError> {
    let inputs = collect_inputs(paths);
    if inputs.is_empty() {
        return Err(SchedulerError::NoInputs);
    }
    Ok(inputs)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

/// Sends an event and mirrors log lines to tracing.
fn log_event(reporter: &dyn ProgressReporter, message: String) {
    debug!(target: "video_rotator::activity", "{}", message);
    reporter.report(ProgressEvent::log(message));
}

struct Inner {
    encoder: Encoder,
    reporter: Arc<dyn ProgressReporter>,
    grace_period: Duration,
    current: Mutex<Option<Arc<BatchRun>>>,
}

impl Inner {
    fn current(&self) -> MutexGuard<'_, Option<Arc<BatchRun>>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Everything a job task needs, shared across the batch.
struct JobContext {
    run: Arc<BatchRun>,
    encoder: Encoder,
    reporter: Arc<dyn ProgressReporter>,
    layout: Arc<OutputLayout>,
    params: Arc<BatchParams>,
    semaphore: Arc<Semaphore>,
    /// Set once the job's outcome has been folded into the run.
    recorded: Arc<AtomicBool>,
}

impl JobContext {
    fn record(&self, job: &Job) -> Completion {
        let completion = self.run.record(job);
        self.recorded.store(true, Ordering::SeqCst);
        completion
    }
}

/// Forwards encoder events of one job to the reporter.
struct JobObserver<'a> {
    run: &'a BatchRun,
    reporter: &'a dyn ProgressReporter,
}

impl EncodeObserver for JobObserver<'_> {
    fn log(&self, message: &str) {
        log_event(self.reporter, message.to_string());
    }

    fn progress(&self, percent: f32) {
        let total = self.run.total().max(1);
        let overall = self.run.completed() as f32 / total as f32 * 100.0;
        self.reporter.report(ProgressEvent::progress(overall, percent));
    }
}

/// Runs batches of rotation jobs.
///
/// Cheap to clone; clones share the encoder, the process registry and the
/// current batch, so a clone can be handed to a signal handler to stop it.
#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<Inner>,
}

impl BatchScheduler {
    pub fn new(
        encoder: Encoder,
        reporter: Arc<dyn ProgressReporter>,
        grace_period: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                encoder,
                reporter,
                grace_period,
                current: Mutex::new(None),
            }),
        }
    }

    /// Validate the configuration and build a scheduler with a fresh registry.
    pub fn from_config(
        config: &Config,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let mut encoder_config = config.encoder.clone();
        encoder_config.program = locate_encoder(&encoder_config.program);
        let registry = Arc::new(ProcessRegistry::new());
        let encoder = Encoder::from_config(&encoder_config, registry);
        Ok(Self::new(
            encoder,
            reporter,
            Duration::from_secs(config.shutdown.grace_period_secs),
        ))
    }

    /// Encoder binary this scheduler runs.
    pub fn program(&self) -> &Path {
        self.inner.encoder.program()
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        self.inner.encoder.registry()
    }

    /// Whether a batch is in progress.
    pub fn is_running(&self) -> bool {
        self.inner
            .current()
            .as_ref()
            .is_some_and(|run| !run.is_finished())
    }

    /// Probe the encoder once before any batch runs.
    ///
    /// A missing encoder is fatal; a missing vendor codec only warns.
    pub async fn preflight(&self, params: &BatchParams) -> Result<String, SchedulerError> {
        let program = self.inner.encoder.program().to_path_buf();
        let acceleration = params.acceleration;
        let version = tokio::task::spawn_blocking(move || {
            let version = check_encoder_available(&program)?;
            warn_if_codec_missing(&program, acceleration);
            Ok::<_, StartupError>(version)
        })
        .await
        .map_err(|e| StartupError::Io(std::io::Error::other(e)))??;
        Ok(version)
    }

    /// Rotate every file and return the final tallies.
    ///
    /// Individual failures never abort the batch; they end up in
    /// [`BatchReport::failed`]. Only one batch may run at a time.
    pub async fn process_batch(
        &self,
        files: Vec<PathBuf>,
        params: &BatchParams,
    ) -> Result<BatchReport, SchedulerError> {
        let run = Arc::new(BatchRun::new(files.len(), params.concurrency()));
        {
            let mut current = self.inner.current();
            if current.as_ref().is_some_and(|r| !r.is_finished()) {
                return Err(SchedulerError::AlreadyRunning);
            }
            *current = Some(run.clone());
        }

        let reporter = self.inner.reporter.clone();
        info!(
            total = run.total(),
            concurrency = run.concurrency(),
            rotation = %params.rotation,
            acceleration = %params.acceleration,
            "starting batch"
        );
        reporter.report(ProgressEvent::status(format!(
            "Processing {} videos ({} at a time)",
            run.total(),
            run.concurrency()
        )));
        reporter.report(ProgressEvent::time_remaining(TimeRemaining::Calculating));
        reporter.report(ProgressEvent::progress(0.0, 0.0));

        let layout = Arc::new(params.layout());
        let params = Arc::new(params.clone());
        let semaphore = Arc::new(Semaphore::new(params.concurrency()));

        let mut tasks = JoinSet::new();
        for path in files {
            let ctx = JobContext {
                run: run.clone(),
                encoder: self.inner.encoder.clone(),
                reporter: reporter.clone(),
                layout: layout.clone(),
                params: params.clone(),
                semaphore: semaphore.clone(),
                recorded: Arc::new(AtomicBool::new(false)),
            };
            let job = Job::new(path, params.rotation, params.acceleration);
            tasks.spawn(supervise_job(ctx, job));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "job supervisor failed");
            }
        }

        let report = run.finish();
        self.inner.current().take();

        if report.all_succeeded() {
            info!(summary = %report.summary(), "batch finished");
        } else {
            warn!(summary = %report.summary(), "batch finished");
        }
        reporter.report(ProgressEvent::status(report.summary()));
        for line in report.details() {
            log_event(reporter.as_ref(), line);
        }
        let overall = if report.total == 0 {
            100.0
        } else {
            (report.succeeded.len() + report.failed.len()) as f32 / report.total as f32 * 100.0
        };
        reporter.report(ProgressEvent::progress(overall, 100.0));
        reporter.report(ProgressEvent::time_remaining(TimeRemaining::Idle));

        Ok(report)
    }

    /// Stop the running batch. Returns immediately.
    ///
    /// Jobs not yet started are skipped; running encoders get the graceful
    /// signal and are force-killed after the grace period. Returns false when
    /// no batch is running or a stop was already requested.
    pub fn request_stop(&self) -> bool {
        let Some(run) = self.inner.current().clone() else {
            return false;
        };
        if !run.cancel() {
            return false;
        }

        warn!("stop requested, terminating running encoders");
        let reporter = &self.inner.reporter;
        reporter.report(ProgressEvent::status("Stopping..."));
        log_event(
            reporter.as_ref(),
            "Stop requested: no further videos will be started".to_string(),
        );

        let registry = self.registry().clone();
        let grace = self.inner.grace_period;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let summary = registry.terminate_all(grace).await;
                    info!(
                        signalled = summary.signalled,
                        force_killed = summary.force_killed,
                        "encoders terminated"
                    );
                });
            }
            Err(_) => {
                // Outside a runtime there is no way to wait out the grace period.
                for handle in registry.snapshot() {
                    handle.request_kill();
                }
            }
        }
        true
    }
}

/// Run a job in its own task so a panic still yields a recorded failure.
///
/// A panic after the outcome was recorded leaves the tally alone.
async fn supervise_job(ctx: JobContext, job: Job) {
    let run = ctx.run.clone();
    let reporter = ctx.reporter.clone();
    let recorded = ctx.recorded.clone();
    let mut snapshot = job.clone();

    if let Err(e) = tokio::spawn(run_job(ctx, job)).await {
        error!(input = %snapshot.input_path.display(), error = %e, "job task failed");
        if recorded.load(Ordering::SeqCst) {
            return;
        }
        snapshot.state = JobState::Failed(format!("internal error: {}", e));
        run.record(&snapshot);
        log_event(
            reporter.as_ref(),
            format!("Failed {}: internal error", file_label(&snapshot.input_path)),
        );
    }
}

async fn run_job(ctx: JobContext, mut job: Job) {
    let Ok(_permit) = ctx.semaphore.clone().acquire_owned().await else {
        return;
    };
    let name = file_label(&job.input_path);
    let reporter = ctx.reporter.as_ref();

    if ctx.run.is_cancelled() {
        job.skip();
        debug!(input = %job.input_path.display(), "skipped, batch stopped");
        ctx.record(&job);
        log_event(reporter, format!("Skipped {}: processing was stopped", name));
        return;
    }

    job.start();
    info!(job_id = %job.id, input = %job.input_path.display(), "job started");
    reporter.report(ProgressEvent::status(format!("Rotating {}", name)));

    let outcome = execute(&ctx, &mut job).await;
    let current = match &outcome {
        Ok(_) => {
            job.succeed();
            100.0
        }
        Err(e) => {
            job.fail(e);
            0.0
        }
    };
    let completion = ctx.record(&job);

    match (&outcome, &job.state) {
        (Ok(summary), _) => {
            let output = job
                .output_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            info!(
                job_id = %job.id,
                output = %output,
                fell_back = summary.fell_back,
                "job succeeded"
            );
            let note = if summary.fell_back {
                " (software fallback)"
            } else {
                ""
            };
            log_event(reporter, format!("Rotated {} -> {}{}", name, output, note));
        }
        (Err(_), JobState::Cancelled) => {
            log_event(reporter, format!("Stopped {}: partial output may remain", name));
        }
        (Err(e), _) => {
            warn!(job_id = %job.id, input = %job.input_path.display(), error = %e, "job failed");
            log_event(
                reporter,
                format!("Failed {}: {}", name, first_line(&e.diagnostic())),
            );
        }
    }
    reporter.report(ProgressEvent::progress(completion.overall, current));
    reporter.report(ProgressEvent::time_remaining(completion.remaining));
    debug!(
        completed = completion.completed,
        total = completion.total,
        remaining = %completion.remaining,
        "batch progress"
    );
}

async fn execute(ctx: &JobContext, job: &mut Job) -> Result<EncodeSummary, JobError> {
    let planned = ctx.layout.output_path_for(&job.input_path)?;
    if planned == job.input_path {
        return Err(JobError::OutputIsInput(planned));
    }

    let output = ctx.layout.resolve(&job.input_path)?;
    job.output_path = Some(output.clone());

    let overwrite = ctx.params.existing_output == ExistingOutput::Overwrite;
    if !overwrite && output.exists() {
        return Err(JobError::OutputExists(output));
    }

    let mut request = EncodeRequest::new(
        job.input_path.clone(),
        output,
        job.rotation,
        job.acceleration,
    );
    request.overwrite = overwrite;

    let observer = JobObserver {
        run: &ctx.run,
        reporter: ctx.reporter.as_ref(),
    };
    Ok(ctx
        .encoder
        .encode(&request, ctx.run.stop_flag(), &observer)
        .await?)
}
