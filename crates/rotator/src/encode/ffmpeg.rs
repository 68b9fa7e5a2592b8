//! ffmpeg invocation
//!
//! Runs one rotation as a child process, watches its output for progress and
//! diagnostics, and retries once in software when a hardware attempt fails
//! in a way that points at the accelerator.

use super::command::{acceleration_label, build_ffmpeg_command, describe_command, EncodeRequest};
use super::failure::{FailureClassifier, RuntimeFailure, Termination, DIAGNOSTIC_TAIL_LINES};
use super::progress::{read_lines, OutputTail, ProgressParser};
use crate::config::{Acceleration, EncoderConfig, Rotation};
use crate::registry::ProcessRegistry;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How long output readers may keep going after the encoder exited.
///
/// A grandchild that inherited the pipes can hold them open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder could not be started at all
    #[error("Failed to launch encoder {}: {source}", .program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The encoder ran and did not succeed
    #[error("{0}")]
    Runtime(RuntimeFailure),

    /// The encoder exceeded the per-attempt timeout and was killed
    #[error("encoder timed out after {0:?} and was killed")]
    TimedOut(Duration),

    /// The encoder was terminated because processing was stopped
    #[error("stopped while encoding; partial output may remain")]
    Stopped,

    /// IO error while waiting on the encoder
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl EncodeError {
    /// Text recorded against the job when it fails with this error.
    pub fn diagnostic(&self) -> String {
        match self {
            EncodeError::Runtime(failure) => failure.diagnostic(),
            other => other.to_string(),
        }
    }
}

/// Receives what happens during an encode.
///
/// Called from the task running the job; implementations must not block.
pub trait EncodeObserver: Send + Sync {
    /// A line for the activity log
    fn log(&self, _message: &str) {}
    /// Progress of the current attempt, 0-99 while running
    fn progress(&self, _percent: f32) {}
}

impl EncodeObserver for () {}

/// Result of a successful encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeSummary {
    /// Acceleration mode of the attempt that succeeded
    pub acceleration: Acceleration,
    /// Whether the software fallback was needed
    pub fell_back: bool,
}

enum Waited {
    Exited(io::Result<ExitStatus>),
    Killed,
    TimedOut,
}

/// Runs ffmpeg for rotation requests.
#[derive(Debug, Clone)]
pub struct Encoder {
    program: PathBuf,
    classifier: FailureClassifier,
    timeout: Option<Duration>,
    registry: Arc<ProcessRegistry>,
}

impl Encoder {
    pub fn new(program: impl Into<PathBuf>, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            program: program.into(),
            classifier: FailureClassifier::default(),
            timeout: None,
            registry,
        }
    }

    pub fn from_config(config: &EncoderConfig, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            program: config.program.clone(),
            classifier: FailureClassifier::from_config(config),
            timeout: (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs)),
            registry,
        }
    }

    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Rotate one file and report `(success, diagnostic)`.
    ///
    /// Convenience wrapper around [`Encoder::encode`] for callers that have no
    /// batch to stop and no observer.
    pub async fn encode_file(
        &self,
        input: &Path,
        output: &Path,
        rotation: Rotation,
        acceleration: Acceleration,
    ) -> (bool, Option<String>) {
        let request = EncodeRequest::new(
            input.to_path_buf(),
            output.to_path_buf(),
            rotation,
            acceleration,
        );
        let stop = AtomicBool::new(false);
        match self.encode(&request, &stop, &()).await {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.diagnostic())),
        }
    }

    /// Encode a request, falling back to software once when the accelerator fails.
    ///
    /// `stop` is the batch's stop flag: a child spawned after it was set is
    /// killed at once, and a set flag suppresses the fallback attempt.
    pub async fn encode(
        &self,
        request: &EncodeRequest,
        stop: &AtomicBool,
        observer: &dyn EncodeObserver,
    ) -> Result<EncodeSummary, EncodeError> {
        let name = display_name(&request.input_path);
        observer.log(&format!(
            "Rotating {} using {}",
            name,
            acceleration_label(request.acceleration)
        ));

        let failure = match self.run_attempt(request, stop, observer).await {
            Ok(()) => {
                return Ok(EncodeSummary {
                    acceleration: request.acceleration,
                    fell_back: false,
                })
            }
            Err(EncodeError::Runtime(failure))
                if request.acceleration.is_hardware() && failure.accelerator_unavailable() =>
            {
                failure
            }
            Err(e) => return Err(e),
        };

        warn!(
            input = %request.input_path.display(),
            acceleration = %request.acceleration,
            exit_code = ?failure.exit_code(),
            "hardware encode failed"
        );
        observer.log(&format!(
            "{} failed with {}: {}",
            name,
            acceleration_label(request.acceleration),
            failure.termination
        ));

        if stop.load(Ordering::SeqCst) {
            debug!(input = %request.input_path.display(), "stop requested, skipping software fallback");
            return Err(EncodeError::Runtime(failure));
        }

        info!(input = %request.input_path.display(), "retrying with software encoding");
        observer.log(&format!("Retrying {} with software encoding", name));

        let fallback = request.with_acceleration(Acceleration::None);
        self.run_attempt(&fallback, stop, observer).await?;
        observer.log(&format!("Software fallback succeeded for {}", name));
        Ok(EncodeSummary {
            acceleration: Acceleration::None,
            fell_back: true,
        })
    }

    /// One ffmpeg run. The child is registered for exactly as long as it runs.
    async fn run_attempt(
        &self,
        request: &EncodeRequest,
        stop: &AtomicBool,
        observer: &dyn EncodeObserver,
    ) -> Result<(), EncodeError> {
        let std_cmd = build_ffmpeg_command(&self.program, request);
        debug!(command = %describe_command(&std_cmd), "launching encoder");

        let mut cmd = Command::from(std_cmd);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| EncodeError::Launch {
            program: self.program.clone(),
            source,
        })?;

        let registration = self
            .registry
            .track(child.id(), request.input_path.display().to_string());
        let handle = registration.handle().clone();
        if stop.load(Ordering::SeqCst) {
            // The stop sweep may already have taken its snapshot.
            handle.request_kill();
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut stdout_tail = OutputTail::new(DIAGNOSTIC_TAIL_LINES);
        let mut stderr_tail = OutputTail::new(DIAGNOSTIC_TAIL_LINES);
        let mut parser = ProgressParser::new();
        let timeout = self.timeout;

        let waited = {
            let mut readers = Box::pin(async {
                let out = async {
                    if let Some(stdout) = stdout {
                        let _ = read_lines(stdout, |line| stdout_tail.push(line)).await;
                    }
                };
                let err = async {
                    if let Some(stderr) = stderr {
                        let _ = read_lines(stderr, |line| {
                            stderr_tail.push(line);
                            if let Some(percent) = parser.feed_line(line) {
                                observer.progress(percent);
                            }
                        })
                        .await;
                    }
                };
                tokio::join!(out, err);
            });

            let mut wait = Box::pin(async {
                tokio::select! {
                    status = child.wait() => Waited::Exited(status),
                    _ = handle.killed() => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        Waited::Killed
                    }
                    _ = sleep_for(timeout) => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        Waited::TimedOut
                    }
                }
            });

            let mut readers_done = false;
            let waited = loop {
                tokio::select! {
                    waited = &mut wait => break waited,
                    _ = &mut readers, if !readers_done => readers_done = true,
                }
            };
            // The child is reaped; its pid may be reused from here on.
            drop(registration);

            if !readers_done
                && tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut readers)
                    .await
                    .is_err()
            {
                debug!(input = %request.input_path.display(), "encoder output still open after exit");
            }
            waited
        };

        match waited {
            Waited::Killed => Err(EncodeError::Stopped),
            Waited::TimedOut => Err(EncodeError::TimedOut(timeout.unwrap_or_default())),
            Waited::Exited(status) => {
                let status = status?;
                if status.success() {
                    return Ok(());
                }
                if stop.load(Ordering::SeqCst) {
                    return Err(EncodeError::Stopped);
                }
                let failure = self.classifier.failure(
                    Termination::from_status(&status),
                    stderr_tail.into_lines(),
                    stdout_tail.into_lines(),
                );
                Err(EncodeError::Runtime(failure))
            }
        }
    }
}

fn sleep_for(timeout: Option<Duration>) -> impl Future<Output = ()> {
    async move {
        match timeout {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::encode::failure::FailureClass;
    use crate::testing::{fake_encoder, TOUCH_OUTPUT};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        logs: Mutex<Vec<String>>,
        progress: Mutex<Vec<f32>>,
    }

    impl EncodeObserver for Recorder {
        fn log(&self, message: &str) {
            self.logs.lock().unwrap().push(message.to_string());
        }
        fn progress(&self, percent: f32) {
            self.progress.lock().unwrap().push(percent);
        }
    }

    fn request(dir: &Path, acceleration: Acceleration) -> EncodeRequest {
        EncodeRequest::new(
            dir.join("in.mp4"),
            dir.join("in_rotated.mp4"),
            Rotation::Clockwise90,
            acceleration,
        )
    }

    fn encoder(program: PathBuf) -> (Encoder, Arc<ProcessRegistry>) {
        let registry = Arc::new(ProcessRegistry::new());
        (Encoder::new(program, registry.clone()), registry)
    }

    #[tokio::test]
    async fn test_successful_encode_writes_output() {
        let temp = TempDir::new().unwrap();
        let program = fake_encoder(temp.path(), "ok.sh", TOUCH_OUTPUT);
        let (encoder, registry) = encoder(program);
        let req = request(temp.path(), Acceleration::None);

        let summary = encoder.encode(&req, &AtomicBool::new(false), &()).await.unwrap();

        assert_eq!(summary.acceleration, Acceleration::None);
        assert!(!summary.fell_back);
        assert!(req.output_path.exists());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_once_reaped_while_output_drains() {
        let temp = TempDir::new().unwrap();
        // The background sleep keeps the output pipes open after the encoder exits
        let program = fake_encoder(temp.path(), "ok.sh", "sleep 3 &\nexit 0");
        let (encoder, registry) = encoder(program);
        let req = request(temp.path(), Acceleration::None);

        let task = tokio::spawn(async move {
            encoder.encode(&req, &AtomicBool::new(false), &()).await
        });
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(registry.is_empty());
        assert!(!task.is_finished(), "output drain should still be pending");
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_launch_failure_for_missing_binary() {
        let temp = TempDir::new().unwrap();
        let (encoder, registry) = encoder(temp.path().join("no-such-encoder"));

        let result = encoder
            .encode(&request(temp.path(), Acceleration::Nvenc), &AtomicBool::new(false), &())
            .await;

        assert!(matches!(result, Err(EncodeError::Launch { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_ordinary_failure_carries_stderr_tail() {
        let temp = TempDir::new().unwrap();
        let program = fake_encoder(
            temp.path(),
            "bad.sh",
            "echo 'in.mp4: Invalid data found when processing input' >&2\nexit 1",
        );
        let (encoder, registry) = encoder(program);

        let err = encoder
            .encode(&request(temp.path(), Acceleration::Nvenc), &AtomicBool::new(false), &())
            .await
            .unwrap_err();

        match &err {
            EncodeError::Runtime(failure) => {
                assert_eq!(failure.class, FailureClass::Ordinary);
                assert_eq!(failure.exit_code(), Some(1));
            }
            other => panic!("expected runtime failure, got {:?}", other),
        }
        let diagnostic = err.diagnostic();
        assert!(diagnostic.contains("Invalid data found"));
        assert!(diagnostic.contains("invalid encoder arguments"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_accelerator_failure_falls_back_to_software() {
        let temp = TempDir::new().unwrap();
        let body = format!(
            "case \"$*\" in *h264_nvenc*) echo 'No NVENC capable devices found' >&2; exit 234;; esac\n{}",
            TOUCH_OUTPUT
        );
        let program = fake_encoder(temp.path(), "nvenc.sh", &body);
        let (encoder, registry) = encoder(program);
        let recorder = Recorder::default();
        let req = request(temp.path(), Acceleration::Nvenc);

        let summary = encoder
            .encode(&req, &AtomicBool::new(false), &recorder)
            .await
            .unwrap();

        assert!(summary.fell_back);
        assert_eq!(summary.acceleration, Acceleration::None);
        assert!(req.output_path.exists());

        let logs = recorder.logs.lock().unwrap();
        assert!(logs.iter().any(|l| l.contains("failed with NVENC")));
        assert!(logs.iter().any(|l| l.contains("Retrying in.mp4 with software")));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_software_request_is_not_retried() {
        let temp = TempDir::new().unwrap();
        let counter = temp.path().join("runs");
        let body = format!("echo run >> '{}'\nexit 234", counter.display());
        let program = fake_encoder(temp.path(), "crash.sh", &body);
        let (encoder, _registry) = encoder(program);

        let err = encoder
            .encode(&request(temp.path(), Acceleration::None), &AtomicBool::new(false), &())
            .await
            .unwrap_err();

        assert!(matches!(err, EncodeError::Runtime(ref f) if f.accelerator_unavailable()));
        let runs = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_set_stop_flag_suppresses_fallback() {
        let temp = TempDir::new().unwrap();
        let counter = temp.path().join("runs");
        let body = format!("echo run >> '{}'\nexit 234", counter.display());
        let program = fake_encoder(temp.path(), "crash.sh", &body);
        let (encoder, registry) = encoder(program);
        let stop = AtomicBool::new(true);

        let result = encoder
            .encode(&request(temp.path(), Acceleration::Qsv), &stop, &())
            .await;

        // The child registered after the stop and was killed straight away,
        // or exited first; either way nothing is retried.
        assert!(result.is_err());
        let runs = std::fs::read_to_string(&counter).unwrap_or_default();
        assert!(runs.lines().count() <= 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_progress_is_parsed_from_stderr() {
        let temp = TempDir::new().unwrap();
        let body = format!(
            "echo '  Duration: 00:00:10.00, start: 0.000000' >&2\n\
             printf 'frame=1 time=00:00:02.50 bitrate=1k\\r' >&2\n\
             printf 'frame=2 time=00:00:05.00 bitrate=1k\\r' >&2\n{}",
            TOUCH_OUTPUT
        );
        let program = fake_encoder(temp.path(), "progress.sh", &body);
        let (encoder, _registry) = encoder(program);
        let recorder = Recorder::default();

        encoder
            .encode(&request(temp.path(), Acceleration::None), &AtomicBool::new(false), &recorder)
            .await
            .unwrap();

        assert_eq!(*recorder.progress.lock().unwrap(), vec![25.0, 50.0]);
    }

    #[tokio::test]
    async fn test_timeout_kills_encoder() {
        let temp = TempDir::new().unwrap();
        let program = fake_encoder(temp.path(), "hang.sh", "exec sleep 30");
        let (encoder, registry) = encoder(program);
        let encoder = encoder.with_timeout(Some(Duration::from_millis(200)));

        let started = std::time::Instant::now();
        let result = encoder
            .encode(&request(temp.path(), Acceleration::None), &AtomicBool::new(false), &())
            .await;

        assert!(matches!(result, Err(EncodeError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stop_terminates_running_encoder() {
        let temp = TempDir::new().unwrap();
        let program = fake_encoder(temp.path(), "hang.sh", "exec sleep 30");
        let (encoder, registry) = encoder(program);
        let stop = Arc::new(AtomicBool::new(false));

        let task = {
            let encoder = encoder.clone();
            let stop = stop.clone();
            let req = request(temp.path(), Acceleration::None);
            tokio::spawn(async move { encoder.encode(&req, &stop, &()).await })
        };

        while registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop.store(true, Ordering::SeqCst);
        let summary = registry.terminate_all(Duration::from_secs(5)).await;

        let result = task.await.unwrap();
        assert!(matches!(result, Err(EncodeError::Stopped)));
        assert_eq!(summary.signalled + summary.force_killed, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_encode_file_reports_pair() {
        let temp = TempDir::new().unwrap();
        let program = fake_encoder(temp.path(), "fail.sh", "exit 3");
        let (encoder, _registry) = encoder(program);

        let (ok, diagnostic) = encoder
            .encode_file(
                &temp.path().join("a.mp4"),
                &temp.path().join("a_r.mp4"),
                Rotation::Rotate180,
                Acceleration::None,
            )
            .await;

        assert!(!ok);
        assert_eq!(diagnostic.as_deref(), Some("encoder exited with code 3"));
    }
}
