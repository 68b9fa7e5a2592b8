//! Progress and status reporting.
//!
//! The scheduler and the encoder push typed events through a
//! [`ProgressReporter`]; whatever renders them (terminal, GUI, log file) lives
//! outside this crate.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Estimated time until the batch finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRemaining {
    /// No job has finished yet, so there is nothing to extrapolate from.
    Calculating,
    /// Extrapolated from the average time per finished job.
    Remaining(Duration),
    /// No batch is running.
    Idle,
}

impl TimeRemaining {
    /// `(elapsed / completed) * (total - completed)`, or `Calculating` before the first completion.
    pub fn estimate(elapsed: Duration, completed: usize, total: usize) -> Self {
        if completed == 0 {
            return TimeRemaining::Calculating;
        }
        let remaining_jobs = total.saturating_sub(completed) as u32;
        let per_job = elapsed / completed as u32;
        TimeRemaining::Remaining(per_job * remaining_jobs)
    }
}

impl fmt::Display for TimeRemaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeRemaining::Calculating => write!(f, "calculating"),
            TimeRemaining::Remaining(d) => {
                let secs = d.as_secs();
                write!(
                    f,
                    "{:02}:{:02}:{:02}",
                    secs / 3600,
                    (secs % 3600) / 60,
                    secs % 60
                )
            }
            TimeRemaining::Idle => write!(f, "--:--:--"),
        }
    }
}

/// An update pushed from the core to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A line for the activity log.
    Log { message: String },
    /// Short status text.
    Status { message: String },
    /// Estimated time remaining for the batch.
    TimeRemaining { remaining: TimeRemaining },
    /// Overall batch progress and progress of the job that last reported, both 0-100.
    Progress { overall: f32, current: f32 },
}

impl ProgressEvent {
    pub fn log(message: impl Into<String>) -> Self {
        ProgressEvent::Log {
            message: message.into(),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        ProgressEvent::Status {
            message: message.into(),
        }
    }

    pub fn time_remaining(remaining: TimeRemaining) -> Self {
        ProgressEvent::TimeRemaining { remaining }
    }

    pub fn progress(overall: f32, current: f32) -> Self {
        ProgressEvent::Progress {
            overall: overall.clamp(0.0, 100.0),
            current: current.clamp(0.0, 100.0),
        }
    }
}

/// Receives progress events.
///
/// Called from worker tasks, possibly from several threads at once, so
/// implementations must not block for long.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Drops every event.
#[derive(Debug, Clone, Default)]
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn report(&self, _event: ProgressEvent) {}
}

/// Forwards events into an unbounded channel.
///
/// Send errors are ignored: a dropped receiver means nobody is listening any more.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelReporter {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }

    /// Create a reporter together with the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl ProgressReporter for ChannelReporter {
    fn report(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

/// Calls a closure for every event.
pub struct FnReporter<F>(F);

impl<F> FnReporter<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ProgressReporter for FnReporter<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        (self.0)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_time_remaining_display() {
        assert_eq!(TimeRemaining::Calculating.to_string(), "calculating");
        assert_eq!(TimeRemaining::Idle.to_string(), "--:--:--");
        assert_eq!(
            TimeRemaining::Remaining(Duration::from_secs(3 * 3600 + 25 * 60 + 7)).to_string(),
            "03:25:07"
        );
        assert_eq!(
            TimeRemaining::Remaining(Duration::from_millis(999)).to_string(),
            "00:00:00"
        );
    }

    #[test]
    fn test_estimate_before_first_completion() {
        assert_eq!(
            TimeRemaining::estimate(Duration::from_secs(40), 0, 5),
            TimeRemaining::Calculating
        );
    }

    #[test]
    fn test_estimate_extrapolates_average() {
        // 2 jobs in 60s -> 30s each, 3 left
        assert_eq!(
            TimeRemaining::estimate(Duration::from_secs(60), 2, 5),
            TimeRemaining::Remaining(Duration::from_secs(90))
        );
        assert_eq!(
            TimeRemaining::estimate(Duration::from_secs(60), 5, 5),
            TimeRemaining::Remaining(Duration::ZERO)
        );
    }

    proptest! {
        #[test]
        fn prop_estimate_never_negative_and_zero_when_done(
            elapsed_ms in 0u64..10_000_000,
            total in 1usize..500,
        ) {
            let elapsed = Duration::from_millis(elapsed_ms);
            prop_assert_eq!(
                TimeRemaining::estimate(elapsed, total, total),
                TimeRemaining::Remaining(Duration::ZERO)
            );
        }
    }

    #[test]
    fn test_progress_event_clamps() {
        assert_eq!(
            ProgressEvent::progress(120.0, -3.0),
            ProgressEvent::Progress {
                overall: 100.0,
                current: 0.0
            }
        );
    }

    #[test]
    fn test_channel_reporter_delivers_in_order() {
        let (reporter, mut rx) = ChannelReporter::channel();
        reporter.report(ProgressEvent::status("one"));
        reporter.report(ProgressEvent::log("two"));

        assert_eq!(rx.try_recv().unwrap(), ProgressEvent::status("one"));
        assert_eq!(rx.try_recv().unwrap(), ProgressEvent::log("two"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_reporter_tolerates_dropped_receiver() {
        let (reporter, rx) = ChannelReporter::channel();
        drop(rx);
        reporter.report(ProgressEvent::log("nobody listens"));
    }

    #[test]
    fn test_fn_reporter_invokes_closure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = FnReporter::new(move |event| sink.lock().unwrap().push(event));

        reporter.report(ProgressEvent::time_remaining(TimeRemaining::Calculating));

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[ProgressEvent::time_remaining(TimeRemaining::Calculating)]
        );
    }

    #[test]
    fn test_events_serialize_with_kind_tag() {
        let json = serde_json::to_value(ProgressEvent::progress(50.0, 25.0)).unwrap();
        assert_eq!(json["kind"], "progress");
        assert_eq!(json["overall"], 50.0);
    }
}
